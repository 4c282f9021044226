use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use stacked_errors::{bail, Result, StackableErr};
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process,
    task,
    time::{sleep, Instant},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    acquire_file_path, default_container_name, image_ref, next_instance_id, normalize_ports,
    wait_for_ok, ContainerRunner, ContainerStop, CreateConfig, CreatedContainer, DockerHost,
    DockerProcess, NetworkRegistry, OutputConfig, OutputHandle, RunConfig, DEFAULT_STOP_TIMEOUT,
    MIN_STOP_TIMEOUT,
};

const CIDFILE_TIMEOUT: Duration = Duration::from_secs(60);
const IP_RETRIES: u64 = 10;
const IP_RETRY_DELAY: Duration = Duration::from_millis(300);

/// Delay before cidfile poll number `retry`: starts at 10 ms, grows by 10 ms
/// per retry, capped at 1 s
pub(crate) fn cidfile_delay(retry: u64) -> Duration {
    Duration::from_millis(10u64.saturating_mul(retry.saturating_add(1)).min(1000))
}

/// `docker stop --time` argument in seconds: floored at 1, default 15
pub(crate) fn stop_time_arg(timeout: Option<Duration>) -> u64 {
    timeout
        .unwrap_or(DEFAULT_STOP_TIMEOUT)
        .as_secs()
        .max(MIN_STOP_TIMEOUT.as_secs())
}

/// Synthesizes the argument vector for `docker create`/`docker run`.
/// Deterministic for fixed input: verb, name, port publications, network plus
/// `--add-host` entries for every sibling, hostname, volumes (both sides
/// non-empty), environment (non-empty keys), `--rm`, cidfile, image
/// reference, trailing image args.
#[allow(clippy::too_many_arguments)]
pub(crate) fn container_argv(
    verb: &str,
    name: &str,
    ports: &[String],
    network: Option<&str>,
    peer_hosts: &[(String, String)],
    hostname: Option<&str>,
    volumes: &[(String, String)],
    environment: &[(String, String)],
    clean_container: bool,
    cidfile: &str,
    image: &str,
    image_args: &[String],
) -> Vec<String> {
    let mut args = vec![verb.to_owned(), "--name".to_owned(), name.to_owned()];
    for port in ports {
        args.push("-p".to_owned());
        args.push(port.clone());
    }
    if let Some(network) = network {
        args.push("--net".to_owned());
        args.push(network.to_owned());
        for (host, ip) in peer_hosts {
            args.push("--add-host".to_owned());
            args.push(format!("{host}:{ip}"));
        }
    }
    if let Some(hostname) = hostname {
        args.push("-h".to_owned());
        args.push(hostname.to_owned());
    }
    for (host_path, container_path) in volumes {
        if !host_path.is_empty() && !container_path.is_empty() {
            args.push("-v".to_owned());
            args.push(format!("{host_path}:{container_path}"));
        }
    }
    for (key, val) in environment {
        if !key.is_empty() {
            args.push("-e".to_owned());
            args.push(format!("{key}={val}"));
        }
    }
    if clean_container {
        args.push("--rm".to_owned());
    }
    args.push("--cidfile".to_owned());
    args.push(cidfile.to_owned());
    args.push(image.to_owned());
    args.extend(image_args.iter().cloned());
    args
}

/// The shared part of a local host that spawned processes and runners hold
/// onto: the discovered binary, the session temp directory, and the stop
/// capability.
pub(crate) struct LocalCore {
    session_id: String,
    binary_override: Option<PathBuf>,
    docker_bin: OnceLock<PathBuf>,
    temp_dir: OnceLock<PathBuf>,
}

impl LocalCore {
    fn docker_bin(&self) -> Result<&Path> {
        self.docker_bin
            .get()
            .map(PathBuf::as_path)
            .stack_err("the docker binary path is only available after `initialize`")
    }

    fn temp_dir(&self) -> Result<&Path> {
        self.temp_dir
            .get()
            .map(PathBuf::as_path)
            .stack_err("the session temp directory is only available after `initialize`")
    }

    /// Runs the docker binary with `args` to completion, capturing output
    async fn run_docker(&self, args: &[String]) -> Result<Output> {
        let bin = self.docker_bin()?;
        debug!("docker {}", args.join(" "));
        process::Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .stack_err_with(|| format!("failed to run `docker {}`", args.join(" ")))
    }

    async fn stop_named(&self, name: &str, timeout: Option<Duration>) -> Result<bool> {
        let args = vec![
            "stop".to_owned(),
            "--time".to_owned(),
            stop_time_arg(timeout).to_string(),
            name.to_owned(),
        ];
        let out = self.run_docker(&args).await?;
        if !out.status.success() {
            warn!(
                "`docker stop` of \"{name}\" was unsuccessful: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(out.status.success())
    }
}

#[async_trait]
impl ContainerStop for LocalCore {
    async fn stop_container(&self, name: &str, timeout: Option<Duration>) -> Result<bool> {
        self.stop_named(name, timeout).await
    }
}

/// Control plane for the docker daemon reachable from this machine, shelling
/// out to the `docker` binary discovered at [initialize](DockerHost::initialize)
/// time. Supervised child stdio is decoded and appended into the process
/// [OutputStream](crate::OutputStream)s by background tasks.
pub struct LocalDockerHost {
    core: Arc<LocalCore>,
    runners: Mutex<BTreeMap<u64, Arc<ContainerRunner>>>,
    processes: Mutex<BTreeMap<u64, Arc<DockerProcess>>>,
    networks: NetworkRegistry,
    closed: AtomicBool,
}

impl Default for LocalDockerHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDockerHost {
    pub fn new() -> Self {
        Self::with_binary_override(None)
    }

    /// Uses `binary` instead of discovering one with `which docker`
    pub fn with_binary_path(binary: impl AsRef<Path>) -> Self {
        Self::with_binary_override(Some(binary.as_ref().to_owned()))
    }

    fn with_binary_override(binary_override: Option<PathBuf>) -> Self {
        Self {
            core: Arc::new(LocalCore {
                session_id: Uuid::new_v4().to_string(),
                binary_override,
                docker_bin: OnceLock::new(),
                temp_dir: OnceLock::new(),
            }),
            runners: Mutex::new(BTreeMap::new()),
            processes: Mutex::new(BTreeMap::new()),
            networks: NetworkRegistry::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn network_registry(&self) -> &NetworkRegistry {
        &self.networks
    }

    /// Mints the cidfile path for one container start. The file itself must
    /// not exist yet or docker refuses to start.
    fn mint_cidfile(&self, instance_id: u64) -> Result<PathBuf> {
        Ok(self.core.temp_dir()?.join(format!("cidfile-{instance_id}")))
    }

    /// Waits for docker to write the container id, polling with growing
    /// delays, giving up early once the supervised process has exited and at
    /// 60 s overall
    async fn wait_cidfile(
        &self,
        path: &Path,
        process: Option<&DockerProcess>,
    ) -> Option<String> {
        let start = Instant::now();
        let mut retry = 0;
        loop {
            if let Ok(metadata) = fs::metadata(path).await {
                if metadata.len() > 1 {
                    if let Ok(content) = fs::read_to_string(path).await {
                        let id = content.trim();
                        if !id.is_empty() {
                            return Some(id.to_owned())
                        }
                    }
                }
            }
            if process.map(|p| !p.is_running()).unwrap_or(false) {
                return None
            }
            if start.elapsed() >= CIDFILE_TIMEOUT {
                return None
            }
            sleep(cidfile_delay(retry)).await;
            retry += 1;
        }
    }

    /// Cidfile probe with the `docker ps -aqf` fallback
    async fn probe_container_id(
        &self,
        cidfile: &Path,
        name: &str,
        process: Option<&DockerProcess>,
    ) -> Result<Option<String>> {
        if let Some(id) = self.wait_cidfile(cidfile, process).await {
            return Ok(Some(id))
        }
        debug!("cidfile for \"{name}\" never appeared, falling back to `docker ps`");
        self.lookup_container_id(name, true).await
    }

    async fn lookup_container_id(&self, name: &str, all: bool) -> Result<Option<String>> {
        let filter = format!("name={name}");
        let mut args = vec!["ps".to_owned()];
        args.push(if all { "-aqf".to_owned() } else { "-qf".to_owned() });
        args.push(filter);
        let out = self.core.run_docker(&args).await?;
        if !out.status.success() {
            return Ok(None)
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        Ok(stdout.lines().next().map(|line| line.trim().to_owned()))
    }

    /// Spawns the docker binary with `argv` and wires its stdio into a new
    /// supervised process: one reader task per stream appends into the
    /// output history, a waiter task latches the exit code (which also
    /// forces both ready latches)
    fn spawn_supervised(
        &self,
        instance_id: u64,
        container_name: Option<String>,
        argv: &[String],
        output: &OutputConfig,
    ) -> Result<Arc<DockerProcess>> {
        let process = DockerProcess::new(instance_id, container_name, output);
        let mut cmd = process::Command::new(self.core.docker_bin()?);
        cmd.args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        let mut child = cmd
            .spawn()
            .stack_err_with(|| format!("failed to spawn `docker {}`", argv.join(" ")))?;
        let stdout = child
            .stdout
            .take()
            .stack_err("child process stdout was not piped")?;
        let stderr = child
            .stderr
            .take()
            .stack_err("child process stderr was not piped")?;
        let stdout_pump = task::spawn(pump(stdout, process.stdout().clone()));
        let stderr_pump = task::spawn(pump(stderr, process.stderr().clone()));
        let waiter = Arc::clone(&process);
        task::spawn(async move {
            // both streams are at EOF and fully appended before the exit code
            // becomes observable, so an exited process implies settled output
            let _ = stdout_pump.await;
            let _ = stderr_pump.await;
            match child.wait().await {
                Ok(status) => waiter.set_exit(status.code().unwrap_or(-1)),
                Err(e) => {
                    warn!("waiting on a supervised docker process failed: {e}");
                    waiter.set_exit(-1);
                }
            }
        });
        Ok(process)
    }

    fn register_process(&self, process: &Arc<DockerProcess>) {
        self.processes
            .lock()
            .insert(process.instance_id(), Arc::clone(process));
    }

    fn register_runner(&self, runner: &Arc<ContainerRunner>) {
        self.runners
            .lock()
            .insert(runner.instance_id(), Arc::clone(runner));
    }

    /// The container's address on `network`, from `docker inspect`. Retries
    /// because there is a delay between a container starting and an address
    /// being assigned.
    pub async fn get_container_ip(&self, id: &str, network: Option<&str>) -> Result<String> {
        wait_for_ok(IP_RETRIES, IP_RETRY_DELAY, || self.inspect_ip(id, network))
            .await
            .stack_err_with(|| format!("get_container_ip(id: {id}, network: {network:?})"))
    }

    async fn inspect_ip(&self, id: &str, network: Option<&str>) -> Result<String> {
        let args = vec!["inspect".to_owned(), id.to_owned()];
        let out = self.core.run_docker(&args).await?;
        if !out.status.success() {
            bail!("`docker inspect {id}` was unsuccessful")
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let v: serde_json::Value =
            serde_json::from_str(&stdout).stack_err("`docker inspect` emitted malformed JSON")?;
        let networks = v
            .get(0)
            .and_then(|v| v.get("NetworkSettings"))
            .and_then(|v| v.get("Networks"))
            .and_then(|v| v.as_object())
            .stack_err("`docker inspect` output had an unexpected shape")?;
        let entry = match network {
            Some(network) => networks.get(network),
            None => networks.values().next(),
        };
        let ip = entry
            .and_then(|v| v.get("IPAddress"))
            .and_then(|v| v.as_str())
            .stack_err("no IPAddress in `docker inspect` output")?;
        if ip.is_empty() {
            bail!("IP address has not been assigned yet")
        }
        Ok(ip.to_owned())
    }

    /// Appends `hostname ip` lines to `/etc/hosts` inside each target
    /// container. The outer map is `container_name -> (hostname -> ip)`; the
    /// result records per container whether every write succeeded.
    pub async fn add_containers_host_mapping(
        &self,
        mapping: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, bool>> {
        let mut results = BTreeMap::new();
        for (container, entries) in mapping {
            let mut ok = true;
            for (hostname, ip) in entries {
                let args = vec![
                    "exec".to_owned(),
                    container.clone(),
                    "/bin/sh".to_owned(),
                    "-c".to_owned(),
                    format!("echo '{ip} {hostname}' >> /etc/hosts"),
                ];
                let out = self.core.run_docker(&args).await?;
                if !out.status.success() {
                    warn!(
                        "could not patch /etc/hosts of \"{container}\": {}",
                        String::from_utf8_lossy(&out.stderr).trim()
                    );
                    ok = false;
                }
            }
            results.insert(container.clone(), ok);
        }
        Ok(results)
    }
}

impl Drop for LocalDockerHost {
    fn drop(&mut self) {
        // the registries are allowed to hold exited entries forever, but the
        // temp directory needs an explicit `close`
        if self.core.temp_dir.get().is_some()
            && !self.closed.load(Ordering::Relaxed)
            && !std::thread::panicking()
        {
            warn!(
                "a `LocalDockerHost` (session {}) was dropped without `close`, its temp \
                 directory was not swept",
                self.core.session_id
            )
        }
    }
}

#[async_trait]
impl DockerHost for LocalDockerHost {
    fn session_id(&self) -> &str {
        &self.core.session_id
    }

    async fn initialize(&self) -> Result<bool> {
        if self.core.docker_bin.get().is_none() {
            let discovered = match self.core.binary_override.as_ref() {
                Some(path) => acquire_file_path(path).await,
                None => {
                    let out = process::Command::new("which")
                        .arg("docker")
                        .stdin(Stdio::null())
                        .output()
                        .await
                        .stack_err("failed to run `which docker`")?;
                    if !out.status.success() {
                        warn!("`which docker` found no binary");
                        return Ok(false)
                    }
                    let path = String::from_utf8_lossy(&out.stdout).trim().to_owned();
                    acquire_file_path(&path).await
                }
            };
            match discovered {
                Ok(path) => {
                    debug!("using docker binary at {path:?}");
                    let _ = self.core.docker_bin.set(path);
                }
                Err(e) => {
                    warn!("could not acquire a docker binary: {e:?}");
                    return Ok(false)
                }
            }
        }
        if self.core.temp_dir.get().is_none() {
            let dir =
                std::env::temp_dir().join(format!("docker_commander_{}", self.core.session_id));
            fs::create_dir_all(&dir)
                .await
                .stack_err("failed to create the session temp directory")?;
            let _ = self.core.temp_dir.set(dir);
        }
        Ok(true)
    }

    async fn check_daemon(&self) -> Result<bool> {
        let out = self.core.run_docker(&["ps".to_owned()]).await?;
        Ok(out.status.success())
    }

    async fn create_container(&self, config: CreateConfig) -> Result<Option<CreatedContainer>> {
        let instance_id = next_instance_id();
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| default_container_name(&self.core.session_id, instance_id));
        let ports = normalize_ports(&config.ports);
        let peers = match config.network.as_deref() {
            Some(network) => self.networks.peers(network, &name),
            None => vec![],
        };
        let peer_hosts: Vec<(String, String)> = peers
            .iter()
            .map(|(_, entry)| (entry.hostname.clone(), entry.ip.clone()))
            .collect();
        let cidfile = self.mint_cidfile(instance_id)?;
        let argv = container_argv(
            "create",
            &name,
            &ports,
            config.network.as_deref(),
            &peer_hosts,
            config.hostname.as_deref(),
            &config.volumes,
            &config.environment,
            config.clean_container,
            &cidfile.to_string_lossy(),
            &image_ref(&config.image, config.version.as_deref()),
            &[],
        );
        let out = self.core.run_docker(&argv).await?;
        if !out.status.success() {
            warn!(
                "`docker create` of \"{name}\" was unsuccessful: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
            return Ok(None)
        }
        let id = match self.probe_container_id(&cidfile, &name, None).await? {
            Some(id) => id,
            None => {
                warn!("created container \"{name}\" but could not determine its id");
                return Ok(None)
            }
        };
        Ok(Some(CreatedContainer {
            container_name: name,
            id,
            image: config.image,
            ports,
            network: config.network,
            hostname: config.hostname,
        }))
    }

    async fn run(&self, config: RunConfig) -> Result<Option<Arc<ContainerRunner>>> {
        let instance_id = next_instance_id();
        let create = &config.create;
        let name = create
            .name
            .clone()
            .unwrap_or_else(|| default_container_name(&self.core.session_id, instance_id));
        let ports = normalize_ports(&create.ports);
        let peers = match create.network.as_deref() {
            Some(network) => self.networks.peers(network, &name),
            None => vec![],
        };
        let peer_hosts: Vec<(String, String)> = peers
            .iter()
            .map(|(_, entry)| (entry.hostname.clone(), entry.ip.clone()))
            .collect();
        let cidfile = self.mint_cidfile(instance_id)?;
        let argv = container_argv(
            "run",
            &name,
            &ports,
            create.network.as_deref(),
            &peer_hosts,
            create.hostname.as_deref(),
            &create.volumes,
            &create.environment,
            create.clean_container,
            &cidfile.to_string_lossy(),
            &image_ref(&create.image, create.version.as_deref()),
            &config.image_args,
        );
        let process = self.spawn_supervised(instance_id, Some(name.clone()), &argv, &config.output)?;

        let id = match self
            .probe_container_id(&cidfile, &name, Some(&process))
            .await?
        {
            Some(id) => id,
            None => {
                warn!("container \"{name}\" did not start (no id could be determined)");
                return Ok(None)
            }
        };

        let mut ip = None;
        if let Some(network) = create.network.as_deref() {
            match self.get_container_ip(&id, Some(network)).await {
                Ok(addr) => ip = Some(addr),
                Err(e) => warn!("could not inspect the address of \"{name}\": {e:?}"),
            }
            if let (Some(hostname), Some(addr)) = (create.hostname.as_deref(), ip.as_deref()) {
                self.networks.register(network, &name, hostname, addr);
                // make the newcomer resolvable from the incumbents as well
                if !peers.is_empty() {
                    let entry = BTreeMap::from([(hostname.to_owned(), addr.to_owned())]);
                    let mapping = peers
                        .iter()
                        .map(|(peer_name, _)| (peer_name.clone(), entry.clone()))
                        .collect();
                    let _ = self.add_containers_host_mapping(&mapping).await?;
                }
            }
        }

        let runner = ContainerRunner::new(
            Arc::clone(&process),
            name,
            id,
            create.image.clone(),
            create.version.clone(),
            ports,
            create.network.clone(),
            create.hostname.clone(),
            ip,
            Arc::clone(&self.core) as Arc<dyn ContainerStop>,
        );
        self.register_process(&process);
        self.register_runner(&runner);
        process.wait_ready().await;
        Ok(Some(runner))
    }

    async fn exec(
        &self,
        container_name: &str,
        cmd: &str,
        args: Vec<String>,
        output: OutputConfig,
    ) -> Result<Option<Arc<DockerProcess>>> {
        if self.lookup_container_id(container_name, false).await?.is_none() {
            warn!("exec into \"{container_name}\" refused, no such running container");
            return Ok(None)
        }
        let instance_id = next_instance_id();
        let mut argv = vec![
            "exec".to_owned(),
            container_name.to_owned(),
            cmd.to_owned(),
        ];
        argv.extend(args);
        let process =
            self.spawn_supervised(instance_id, Some(container_name.to_owned()), &argv, &output)?;
        self.register_process(&process);
        process.wait_ready().await;
        Ok(Some(process))
    }

    async fn command(
        &self,
        cmd: &str,
        args: Vec<String>,
        output: OutputConfig,
    ) -> Result<Option<Arc<DockerProcess>>> {
        let instance_id = next_instance_id();
        let mut argv = vec![cmd.to_owned()];
        argv.extend(args);
        let process = self.spawn_supervised(instance_id, None, &argv, &output)?;
        self.register_process(&process);
        process.wait_ready().await;
        Ok(Some(process))
    }

    async fn get_container_id_by_name(&self, name: &str) -> Result<Option<String>> {
        self.lookup_container_id(name, true).await
    }

    async fn stop_by_name(&self, name: &str, timeout: Option<Duration>) -> Result<bool> {
        self.core.stop_named(name, timeout).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(dir) = self.core.temp_dir.get() {
            if let Err(e) = fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e).stack_err("failed to sweep the session temp directory")
                }
            }
        }
        Ok(())
    }

    fn get_runner_by_instance_id(&self, instance_id: u64) -> Option<Arc<ContainerRunner>> {
        self.runners.lock().get(&instance_id).cloned()
    }

    fn get_process_by_instance_id(&self, instance_id: u64) -> Option<Arc<DockerProcess>> {
        self.processes.lock().get(&instance_id).cloned()
    }

    fn forget_runner(&self, instance_id: u64) -> bool {
        let runner = self.runners.lock().remove(&instance_id);
        if let Some(runner) = runner {
            self.processes.lock().remove(&instance_id);
            self.networks.remove_container(runner.name());
            true
        } else {
            false
        }
    }

    fn forget_process(&self, instance_id: u64) -> bool {
        self.processes.lock().remove(&instance_id).is_some()
    }
}

/// Copies one child stdio stream into its output history, decoding by line or
/// copying raw bytes depending on the handle mode
async fn pump<R: AsyncRead + Unpin>(reader: R, handle: OutputHandle) {
    match handle {
        OutputHandle::Lines(stream) => {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        while matches!(buf.last(), Some(b'\n' | b'\r')) {
                            buf.pop();
                        }
                        stream.push(String::from_utf8_lossy(&buf).into_owned());
                    }
                    Err(e) => {
                        warn!("supervised stdio line reader failed: {e}");
                        break
                    }
                }
            }
        }
        OutputHandle::Bytes(stream) => {
            let mut reader = reader;
            let mut buf = [0u8; 8 * 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => stream.push_bytes(&buf[..n]),
                    Err(e) => {
                        warn!("supervised stdio byte reader failed: {e}");
                        break
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_synthesis_is_deterministic_and_ordered() {
        let argv = container_argv(
            "run",
            "docker_commander-s-0",
            &["80:80".to_owned(), "443:443".to_owned()],
            Some("testnet"),
            &[("peer".to_owned(), "172.18.0.2".to_owned())],
            Some("me"),
            &[
                ("/data".to_owned(), "/var/lib/data".to_owned()),
                (String::new(), "/skipped".to_owned()),
            ],
            &[
                ("POSTGRES_PASSWORD".to_owned(), "p".to_owned()),
                (String::new(), "skipped".to_owned()),
            ],
            true,
            "/tmp/cidfile-0",
            "postgres:latest",
            &["-c".to_owned(), "max_connections=10".to_owned()],
        );
        assert_eq!(argv, [
            "run",
            "--name",
            "docker_commander-s-0",
            "-p",
            "80:80",
            "-p",
            "443:443",
            "--net",
            "testnet",
            "--add-host",
            "peer:172.18.0.2",
            "-h",
            "me",
            "-v",
            "/data:/var/lib/data",
            "-e",
            "POSTGRES_PASSWORD=p",
            "--rm",
            "--cidfile",
            "/tmp/cidfile-0",
            "postgres:latest",
            "-c",
            "max_connections=10",
        ]);
    }

    #[test]
    fn create_argv_has_no_trailing_args() {
        let argv = container_argv(
            "create",
            "c",
            &[],
            None,
            &[],
            None,
            &[],
            &[],
            false,
            "/tmp/cidfile-1",
            "alpine",
            &[],
        );
        assert_eq!(argv, ["create", "--name", "c", "--cidfile", "/tmp/cidfile-1", "alpine"]);
    }

    #[test]
    fn stop_timeout_floor_and_default() {
        assert_eq!(stop_time_arg(Some(Duration::ZERO)), 1);
        assert_eq!(stop_time_arg(Some(Duration::from_millis(500))), 1);
        assert_eq!(stop_time_arg(Some(Duration::from_secs(30))), 30);
        assert_eq!(stop_time_arg(None), 15);
    }

    #[test]
    fn cidfile_backoff_grows_to_cap() {
        assert_eq!(cidfile_delay(0), Duration::from_millis(10));
        assert_eq!(cidfile_delay(1), Duration::from_millis(20));
        assert_eq!(cidfile_delay(5), Duration::from_millis(60));
        assert_eq!(cidfile_delay(99), Duration::from_millis(1000));
        assert_eq!(cidfile_delay(1000), Duration::from_millis(1000));
    }
}
