use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use stacked_errors::{bail, Result, StackableErr};
use tokio::{task, time::sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    normalize_ports,
    wire::{encode_str_vec, join_csv, join_pairs, CommandReply, ExecReply, PullReply, RunReply},
    ContainerRunner, ContainerStop, CreateConfig, CreatedContainer, Credentials, DockerHost,
    DockerProcess, OutputConfig, OutputHandle, RunConfig,
};

/// Consecutive RPC failures tolerated by a puller (or the exit watcher)
/// before it gives up
const MAX_SYNC_FAILURES: u32 = 3;
const EXIT_WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Sleep before the next output poll given the number of consecutive empty
/// replies since data last arrived: 50 ms while data flows, then k x 100 ms,
/// ceiling 10 s
pub(crate) fn poll_backoff(consecutive_empty: u64) -> Duration {
    match consecutive_empty {
        0 => Duration::from_millis(50),
        k @ 1..=100 => Duration::from_millis(k * 100),
        _ => Duration::from_millis(10_000),
    }
}

/// Authenticated HTTP channel to the peer. Every operation is a GET with
/// query parameters and a JSON reply; the bearer token from `/auth` is cached
/// and attached as `X-Access-Token`, with a single re-auth retry when it is
/// rejected.
pub(crate) struct RemoteTransport {
    base: Url,
    http: Client,
    credentials: Credentials,
    token: tokio::sync::Mutex<Option<String>>,
}

impl RemoteTransport {
    fn new(base: Url, credentials: Credentials) -> Result<Self> {
        Ok(Self {
            base,
            http: Client::builder()
                .build()
                .stack_err("failed to build the HTTP client")?,
            credentials,
            token: tokio::sync::Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .stack_err_with(|| format!("could not join \"{path}\" onto {}", self.base))
    }

    async fn bearer_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone())
        }
        let token = self.authenticate().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }

    async fn authenticate(&self) -> Result<String> {
        let req = self.http.get(self.url("/auth")?);
        let req = match &self.credentials {
            Credentials::Bearer(token) => req.bearer_auth(token),
            Credentials::Basic { username, password } => req.basic_auth(username, Some(password)),
        };
        let resp = req
            .send()
            .await
            .stack_err("the auth request could not be sent")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("authentication was rejected with status {status}")
        }
        let value: serde_json::Value = resp
            .json()
            .await
            .stack_err("the auth reply was malformed")?;
        value
            .as_str()
            .map(str::to_owned)
            .stack_err("the auth reply was not a token string")
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        for attempt in 0..2 {
            let token = self.bearer_token().await?;
            let resp = self
                .http
                .get(self.url(path)?)
                .query(query)
                .header("X-Access-Token", &token)
                .send()
                .await
                .stack_err_with(|| format!("GET {path} could not be sent"))?;
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!("token rejected on {path}, re-authenticating");
                self.invalidate_token().await;
                continue
            }
            if !status.is_success() {
                bail!("GET {path} returned status {status}")
            }
            return resp
                .json::<T>()
                .await
                .stack_err_with(|| format!("GET {path} returned malformed JSON"))
        }
        bail!("GET {path} was still rejected after re-authentication")
    }
}

#[async_trait]
impl ContainerStop for RemoteTransport {
    async fn stop_container(&self, name: &str, timeout: Option<Duration>) -> Result<bool> {
        let mut query = vec![("name", name.to_owned())];
        if let Some(timeout) = timeout {
            query.push(("timeout", timeout.as_secs().to_string()));
        }
        self.get_json::<bool>("/stop", &query).await
    }
}

#[derive(Clone, Copy)]
enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    fn path(self) -> &'static str {
        match self {
            Self::Stdout => "/stdout",
            Self::Stderr => "/stderr",
        }
    }

    fn handle(self, process: &DockerProcess) -> &OutputHandle {
        match self {
            Self::Stdout => process.stdout(),
            Self::Stderr => process.stderr(),
        }
    }
}

fn absorb_reply(handle: &OutputHandle, reply: &PullReply) -> Result<usize> {
    match handle {
        OutputHandle::Lines(stream) => stream.absorb(reply.removed, reply.lines()?),
        OutputHandle::Bytes(stream) => stream.absorb(reply.removed, reply.bytes()?),
    }
    Ok(reply.entries.len())
}

/// Pulls one stdio stream of a remote process into its local mirror until the
/// process is known to have exited (or the transport fails three times in a
/// row). Each poll asks for everything from the mirror's logical length
/// onward, so replication is driven purely by offsets.
fn spawn_puller(transport: Arc<RemoteTransport>, process: Arc<DockerProcess>, which: StdStream) {
    task::spawn(async move {
        let path = which.path();
        let instance_id = process.instance_id();
        let mut consecutive_empty: u64 = 0;
        let mut failures: u32 = 0;
        loop {
            sleep(poll_backoff(consecutive_empty)).await;
            // a known exit still gets one more poll so the tail drains; the
            // origin reports `running: false` only after its streams settled
            let exited = !process.is_running();
            let handle = which.handle(&process);
            let query = [
                ("instanceID", instance_id.to_string()),
                ("realOffset", handle.logical_len().to_string()),
            ];
            match transport.get_json::<PullReply>(path, &query).await {
                Ok(reply) => {
                    failures = 0;
                    match absorb_reply(handle, &reply) {
                        Ok(0) => consecutive_empty += 1,
                        Ok(_) => consecutive_empty = 0,
                        Err(e) => {
                            warn!("instance {instance_id} {path} sync got bad entries: {e:?}");
                            break
                        }
                    }
                    if !reply.running || exited {
                        break
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "instance {instance_id} {path} sync failed \
                         ({failures}/{MAX_SYNC_FAILURES}): {e:?}"
                    );
                    if failures >= MAX_SYNC_FAILURES {
                        break
                    }
                }
            }
        }
        debug!("instance {instance_id} {path} puller finished");
    });
}

/// Long-polls `/wait_exit` and latches the exit code into the mirror, which
/// also forces both ready latches and lets the pullers terminate
fn spawn_exit_watcher(transport: Arc<RemoteTransport>, process: Arc<DockerProcess>) {
    task::spawn(async move {
        let instance_id = process.instance_id();
        let query = [("instanceID", instance_id.to_string())];
        let mut failures: u32 = 0;
        loop {
            match transport.get_json::<i32>("/wait_exit", &query).await {
                Ok(code) => {
                    process.set_exit(code);
                    break
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "instance {instance_id} exit watch failed \
                         ({failures}/{MAX_SYNC_FAILURES}): {e:?}"
                    );
                    if failures >= MAX_SYNC_FAILURES {
                        break
                    }
                    sleep(EXIT_WATCH_RETRY_DELAY).await;
                }
            }
        }
    });
}

/// Control plane for a docker daemon behind a remote peer speaking the
/// GET/JSON dialect that [server](crate::server) serves. Processes started
/// here are mirrors: the
/// peer assigns instance ids and supervises the real thing, while this side
/// pulls stdio by offset and evaluates readiness predicates against the
/// mirrored streams.
pub struct RemoteDockerHost {
    session_id: String,
    transport: Arc<RemoteTransport>,
    runners: Mutex<BTreeMap<u64, Arc<ContainerRunner>>>,
    processes: Mutex<BTreeMap<u64, Arc<DockerProcess>>>,
}

impl RemoteDockerHost {
    pub fn new(base_url: impl AsRef<str>, credentials: Credentials) -> Result<Self> {
        let base = Url::parse(base_url.as_ref())
            .stack_err_with(|| format!("malformed base url \"{}\"", base_url.as_ref()))?;
        Ok(Self {
            session_id: Uuid::new_v4().to_string(),
            transport: Arc::new(RemoteTransport::new(base, credentials)?),
            runners: Mutex::new(BTreeMap::new()),
            processes: Mutex::new(BTreeMap::new()),
        })
    }

    /// Builds the local mirror of a remote process and starts its pullers
    /// and exit watcher
    fn mirror_process(
        &self,
        instance_id: u64,
        container_name: Option<String>,
        output: &OutputConfig,
    ) -> Arc<DockerProcess> {
        let process = DockerProcess::new(instance_id, container_name, output);
        spawn_puller(
            Arc::clone(&self.transport),
            Arc::clone(&process),
            StdStream::Stdout,
        );
        spawn_puller(
            Arc::clone(&self.transport),
            Arc::clone(&process),
            StdStream::Stderr,
        );
        spawn_exit_watcher(Arc::clone(&self.transport), Arc::clone(&process));
        self.processes.lock().insert(instance_id, Arc::clone(&process));
        process
    }

    fn create_query(config: &CreateConfig) -> Vec<(&'static str, String)> {
        let mut query = vec![("image", config.image.clone())];
        if let Some(version) = &config.version {
            query.push(("version", version.clone()));
        }
        if let Some(name) = &config.name {
            query.push(("name", name.clone()));
        }
        query.push(("ports", join_csv(&normalize_ports(&config.ports))));
        if let Some(network) = &config.network {
            query.push(("network", network.clone()));
        }
        if let Some(hostname) = &config.hostname {
            query.push(("hostname", hostname.clone()));
        }
        query.push(("environment", join_pairs(&config.environment)));
        query.push(("volumes", join_pairs(&config.volumes)));
        query.push(("cleanContainer", config.clean_container.to_string()));
        query
    }

    fn output_query(output: &OutputConfig, query: &mut Vec<(&'static str, String)>) {
        query.push(("outputAsLines", output.as_lines.to_string()));
        if let Some(limit) = output.limit {
            query.push(("outputLimit", limit.to_string()));
        }
    }
}

#[async_trait]
impl DockerHost for RemoteDockerHost {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn initialize(&self) -> Result<bool> {
        self.transport.get_json::<bool>("/initialize", &[]).await
    }

    async fn check_daemon(&self) -> Result<bool> {
        self.transport.get_json::<bool>("/check_daemon", &[]).await
    }

    async fn create_container(&self, config: CreateConfig) -> Result<Option<CreatedContainer>> {
        let query = Self::create_query(&config);
        self.transport
            .get_json::<Option<CreatedContainer>>("/create", &query)
            .await
    }

    async fn run(&self, config: RunConfig) -> Result<Option<Arc<ContainerRunner>>> {
        let mut query = Self::create_query(&config.create);
        query.push(("imageArgs", encode_str_vec(&config.image_args)));
        Self::output_query(&config.output, &mut query);
        let reply = match self
            .transport
            .get_json::<Option<RunReply>>("/run", &query)
            .await?
        {
            Some(reply) => reply,
            None => return Ok(None),
        };
        let process = self.mirror_process(
            reply.instance_id,
            Some(reply.container_name.clone()),
            &config.output,
        );
        let create = config.create;
        let runner = ContainerRunner::new(
            Arc::clone(&process),
            reply.container_name,
            reply.id,
            create.image,
            create.version,
            normalize_ports(&create.ports),
            create.network,
            create.hostname,
            None,
            Arc::clone(&self.transport) as Arc<dyn ContainerStop>,
        );
        self.runners.lock().insert(runner.instance_id(), Arc::clone(&runner));
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
        let mut query = vec![
            ("cmd", cmd.to_owned()),
            ("args", encode_str_vec(&args)),
            ("name", container_name.to_owned()),
        ];
        Self::output_query(&output, &mut query);
        let reply = match self
            .transport
            .get_json::<Option<ExecReply>>("/exec", &query)
            .await?
        {
            Some(reply) => reply,
            None => return Ok(None),
        };
        let process =
            self.mirror_process(reply.instance_id, Some(reply.container_name), &output);
        process.wait_ready().await;
        Ok(Some(process))
    }

    async fn command(
        &self,
        cmd: &str,
        args: Vec<String>,
        output: OutputConfig,
    ) -> Result<Option<Arc<DockerProcess>>> {
        let mut query = vec![("cmd", cmd.to_owned()), ("args", encode_str_vec(&args))];
        Self::output_query(&output, &mut query);
        let reply = match self
            .transport
            .get_json::<Option<CommandReply>>("/command", &query)
            .await?
        {
            Some(reply) => reply,
            None => return Ok(None),
        };
        let process = self.mirror_process(reply.instance_id, None, &output);
        process.wait_ready().await;
        Ok(Some(process))
    }

    async fn get_container_id_by_name(&self, name: &str) -> Result<Option<String>> {
        self.transport
            .get_json::<Option<String>>("/id_by_name", &[("name", name.to_owned())])
            .await
    }

    async fn stop_by_name(&self, name: &str, timeout: Option<Duration>) -> Result<bool> {
        self.transport.stop_container(name, timeout).await
    }

    async fn close(&self) -> Result<()> {
        let _ = self.transport.get_json::<bool>("/close", &[]).await?;
        Ok(())
    }

    fn get_runner_by_instance_id(&self, instance_id: u64) -> Option<Arc<ContainerRunner>> {
        self.runners.lock().get(&instance_id).cloned()
    }

    fn get_process_by_instance_id(&self, instance_id: u64) -> Option<Arc<DockerProcess>> {
        self.processes.lock().get(&instance_id).cloned()
    }

    fn forget_runner(&self, instance_id: u64) -> bool {
        let existed = self.runners.lock().remove(&instance_id).is_some();
        if existed {
            self.processes.lock().remove(&instance_id);
        }
        existed
    }

    fn forget_process(&self, instance_id: u64) -> bool {
        self.processes.lock().remove(&instance_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_exact() {
        let observed: Vec<u64> = (0..=102).map(|k| poll_backoff(k).as_millis() as u64).collect();
        assert_eq!(observed[0], 50);
        assert_eq!(observed[1], 100);
        assert_eq!(observed[2], 200);
        assert_eq!(observed[3], 300);
        assert_eq!(observed[100], 10_000);
        assert_eq!(observed[101], 10_000);
        assert_eq!(observed[102], 10_000);
    }

    #[test]
    fn absorb_reply_converts_line_entries() {
        let process = DockerProcess::new(0, None, &OutputConfig::new());
        let reply = PullReply {
            running: true,
            length: 15,
            removed: 10,
            entries: (10..15).map(|i| format!("E{i}").into()).collect(),
        };
        let appended = absorb_reply(process.stdout(), &reply).unwrap();
        assert_eq!(appended, 5);
        assert_eq!(process.stdout().entries_removed(), 10);
        assert_eq!(process.stdout().logical_len(), 15);
        assert_eq!(
            process.stdout().lines().unwrap(),
            ["E10", "E11", "E12", "E13", "E14"]
        );
    }

    #[test]
    fn absorb_reply_rejects_mismatched_entry_types() {
        let process = DockerProcess::new(0, None, &OutputConfig::new());
        let reply = PullReply {
            running: true,
            length: 1,
            removed: 0,
            entries: vec![serde_json::json!(3)],
        };
        assert!(absorb_reply(process.stdout(), &reply).is_err());
    }
}
