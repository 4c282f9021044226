use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stacked_errors::Result;

use crate::{ContainerRunner, DockerProcess, OutputConfig};

/// Default grace period passed to `docker stop`
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(15);
/// `docker stop --time` is floored to this
pub const MIN_STOP_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn default_container_name(session_id: &str, instance_id: u64) -> String {
    format!("docker_commander-{session_id}-{instance_id}")
}

/// Credential for a remote control-plane endpoint: either a preissued bearer
/// token or a username/password pair exchanged for one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

impl Credentials {
    pub fn bearer(token: impl AsRef<str>) -> Self {
        Self::Bearer(token.as_ref().to_owned())
    }

    pub fn basic(username: impl AsRef<str>, password: impl AsRef<str>) -> Self {
        Self::Basic {
            username: username.as_ref().to_owned(),
            password: password.as_ref().to_owned(),
        }
    }
}

/// Configuration for `docker create`.
///
/// # Note
///
/// `clean_container` defaults to `false` here, while [RunConfig] defaults it
/// to `true`; created-but-not-started containers are kept around for a later
/// explicit start, run containers self-destruct by default.
#[must_use]
#[derive(Debug, Clone)]
pub struct CreateConfig {
    pub image: String,
    pub version: Option<String>,
    /// Caller-chosen container name; auto-generated from the session and
    /// instance ids when unset
    pub name: Option<String>,
    /// Port publications, normalized with
    /// [normalize_ports](crate::normalize_ports)
    pub ports: Vec<String>,
    pub network: Option<String>,
    pub hostname: Option<String>,
    /// Environment variable mappings, entries with empty keys are skipped
    pub environment: Vec<(String, String)>,
    /// `host_path:container_path` volume mappings, entries with an empty side
    /// are skipped
    pub volumes: Vec<(String, String)>,
    /// Passes `--rm` so the container removes itself on exit
    pub clean_container: bool,
}

impl CreateConfig {
    pub fn new(image: impl AsRef<str>) -> Self {
        Self {
            image: image.as_ref().to_owned(),
            version: None,
            name: None,
            ports: vec![],
            network: None,
            hostname: None,
            environment: vec![],
            volumes: vec![],
            clean_container: false,
        }
    }

    pub fn version(mut self, version: impl AsRef<str>) -> Self {
        self.version = Some(version.as_ref().to_owned());
        self
    }

    pub fn name(mut self, name: impl AsRef<str>) -> Self {
        self.name = Some(name.as_ref().to_owned());
        self
    }

    pub fn port(mut self, port: impl AsRef<str>) -> Self {
        self.ports.push(port.as_ref().to_owned());
        self
    }

    pub fn ports<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ports
            .extend(ports.into_iter().map(|s| s.as_ref().to_owned()));
        self
    }

    pub fn network(mut self, network: impl AsRef<str>) -> Self {
        self.network = Some(network.as_ref().to_owned());
        self
    }

    pub fn hostname(mut self, hostname: impl AsRef<str>) -> Self {
        self.hostname = Some(hostname.as_ref().to_owned());
        self
    }

    pub fn env(mut self, key: impl AsRef<str>, val: impl AsRef<str>) -> Self {
        self.environment
            .push((key.as_ref().to_owned(), val.as_ref().to_owned()));
        self
    }

    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.environment.extend(
            envs.into_iter()
                .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned())),
        );
        self
    }

    pub fn volume(mut self, host_path: impl AsRef<str>, container_path: impl AsRef<str>) -> Self {
        self.volumes.push((
            host_path.as_ref().to_owned(),
            container_path.as_ref().to_owned(),
        ));
        self
    }

    pub fn clean_container(mut self, clean_container: bool) -> Self {
        self.clean_container = clean_container;
        self
    }
}

/// Configuration for `docker run`: everything [CreateConfig] carries plus the
/// trailing image arguments and the stdio/readiness setup
#[must_use]
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub create: CreateConfig,
    /// Trailing arguments passed to the image entrypoint
    pub image_args: Vec<String>,
    pub output: OutputConfig,
}

impl RunConfig {
    pub fn new(image: impl AsRef<str>) -> Self {
        Self {
            create: CreateConfig::new(image).clean_container(true),
            image_args: vec![],
            output: OutputConfig::default(),
        }
    }

    pub fn version(mut self, version: impl AsRef<str>) -> Self {
        self.create = self.create.version(version);
        self
    }

    pub fn name(mut self, name: impl AsRef<str>) -> Self {
        self.create = self.create.name(name);
        self
    }

    pub fn port(mut self, port: impl AsRef<str>) -> Self {
        self.create = self.create.port(port);
        self
    }

    pub fn ports<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.create = self.create.ports(ports);
        self
    }

    pub fn network(mut self, network: impl AsRef<str>) -> Self {
        self.create = self.create.network(network);
        self
    }

    pub fn hostname(mut self, hostname: impl AsRef<str>) -> Self {
        self.create = self.create.hostname(hostname);
        self
    }

    pub fn env(mut self, key: impl AsRef<str>, val: impl AsRef<str>) -> Self {
        self.create = self.create.env(key, val);
        self
    }

    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.create = self.create.envs(envs);
        self
    }

    pub fn volume(mut self, host_path: impl AsRef<str>, container_path: impl AsRef<str>) -> Self {
        self.create = self.create.volume(host_path, container_path);
        self
    }

    pub fn clean_container(mut self, clean_container: bool) -> Self {
        self.create = self.create.clean_container(clean_container);
        self
    }

    pub fn image_arg(mut self, arg: impl AsRef<str>) -> Self {
        self.image_args.push(arg.as_ref().to_owned());
        self
    }

    pub fn image_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.image_args
            .extend(args.into_iter().map(|s| s.as_ref().to_owned()));
        self
    }

    pub fn output(mut self, output: OutputConfig) -> Self {
        self.output = output;
        self
    }
}

/// What `docker create` produced, also the `/create` RPC reply shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedContainer {
    #[serde(rename = "containerName")]
    pub container_name: String,
    pub id: String,
    pub image: String,
    pub ports: Vec<String>,
    pub network: Option<String>,
    pub hostname: Option<String>,
}

/// Control plane for a single docker daemon, local (shelling out to the
/// `docker` binary) or remote (RPC to a peer serving one).
///
/// Operations that can fail at container startup (daemon down, bad image,
/// missing container) resolve to `Ok(None)`; errors are reserved for
/// transport and invariant problems. Runner and process registries never
/// evict on their own, even after exit, so late observers can still inspect
/// results; use [DockerHost::forget_runner] / [DockerHost::forget_process]
/// to drop entries explicitly.
#[async_trait]
pub trait DockerHost: Send + Sync {
    /// Opaque id unique per host lifetime, used to namespace generated
    /// container names and temp artifacts
    fn session_id(&self) -> &str;

    /// One-shot host setup (binary discovery and temp directory locally, a
    /// handshake remotely). Returns whether the host is usable.
    async fn initialize(&self) -> Result<bool>;

    /// Whether the daemon behind this host answers `docker ps`
    async fn check_daemon(&self) -> Result<bool>;

    /// Creates a container without starting it
    async fn create_container(&self, config: CreateConfig) -> Result<Option<CreatedContainer>>;

    /// Starts a container and supervises its main process, returning after
    /// the configured readiness criterion is met (or the process exits)
    async fn run(&self, config: RunConfig) -> Result<Option<Arc<ContainerRunner>>>;

    /// Runs `cmd` inside a running container via `docker exec`. Resolves to
    /// `None` when no such container is running.
    async fn exec(
        &self,
        container_name: &str,
        cmd: &str,
        args: Vec<String>,
        output: OutputConfig,
    ) -> Result<Option<Arc<DockerProcess>>>;

    /// Runs a plain docker CLI subcommand (`docker <cmd> <args..>`) under
    /// supervision
    async fn command(
        &self,
        cmd: &str,
        args: Vec<String>,
        output: OutputConfig,
    ) -> Result<Option<Arc<DockerProcess>>>;

    /// Container id lookup by name, `None` when no such container exists
    async fn get_container_id_by_name(&self, name: &str) -> Result<Option<String>>;

    /// `docker stop --time T <name>`, `T` floored at 1 s and defaulting to
    /// 15 s. `true` iff docker accepted the stop.
    async fn stop_by_name(&self, name: &str, timeout: Option<Duration>) -> Result<bool>;

    /// Releases host resources (the temp directory sweep locally). Running
    /// containers are left alone.
    async fn close(&self) -> Result<()>;

    fn get_runner_by_instance_id(&self, instance_id: u64) -> Option<Arc<ContainerRunner>>;

    fn get_process_by_instance_id(&self, instance_id: u64) -> Option<Arc<DockerProcess>>;

    /// Drops a runner registry entry (and its process entry), returning
    /// whether one existed
    fn forget_runner(&self, instance_id: u64) -> bool;

    /// Drops a process registry entry, returning whether one existed
    fn forget_process(&self, instance_id: u64) -> bool;
}
