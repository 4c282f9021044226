use core::fmt;
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use stacked_errors::Result;
use tokio::sync::watch;

use crate::{
    OutputHandle, OutputStream, ReadyLatch, ReadyPredicate, DEFAULT_BYTE_CAPACITY,
    DEFAULT_LINE_CAPACITY,
};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// Allocates the next process-wide unique instance id. Ids monotonically
/// reflect creation order.
pub(crate) fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which stdio readiness criterion [DockerProcess::wait_ready] resolves on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputReadyType {
    /// The stdout ready latch
    Stdout,
    /// The stderr ready latch
    Stderr,
    /// Either sibling latch
    Any,
    /// Ready as soon as the process is started
    StartsReady,
}

/// How a process' stdio is retained and when it counts as ready.
///
/// With no explicit `ready_type`, the type is inferred from which predicates
/// were supplied: stderr-only predicates select [OutputReadyType::Stderr],
/// stdout-only [OutputReadyType::Stdout], both [OutputReadyType::Any], and
/// none [OutputReadyType::StartsReady].
#[must_use]
#[derive(Clone)]
pub struct OutputConfig {
    /// Decode output into lines (the default); otherwise retain raw bytes
    pub as_lines: bool,
    /// Overrides the per-stream retention capacity (entries in line mode,
    /// bytes in byte mode)
    pub limit: Option<usize>,
    /// Overrides the inferred readiness criterion
    pub ready_type: Option<OutputReadyType>,
    pub stdout_ready: Option<ReadyPredicate<String>>,
    pub stderr_ready: Option<ReadyPredicate<String>>,
    pub stdout_ready_bytes: Option<ReadyPredicate<u8>>,
    pub stderr_ready_bytes: Option<ReadyPredicate<u8>>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            as_lines: true,
            limit: None,
            ready_type: None,
            stdout_ready: None,
            stderr_ready: None,
            stdout_ready_bytes: None,
            stderr_ready_bytes: None,
        }
    }
}

impl Debug for OutputConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputConfig")
            .field("as_lines", &self.as_lines)
            .field("limit", &self.limit)
            .field("ready_type", &self.ready_type)
            .field("stdout_ready", &self.stdout_ready.is_some())
            .field("stderr_ready", &self.stderr_ready.is_some())
            .field("stdout_ready_bytes", &self.stdout_ready_bytes.is_some())
            .field("stderr_ready_bytes", &self.stderr_ready_bytes.is_some())
            .finish()
    }
}

impl OutputConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets line mode (`true`, the default) or raw byte mode
    pub fn as_lines(mut self, as_lines: bool) -> Self {
        self.as_lines = as_lines;
        self
    }

    /// Sets the retention capacity override
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Forces the readiness criterion instead of inferring it
    pub fn ready_type(mut self, ready_type: OutputReadyType) -> Self {
        self.ready_type = Some(ready_type);
        self
    }

    /// Sets the line-mode stdout ready predicate
    pub fn stdout_ready(mut self, predicate: ReadyPredicate<String>) -> Self {
        self.stdout_ready = Some(predicate);
        self
    }

    /// Sets the line-mode stderr ready predicate
    pub fn stderr_ready(mut self, predicate: ReadyPredicate<String>) -> Self {
        self.stderr_ready = Some(predicate);
        self
    }

    /// Sets the byte-mode stdout ready predicate
    pub fn stdout_ready_bytes(mut self, predicate: ReadyPredicate<u8>) -> Self {
        self.stdout_ready_bytes = Some(predicate);
        self
    }

    /// Sets the byte-mode stderr ready predicate
    pub fn stderr_ready_bytes(mut self, predicate: ReadyPredicate<u8>) -> Self {
        self.stderr_ready_bytes = Some(predicate);
        self
    }

    pub fn resolved_ready_type(&self) -> OutputReadyType {
        if let Some(ready_type) = self.ready_type {
            return ready_type
        }
        let stdout = self.stdout_ready.is_some() || self.stdout_ready_bytes.is_some();
        let stderr = self.stderr_ready.is_some() || self.stderr_ready_bytes.is_some();
        match (stdout, stderr) {
            (true, true) => OutputReadyType::Any,
            (true, false) => OutputReadyType::Stdout,
            (false, true) => OutputReadyType::Stderr,
            (false, false) => OutputReadyType::StartsReady,
        }
    }
}

/// One-shot exit-code latch with any number of waiters. The first `set` wins;
/// later calls are ignored.
#[derive(Clone)]
pub(crate) struct ExitLatch {
    tx: Arc<watch::Sender<Option<i32>>>,
}

impl ExitLatch {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    fn set(&self, code: i32) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        })
    }

    fn get(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    async fn wait(&self) -> i32 {
        let mut rx = self.tx.subscribe();
        let result = match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => code.unwrap_or(-1),
            // cannot happen, the sender is kept alive by `self`
            Err(_) => -1,
        };
        result
    }
}

/// Handle to a supervised command execution: a container main process, a
/// `docker exec` inside one, or a plain CLI invocation. Holds the two stdio
/// histories, the readiness criterion, and the exit latch.
///
/// The handle stays registered in its host even after the process exits, so
/// late observers can still read exit codes and retained output.
pub struct DockerProcess {
    instance_id: u64,
    container_name: Option<String>,
    stdout: OutputHandle,
    stderr: OutputHandle,
    ready_type: OutputReadyType,
    exit: ExitLatch,
}

impl Debug for DockerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerProcess")
            .field("instance_id", &self.instance_id)
            .field("container_name", &self.container_name)
            .field("ready_type", &self.ready_type)
            .field("exit_code", &self.exit.get())
            .finish()
    }
}

impl DockerProcess {
    pub(crate) fn new(
        instance_id: u64,
        container_name: Option<String>,
        output: &OutputConfig,
    ) -> Arc<Self> {
        let any_ready = ReadyLatch::new();
        let (stdout, stderr) = if output.as_lines {
            let capacity = output.limit.unwrap_or(DEFAULT_LINE_CAPACITY);
            (
                OutputHandle::Lines(OutputStream::new(
                    capacity,
                    output.stdout_ready.clone(),
                    any_ready.clone(),
                )),
                OutputHandle::Lines(OutputStream::new(
                    capacity,
                    output.stderr_ready.clone(),
                    any_ready.clone(),
                )),
            )
        } else {
            let capacity = output.limit.unwrap_or(DEFAULT_BYTE_CAPACITY);
            (
                OutputHandle::Bytes(OutputStream::new(
                    capacity,
                    output.stdout_ready_bytes.clone(),
                    any_ready.clone(),
                )),
                OutputHandle::Bytes(OutputStream::new(
                    capacity,
                    output.stderr_ready_bytes.clone(),
                    any_ready.clone(),
                )),
            )
        };
        Arc::new(Self {
            instance_id,
            container_name,
            stdout,
            stderr,
            ready_type: output.resolved_ready_type(),
            exit: ExitLatch::new(),
        })
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// The container this process runs in (or is the main process of), if any
    pub fn container_name(&self) -> Option<&str> {
        self.container_name.as_deref()
    }

    pub fn stdout(&self) -> &OutputHandle {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputHandle {
        &self.stderr
    }

    pub fn ready_type(&self) -> OutputReadyType {
        self.ready_type
    }

    pub fn is_running(&self) -> bool {
        self.exit.get().is_none()
    }

    /// `None` while running; immutable once set
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.get()
    }

    pub fn is_ready(&self) -> bool {
        match self.ready_type {
            OutputReadyType::Stdout => self.stdout.is_ready(),
            OutputReadyType::Stderr => self.stderr.is_ready(),
            OutputReadyType::Any => self.stdout.is_ready() || self.stderr.is_ready(),
            OutputReadyType::StartsReady => true,
        }
    }

    /// Resolves once the readiness criterion is met or the process exits,
    /// whichever is first (exit forces both stream latches)
    pub async fn wait_ready(&self) {
        match self.ready_type {
            OutputReadyType::Stdout => self.stdout.wait_ready().await,
            OutputReadyType::Stderr => self.stderr.wait_ready().await,
            OutputReadyType::Any => self.stdout.wait_any_ready().await,
            OutputReadyType::StartsReady => (),
        }
    }

    /// Blocks until the exit code is known. Any number of waiters may be
    /// parked here; all receive the same code.
    pub async fn wait_exit(&self) -> i32 {
        self.exit.wait().await
    }

    /// Like [DockerProcess::wait_exit], but resolves to `None` when the
    /// observed code differs from `desired`, so callers can gate success
    /// without matching on the raw code
    pub async fn wait_exit_expecting(&self, desired: i32) -> Option<i32> {
        let code = self.exit.wait().await;
        if code == desired {
            Some(code)
        } else {
            None
        }
    }

    /// Latches the exit code (first call wins) and forces both stream ready
    /// latches so no readiness waiter stalls on a dead process
    pub(crate) fn set_exit(&self, code: i32) {
        self.exit.set(code);
        self.stdout.mark_ready();
        self.stderr.mark_ready();
    }
}

/// Capability to stop a named container, implemented by each backend so that
/// runners do not need to hold their host
#[async_trait]
pub(crate) trait ContainerStop: Send + Sync {
    async fn stop_container(&self, name: &str, timeout: Option<Duration>) -> Result<bool>;
}

/// A supervised container: the main process plus container identity. Built by
/// [DockerHost::run](crate::DockerHost::run); composition around
/// [DockerProcess], which it derefs into for waiting and output access.
pub struct ContainerRunner {
    process: Arc<DockerProcess>,
    name: String,
    id: String,
    image: String,
    version: Option<String>,
    ports: Vec<String>,
    network: Option<String>,
    hostname: Option<String>,
    ip: Option<String>,
    stopper: Arc<dyn ContainerStop>,
}

impl Debug for ContainerRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRunner")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("image", &self.image)
            .field("version", &self.version)
            .field("ports", &self.ports)
            .field("network", &self.network)
            .field("hostname", &self.hostname)
            .field("ip", &self.ip)
            .field("process", &self.process)
            .finish()
    }
}

impl ContainerRunner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        process: Arc<DockerProcess>,
        name: String,
        id: String,
        image: String,
        version: Option<String>,
        ports: Vec<String>,
        network: Option<String>,
        hostname: Option<String>,
        ip: Option<String>,
        stopper: Arc<dyn ContainerStop>,
    ) -> Arc<Self> {
        Arc::new(Self {
            process,
            name,
            id,
            image,
            version,
            ports,
            network,
            hostname,
            ip,
            stopper,
        })
    }

    pub fn process(&self) -> &Arc<DockerProcess> {
        &self.process
    }

    pub fn instance_id(&self) -> u64 {
        self.process.instance_id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The container id reported by docker after start
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Normalized `host:container` port mappings
    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// The container's address on its network, when one was attached
    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn stdout(&self) -> &OutputHandle {
        self.process.stdout()
    }

    pub fn stderr(&self) -> &OutputHandle {
        self.process.stderr()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.process.exit_code()
    }

    pub fn is_ready(&self) -> bool {
        self.process.is_ready()
    }

    pub async fn wait_ready(&self) {
        self.process.wait_ready().await
    }

    pub async fn wait_exit(&self) -> i32 {
        self.process.wait_exit().await
    }

    pub async fn wait_exit_expecting(&self, desired: i32) -> Option<i32> {
        self.process.wait_exit_expecting(desired).await
    }

    /// Issues `docker stop` with the backend's timeout floor (1 s minimum,
    /// 15 s default). Success means docker accepted the stop; the exit code
    /// is still delivered through the normal exit path afterwards.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<bool> {
        self.stopper.stop_container(&self.name, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_marker;

    #[test]
    fn ready_type_inference() {
        let cfg = OutputConfig::new();
        assert_eq!(cfg.resolved_ready_type(), OutputReadyType::StartsReady);
        let cfg = OutputConfig::new().stdout_ready(line_marker("x"));
        assert_eq!(cfg.resolved_ready_type(), OutputReadyType::Stdout);
        let cfg = OutputConfig::new().stderr_ready(line_marker("x"));
        assert_eq!(cfg.resolved_ready_type(), OutputReadyType::Stderr);
        let cfg = OutputConfig::new()
            .stdout_ready(line_marker("x"))
            .stderr_ready(line_marker("y"));
        assert_eq!(cfg.resolved_ready_type(), OutputReadyType::Any);
        let cfg = OutputConfig::new()
            .stdout_ready(line_marker("x"))
            .ready_type(OutputReadyType::StartsReady);
        assert_eq!(cfg.resolved_ready_type(), OutputReadyType::StartsReady);
    }

    #[test]
    fn instance_ids_are_monotonic() {
        let a = next_instance_id();
        let b = next_instance_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn exit_forces_ready_latches() {
        let cfg = OutputConfig::new().stdout_ready(line_marker("never appears"));
        let process = DockerProcess::new(next_instance_id(), None, &cfg);
        assert!(process.is_running());
        assert!(!process.is_ready());
        process.set_exit(7);
        assert!(!process.is_running());
        assert_eq!(process.exit_code(), Some(7));
        assert!(process.is_ready());
        process.wait_ready().await;
        assert_eq!(process.wait_exit().await, 7);
        // first set wins
        process.set_exit(9);
        assert_eq!(process.exit_code(), Some(7));
    }

    #[tokio::test]
    async fn wait_exit_expecting_gates_on_mismatch() {
        let process = DockerProcess::new(next_instance_id(), None, &OutputConfig::new());
        process.set_exit(1);
        assert_eq!(process.wait_exit_expecting(0).await, None);
        assert_eq!(process.wait_exit_expecting(1).await, Some(1));
    }
}
