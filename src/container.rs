use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};

/// Everything a runtime needs to start one container. Env values here are
/// already resolved except where cluster-native references
/// ([`ContainerSpec::secret_key_refs`], [`ContainerSpec::config_map_refs`])
/// carry them instead.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container/pod name, unique per session.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub persistent: bool,
    pub remove_after_run: bool,
    pub interactive: bool,
    pub keep_stdin_open: bool,
    pub startup_timeout: Option<Duration>,
    pub cpus: Option<u64>,
    pub memory: Option<String>,
    pub user: Option<String>,
    pub privileged: bool,
    /// env-name → (secret resource, data key); cluster runtime only.
    pub secret_key_refs: BTreeMap<String, SecretKeyRef>,
    /// ConfigMap resources injected wholesale via envFrom; cluster runtime only.
    pub config_map_refs: Vec<String>,
    /// Container-daemon specific extras the proxy layer needs.
    pub docker: Option<DockerOverrides>,
}

#[derive(Debug, Clone)]
pub struct SecretKeyRef {
    pub secret: String,
    pub key: String,
}

#[derive(Debug, Clone, Default)]
pub struct DockerOverrides {
    pub links: Vec<String>,
    pub dns: Vec<String>,
}

/// Outcome of an ephemeral synchronous run. A nonzero exit code is a result,
/// not a runtime error.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub success: bool,
}

/// A started persistent container with its attached stdio. The streams are
/// taken by the MCP transport; the id stays valid for `stop_container`.
pub struct ContainerHandle {
    pub id: String,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle").field("id", &self.id).finish()
    }
}

/// Contract shared by the local-container and cluster runtimes. Cancellation
/// follows the tokio model: callers drop the future (or race it against a
/// token); the runtime keeps no state outside the returned handle.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ephemeral synchronous execution. Container failure is reported in the
    /// result (`success = false`), never as an `Err`.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<RunResult>;

    /// Starts a persistent container and attaches its stdio.
    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Closes the container down: graceful wait up to 5s, then force.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Best-effort teardown of everything this runtime started. Errors are
    /// logged by the caller and never abort a gateway shutdown.
    async fn shutdown(&self) -> Result<()>;
}

pub const STOP_GRACE: Duration = Duration::from_secs(5);
pub const READINESS_POLL: Duration = Duration::from_secs(2);
pub const COMPLETION_POLL: Duration = Duration::from_secs(2);
pub const MARKER_POLL: Duration = Duration::from_secs(1);
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);
pub const MARKER_TIMEOUT: Duration = Duration::from_secs(30);
pub const PRE_STOP_SLEEP_SECS: u64 = 10;
