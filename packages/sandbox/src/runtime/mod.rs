// ABOUTME: Runtime trait and per-operation specs for the container daemon seam
// ABOUTME: Distinguishes not-found replies from other failures so teardown can stay idempotent

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerRuntime;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Container is not running: {0}")]
    NotRunning(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Runtime API error: {0}")]
    Api(String),
}

impl RuntimeError {
    /// True for the "nothing there to act on" class of replies
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_) | RuntimeError::NotRunning(_))
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Lines of container output
pub type LogStream = BoxStream<'static, RuntimeResult<String>>;

/// How a new container attaches to the network
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkMode {
    #[default]
    Default,
    /// Share the network namespace of the container with this id
    Container(String),
}

impl NetworkMode {
    pub fn as_docker_mode(&self) -> Option<String> {
        match self {
            NetworkMode::Default => None,
            NetworkMode::Container(id) => Some(format!("container:{}", id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything the runtime needs to allocate a container
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    /// Overrides the image's default command when non-empty
    pub command: Vec<String>,
    pub exposed_ports: Vec<u16>,
    pub port_bindings: Vec<PortBinding>,
    pub binds: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub network: NetworkMode,
}

/// Options for starting an already created container
#[derive(Debug, Clone, Default)]
pub struct StartSpec {
    /// Override the key sequence for detaching from the container
    pub detach_keys: Option<String>,
}

/// Command run inside a running container
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
}

impl ExecSpec {
    pub fn command<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Result of a command executed inside a container
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub exit_code: Option<i64>,
    pub running: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutcome {
    pub fn succeeded(&self) -> bool {
        !self.running && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub tag: String,
    pub no_cache: bool,
    /// Remove intermediate containers after a successful build
    pub remove_intermediate: bool,
}

/// Output of an image build; `error` is set when the daemon reported a failure
#[derive(Debug, Clone, Default)]
pub struct BuildLog {
    pub lines: Vec<String>,
    pub error: Option<String>,
}

/// Inspection result; missing fields mean the daemon did not report them
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub running: Option<bool>,
    pub status: Option<String>,
    pub exit_code: Option<i64>,
}

/// Container daemon operations used by the sandbox
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Host name under which published ports are reachable
    fn host(&self) -> &str;

    /// Daemon version string
    async fn version(&self) -> RuntimeResult<String>;

    /// Build an image from a tar build context
    async fn build_image(&self, spec: &BuildSpec, context: Vec<u8>) -> RuntimeResult<BuildLog>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &CreateSpec) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str, spec: &StartSpec) -> RuntimeResult<()>;

    async fn kill_container(&self, id: &str) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &str) -> RuntimeResult<()>;

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerState>;

    /// Container output; with `follow` the stream ends when the container stops
    fn logs(&self, id: &str, follow: bool) -> LogStream;

    async fn exec(&self, id: &str, spec: &ExecSpec) -> RuntimeResult<ExecOutcome>;

    /// Copy a path out of the container as a tar archive
    async fn download(&self, id: &str, path: &str) -> RuntimeResult<Vec<u8>>;
}
