// ABOUTME: Docker Engine implementation of the sandbox runtime seam
// ABOUTME: Uses bollard to build images and drive container create/start/kill/remove/exec

use super::{
    BuildLog, BuildSpec, ContainerState, CreateSpec, ExecOutcome, ExecSpec, LogStream, Runtime,
    RuntimeError, RuntimeResult, StartSpec,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
        LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::BuildImageOptions,
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

/// Environment variable bollard reads to locate a remote daemon
const DOCKER_HOST_ENV: &str = "DOCKER_HOST";

/// Host used when the daemon is reached over a local socket
const LOCAL_HOST: &str = "localhost";

pub struct DockerRuntime {
    client: Docker,
    host: String,
}

impl DockerRuntime {
    /// Connect using DOCKER_HOST or the platform's default socket
    pub fn connect() -> RuntimeResult<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        let host = host_from_docker_host(std::env::var(DOCKER_HOST_ENV).ok().as_deref());

        Ok(Self::with_client(client, host))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker, host: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into(),
        }
    }

    /// Convert our create spec to bollard config
    fn to_bollard_config(spec: &CreateSpec) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        for port in &spec.exposed_ports {
            exposed_ports.insert(format!("{}/tcp", port), HashMap::new());
        }

        let mut port_bindings = HashMap::new();
        for binding in &spec.port_bindings {
            port_bindings.insert(
                format!("{}/tcp", binding.container_port),
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
        }

        let binds: Vec<String> = spec
            .binds
            .iter()
            .map(|b| {
                format!(
                    "{}:{}:{}",
                    b.host_path,
                    b.container_path,
                    if b.read_only { "ro" } else { "rw" }
                )
            })
            .collect();

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: spec.network.as_docker_mode(),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

/// Derive the host that published ports are reachable on from a DOCKER_HOST value
pub fn host_from_docker_host(value: Option<&str>) -> String {
    value
        .filter(|v| v.starts_with("tcp://") || v.starts_with("http://") || v.starts_with("https://"))
        .and_then(|v| url::Url::parse(v).ok())
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| LOCAL_HOST.to_string())
}

fn map_error(e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        e => RuntimeError::Api(e.to_string()),
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn host(&self) -> &str {
        &self.host
    }

    async fn version(&self) -> RuntimeResult<String> {
        let version = self
            .client
            .version()
            .await
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;

        Ok(version.version.unwrap_or_default())
    }

    async fn build_image(&self, spec: &BuildSpec, context: Vec<u8>) -> RuntimeResult<BuildLog> {
        info!("Building image: {}", spec.tag);

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: spec.tag.clone(),
            q: false,
            nocache: spec.no_cache,
            rm: spec.remove_intermediate,
            ..Default::default()
        };

        let mut stream = self.client.build_image(options, None, Some(context.into()));
        let mut log = BuildLog::default();

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            log.lines.push(line.to_string());
                        }
                    }
                    if let Some(error) = info.error {
                        log.error = Some(error.trim_end().to_string());
                    }
                }
                Err(BollardError::DockerStreamError { error }) => {
                    log.error = Some(error.trim_end().to_string());
                    break;
                }
                Err(e) => return Err(map_error(e)),
            }
        }

        Ok(log)
    }

    async fn create_container(&self, spec: &CreateSpec) -> RuntimeResult<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(map_error)?;

        for warning in &container.warnings {
            debug!("Create warning for {}: {}", spec.name, warning);
        }

        Ok(container.id)
    }

    async fn start_container(&self, id: &str, spec: &StartSpec) -> RuntimeResult<()> {
        let options = spec
            .detach_keys
            .clone()
            .map(|detach_keys| StartContainerOptions { detach_keys });

        self.client
            .start_container(id, options)
            .await
            .map_err(map_error)
    }

    async fn kill_container(&self, id: &str) -> RuntimeResult<()> {
        match self
            .client
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Container exists but is not running
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 409,
                message,
            }) => Err(RuntimeError::NotRunning(message)),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true, // Remove anonymous volumes
            ..Default::default()
        };

        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerState> {
        let inspect = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(map_error)?;

        Ok(inspect
            .state
            .map(|state| ContainerState {
                running: state.running,
                status: state.status.as_ref().map(|s| s.as_ref().to_string()),
                exit_code: state.exit_code,
            })
            .unwrap_or_default())
    }

    fn logs(&self, id: &str, follow: bool) -> LogStream {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            ..Default::default()
        };

        self.client
            .logs(id, Some(options))
            .map(|result| {
                result
                    .map(|output| output.to_string().trim_end().to_string())
                    .map_err(map_error)
            })
            .boxed()
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> RuntimeResult<ExecOutcome> {
        debug!("Executing command in container {}: {:?}", id, spec.command);

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec_config = CreateExecOptions {
            cmd: Some(spec.command.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(id, exec_config)
            .await
            .map_err(map_error)?;

        let mut outcome = ExecOutcome::default();

        match self.client.start_exec(&exec.id, None).await.map_err(map_error)? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => {
                            outcome.stdout.extend_from_slice(&message)
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            outcome.stderr.extend_from_slice(&message)
                        }
                        Ok(LogOutput::Console { message }) => {
                            outcome.stdout.extend_from_slice(&message)
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Api(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(map_error)?;

        outcome.exit_code = exec_inspect.exit_code;
        outcome.running = exec_inspect.running.unwrap_or(false);
        Ok(outcome)
    }

    async fn download(&self, id: &str, path: &str) -> RuntimeResult<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let mut stream = self.client.download_from_container(id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(map_error)?;
            data.extend_from_slice(&bytes);
        }

        Ok(data)
    }
}
