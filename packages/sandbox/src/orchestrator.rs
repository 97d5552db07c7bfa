// ABOUTME: Two-tier sandbox lifecycle: image builds, ordered container startup, readiness and teardown
// ABOUTME: Any failure or interrupt during construction tears down everything created so far

use crate::build_context::{archive_directory, BuildContext, DockerfileTemplate};
use crate::config::{AppConfiguration, AppLayout, SandboxConfig};
use crate::container::ContainerHandle;
use crate::error::{Result, SandboxError};
use crate::interrupt::InterruptGuard;
use crate::naming::{
    current_stamp, timestamped_name, APP_CONTAINER, APP_IMAGE_BASE, DEVAPPSERVER_CONTAINER,
    DEVAPPSERVER_IMAGE_BASE,
};
use crate::probe::{ExecCheck, HealthProbe, TcpCheck};
use crate::runtime::{
    BindMount, BuildSpec, CreateSpec, ExecSpec, NetworkMode, PortBinding, Runtime, StartSpec,
};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Base image for the API server tier, built by `appstart init`
pub const DEVAPPSERVER_IMAGE: &str = "appstart_devappserver_base";

/// Port the application listens on inside its container
pub const APP_INTERNAL_PORT: u16 = 8080;

/// Oldest runtime version the sandbox works with
pub const MIN_RUNTIME_VERSION: (u64, u64, u64) = (1, 7, 0);

const STORAGE_MOUNT: &str = "/storage";
const LOG_MOUNT: &str = "/var/log/app_engine";
const DEFAULT_CONFIG_NAME: &str = "app.yaml";

const LABEL_MANAGED: &str = "appstart.managed";
const LABEL_TIER: &str = "appstart.tier";
const LABEL_STAMP: &str = "appstart.stamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPhase {
    Unconstructed,
    Constructing,
    Running,
    Stopping,
    Stopped,
    /// Construction failed; everything it created has been torn down
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    ApiServer,
    App,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::ApiServer => "devappserver",
            Tier::App => "app",
        }
    }
}

/// Parse `major.minor.patch`, tolerating suffixes such as `-ce`
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.trim().trim_start_matches('v').split('.').map(|part| {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u64>().ok()
    });

    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

/// Race `operation` against the interrupt token
async fn interruptible<T, F>(token: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SandboxError::Interrupted),
        result = operation => result,
    }
}

/// Build an image, relaying its output, and turn a reported failure into an error
pub(crate) async fn build_and_log(
    runtime: &dyn Runtime,
    spec: BuildSpec,
    context: Vec<u8>,
) -> Result<()> {
    info!("Building image {}...", spec.tag);
    let log = runtime.build_image(&spec, context).await?;

    for line in &log.lines {
        info!("{}", line);
    }

    if let Some(message) = log.error {
        error!("Failed to build image {}: {}", spec.tag, message);
        return Err(SandboxError::Build {
            image: spec.tag,
            message,
            log: log.lines,
        });
    }

    info!("Successfully built image {}", spec.tag);
    Ok(())
}

fn ensure_not_interrupted(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(SandboxError::Interrupted)
    } else {
        Ok(())
    }
}

/// Manages the API server and application containers of one sandbox
///
/// Assumes it is the only client acting on the containers it creates.
/// Containers removed by someone else are tolerated, but two orchestrators
/// sharing the same ids are not coordinated.
pub struct SandboxOrchestrator {
    config: SandboxConfig,
    layout: Option<AppLayout>,
    runtime: Arc<dyn Runtime>,
    api_server: ContainerHandle,
    app: ContainerHandle,
    stamp: String,
    phase: SandboxPhase,
}

impl SandboxOrchestrator {
    /// Validate `config` and prepare a sandbox without touching the runtime
    pub fn new(config: SandboxConfig, runtime: Arc<dyn Runtime>) -> Result<Self> {
        let layout = config.validate()?;
        let api_server = ContainerHandle::new(
            runtime.clone(),
            Tier::ApiServer.label(),
            config.admin_port,
        );
        let app = ContainerHandle::new(runtime.clone(), Tier::App.label(), config.app_port);

        Ok(Self {
            config,
            layout,
            runtime,
            api_server,
            app,
            stamp: current_stamp(),
            phase: SandboxPhase::Unconstructed,
        })
    }

    /// Use a fixed stamp for image and container names
    pub fn with_stamp(mut self, stamp: impl Into<String>) -> Self {
        self.stamp = stamp.into();
        self
    }

    pub fn phase(&self) -> SandboxPhase {
        self.phase
    }

    pub fn api_server(&self) -> &ContainerHandle {
        &self.api_server
    }

    pub fn app(&self) -> &ContainerHandle {
        &self.app
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    pub fn host(&self) -> &str {
        self.runtime.host()
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn app_configuration(&self) -> Option<&AppConfiguration> {
        self.layout.as_ref().map(|layout| &layout.configuration)
    }

    /// Build, create and start everything, then wait for the application
    pub async fn start(&mut self) -> Result<()> {
        self.start_with(CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), observing `token` as the interrupt signal
    ///
    /// Ctrl-C cancels `token` while construction runs. On any failure the
    /// containers created so far are torn down before the error is returned.
    pub async fn start_with(&mut self, token: CancellationToken) -> Result<()> {
        if self.phase != SandboxPhase::Unconstructed {
            return Err(SandboxError::InvalidState(format!(
                "start called in phase {:?}; a sandbox can only be started once",
                self.phase
            )));
        }
        self.phase = SandboxPhase::Constructing;

        let guard = InterruptGuard::install(token);
        let result = self.construct(guard.token()).await;
        drop(guard);

        match result {
            Ok(()) => {
                self.phase = SandboxPhase::Running;
                info!(
                    "Your application is live. Access it at: {}:{}",
                    self.host(),
                    self.config.app_port
                );
                Ok(())
            }
            Err(e) => {
                self.phase = SandboxPhase::Stopping;
                let clean = self.teardown().await;
                self.phase = SandboxPhase::Failed;
                let cause = if e.is_interrupt() {
                    "Caught interrupt"
                } else {
                    "An error was detected"
                };
                if clean {
                    warn!(
                        "{} when the sandbox was being set up. \
                         The environment was successfully cleaned up.",
                        cause
                    );
                } else {
                    error!(
                        "{} when the sandbox was being set up. \
                         The environment could not be fully cleaned up; \
                         check for leftover containers.",
                        cause
                    );
                }
                Err(e)
            }
        }
    }

    /// Kill and remove both containers, application first
    ///
    /// Safe to call any number of times, before or after `start`.
    pub async fn stop(&mut self) {
        match self.phase {
            SandboxPhase::Unconstructed => {
                self.phase = SandboxPhase::Stopped;
                return;
            }
            SandboxPhase::Stopped | SandboxPhase::Failed => {
                self.teardown().await;
                return;
            }
            _ => {}
        }

        self.phase = SandboxPhase::Stopping;
        if !self.teardown().await {
            warn!("The sandbox was stopped, but some containers could not be removed");
        }
        self.phase = SandboxPhase::Stopped;
    }

    /// Start, run `body` against the live sandbox, then always stop
    ///
    /// A start failure is returned as is (teardown already happened). If
    /// `token` is cancelled while `body` runs, the sandbox is stopped and
    /// `Interrupted` is returned.
    pub async fn scoped<T, F>(mut self, token: CancellationToken, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut SandboxOrchestrator) -> BoxFuture<'a, T>,
    {
        self.start_with(token.clone()).await?;

        let outcome = {
            let body = body(&mut self);
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                output = body => Some(output),
            }
        };

        self.stop().await;
        outcome.ok_or(SandboxError::Interrupted)
    }

    async fn construct(&mut self, token: &CancellationToken) -> Result<()> {
        self.check_runtime_version(token).await?;

        if self.config.run_api_server {
            let image = self.api_server_image(token).await?;
            let spec = self.api_server_spec(image);
            ensure_not_interrupted(token)?;
            self.api_server.create(&spec, token).await?;
            interruptible(token, self.api_server.start(&StartSpec::default())).await?;
        }

        let image = match &self.config.image_name {
            Some(image) => image.clone(),
            None => self.build_app_image(token).await?,
        };
        let spec = self.app_spec(image)?;
        ensure_not_interrupted(token)?;
        self.app.create(&spec, token).await?;
        interruptible(token, self.app.start(&StartSpec::default())).await?;

        self.wait_for_ready(token).await
    }

    async fn check_runtime_version(&self, token: &CancellationToken) -> Result<()> {
        let runtime = self.runtime.clone();
        let version = interruptible(token, async {
            runtime.version().await.map_err(SandboxError::from)
        })
        .await?;

        match parse_version(&version) {
            Some(found) if found < MIN_RUNTIME_VERSION => {
                let (major, minor, patch) = MIN_RUNTIME_VERSION;
                error!("Runtime version {} is too old", version);
                Err(SandboxError::UnsupportedRuntime {
                    found: version,
                    required: format!("{}.{}.{}", major, minor, patch),
                })
            }
            Some(_) => {
                debug!("Runtime version {}", version);
                Ok(())
            }
            None => {
                warn!("Could not parse runtime version {:?}; continuing", version);
                Ok(())
            }
        }
    }

    async fn build_image(
        &self,
        token: &CancellationToken,
        spec: BuildSpec,
        context: Vec<u8>,
    ) -> Result<()> {
        interruptible(token, build_and_log(self.runtime.as_ref(), spec, context)).await
    }

    fn build_spec(&self, tag: String) -> BuildSpec {
        BuildSpec {
            tag,
            no_cache: !self.config.use_cache,
            remove_intermediate: true,
        }
    }

    /// Layer the config files onto the base image, or use the base image as is
    async fn api_server_image(&self, token: &CancellationToken) -> Result<String> {
        let Some(layout) = &self.layout else {
            debug!("No config file; running {} directly", DEVAPPSERVER_IMAGE);
            return Ok(DEVAPPSERVER_IMAGE.to_string());
        };

        let offset = layout.kind.internal_offset();
        let dockerfile = DockerfileTemplate::new(
            DEVAPPSERVER_IMAGE,
            "app/",
            format!("/app/{}", offset),
        );
        let mut context = BuildContext::new(dockerfile.render())
            .with_prefix("app")
            .file(&layout.config_path, layout.config_name());
        if let Some(web_xml) = layout.web_xml() {
            context = context.file(web_xml, crate::config::WEB_XML_NAME);
        }

        let tag = timestamped_name(DEVAPPSERVER_IMAGE_BASE, &self.stamp);
        self.build_image(token, self.build_spec(tag.clone()), context.into_archive()?)
            .await?;
        Ok(tag)
    }

    async fn build_app_image(&self, token: &CancellationToken) -> Result<String> {
        let layout = self.layout.as_ref().ok_or_else(|| {
            SandboxError::Configuration(
                "An application image can only be built from a config file's directory"
                    .to_string(),
            )
        })?;

        let context = archive_directory(&layout.app_dir)?;
        let tag = timestamped_name(APP_IMAGE_BASE, &self.stamp);
        self.build_image(token, self.build_spec(tag.clone()), context)
            .await?;
        Ok(tag)
    }

    fn config_name(&self) -> String {
        self.layout
            .as_ref()
            .map(AppLayout::config_name)
            .unwrap_or_else(|| DEFAULT_CONFIG_NAME.to_string())
    }

    fn labels(&self, tier: Tier) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_TIER.to_string(), tier.label().to_string()),
            (LABEL_STAMP.to_string(), self.stamp.clone()),
        ])
    }

    /// Environment of the API server container
    pub fn api_server_env(&self) -> BTreeMap<String, String> {
        let offset = self
            .layout
            .as_ref()
            .map(|layout| layout.kind.internal_offset())
            .unwrap_or_default();

        BTreeMap::from([
            ("APP_ID".to_string(), self.config.application_id.clone()),
            (
                "PROXY_PORT".to_string(),
                self.config.internal_proxy_port.to_string(),
            ),
            (
                "API_PORT".to_string(),
                self.config.internal_api_port.to_string(),
            ),
            (
                "APP_YAML_FILE".to_string(),
                format!("{}{}", offset, self.config_name()),
            ),
        ])
    }

    /// Environment of the application container
    ///
    /// `API_HOST` is the wildcard address because the application shares the
    /// API server's network stack.
    pub fn app_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("API_HOST".to_string(), "0.0.0.0".to_string()),
            (
                "API_PORT".to_string(),
                self.config.internal_api_port.to_string(),
            ),
            (
                "GAE_LONG_APP_ID".to_string(),
                self.config.application_id.clone(),
            ),
            ("GAE_PARTITION".to_string(), "dev".to_string()),
            ("GAE_MODULE_INSTANCE".to_string(), "0".to_string()),
            ("MODULE_YAML_PATH".to_string(), self.config_name()),
            ("GAE_MODULE_NAME".to_string(), "default".to_string()),
            ("GAE_MODULE_VERSION".to_string(), "1".to_string()),
            (
                "GAE_SERVER_PORT".to_string(),
                APP_INTERNAL_PORT.to_string(),
            ),
            ("USE_MVM_AGENT".to_string(), "true".to_string()),
        ])
    }

    fn api_server_spec(&self, image: String) -> CreateSpec {
        let config = &self.config;
        CreateSpec {
            name: timestamped_name(DEVAPPSERVER_CONTAINER, &self.stamp),
            image,
            command: Vec::new(),
            exposed_ports: vec![config.internal_proxy_port, config.internal_admin_port],
            port_bindings: vec![
                PortBinding {
                    container_port: config.internal_proxy_port,
                    host_port: config.app_port,
                },
                PortBinding {
                    container_port: config.internal_admin_port,
                    host_port: config.admin_port,
                },
            ],
            binds: vec![BindMount {
                host_path: config.storage_path.to_string_lossy().into_owned(),
                container_path: STORAGE_MOUNT.to_string(),
                read_only: false,
            }],
            env: self.api_server_env(),
            labels: self.labels(Tier::ApiServer),
            network: NetworkMode::Default,
        }
    }

    /// Shares the API server's network when that tier runs; publishes 8080 otherwise
    fn app_spec(&self, image: String) -> Result<CreateSpec> {
        let network = match (self.config.run_api_server, self.api_server.id()) {
            (true, Some(id)) => NetworkMode::Container(id.to_string()),
            (true, None) => {
                return Err(SandboxError::InvalidState(
                    "the API server must exist before the application container".to_string(),
                ))
            }
            (false, _) => NetworkMode::Default,
        };

        let (exposed_ports, port_bindings) = match network {
            NetworkMode::Default => (
                vec![APP_INTERNAL_PORT],
                vec![PortBinding {
                    container_port: APP_INTERNAL_PORT,
                    host_port: self.config.app_port,
                }],
            ),
            NetworkMode::Container(_) => (Vec::new(), Vec::new()),
        };

        Ok(CreateSpec {
            name: timestamped_name(APP_CONTAINER, &self.stamp),
            image,
            command: Vec::new(),
            exposed_ports,
            port_bindings,
            binds: vec![BindMount {
                host_path: self.config.log_path.to_string_lossy().into_owned(),
                container_path: LOG_MOUNT.to_string(),
                read_only: false,
            }],
            env: self.app_env(),
            labels: self.labels(Tier::App),
            network,
        })
    }

    async fn wait_for_ready(&self, token: &CancellationToken) -> Result<()> {
        let probe = HealthProbe::new(self.config.probe_interval, self.config.probe_attempts);

        match &self.config.readiness_command {
            Some(command) => {
                let check = ExecCheck::new(&self.app, ExecSpec::command(command.clone()));
                interruptible(token, probe.wait_until_ready(&check)).await?;
            }
            None => {
                let check = TcpCheck::new(self.host(), self.config.app_port);
                interruptible(token, probe.wait_until_ready(&check)).await?;
            }
        }
        Ok(())
    }

    /// Kill then remove, application tier first
    ///
    /// Failures are logged, never raised. Returns false if any step failed.
    async fn teardown(&mut self) -> bool {
        let mut clean = true;
        for handle in [&mut self.app, &mut self.api_server] {
            if handle.id().is_none() {
                continue;
            }
            if let Err(e) = handle.kill().await {
                warn!("Failed to stop {}: {}", handle.label(), e);
                clean = false;
            }
            if let Err(e) = handle.remove().await {
                warn!("Failed to remove {}: {}", handle.label(), e);
                clean = false;
            }
        }
        clean
    }
}

impl Drop for SandboxOrchestrator {
    fn drop(&mut self) {
        if self.app.id().is_none() && self.api_server.id().is_none() {
            return;
        }

        let mut app = std::mem::replace(
            &mut self.app,
            ContainerHandle::new(self.runtime.clone(), Tier::App.label(), 0),
        );
        let mut api_server = std::mem::replace(
            &mut self.api_server,
            ContainerHandle::new(self.runtime.clone(), Tier::ApiServer.label(), 0),
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Sandbox dropped while containers were live; cleaning up");
                handle.spawn(async move {
                    for handle in [&mut app, &mut api_server] {
                        if let Err(e) = handle.kill().await {
                            warn!("Failed to stop {}: {}", handle.label(), e);
                        }
                        if let Err(e) = handle.remove().await {
                            warn!("Failed to remove {}: {}", handle.label(), e);
                        }
                    }
                });
            }
            Err(_) => {
                for handle in [&app, &api_server] {
                    if let Some(id) = handle.id() {
                        error!("Container {} ({}) was left behind", id, handle.label());
                    }
                }
            }
        }
    }
}
