// ABOUTME: `appstart run` stands up the sandbox and keeps it alive until Ctrl-C
// ABOUTME: Maps command line flags onto the sandbox configuration

use anyhow::{Context, Result};
use appstart_sandbox::config::{
    DEFAULT_ADMIN_PORT, DEFAULT_APPLICATION_ID, DEFAULT_APP_PORT, DEFAULT_INTERNAL_ADMIN_PORT,
    DEFAULT_INTERNAL_API_PORT, DEFAULT_INTERNAL_PROXY_PORT, DEFAULT_LOG_PATH, DEFAULT_STORAGE_PATH,
};
use appstart_sandbox::probe::DEFAULT_INTERVAL;
use appstart_sandbox::{DockerRuntime, InterruptGuard, SandboxConfig, SandboxOrchestrator};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args};
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the application's .yaml or appengine-web.xml file
    pub config_file: Option<PathBuf>,

    /// Docker image to run; built from the application's Dockerfile when omitted
    #[arg(long, env = "APPSTART_IMAGE_NAME")]
    pub image_name: Option<String>,

    /// Whether to run the API server (not needed if the app uses no platform services)
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub run_api_server: bool,

    /// Host port the application is reachable on
    #[arg(long, default_value_t = DEFAULT_APP_PORT)]
    pub application_port: u16,

    /// Host port the admin panel is reachable on
    #[arg(long, default_value_t = DEFAULT_ADMIN_PORT)]
    pub admin_port: u16,

    /// Application id; selects which datastore the app uses
    #[arg(long, env = "APPSTART_APPLICATION_ID", default_value = DEFAULT_APPLICATION_ID)]
    pub application_id: String,

    /// Host directory for datastore, blobstore and other service data
    #[arg(long, env = "APPSTART_STORAGE_PATH", default_value = DEFAULT_STORAGE_PATH)]
    pub storage_path: PathBuf,

    /// Host directory the application's logs are written to
    #[arg(long, env = "APPSTART_LOG_PATH", default_value = DEFAULT_LOG_PATH)]
    pub log_path: PathBuf,

    #[arg(long, hide = true, default_value_t = DEFAULT_INTERNAL_ADMIN_PORT)]
    pub internal_admin_port: u16,

    #[arg(long, hide = true, default_value_t = DEFAULT_INTERNAL_API_PORT)]
    pub internal_api_port: u16,

    #[arg(long, hide = true, default_value_t = DEFAULT_INTERNAL_PROXY_PORT)]
    pub internal_proxy_port: u16,

    /// Use the Docker build cache
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub use_cache: bool,

    /// Seconds to wait for the application to start listening
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u32).range(1..))]
    pub timeout: u32,

    /// Command run inside the application container to check readiness
    #[arg(long)]
    pub readiness_command: Option<String>,
}

impl RunArgs {
    pub fn into_config(self) -> SandboxConfig {
        SandboxConfig {
            config_file: self.config_file,
            image_name: self.image_name,
            application_id: self.application_id,
            app_port: self.application_port,
            admin_port: self.admin_port,
            internal_admin_port: self.internal_admin_port,
            internal_api_port: self.internal_api_port,
            internal_proxy_port: self.internal_proxy_port,
            storage_path: self.storage_path,
            log_path: self.log_path,
            run_api_server: self.run_api_server,
            use_cache: self.use_cache,
            probe_interval: DEFAULT_INTERVAL,
            probe_attempts: self.timeout,
            readiness_command: self
                .readiness_command
                .map(|command| command.split_whitespace().map(str::to_string).collect()),
        }
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let config = args.into_config();
    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    let sandbox = SandboxOrchestrator::new(config, Arc::new(runtime))
        .context("Invalid sandbox configuration")?;

    // One guard spans construction and the running phase
    let token = CancellationToken::new();
    let guard = InterruptGuard::install(token.clone());
    let outcome = sandbox
        .scoped(token, |sandbox| {
            async move {
                sandbox.app().stream_output(true).await;
                info!("Press Ctrl-C to stop the sandbox");
                futures::future::pending::<()>().await
            }
            .boxed()
        })
        .await;
    drop(guard);

    match outcome {
        Ok(()) => Ok(()),
        // Ctrl-C; the sandbox has already cleaned up after itself
        Err(e) if e.is_interrupt() => Ok(()),
        Err(e) => Err(e).context("The sandbox failed to start"),
    }
}
