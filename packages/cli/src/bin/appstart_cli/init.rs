// ABOUTME: `appstart init` builds the devappserver base image
// ABOUTME: Locates the Cloud SDK from PATH unless a root is given

use anyhow::{Context, Result};
use appstart_sandbox::base_image::{build_base_image, sdk_root_from_env};
use appstart_sandbox::{DockerRuntime, DEVAPPSERVER_IMAGE};
use clap::Args;
use colored::*;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Root of the Cloud SDK (default: found through PATH)
    #[arg(long, env = "APPSTART_SDK_ROOT")]
    pub sdk_root: Option<PathBuf>,
}

pub async fn execute(args: InitArgs) -> Result<()> {
    let sdk_root = match args.sdk_root {
        Some(root) => root,
        None => sdk_root_from_env()?,
    };

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    build_base_image(&runtime, &sdk_root)
        .await
        .with_context(|| format!("Failed to build {}", DEVAPPSERVER_IMAGE))?;

    println!(
        "{} {}",
        "✓".green(),
        format!("Built {}", DEVAPPSERVER_IMAGE).bold()
    );
    Ok(())
}
