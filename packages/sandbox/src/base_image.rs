// ABOUTME: Builds the API server base image from a local Cloud SDK checkout
// ABOUTME: Finds the SDK through PATH and packs its dev_appserver files into a build context

use crate::build_context::BuildContext;
use crate::config::DEFAULT_INTERNAL_ADMIN_PORT;
use crate::error::{Result, SandboxError};
use crate::orchestrator::{build_and_log, DEVAPPSERVER_IMAGE};
use crate::runtime::{BuildSpec, Runtime};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// dev_appserver.py relative to the SDK's `bin` directory
pub const DAS_REL_PATH: &str = "../platform/google_appengine/dev_appserver.py";
pub const GCLOUD_NAME: &str = "gcloud";
/// SDK directories copied into the base image
pub const TARGET_DIRS: [&str; 2] = ["platform/google_appengine", "lib/docker"];

/// SDK root for the first `PATH` entry that is an SDK `bin` directory
pub fn sdk_root_from_path(path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var).find_map(|dir| {
        let is_sdk = dir.file_name() == Some(OsStr::new("bin"))
            && dir.join(GCLOUD_NAME).exists()
            && dir.join(DAS_REL_PATH).exists();
        if !is_sdk {
            return None;
        }
        let root = dir.parent()?;
        Some(std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf()))
    })
}

/// SDK root from the process `PATH`
pub fn sdk_root_from_env() -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    sdk_root_from_path(&path_var).ok_or_else(|| {
        error!("Could not find gcloud sdk path.");
        SandboxError::Configuration(
            "Could not find the Cloud SDK on PATH; pass its root explicitly".to_string(),
        )
    })
}

/// Dockerfile for the base image; the per-application layer adds `/app`
pub fn base_dockerfile() -> String {
    format!(
        "FROM python:2.7-slim\n\
         ADD platform/google_appengine /google_appengine\n\
         ADD lib/docker /lib/docker\n\
         ENV PYTHONPATH /google_appengine:/lib/docker\n\
         VOLUME /storage\n\
         CMD python /google_appengine/dev_appserver.py /app/$APP_YAML_FILE \
         --application=$APP_ID --api_port=$API_PORT --port=$PROXY_PORT \
         --admin_port={admin_port} --host=0.0.0.0 --admin_host=0.0.0.0 \
         --storage_path=/storage --skip_sdk_update_check=true\n",
        admin_port = DEFAULT_INTERNAL_ADMIN_PORT
    )
}

/// Build context with the generated Dockerfile and the SDK's target directories
pub fn base_image_context(sdk_root: &Path) -> Result<Vec<u8>> {
    let mut context = BuildContext::new(base_dockerfile());
    for relpath in TARGET_DIRS {
        let dir = sdk_root.join(relpath);
        if !dir.is_dir() {
            return Err(SandboxError::Configuration(format!(
                "{} is not a Cloud SDK root: missing {}",
                sdk_root.display(),
                relpath
            )));
        }
        debug!("Adding {} to the build context", dir.display());
        context = context.directory(&dir, relpath)?;
    }
    Ok(context.into_archive()?)
}

/// Build `appstart_devappserver_base`
///
/// The image is built once per SDK, so the build cache is never used.
pub async fn build_base_image(runtime: &dyn Runtime, sdk_root: &Path) -> Result<()> {
    info!("Using Cloud SDK at {}", sdk_root.display());
    let context = base_image_context(sdk_root)?;
    let spec = BuildSpec {
        tag: DEVAPPSERVER_IMAGE.to_string(),
        no_cache: true,
        remove_intermediate: true,
    };
    build_and_log(runtime, spec, context).await
}
