// ABOUTME: Lifecycle handle around a single remote container
// ABOUTME: Explicit absent/created/started/killed/removed states make teardown idempotent

use crate::error::{Result, SandboxError};
use crate::runtime::{CreateSpec, ExecOutcome, ExecSpec, LogStream, Runtime, StartSpec};
use futures::StreamExt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a handle is in its lifecycle
///
/// Only states carrying an id refer to a remote container. Operations that
/// need an id are no-ops in the other states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleState {
    Absent,
    Created(String),
    Started(String),
    Killed(String),
    Removed,
}

impl HandleState {
    pub fn id(&self) -> Option<&str> {
        match self {
            HandleState::Created(id) | HandleState::Started(id) | HandleState::Killed(id) => {
                Some(id)
            }
            HandleState::Absent | HandleState::Removed => None,
        }
    }
}

/// Wrapper around one container on a shared runtime
pub struct ContainerHandle {
    runtime: Arc<dyn Runtime>,
    label: String,
    port: u16,
    state: HandleState,
}

impl ContainerHandle {
    /// A handle that does not refer to any container yet
    pub fn new(runtime: Arc<dyn Runtime>, label: impl Into<String>, port: u16) -> Self {
        Self {
            runtime,
            label: label.into(),
            port,
            state: HandleState::Absent,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> &HandleState {
        &self.state
    }

    pub fn id(&self) -> Option<&str> {
        self.state.id()
    }

    pub fn host(&self) -> &str {
        self.runtime.host()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Allocate the remote container
    ///
    /// The create call itself is never abandoned half way. If `interrupt`
    /// fired while it was outstanding, the freshly created container is
    /// removed before `Interrupted` is returned, so nothing is left orphaned.
    pub async fn create(&mut self, spec: &CreateSpec, interrupt: &CancellationToken) -> Result<()> {
        if let Some(id) = self.id() {
            return Err(SandboxError::InvalidState(format!(
                "{} already refers to container {}",
                self.label, id
            )));
        }

        info!("Creating container: {}", spec.name);
        let id = self.runtime.create_container(spec).await?;
        debug!("Created container {} ({})", spec.name, id);
        self.state = HandleState::Created(id);

        if interrupt.is_cancelled() {
            warn!(
                "Interrupt received while creating {}; removing it",
                spec.name
            );
            if let Err(e) = self.remove().await {
                warn!("Failed to remove {} after interrupt: {}", self.label, e);
            }
            return Err(SandboxError::Interrupted);
        }

        Ok(())
    }

    /// Start a created container; no-op in any other state
    pub async fn start(&mut self, spec: &StartSpec) -> Result<()> {
        let HandleState::Created(id) = &self.state else {
            debug!("Start of {} skipped in state {:?}", self.label, self.state);
            return Ok(());
        };
        let id = id.clone();

        info!("Starting container: {}", self.label);
        self.runtime.start_container(&id, spec).await?;
        self.state = HandleState::Started(id);
        Ok(())
    }

    /// Stop the container
    ///
    /// "Not found" and "not running" replies are normal during teardown and are
    /// not reported. Only the first kill of a live container reaches the runtime.
    pub async fn kill(&mut self) -> Result<()> {
        let id = match &self.state {
            HandleState::Created(id) | HandleState::Started(id) => id.clone(),
            _ => return Ok(()),
        };

        info!("Stopping {}", self.label);
        match self.runtime.kill_container(&id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{} was already stopped: {}", self.label, e),
            Err(e) => return Err(e.into()),
        }

        self.state = HandleState::Killed(id);
        Ok(())
    }

    /// Delete the container and forget its id
    pub async fn remove(&mut self) -> Result<()> {
        let Some(id) = self.id().map(str::to_string) else {
            return Ok(());
        };

        info!("Removing {}", self.label);
        match self.runtime.remove_container(&id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{} was already removed: {}", self.label, e),
            Err(e) => return Err(e.into()),
        }

        self.state = HandleState::Removed;
        Ok(())
    }

    /// Whether the runtime reports the container as running
    ///
    /// Missing ids, failed inspections and missing state all read as `false`.
    pub async fn running(&self) -> bool {
        let Some(id) = self.id() else {
            return false;
        };

        match self.runtime.inspect_container(id).await {
            Ok(state) => state.running.unwrap_or(false),
            Err(e) => {
                debug!("Inspecting {} failed: {}", self.label, e);
                false
            }
        }
    }

    /// Relay container output through the log
    ///
    /// With `follow` the relay runs on its own task and this returns at once;
    /// the task ends when the output stream does. Without it, the output
    /// buffered so far is relayed before returning.
    pub async fn stream_output(&self, follow: bool) {
        let Some(id) = self.id() else {
            return;
        };

        let stream = self.runtime.logs(id, follow);
        let label = self.label.clone();

        if follow {
            tokio::spawn(relay_output(label, stream));
        } else {
            relay_output(label, stream).await;
        }
    }

    /// Run a command inside the running container
    pub async fn execute(&self, spec: &ExecSpec) -> Result<ExecOutcome> {
        let id = self.id().ok_or_else(|| {
            SandboxError::InvalidState(format!("{} has no container to execute in", self.label))
        })?;

        Ok(self.runtime.exec(id, spec).await?)
    }

    /// Copy `path` out of the container
    ///
    /// A path that does not resolve is a caller error, reported as
    /// `PathNotFound` rather than silently ignored.
    pub async fn extract_archive(&self, path: &str) -> Result<ContainerArchive> {
        let id = self.id().ok_or_else(|| {
            SandboxError::InvalidState(format!("{} has no container to copy from", self.label))
        })?;

        match self.runtime.download(id, path).await {
            Ok(data) => Ok(ContainerArchive::new(data)),
            Err(e) if e.is_not_found() => Err(SandboxError::PathNotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

async fn relay_output(label: String, mut stream: LogStream) {
    while let Some(line) = stream.next().await {
        match line {
            Ok(line) => info!(container = %label, "{}", line),
            Err(e) => {
                warn!("Error streaming output of {}: {}", label, e);
                break;
            }
        }
    }
}

/// Tar archive copied out of a container
#[derive(Debug, Clone)]
pub struct ContainerArchive {
    data: Vec<u8>,
}

impl ContainerArchive {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Paths of all entries in archive order
    pub fn entries(&self) -> Result<Vec<String>> {
        let mut archive = tar::Archive::new(self.data.as_slice());
        let mut names = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            names.push(entry.path()?.to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Contents of the entry named `name`, if present
    pub fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut archive = tar::Archive::new(self.data.as_slice());
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.to_string_lossy() == name {
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                return Ok(Some(contents));
            }
        }
        Ok(None)
    }

    /// Extract into `dest`, creating it if needed
    pub fn unpack(&self, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        let mut archive = tar::Archive::new(self.data.as_slice());
        archive.unpack(dest)?;
        Ok(())
    }
}
