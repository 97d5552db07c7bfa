// ABOUTME: Recording in-memory runtime used by unit tests in place of a Docker daemon
// ABOUTME: Keeps container state and an ordered call log for ordering and idempotence assertions

use crate::runtime::{
    BuildLog, BuildSpec, ContainerState, CreateSpec, ExecOutcome, ExecSpec, LogStream,
    NetworkMode, Runtime, RuntimeError, RuntimeResult, StartSpec,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Version,
    Build(String),
    Create { name: String, network: NetworkMode },
    Start(String),
    Kill(String),
    Remove(String),
    Inspect(String),
    Logs { id: String, follow: bool },
    Exec(String),
    Download { id: String, path: String },
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub running: bool,
    pub spec: CreateSpec,
}

#[derive(Default)]
pub(crate) struct Inner {
    calls: Vec<Call>,
    containers: HashMap<String, FakeContainer>,
    removed: Vec<String>,
    images: HashSet<String>,
    next_id: u32,
}

pub struct FakeRuntime {
    pub(crate) inner: Mutex<Inner>,
    pub version: String,
    pub fail_build: bool,
    /// Container names starting with this prefix fail to create
    pub fail_create: Option<String>,
    /// Cancelled while a create call is in flight
    pub cancel_on_create: Option<CancellationToken>,
    pub exec_exit_code: i64,
    /// Every remove call fails with an API error
    pub fail_remove: bool,
    pub log_lines: Vec<String>,
    /// Paths that resolve inside every container, mapped to file contents
    pub files: HashMap<String, Vec<u8>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            version: "24.0.7".to_string(),
            fail_build: false,
            fail_create: None,
            cancel_on_create: None,
            exec_exit_code: 0,
            fail_remove: false,
            log_lines: vec!["line one".to_string(), "line two".to_string()],
            files: HashMap::new(),
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn remote_call_count(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.inner.lock().unwrap().containers.values().cloned().collect()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.inner.lock().unwrap().containers.get(id).cloned()
    }

    pub fn removed(&self) -> Vec<String> {
        self.inner.lock().unwrap().removed.clone()
    }

    pub fn images(&self) -> HashSet<String> {
        self.inner.lock().unwrap().images.clone()
    }

    pub fn add_image(&self, image: &str) {
        self.inner.lock().unwrap().images.insert(image.to_string());
    }

    /// Mark a container as stopped out of band
    pub fn stop_out_of_band(&self, id: &str) {
        if let Some(container) = self.inner.lock().unwrap().containers.get_mut(id) {
            container.running = false;
        }
    }

    /// Remove a container out of band, as another client would
    pub fn remove_out_of_band(&self, id: &str) {
        self.inner.lock().unwrap().containers.remove(id);
    }

    /// Index of the first call matching the predicate
    pub fn position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls().iter().position(predicate)
    }

    fn record(&self, call: Call) {
        self.inner.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    fn host(&self) -> &str {
        "127.0.0.1"
    }

    async fn version(&self) -> RuntimeResult<String> {
        self.record(Call::Version);
        Ok(self.version.clone())
    }

    async fn build_image(&self, spec: &BuildSpec, context: Vec<u8>) -> RuntimeResult<BuildLog> {
        self.record(Call::Build(spec.tag.clone()));
        assert!(!context.is_empty(), "build context must not be empty");

        if self.fail_build {
            return Ok(BuildLog {
                lines: vec!["Step 1 : FROM base".to_string()],
                error: Some("Could not build 032b8b2855fc".to_string()),
            });
        }

        self.add_image(&spec.tag);
        Ok(BuildLog {
            lines: vec![
                "Step 1 : FROM base".to_string(),
                "Successfully built 032b8b2855fc".to_string(),
            ],
            error: None,
        })
    }

    async fn create_container(&self, spec: &CreateSpec) -> RuntimeResult<String> {
        self.record(Call::Create {
            name: spec.name.clone(),
            network: spec.network.clone(),
        });

        if let Some(prefix) = &self.fail_create {
            if spec.name.starts_with(prefix) {
                return Err(RuntimeError::Api(format!("cannot create {}", spec.name)));
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if !inner.images.contains(&spec.image) {
            return Err(RuntimeError::NotFound(format!("No such image: {}", spec.image)));
        }
        if let NetworkMode::Container(peer) = &spec.network {
            if !inner.containers.contains_key(peer) {
                return Err(RuntimeError::NotFound(format!("No such container: {}", peer)));
            }
        }

        inner.next_id += 1;
        let id = format!("fake-{}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                running: false,
                spec: spec.clone(),
            },
        );
        drop(inner);

        // The interrupt lands while the call is still outstanding
        if let Some(token) = &self.cancel_on_create {
            token.cancel();
        }

        Ok(id)
    }

    async fn start_container(&self, id: &str, _spec: &StartSpec) -> RuntimeResult<()> {
        self.record(Call::Start(id.to_string()));
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn kill_container(&self, id: &str) -> RuntimeResult<()> {
        self.record(Call::Kill(id.to_string()));
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.get_mut(id) {
            Some(container) if container.running => {
                container.running = false;
                Ok(())
            }
            Some(_) => Err(RuntimeError::NotRunning(id.to_string())),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        self.record(Call::Remove(id.to_string()));
        if self.fail_remove {
            return Err(RuntimeError::Api(format!("cannot remove {}", id)));
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.containers.remove(id) {
            Some(_) => {
                inner.removed.push(id.to_string());
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerState> {
        self.record(Call::Inspect(id.to_string()));
        let inner = self.inner.lock().unwrap();
        inner
            .containers
            .get(id)
            .map(|c| ContainerState {
                running: Some(c.running),
                status: Some(if c.running { "running" } else { "exited" }.to_string()),
                exit_code: None,
            })
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn logs(&self, id: &str, follow: bool) -> LogStream {
        self.record(Call::Logs {
            id: id.to_string(),
            follow,
        });
        let lines: Vec<RuntimeResult<String>> = self.log_lines.iter().cloned().map(Ok).collect();
        futures::stream::iter(lines).boxed()
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> RuntimeResult<ExecOutcome> {
        self.record(Call::Exec(id.to_string()));
        let inner = self.inner.lock().unwrap();
        match inner.containers.get(id) {
            Some(c) if c.running => Ok(ExecOutcome {
                exit_code: Some(self.exec_exit_code),
                running: false,
                stdout: spec.command.join(" ").into_bytes(),
                stderr: Vec::new(),
            }),
            Some(_) => Err(RuntimeError::NotRunning(id.to_string())),
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn download(&self, id: &str, path: &str) -> RuntimeResult<Vec<u8>> {
        self.record(Call::Download {
            id: id.to_string(),
            path: path.to_string(),
        });

        if !self.inner.lock().unwrap().containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        let contents = self
            .files
            .get(path)
            .ok_or_else(|| RuntimeError::NotFound(format!("Could not find the file {}", path)))?;

        let name = path.rsplit('/').next().unwrap_or(path);
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_slice())
            .map_err(|e| RuntimeError::Api(e.to_string()))?;
        builder
            .into_inner()
            .map_err(|e| RuntimeError::Api(e.to_string()))
    }
}
