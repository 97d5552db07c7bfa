// ABOUTME: Lifecycle manager for the two-container application sandbox
// ABOUTME: Exposes the runtime seam, container handles, readiness probing and the orchestrator

pub mod base_image;
pub mod build_context;
pub mod config;
pub mod container;
pub mod error;
pub mod interrupt;
pub mod naming;
pub mod orchestrator;
pub mod probe;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use build_context::{BuildContext, DockerfileTemplate, IgnoreRules};
pub use config::{AppConfiguration, AppLayout, ConfigKind, SandboxConfig};
pub use container::{ContainerArchive, ContainerHandle, HandleState};
pub use error::{Result, SandboxError};
pub use interrupt::InterruptGuard;
pub use orchestrator::{SandboxOrchestrator, SandboxPhase, Tier, DEVAPPSERVER_IMAGE};
pub use probe::{ExecCheck, HealthProbe, ProbeState, ReadinessCheck, TcpCheck};
pub use runtime::{DockerRuntime, Runtime, RuntimeError};
