// ABOUTME: Error types for sandbox construction, operation and teardown
// ABOUTME: Separates configuration, build, runtime, readiness and interrupt failures

use crate::runtime::RuntimeError;
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Invalid or missing configuration, raised before any remote call
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Image build reported a failure
    #[error("Failed to build image {image}: {message}")]
    Build {
        image: String,
        message: String,
        log: Vec<String>,
    },

    /// Extraction target does not exist inside the container
    #[error("File could not be found at {0}")]
    PathNotFound(String),

    /// Runtime/daemon errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Application never became reachable
    #[error("The application failed to become ready after {attempts} attempts")]
    ReadinessTimeout { attempts: u32 },

    /// Interrupt received while the sandbox was being set up
    #[error("Interrupted while the sandbox was being set up")]
    Interrupted,

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Runtime daemon is too old
    #[error("Runtime version {found} is not supported (minimum {required})")]
    UnsupportedRuntime { found: String, required: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, SandboxError::Interrupted)
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
