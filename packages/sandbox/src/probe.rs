// ABOUTME: Bounded-retry readiness polling for the application tier
// ABOUTME: TCP connect and in-container command checks share one polling loop

use crate::container::ContainerHandle;
use crate::error::{Result, SandboxError};
use crate::runtime::ExecSpec;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Upper bound on a single TCP connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Polling state; `Ready` and `Exhausted` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Polling { attempt: u32 },
    Ready { attempt: u32 },
    Exhausted { attempts: u32 },
}

impl ProbeState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProbeState::Polling { .. })
    }

    /// Next state after an attempt with the given outcome
    fn advance(self, ready: bool, max_attempts: u32) -> ProbeState {
        match self {
            ProbeState::Polling { attempt } if ready => ProbeState::Ready { attempt },
            ProbeState::Polling { attempt } if attempt >= max_attempts => ProbeState::Exhausted {
                attempts: attempt,
            },
            ProbeState::Polling { attempt } => ProbeState::Polling {
                attempt: attempt + 1,
            },
            terminal => terminal,
        }
    }
}

/// One readiness attempt
///
/// Implementations report "not ready yet" as `false`; errors such as a refused
/// connection are not failures of the probe.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self) -> bool;

    /// Short description for log lines
    fn describe(&self) -> String;
}

/// Ready once a TCP connection to the target succeeds, whatever it serves
#[derive(Debug, Clone)]
pub struct TcpCheck {
    host: String,
    port: u16,
}

impl TcpCheck {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl ReadinessCheck for TcpCheck {
    async fn check(&self) -> bool {
        let address = format!("{}:{}", self.host, self.port);
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Connection to {} failed: {}", address, e);
                false
            }
            Err(_) => {
                debug!("Connection to {} timed out", address);
                false
            }
        }
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ready once a command run inside the container exits with status 0
pub struct ExecCheck<'a> {
    handle: &'a ContainerHandle,
    spec: ExecSpec,
}

impl<'a> ExecCheck<'a> {
    pub fn new(handle: &'a ContainerHandle, spec: ExecSpec) -> Self {
        Self { handle, spec }
    }
}

#[async_trait]
impl ReadinessCheck for ExecCheck<'_> {
    async fn check(&self) -> bool {
        match self.handle.execute(&self.spec).await {
            Ok(outcome) => outcome.succeeded(),
            Err(e) => {
                debug!("Readiness command failed: {}", e);
                false
            }
        }
    }

    fn describe(&self) -> String {
        format!("`{}` in {}", self.spec.command.join(" "), self.handle.label())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthProbe {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl HealthProbe {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Poll until the check passes or the attempt budget runs out
    ///
    /// Returns the attempt number that succeeded. Attempts are spaced by
    /// `interval`; there is no sleep after the last one.
    pub async fn wait_until_ready(&self, check: &dyn ReadinessCheck) -> Result<u32> {
        let target = check.describe();
        info!("Waiting for the application at {}", target);

        let mut state = ProbeState::Polling { attempt: 1 };
        while let ProbeState::Polling { attempt } = state {
            info!("Waiting for application to listen on {}: attempt #{}", target, attempt);
            state = state.advance(check.check().await, self.max_attempts);

            match state {
                ProbeState::Ready { attempt } => {
                    debug!("{} ready after {} attempt(s)", target, attempt);
                    return Ok(attempt);
                }
                ProbeState::Exhausted { attempts } => {
                    return Err(SandboxError::ReadinessTimeout { attempts });
                }
                ProbeState::Polling { .. } => tokio::time::sleep(self.interval).await,
            }
        }

        Err(SandboxError::ReadinessTimeout { attempts: 0 })
    }
}
