// ABOUTME: Interrupt handling scoped to sandbox construction
// ABOUTME: Ctrl-C only cancels a token; SIGINT goes back to terminating the process once no guard is alive

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Whether SIGINT currently takes its default action
///
/// Tokio's signal listener stays registered for the life of the process, so
/// a permanent action emulates the default disposition whenever no guard is
/// alive.
struct SigintDisposition {
    guards: Mutex<usize>,
    restore_default: Arc<AtomicBool>,
}

impl SigintDisposition {
    fn new() -> Self {
        Self {
            guards: Mutex::new(0),
            restore_default: Arc::new(AtomicBool::new(true)),
        }
    }

    fn acquire(&self) {
        let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
        *guards += 1;
        self.restore_default.store(false, Ordering::SeqCst);
    }

    fn release(&self) {
        let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
        *guards = guards.saturating_sub(1);
        if *guards == 0 {
            self.restore_default.store(true, Ordering::SeqCst);
        }
    }

    fn default_restored(&self) -> bool {
        self.restore_default.load(Ordering::SeqCst)
    }
}

fn sigint_disposition() -> &'static SigintDisposition {
    static DISPOSITION: OnceLock<SigintDisposition> = OnceLock::new();
    DISPOSITION.get_or_init(|| {
        let disposition = SigintDisposition::new();
        register_default_action(disposition.restore_default.clone());
        disposition
    })
}

#[cfg(unix)]
fn register_default_action(condition: Arc<AtomicBool>) {
    use signal_hook::consts::SIGINT;

    if let Err(e) = signal_hook::flag::register_conditional_default(SIGINT, condition) {
        warn!("Unable to restore the default interrupt action: {}", e);
    }
}

#[cfg(not(unix))]
fn register_default_action(_condition: Arc<AtomicBool>) {}

/// True when SIGINT would terminate the process
pub fn default_interrupt_restored() -> bool {
    sigint_disposition().default_restored()
}

/// Listens for Ctrl-C while alive and records it on a cancellation token
///
/// Dropping the last live guard stops listening and gives SIGINT its default
/// action back. The token itself is never reset.
pub struct InterruptGuard {
    token: CancellationToken,
    listener: JoinHandle<()>,
}

impl InterruptGuard {
    /// Start listening; must be called from within a tokio runtime
    pub fn install(token: CancellationToken) -> Self {
        sigint_disposition().acquire();

        let watched = token.clone();
        let listener = tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        warn!("Interrupt received; the sandbox will be cleaned up");
                        watched.cancel();
                    }
                    Err(e) => warn!("Unable to listen for interrupts: {}", e),
                },
                _ = watched.cancelled() => debug!("Interrupt listener stopped by cancellation"),
            }
        });

        Self { token, listener }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_listening(&self) -> bool {
        !self.listener.is_finished()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.listener.abort();
        sigint_disposition().release();
    }
}
