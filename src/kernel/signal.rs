use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe signal handling for the launcher and the sandbox init
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::types::{Result, SandboxError, SetupStage};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Set in the sandbox init when the supervisor asks it to stop
static TERMINATION_REQUESTED: AtomicBool = AtomicBool::new(false);

fn supervision_error(message: String) -> SandboxError {
    SandboxError::setup(SetupStage::Supervision, message)
}

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Initialize signal handlers
    /// Must be called early in main() before any threads are spawned
    pub fn init() -> Result<Self> {
        Self::install_signal_handlers()?;
        Ok(Self)
    }

    /// Install signal handlers for SIGINT, SIGTERM, SIGHUP
    fn install_signal_handlers() -> Result<()> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only stores to atomics.
            unsafe { signal::sigaction(sig, &sig_action) }
                .map_err(|e| supervision_error(format!("Failed to install {} handler: {}", sig, e)))?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(())
    }

    /// Async-safe signal handler
    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Get signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    /// Wait for signal with timeout
    /// Returns true if signal received, false if timeout
    pub fn wait_for_signal(&self, timeout: std::time::Duration) -> bool {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if self.shutdown_requested() {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        false
    }
}

/// SIGTERM handler for the sandbox init.
///
/// Installed without SA_RESTART so a blocking waitpid returns EINTR and the
/// init can check [`termination_requested`].
pub fn install_termination_handler() -> Result<()> {
    extern "C" fn on_term(_signal: libc::c_int) {
        TERMINATION_REQUESTED.store(true, Ordering::SeqCst);
    }

    let action = SigAction::new(
        SigHandler::Handler(on_term),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic.
    unsafe { signal::sigaction(Signal::SIGTERM, &action) }
        .map_err(|e| supervision_error(format!("Failed to install SIGTERM handler: {}", e)))?;
    Ok(())
}

pub fn termination_requested() -> bool {
    TERMINATION_REQUESTED.load(Ordering::SeqCst)
}

/// Restore default dispositions and an empty mask before exec.
pub fn reset_signal_state() -> Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in [
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGPIPE,
        Signal::SIGCHLD,
    ] {
        // SAFETY: installing SIG_DFL has no handler preconditions.
        unsafe { signal::sigaction(sig, &default) }
            .map_err(|e| supervision_error(format!("Failed to reset {}: {}", sig, e)))?;
    }
    signal::sigprocmask(signal::SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|e| supervision_error(format!("Failed to clear signal mask: {}", e)))?;
    Ok(())
}
