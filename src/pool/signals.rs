//! Signal setup and exit analysis for worker processes.

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::WaitStatus;

/// Why a worker process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// SIGKILL: either the OOM killer or the pool aborting a batch.
    Killed,
    /// SIGABRT: a Rust abort, e.g. a panic while panicking.
    Aborted,
    /// SIGSEGV or SIGBUS, usually a stack overflow.
    Faulted(Signal),
    /// Any other signal.
    Signaled(Signal),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// Exit code 0.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code 2 is reserved for a refused start handshake.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Exited(crate::pool::worker_main::EXIT_REJECTED))
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Killed => write!(f, "killed (SIGKILL)"),
            Self::Aborted => write!(f, "aborted (SIGABRT)"),
            Self::Faulted(sig) => write!(f, "crashed with {:?}, possibly a stack overflow", sig),
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Classify a `WaitStatus`.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGABRT => TerminationReason::Aborted,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::Faulted(signal),
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// Signal dispositions for a worker process.
///
/// SIGPIPE is ignored so a vanished parent surfaces as a write error.
/// SIGINT is ignored because the parent owns interrupt handling and tears
/// the worker down itself.
pub fn install_worker_dispositions() {
    for sig in [Signal::SIGPIPE, Signal::SIGINT] {
        // Safety: SigIgn installs no Rust handler, so no async-signal-safety concerns.
        if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigIgn) } {
            tracing::debug!(signal = ?sig, error = %e, "Failed to ignore signal");
        }
    }
}
