//! Per-process thread watchdog.
//!
//! Wakes whenever a worker thread exits, or after `interval` at the latest,
//! and tops the process back up to its target thread count while items
//! remain queued. Stops once the queue is observed empty.

use super::source::WorkSource;
use super::thread::{ProcessContext, ThreadExit};
use crate::error::Result;
use crate::job::Runner;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Result of one watchdog check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Check {
    /// Work remains; keep watching.
    Continue { replaced: usize },
    /// The queue is empty; the process drains naturally.
    Drained,
}

/// One check-and-repair pass.
pub(crate) fn check<S, R>(ctx: &Arc<ProcessContext<S, R>>) -> Result<Check>
where
    S: WorkSource,
    R: Runner<S::Item>,
{
    let remaining = ctx.source.remaining()?;
    if remaining == 0 {
        return Ok(Check::Drained);
    }

    let live = ctx.live();
    let target = ctx.target();
    if live >= target {
        return Ok(Check::Continue { replaced: 0 });
    }

    let replaced = remaining.min(target - live);
    tracing::warn!(
        live,
        target,
        remaining,
        replaced,
        "Worker threads missing, starting replacements"
    );
    ctx.spawn_threads(replaced)?;
    ctx.record_replacements(replaced);
    Ok(Check::Continue { replaced })
}

/// Run until the queue is empty or the process halts.
pub(crate) fn supervise<S, R>(
    ctx: Arc<ProcessContext<S, R>>,
    exits: Receiver<ThreadExit>,
    interval: Duration,
) where
    S: WorkSource,
    R: Runner<S::Item>,
{
    loop {
        match exits.recv_timeout(interval) {
            Ok(exit) => tracing::trace!(?exit, live = ctx.live(), "Worker thread exited"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if ctx.halted() {
            break;
        }

        match check(&ctx) {
            Ok(Check::Drained) => {
                tracing::debug!("Queue empty, watchdog stopping");
                break;
            }
            Ok(Check::Continue { .. }) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Watchdog check failed, stopping");
                break;
            }
        }
    }
}
