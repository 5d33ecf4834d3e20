//! Parent-side service for worker processes.
//!
//! Each process slot gets one broker thread. The broker spawns the worker
//! process, answers its queue requests from the shared queues and books its
//! results. When the worker process dies, the items it had taken are marked
//! done (counted as lost) and the process is respawned while work remains.

use super::config::PanicPolicy;
use super::entry::ProcessReport;
use super::proc::Proc;
use super::protocol::{ItemOutcome, ParentMessage, WorkerMessage};
use super::signals::TerminationReason;
use super::spawn::spawn_worker;
use crate::error::{PoolError, Result};
use crate::queue::{OutputQueue, Ticket, WorkQueue};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a worker gets to exit after the batch before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parent-side counters for one batch.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub completed: AtomicUsize,
    pub failed: AtomicUsize,
    pub crashed: AtomicUsize,
    pub lost: AtomicUsize,
    pub restarts: AtomicUsize,
}

/// State shared by the pool manager and all brokers of one batch.
pub(crate) struct Shared {
    pub queue: WorkQueue<Value>,
    pub output: Option<OutputQueue<Value>>,
    pub tally: Tally,
    policy: PanicPolicy,
    abort: Mutex<Option<PoolError>>,
    stopping: AtomicBool,
    children: Mutex<HashMap<usize, Pid>>,
    live_slots: AtomicUsize,
    reports: Mutex<Vec<ProcessReport>>,
}

impl Shared {
    pub(crate) fn new(return_objects: bool, policy: PanicPolicy, slots: usize) -> Self {
        Self {
            queue: WorkQueue::new(),
            output: return_objects.then(OutputQueue::new),
            tally: Tally::default(),
            policy,
            abort: Mutex::new(None),
            stopping: AtomicBool::new(false),
            children: Mutex::new(HashMap::new()),
            live_slots: AtomicUsize::new(slots),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Record the first fatal error of the batch.
    pub(crate) fn abort_with(&self, error: PoolError) {
        let mut slot = lock(&self.abort);
        if slot.is_none() {
            tracing::debug!(error = %error, "Aborting batch");
            *slot = Some(error);
        }
    }

    pub(crate) fn take_abort(&self) -> Option<PoolError> {
        lock(&self.abort).take()
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Stop respawning and SIGKILL every worker process still running.
    pub(crate) fn kill_all(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for (slot, pid) in lock(&self.children).iter() {
            tracing::debug!(slot, pid = %pid, "Killing worker process");
            let _ = signal::kill(*pid, Signal::SIGKILL);
        }
    }

    /// Slots whose broker is still serving a worker process.
    pub(crate) fn live_slots(&self) -> usize {
        self.live_slots.load(Ordering::SeqCst)
    }

    pub(crate) fn live_slots_done(&self) {
        self.live_slots.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn take_reports(&self) -> Vec<ProcessReport> {
        std::mem::take(&mut *lock(&self.reports))
    }

    fn book(&self, outcome: ItemOutcome) -> Result<()> {
        match outcome {
            ItemOutcome::Completed { item } => {
                if let (Some(output), Some(item)) = (&self.output, item) {
                    output.push(item);
                }
                self.tally.completed.fetch_add(1, Ordering::Relaxed);
            }
            ItemOutcome::Failed { message } => {
                tracing::debug!(error = %message, "Work item failed");
                self.tally.failed.fetch_add(1, Ordering::Relaxed);
            }
            ItemOutcome::Crashed { message } => {
                self.tally.crashed.fetch_add(1, Ordering::Relaxed);
                if self.policy == PanicPolicy::FailFast {
                    self.abort_with(PoolError::WorkerPanicked { message });
                }
            }
        }
        // Abort is recorded before the drain counter can reach zero.
        self.queue.task_done()
    }

    fn release(&self, leases: HashSet<Ticket>) {
        if leases.is_empty() {
            return;
        }
        tracing::warn!(count = leases.len(), "Dropping items held by a dead worker process");
        for _ in &leases {
            self.tally.lost.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.queue.task_done() {
                tracing::error!(error = %e, "Drain accounting out of step");
            }
        }
    }
}

/// How one worker process session ended.
enum Session {
    /// The worker reported and exited.
    Finished,
    /// The worker refused the start instructions.
    Rejected(String),
    /// The pipe broke before the worker finished.
    Died,
}

/// Serve one process slot until the batch no longer needs it.
pub(crate) fn run_slot(
    shared: &Shared,
    slot: usize,
    program: PathBuf,
    start: ParentMessage,
    max_restarts: usize,
) {
    let mut restarts = 0;
    loop {
        if shared.stopping() {
            break;
        }

        let mut proc = match spawn_worker(&program) {
            Ok(proc) => proc,
            Err(e) => {
                shared.abort_with(e);
                break;
            }
        };
        lock(&shared.children).insert(slot, proc.pid());

        let mut leases = HashSet::new();
        let session = serve(shared, &mut proc, &start, &mut leases);
        lock(&shared.children).remove(&slot);
        shared.release(leases);

        match session {
            Session::Finished => {
                match proc.stop(EXIT_GRACE) {
                    Ok(reason) if !reason.is_success() => {
                        tracing::warn!(slot, reason = %reason, "Worker process finished uncleanly");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(slot, error = %e, "Failed to reap worker process"),
                }
                break;
            }
            Session::Rejected(message) => {
                if let Ok(reason) = proc.wait()
                    && !reason.is_rejection()
                {
                    tracing::debug!(slot, reason = %reason, "Rejecting worker process exited unexpectedly");
                }
                shared.abort_with(PoolError::Precondition(message));
                break;
            }
            Session::Died => {
                let reason = match proc.wait() {
                    Ok(reason) => reason,
                    Err(e) => {
                        tracing::warn!(slot, error = %e, "Failed to reap worker process");
                        TerminationReason::Unknown
                    }
                };
                // Exiting with the rejection code without a reason still means
                // the start instructions were refused; respawning cannot help.
                if reason.is_rejection() {
                    shared.abort_with(PoolError::Precondition(format!(
                        "Worker process refused the start instructions ({})",
                        reason
                    )));
                    break;
                }
                if shared.stopping() || shared.queue.remaining() == 0 {
                    break;
                }
                if restarts >= max_restarts {
                    tracing::error!(slot, reason = %reason, restarts, "Worker process died, giving up on this slot");
                    break;
                }
                restarts += 1;
                shared.tally.restarts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(slot, reason = %reason, restart = restarts, "Worker process died, respawning");
            }
        }
    }
    shared.live_slots_done();
}

fn serve(
    shared: &Shared,
    proc: &mut Proc,
    start: &ParentMessage,
    leases: &mut HashSet<Ticket>,
) -> Session {
    match proc.recv() {
        Ok(Some(WorkerMessage::Ready { pid })) => {
            tracing::trace!(pid, "Worker process ready");
        }
        Ok(Some(other)) => {
            tracing::warn!(message = ?other, "Worker process sent unexpected message instead of Ready");
            return Session::Died;
        }
        Ok(None) => return Session::Died,
        Err(e) => {
            tracing::warn!(error = %e, "Worker process handshake failed");
            return Session::Died;
        }
    }
    if proc.send(start).is_err() {
        return Session::Died;
    }

    loop {
        let message = match proc.recv() {
            Ok(Some(message)) => message,
            Ok(None) => return Session::Died,
            Err(e) => {
                tracing::warn!(pid = %proc.pid(), error = %e, "Worker process connection failed");
                return Session::Died;
            }
        };

        let reply = match message {
            WorkerMessage::Size => Some(ParentMessage::Size {
                remaining: if shared.stopping() {
                    0
                } else {
                    shared.queue.remaining()
                },
            }),
            WorkerMessage::Take if shared.stopping() => Some(ParentMessage::Exit),
            WorkerMessage::Take => Some(match shared.queue.try_take() {
                Some((ticket, item)) => {
                    leases.insert(ticket);
                    ParentMessage::Item { ticket, item }
                }
                None => ParentMessage::Empty,
            }),
            WorkerMessage::Done { ticket, outcome } => {
                if leases.remove(&ticket) {
                    if let Err(e) = shared.book(outcome) {
                        tracing::error!(ticket, error = %e, "Drain accounting out of step");
                    }
                } else {
                    tracing::warn!(ticket, "Worker process reported an item it does not hold");
                }
                None
            }
            WorkerMessage::Rejected { message } => return Session::Rejected(message),
            WorkerMessage::Finished { report } => {
                lock(&shared.reports).push(report);
                return Session::Finished;
            }
            WorkerMessage::Ready { .. } => {
                tracing::warn!(pid = %proc.pid(), "Worker process sent a second Ready");
                None
            }
        };

        if let Some(reply) = reply
            && proc.send(&reply).is_err()
        {
            return Session::Died;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared_with(items: usize, return_objects: bool, policy: PanicPolicy) -> Shared {
        let shared = Shared::new(return_objects, policy, 1);
        for i in 0..items {
            shared.queue.put(json!(i));
        }
        shared
    }

    #[test]
    fn test_book_outcomes() {
        let shared = shared_with(3, true, PanicPolicy::ReplaceThread);
        for _ in 0..3 {
            shared.queue.try_take().unwrap();
        }

        shared
            .book(ItemOutcome::Completed {
                item: Some(json!(10)),
            })
            .unwrap();
        shared
            .book(ItemOutcome::Failed {
                message: "nope".into(),
            })
            .unwrap();
        shared
            .book(ItemOutcome::Crashed {
                message: "boom".into(),
            })
            .unwrap();

        assert!(shared.queue.wait_drained(Some(Duration::ZERO)));
        assert_eq!(shared.tally.completed.load(Ordering::Relaxed), 1);
        assert_eq!(shared.tally.failed.load(Ordering::Relaxed), 1);
        assert_eq!(shared.tally.crashed.load(Ordering::Relaxed), 1);
        assert_eq!(shared.output.as_ref().unwrap().drain(), vec![json!(10)]);
        // Crashes do not abort outside fail-fast
        assert!(shared.take_abort().is_none());
    }

    #[test]
    fn test_fail_fast_crash_aborts() {
        let shared = shared_with(1, false, PanicPolicy::FailFast);
        shared.queue.try_take().unwrap();
        shared
            .book(ItemOutcome::Crashed {
                message: "boom".into(),
            })
            .unwrap();
        assert!(matches!(
            shared.take_abort(),
            Some(PoolError::WorkerPanicked { .. })
        ));
        assert!(shared.output.is_none());
    }

    #[test]
    fn test_release_counts_lost_items() {
        let shared = shared_with(2, true, PanicPolicy::ReplaceThread);
        let (a, _) = shared.queue.try_take().unwrap();
        let (b, _) = shared.queue.try_take().unwrap();

        shared.release(HashSet::from([a, b]));
        assert_eq!(shared.tally.lost.load(Ordering::Relaxed), 2);
        assert_eq!(shared.queue.unfinished(), 0);
    }

    #[test]
    fn test_first_abort_wins() {
        let shared = shared_with(0, false, PanicPolicy::ReplaceThread);
        shared.abort_with(PoolError::Interrupted);
        shared.abort_with(PoolError::Worker("later".into()));
        assert!(matches!(shared.take_abort(), Some(PoolError::Interrupted)));
        assert!(shared.take_abort().is_none());
    }

    #[test]
    fn test_missing_worker_program_aborts_slot() {
        let shared = shared_with(1, false, PanicPolicy::ReplaceThread);
        let start = ParentMessage::Exit;
        run_slot(
            &shared,
            0,
            PathBuf::from("/nonexistent/mpwork-worker"),
            start,
            3,
        );
        assert_eq!(shared.live_slots(), 0);
        assert!(matches!(shared.take_abort(), Some(PoolError::Worker(_))));
    }

    fn start() -> ParentMessage {
        ParentMessage::Start(super::super::protocol::StartSpec {
            job: "square".into(),
            item_type: "u32".into(),
            threads_per_proc: 1,
            return_objects: true,
            provide_logger: false,
            watchdog_interval_ms: 50,
            panic_policy: PanicPolicy::ReplaceThread,
            logger_init_args: Default::default(),
        })
    }

    fn exiting_program(dir: &std::path::Path, code: i32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(format!("exit-{}", code));
        std::fs::write(&path, format!("#!/bin/sh\nexit {}\n", code)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_dead_worker_is_respawned_up_to_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_with(4, true, PanicPolicy::ReplaceThread);

        run_slot(&shared, 0, exiting_program(dir.path(), 3), start(), 2);

        assert_eq!(shared.tally.restarts.load(Ordering::Relaxed), 2);
        assert_eq!(shared.live_slots(), 0);
        assert!(shared.take_abort().is_none());
        // Nothing was leased, so nothing was written off.
        assert_eq!(shared.tally.lost.load(Ordering::Relaxed), 0);
        assert_eq!(shared.queue.remaining(), 4);
    }

    #[test]
    fn test_rejection_exit_code_aborts_without_respawn() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_with(4, true, PanicPolicy::ReplaceThread);

        run_slot(&shared, 0, exiting_program(dir.path(), 2), start(), 3);

        assert_eq!(shared.tally.restarts.load(Ordering::Relaxed), 0);
        let err = shared.take_abort().unwrap();
        assert!(matches!(err, PoolError::Precondition(_)), "{err}");
        assert!(err.to_string().contains("exited with code 2"));
    }
}
