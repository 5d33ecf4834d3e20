//! Process entry point.
//!
//! Starts the worker threads and the watchdog for one process, then waits
//! until all of them are done. [`run_inline`] is the single-threaded variant
//! used when the pool has no worker processes.

use super::config::PanicPolicy;
use super::source::{LocalSource, WorkSource};
use super::spawn::spawn_named;
use super::thread::{ProcessContext, ThreadExit};
use super::watchdog;
use crate::error::{PoolError, Result};
use crate::job::{Job, Runner, WorkItem};
use crate::logging::WorkLogger;
use crate::queue::{OutputQueue, WorkQueue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// What one process did during a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub pid: u32,
    /// Threads started at process start: `min(threads_per_proc, queue size)`.
    pub initial_threads: usize,
    /// Threads started later by the watchdog.
    pub replacement_threads: usize,
    pub completed: usize,
    pub failed: usize,
    pub crashed: usize,
}

/// Settings shared by every process of a batch.
#[derive(Debug, Clone)]
pub(crate) struct EntrySettings {
    pub threads_per_proc: usize,
    pub policy: PanicPolicy,
    pub watchdog_interval: Duration,
    pub logger: Option<WorkLogger>,
}

/// Run one process's share of the batch to completion.
pub(crate) fn run_process<S, R>(source: S, runner: R, settings: EntrySettings) -> Result<ProcessReport>
where
    S: WorkSource,
    R: Runner<S::Item>,
{
    let initial = settings.threads_per_proc.min(source.remaining()?);
    let (ctx, exits) = ProcessContext::new(
        source,
        runner,
        settings.logger,
        settings.policy,
        settings.threads_per_proc,
        None,
    );
    if initial == 0 {
        tracing::debug!("Queue already empty, nothing to start");
        return Ok(ctx.report(0));
    }

    tracing::debug!(threads = initial, "Starting worker threads");
    if let Err(e) = ctx.spawn_threads(initial) {
        ctx.stop();
        ctx.join_threads();
        return Err(e);
    }

    let watchdog_ctx = Arc::clone(&ctx);
    let interval = settings.watchdog_interval;
    let watchdog = spawn_named("pool-watchdog".into(), move || {
        watchdog::supervise(watchdog_ctx, exits, interval)
    });
    match watchdog {
        Ok(handle) => {
            let _ = handle.join();
        }
        Err(e) => {
            // Without a watchdog the threads still drain, just without repair.
            tracing::warn!(error = %e, "Failed to start watchdog");
        }
    }
    ctx.join_threads();

    let report = ctx.report(initial);
    tracing::debug!(
        completed = report.completed,
        failed = report.failed,
        crashed = report.crashed,
        replacements = report.replacement_threads,
        "Process finished"
    );
    Ok(report)
}

/// Run the whole batch on the calling thread, in submission order.
///
/// There is no watchdog. Under [`PanicPolicy::ReplaceThread`] a crashed loop
/// is replaced at once by a fresh loop on the same thread.
pub(crate) fn run_inline<T: WorkItem>(
    queue: Arc<WorkQueue<T>>,
    output: Option<Arc<OutputQueue<T>>>,
    job: Job<T>,
    policy: PanicPolicy,
    logger: Option<WorkLogger>,
    interrupt: Arc<AtomicBool>,
) -> Result<ProcessReport> {
    let source = LocalSource::new(queue, output);
    let (ctx, _exits) = ProcessContext::new(source, job, logger, policy, 1, Some(interrupt));

    loop {
        match ctx.worker_loop() {
            ThreadExit::Empty => break,
            ThreadExit::Crashed => {
                if let Some(message) = ctx.fatal() {
                    return Err(PoolError::WorkerPanicked { message });
                }
                ctx.record_replacements(1);
            }
            ThreadExit::Halted => {
                if ctx.interrupted() {
                    return Err(PoolError::Interrupted);
                }
                return Err(PoolError::Worker("Inline worker halted".into()));
            }
        }
    }

    Ok(ctx.report(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    static SEEN: Mutex<Vec<u32>> = Mutex::new(Vec::new());

    fn record(n: &mut u32) -> std::result::Result<(), CallbackError> {
        SEEN.lock().unwrap().push(*n);
        *n += 100;
        Ok(())
    }

    fn crash_on_even(n: &mut u32) -> std::result::Result<(), CallbackError> {
        if *n % 2 == 0 {
            panic!("even item {}", n);
        }
        Ok(())
    }

    fn settings(threads: usize) -> EntrySettings {
        EntrySettings {
            threads_per_proc: threads,
            policy: PanicPolicy::ReplaceThread,
            watchdog_interval: Duration::from_millis(20),
            logger: None,
        }
    }

    fn queued(n: u32) -> Arc<WorkQueue<u32>> {
        let queue = Arc::new(WorkQueue::new());
        for i in 0..n {
            queue.put(i);
        }
        queue
    }

    #[test]
    fn test_thread_count_capped_by_queue_size() {
        let queue = queued(3);
        let source = LocalSource::new(Arc::clone(&queue), None);
        let report = run_process(source, Job::new("crash_on_even", crash_on_even), settings(8)).unwrap();
        assert_eq!(report.initial_threads, 3);
        assert_eq!(report.completed + report.crashed, 3);
        assert_eq!(queue.unfinished(), 0);
    }

    #[test]
    fn test_empty_queue_starts_nothing() {
        let queue = queued(0);
        let source = LocalSource::new(queue, None);
        let report = run_process(source, Job::new("crash_on_even", crash_on_even), settings(4)).unwrap();
        assert_eq!(report.initial_threads, 0);
        assert_eq!(report, ProcessReport { pid: std::process::id(), ..Default::default() });
    }

    #[test]
    fn test_run_process_heals_and_drains() {
        let queue = queued(30);
        let output = Arc::new(OutputQueue::new());
        let source = LocalSource::new(Arc::clone(&queue), Some(Arc::clone(&output)));
        let report = run_process(source, Job::new("crash_on_even", crash_on_even), settings(2)).unwrap();

        assert_eq!(report.initial_threads, 2);
        assert_eq!(report.crashed, 15);
        assert_eq!(report.completed, 15);
        assert!(report.replacement_threads > 0);
        let mut odd = output.drain();
        odd.sort_unstable();
        assert_eq!(odd, (0..30).filter(|n| n % 2 == 1).collect::<Vec<_>>());
    }

    #[test]
    fn test_inline_runs_in_submission_order() {
        let queue = queued(5);
        let output = Arc::new(OutputQueue::new());
        let report = run_inline(
            queue,
            Some(Arc::clone(&output)),
            Job::new("record", record),
            PanicPolicy::ReplaceThread,
            None,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(*SEEN.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(output.drain(), vec![100, 101, 102, 103, 104]);
        assert_eq!(report.initial_threads, 1);
        assert_eq!(report.completed, 5);
    }

    #[test]
    fn test_inline_replaces_crashed_loop() {
        let queue = queued(6);
        let output = Arc::new(OutputQueue::new());
        let report = run_inline(
            Arc::clone(&queue),
            Some(Arc::clone(&output)),
            Job::new("crash_on_even", crash_on_even),
            PanicPolicy::ReplaceThread,
            None,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert_eq!(output.drain(), vec![1, 3, 5]);
        assert_eq!(report.replacement_threads, 3);
        assert_eq!(queue.unfinished(), 0);
    }

    #[test]
    fn test_inline_fail_fast() {
        let err = run_inline(
            queued(4),
            None,
            Job::new("crash_on_even", crash_on_even),
            PanicPolicy::FailFast,
            None,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap_err();
        match err {
            PoolError::WorkerPanicked { message } => assert_eq!(message, "even item 0"),
            other => panic!("Expected WorkerPanicked, got {:?}", other),
        }
    }

    #[test]
    fn test_inline_interrupt() {
        let flag = Arc::new(AtomicBool::new(false));
        flag.store(true, Ordering::SeqCst);
        let err = run_inline(
            queued(2),
            None,
            Job::new("record", record),
            PanicPolicy::ReplaceThread,
            None,
            flag,
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::Interrupted));
    }
}
