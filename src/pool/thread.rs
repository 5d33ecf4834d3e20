//! Worker threads and the per-process context they share.
//!
//! A worker thread takes items until the source is empty, running the job
//! on each. Threads are never restarted: a thread that exits is gone, and the
//! watchdog starts a new one if the process falls below its target.
//!
//! The context keeps an explicit count of live threads. A thread holds a
//! [`LiveGuard`] for its whole life; dropping the guard lowers the count and
//! notifies the watchdog.

use super::config::PanicPolicy;
use super::entry::ProcessReport;
use super::source::{Lease, Outcome, WorkSource};
use super::spawn::spawn_named;
use crate::error::Result;
use crate::job::Runner;
use crate::logging::WorkLogger;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// How a worker thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadExit {
    /// The source reported no more items.
    Empty,
    /// A callback panicked and the thread gave up.
    Crashed,
    /// The process was told to stop, or the source failed.
    Halted,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicUsize,
    failed: AtomicUsize,
    crashed: AtomicUsize,
    replacements: AtomicUsize,
}

/// State shared by all worker threads and the watchdog of one process.
pub(crate) struct ProcessContext<S: WorkSource, R> {
    pub(crate) source: S,
    runner: R,
    logger: Option<WorkLogger>,
    policy: PanicPolicy,
    target: usize,
    live: AtomicUsize,
    next_id: AtomicUsize,
    exits: Sender<ThreadExit>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
    halt: AtomicBool,
    interrupt: Option<Arc<AtomicBool>>,
    fatal: Mutex<Option<String>>,
}

impl<S, R> ProcessContext<S, R>
where
    S: WorkSource,
    R: Runner<S::Item>,
{
    /// Returns the context and the receiving end of its thread-exit notifications.
    pub(crate) fn new(
        source: S,
        runner: R,
        logger: Option<WorkLogger>,
        policy: PanicPolicy,
        target: usize,
        interrupt: Option<Arc<AtomicBool>>,
    ) -> (Arc<Self>, Receiver<ThreadExit>) {
        let (exits, rx) = unbounded();
        let ctx = Arc::new(Self {
            source,
            runner,
            logger,
            policy,
            target,
            live: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            exits,
            handles: Mutex::new(Vec::new()),
            counters: Counters::default(),
            halt: AtomicBool::new(false),
            interrupt,
            fatal: Mutex::new(None),
        });
        (ctx, rx)
    }

    /// Threads this process should keep running while work remains.
    pub(crate) fn target(&self) -> usize {
        self.target
    }

    /// Worker threads currently alive.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
            || self
                .interrupt
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub(crate) fn stop(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn fatal_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Panic message that stopped the process under [`PanicPolicy::FailFast`].
    pub(crate) fn fatal(&self) -> Option<String> {
        self.fatal_slot().clone()
    }

    pub(crate) fn record_replacements(&self, n: usize) {
        self.counters.replacements.fetch_add(n, Ordering::Relaxed);
    }

    /// Start `n` worker threads.
    ///
    /// The live count is raised before each spawn so the watchdog never
    /// sees a thread that is starting up as missing.
    pub(crate) fn spawn_threads(self: &Arc<Self>, n: usize) -> Result<()> {
        for _ in 0..n {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.live.fetch_add(1, Ordering::SeqCst);
            let ctx = Arc::clone(self);
            match spawn_named(format!("pool-worker-{}", id), move || ctx.thread_main()) {
                Ok(handle) => self.lock_handles().push(handle),
                Err(e) => {
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join every worker thread, including ones started while joining.
    pub(crate) fn join_threads(&self) {
        loop {
            let handles = std::mem::take(&mut *self.lock_handles());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
    }

    fn thread_main(&self) {
        let mut guard = LiveGuard {
            live: &self.live,
            exits: &self.exits,
            exit: ThreadExit::Crashed,
        };
        guard.exit = self.worker_loop();
        tracing::trace!(exit = ?guard.exit, "Worker thread exiting");
    }

    /// Take and run items until the source is empty, the process halts, or
    /// the panic policy ends the thread.
    pub(crate) fn worker_loop(&self) -> ThreadExit {
        loop {
            if self.halted() {
                return ThreadExit::Halted;
            }

            let Lease { ticket, mut item } = match self.source.take() {
                Ok(Some(lease)) => lease,
                Ok(None) => return ThreadExit::Empty,
                Err(e) => {
                    tracing::warn!(error = %e, "Lost contact with the work queue");
                    self.stop();
                    return ThreadExit::Halted;
                }
            };

            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.runner.run(&mut item, self.logger.as_ref())
            }));

            let (outcome, crash) = match result {
                Ok(Ok(())) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    (Outcome::Completed(item), None)
                }
                Ok(Err(e)) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(ticket, error = %e, "Work item failed");
                    (Outcome::Failed(e.message().to_string()), None)
                }
                Err(payload) => {
                    self.counters.crashed.fetch_add(1, Ordering::Relaxed);
                    let message = panic_message(payload.as_ref());
                    (Outcome::Crashed(message.clone()), Some(message))
                }
            };

            if let Err(e) = self.source.finish(ticket, outcome) {
                tracing::warn!(ticket, error = %e, "Failed to report work item");
                self.stop();
                return ThreadExit::Halted;
            }

            if let Some(message) = crash {
                match self.policy {
                    PanicPolicy::Contain => {
                        tracing::warn!(ticket, panic = %message, "Work item panicked, continuing");
                    }
                    PanicPolicy::ReplaceThread => {
                        tracing::warn!(ticket, panic = %message, "Work item panicked, thread exiting");
                        return ThreadExit::Crashed;
                    }
                    PanicPolicy::FailFast => {
                        tracing::error!(ticket, panic = %message, "Work item panicked, stopping process");
                        self.fatal_slot().get_or_insert(message);
                        self.stop();
                        return ThreadExit::Crashed;
                    }
                }
            }
        }
    }

    pub(crate) fn report(&self, initial_threads: usize) -> ProcessReport {
        ProcessReport {
            pid: std::process::id(),
            initial_threads,
            replacement_threads: self.counters.replacements.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            crashed: self.counters.crashed.load(Ordering::Relaxed),
        }
    }
}

/// Lowers the live count and notifies the watchdog when a thread ends,
/// however it ends.
struct LiveGuard<'a> {
    live: &'a AtomicUsize,
    exits: &'a Sender<ThreadExit>,
    exit: ThreadExit,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        let _ = self.exits.send(self.exit);
    }
}

/// Text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// `[(pid:N) process : thread ]` for the calling thread.
pub fn thread_debug_info() -> String {
    let process = if std::env::var_os(super::spawn::WORKER_ENV).is_some() {
        "worker-process"
    } else {
        "main-process"
    };
    let current = std::thread::current();
    format!(
        "[(pid:{}) {} : {} ]",
        std::process::id(),
        process,
        current.name().unwrap_or("unnamed")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use crate::job::Job;
    use crate::pool::source::LocalSource;
    use crate::queue::{OutputQueue, WorkQueue};
    use std::time::Duration;

    fn double(n: &mut i64) -> std::result::Result<(), CallbackError> {
        *n *= 2;
        Ok(())
    }

    fn reject_odd(n: &mut i64) -> std::result::Result<(), CallbackError> {
        if *n % 2 == 1 {
            return Err(CallbackError::new("odd"));
        }
        Ok(())
    }

    fn panic_on_three(n: &mut i64) -> std::result::Result<(), CallbackError> {
        if *n == 3 {
            panic!("three is not allowed");
        }
        Ok(())
    }

    type Ctx = ProcessContext<LocalSource<i64>, Job<i64>>;

    fn context(
        items: &[i64],
        job: Job<i64>,
        policy: PanicPolicy,
        target: usize,
    ) -> (
        Arc<Ctx>,
        Receiver<ThreadExit>,
        Arc<WorkQueue<i64>>,
        Arc<OutputQueue<i64>>,
    ) {
        let queue = Arc::new(WorkQueue::new());
        for &i in items {
            queue.put(i);
        }
        let output = Arc::new(OutputQueue::new());
        let source = LocalSource::new(Arc::clone(&queue), Some(Arc::clone(&output)));
        let (ctx, rx) = ProcessContext::new(source, job, None, policy, target, None);
        (ctx, rx, queue, output)
    }

    #[test]
    fn test_loop_drains_and_exits_empty() {
        let (ctx, _rx, queue, output) =
            context(&[1, 2, 3], Job::new("double", double), PanicPolicy::ReplaceThread, 1);
        assert_eq!(ctx.worker_loop(), ThreadExit::Empty);
        assert_eq!(output.drain(), vec![2, 4, 6]);
        assert_eq!(queue.unfinished(), 0);
        assert_eq!(ctx.report(1).completed, 3);
    }

    #[test]
    fn test_domain_error_marks_done_and_drops_item() {
        let (ctx, _rx, queue, output) =
            context(&[1, 2, 3, 4], Job::new("reject_odd", reject_odd), PanicPolicy::ReplaceThread, 1);
        assert_eq!(ctx.worker_loop(), ThreadExit::Empty);
        assert_eq!(output.drain(), vec![2, 4]);
        assert_eq!(queue.unfinished(), 0);

        let report = ctx.report(1);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 2);
    }

    #[test]
    fn test_panic_ends_thread_under_replace_policy() {
        let (ctx, _rx, queue, output) = context(
            &[1, 3, 5],
            Job::new("panic_on_three", panic_on_three),
            PanicPolicy::ReplaceThread,
            1,
        );
        assert_eq!(ctx.worker_loop(), ThreadExit::Crashed);
        // The crashed item is accounted for, the rest is still queued.
        assert_eq!(queue.unfinished(), 1);
        assert_eq!(queue.remaining(), 1);
        assert_eq!(output.drain(), vec![1]);
        assert_eq!(ctx.report(1).crashed, 1);

        // A fresh loop picks up where the old one stopped.
        assert_eq!(ctx.worker_loop(), ThreadExit::Empty);
        assert_eq!(output.drain(), vec![5]);
    }

    #[test]
    fn test_panic_contained() {
        let (ctx, _rx, queue, output) = context(
            &[1, 3, 5],
            Job::new("panic_on_three", panic_on_three),
            PanicPolicy::Contain,
            1,
        );
        assert_eq!(ctx.worker_loop(), ThreadExit::Empty);
        assert_eq!(output.drain(), vec![1, 5]);
        assert_eq!(queue.unfinished(), 0);
    }

    #[test]
    fn test_panic_fail_fast_records_message() {
        let (ctx, _rx, _queue, _output) = context(
            &[3, 1],
            Job::new("panic_on_three", panic_on_three),
            PanicPolicy::FailFast,
            1,
        );
        assert_eq!(ctx.worker_loop(), ThreadExit::Crashed);
        assert_eq!(ctx.fatal().as_deref(), Some("three is not allowed"));
        assert!(ctx.halted());
        assert_eq!(ctx.worker_loop(), ThreadExit::Halted);
    }

    #[test]
    fn test_spawned_threads_update_live_count_and_notify() {
        let items: Vec<i64> = (0..40).collect();
        let (ctx, rx, queue, output) =
            context(&items, Job::new("double", double), PanicPolicy::ReplaceThread, 4);

        ctx.spawn_threads(4).unwrap();
        queue.join();
        ctx.join_threads();

        assert_eq!(ctx.live(), 0);
        let exits: Vec<_> = rx.try_iter().collect();
        assert_eq!(exits, vec![ThreadExit::Empty; 4]);
        assert_eq!(output.len(), 40);
    }

    #[test]
    fn test_interrupt_flag_halts_loop() {
        let queue = Arc::new(WorkQueue::new());
        queue.put(1_i64);
        let flag = Arc::new(AtomicBool::new(true));
        let source = LocalSource::new(Arc::clone(&queue), None);
        let (ctx, _rx) = ProcessContext::new(
            source,
            Job::new("double", double),
            None,
            PanicPolicy::ReplaceThread,
            1,
            Some(flag),
        );
        assert_eq!(ctx.worker_loop(), ThreadExit::Halted);
        assert!(ctx.interrupted());
        assert_eq!(queue.remaining(), 1);
        assert!(!queue.wait_drained(Some(Duration::ZERO)));
    }

    #[test]
    fn test_panic_message_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(s.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_thread_debug_info_format() {
        let info = std::thread::Builder::new()
            .name("inspected".into())
            .spawn(thread_debug_info)
            .unwrap()
            .join()
            .unwrap();
        assert!(info.starts_with(&format!("[(pid:{}) ", std::process::id())));
        assert!(info.ends_with(": inspected ]"));
    }
}
