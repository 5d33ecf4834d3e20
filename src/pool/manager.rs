//! The pool manager: the entry point callers use.

use super::broker::{self, Shared};
use super::config::{ExecuteOptions, PoolConfig};
use super::entry::{self, ProcessReport};
use super::protocol::{ParentMessage, StartSpec};
use super::spawn::{resolve_worker_program, spawn_named};
use super::worker_main::is_worker;
use crate::error::{PoolError, Result};
use crate::job::{Job, JobRegistry, WorkItem};
use crate::logging;
use crate::queue::{OutputQueue, WorkQueue};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::instrument;

/// How often the caller re-checks interrupts and aborts while waiting for
/// the drain.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Statistics for the last batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub procs: usize,
    pub threads_per_proc: usize,
    pub submitted: usize,
    /// Items handed back to the caller.
    pub returned: usize,
    pub completed: usize,
    /// Items whose callback returned a domain error.
    pub failed: usize,
    /// Items whose callback panicked.
    pub crashed: usize,
    /// Items held by a worker process that died.
    pub lost: usize,
    pub process_restarts: usize,
    pub processes: Vec<ProcessReport>,
    pub elapsed: Duration,
}

/// A pool of worker processes, each running a pool of worker threads.
///
/// ```no_run
/// use mpwork::{CallbackError, Job, JobRegistry, MultiProcWorkPool, PoolConfig};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Item { value: u64 }
///
/// fn square(item: &mut Item) -> Result<(), CallbackError> {
///     item.value *= item.value;
///     Ok(())
/// }
///
/// fn main() -> mpwork::Result<()> {
///     let job = Job::new("square", square);
///     mpwork::run_if_worker(&JobRegistry::new().with(job.clone()));
///
///     let pool = MultiProcWorkPool::new(PoolConfig::default())?;
///     let items = (1..=100).map(|value| Item { value }).collect();
///     let squared = pool.run(items, &job)?;
///     assert_eq!(squared.len(), 100);
///     Ok(())
/// }
/// ```
pub struct MultiProcWorkPool {
    config: PoolConfig,
    threads_per_proc: usize,
    interrupt: Arc<AtomicBool>,
    last_run: Mutex<Option<RunStats>>,
}

impl MultiProcWorkPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let threads_per_proc = config.effective_threads_per_proc();
        tracing::debug!(
            procs = config.procs,
            threads_per_proc,
            max_threads = ?config.max_threads,
            "Created work pool"
        );
        Ok(Self {
            config,
            threads_per_proc,
            interrupt: Arc::new(AtomicBool::new(false)),
            last_run: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn procs(&self) -> usize {
        self.config.procs
    }

    /// Threads each process starts with, after applying `max_threads`.
    pub fn threads_per_proc(&self) -> usize {
        self.threads_per_proc
    }

    /// Setting this flag while [`execute`](Self::execute) waits kills every
    /// worker process and returns [`PoolError::Interrupted`]. A flag set
    /// before the call interrupts it as well. The flag is cleared when a call
    /// ends.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Statistics of the most recent successful call.
    pub fn last_run(&self) -> Option<RunStats> {
        self.last_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// [`execute`](Self::execute) with default options.
    pub fn run<T: WorkItem>(&self, items: Vec<T>, job: &Job<T>) -> Result<Vec<T>> {
        Ok(self
            .execute(items, job, ExecuteOptions::default())?
            .unwrap_or_default())
    }

    /// Run `job` on every item and block until the batch is drained.
    ///
    /// Returns the processed items in completion order when
    /// `options.return_objects` is set. Items whose callback failed or
    /// panicked are not returned.
    #[instrument(level = "debug", skip_all, fields(job = job.name(), items = items.len()))]
    pub fn execute<T: WorkItem>(
        &self,
        items: Vec<T>,
        job: &Job<T>,
        options: ExecuteOptions,
    ) -> Result<Option<Vec<T>>> {
        if items.is_empty() {
            return Err(PoolError::Precondition("Must supply work items".into()));
        }
        job.validate(options.provide_logger, &options.logger_init_args)?;

        let start = Instant::now();
        let outcome = if self.config.procs == 0 {
            self.execute_inline(items, job, &options)
        } else {
            self.execute_procs(items, job, &options)
        };
        // Cleared after the call so an interrupt raised before it still counts.
        self.interrupt.store(false, Ordering::SeqCst);
        let (results, mut stats) = outcome?;
        stats.elapsed = start.elapsed();

        tracing::info!(
            submitted = stats.submitted,
            completed = stats.completed,
            failed = stats.failed,
            crashed = stats.crashed,
            lost = stats.lost,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Batch drained"
        );
        *self
            .last_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stats);
        Ok(results)
    }

    fn execute_inline<T: WorkItem>(
        &self,
        items: Vec<T>,
        job: &Job<T>,
        options: &ExecuteOptions,
    ) -> Result<(Option<Vec<T>>, RunStats)> {
        let submitted = items.len();
        let queue = Arc::new(WorkQueue::new());
        for item in items {
            queue.put(item);
        }
        let output = options.return_objects.then(|| Arc::new(OutputQueue::new()));

        let logger = options
            .provide_logger
            .then(|| logging::init_work_logging(job.logger_init(), &options.logger_init_args));

        let report = entry::run_inline(
            Arc::clone(&queue),
            output.clone(),
            job.clone(),
            self.config.panic_policy,
            logger,
            Arc::clone(&self.interrupt),
        )?;
        queue.join();

        let results = output.map(|output| output.drain());
        let stats = RunStats {
            procs: 0,
            threads_per_proc: 1,
            submitted,
            returned: results.as_ref().map_or(0, Vec::len),
            completed: report.completed,
            failed: report.failed,
            crashed: report.crashed,
            processes: vec![report],
            ..RunStats::default()
        };
        Ok((results, stats))
    }

    fn execute_procs<T: WorkItem>(
        &self,
        items: Vec<T>,
        job: &Job<T>,
        options: &ExecuteOptions,
    ) -> Result<(Option<Vec<T>>, RunStats)> {
        let program = resolve_worker_program(self.config.worker_program.as_deref())?;
        check_worker_host(is_worker(), JobRegistry::installed(), job)?;
        if self.interrupt.load(Ordering::SeqCst) {
            return Err(PoolError::Interrupted);
        }
        let procs = self.config.procs;
        let submitted = items.len();

        let shared = Arc::new(Shared::new(
            options.return_objects,
            self.config.panic_policy,
            procs,
        ));
        for item in &items {
            shared.queue.put(serde_json::to_value(item)?);
        }
        drop(items);

        let start = ParentMessage::Start(StartSpec {
            job: job.name().to_string(),
            item_type: std::any::type_name::<T>().to_string(),
            threads_per_proc: self.threads_per_proc,
            return_objects: options.return_objects,
            provide_logger: options.provide_logger,
            watchdog_interval_ms: self.config.watchdog_interval.as_millis() as u64,
            panic_policy: self.config.panic_policy,
            logger_init_args: options.logger_init_args.clone(),
        });

        let mut brokers = Vec::with_capacity(procs);
        for slot in 0..procs {
            let shared_slot = Arc::clone(&shared);
            let program = program.clone();
            let start = start.clone();
            let max_restarts = self.config.max_process_restarts;
            let spawned = spawn_named(format!("pool-broker-{}", slot), move || {
                broker::run_slot(&shared_slot, slot, program, start, max_restarts)
            });
            match spawned {
                Ok(handle) => brokers.push(handle),
                Err(e) => {
                    shared.abort_with(e);
                    // Slots that never started are not live either.
                    for _ in slot..procs {
                        shared.live_slots_done();
                    }
                    break;
                }
            }
        }
        tracing::debug!(procs, threads_per_proc = self.threads_per_proc, "Worker processes started");

        if let Err(e) = self.wait_for_drain(&shared) {
            shared.kill_all();
            join_all(brokers);
            return Err(e);
        }
        join_all(brokers);
        if let Some(e) = shared.take_abort() {
            return Err(e);
        }

        let results = match &shared.output {
            Some(output) => Some(
                output
                    .drain()
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<std::result::Result<Vec<T>, _>>()?,
            ),
            None => None,
        };

        let tally = &shared.tally;
        let stats = RunStats {
            procs,
            threads_per_proc: self.threads_per_proc,
            submitted,
            returned: results.as_ref().map_or(0, Vec::len),
            completed: tally.completed.load(Ordering::Relaxed),
            failed: tally.failed.load(Ordering::Relaxed),
            crashed: tally.crashed.load(Ordering::Relaxed),
            lost: tally.lost.load(Ordering::Relaxed),
            process_restarts: tally.restarts.load(Ordering::Relaxed),
            processes: shared.take_reports(),
            elapsed: Duration::ZERO,
        };
        Ok((results, stats))
    }

    /// Block until the queue is drained, the caller interrupts, or the
    /// batch is aborted.
    fn wait_for_drain(&self, shared: &Shared) -> Result<()> {
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                tracing::warn!("Interrupted, terminating worker processes");
                return Err(PoolError::Interrupted);
            }
            if let Some(e) = shared.take_abort() {
                return Err(e);
            }
            if shared.queue.wait_drained(Some(DRAIN_POLL)) {
                return Ok(());
            }
            if shared.live_slots() == 0 && !shared.queue.wait_drained(Some(Duration::ZERO)) {
                if let Some(e) = shared.take_abort() {
                    return Err(e);
                }
                return Err(PoolError::Worker(format!(
                    "All worker processes exited with {} items unfinished",
                    shared.queue.unfinished()
                )));
            }
        }
    }
}

/// Worker processes resolve `job` by name in the installed registry, so the
/// caller's job must be exactly the registered one. A worker process that
/// reaches this point ran the host's `main` without
/// [`run_if_worker`](crate::run_if_worker) and must not spawn workers itself.
fn check_worker_host<T: WorkItem>(
    in_worker: bool,
    registry: Option<&JobRegistry>,
    job: &Job<T>,
) -> Result<()> {
    if in_worker {
        return Err(PoolError::Precondition(
            "Worker process tried to start its own workers. Call mpwork::run_if_worker first thing in main".into(),
        ));
    }
    let registry = registry.ok_or_else(|| {
        PoolError::Precondition(
            "No job registry installed. Call mpwork::run_if_worker (or JobRegistry::install) first thing in main".into(),
        )
    })?;
    registry.check_job(job)
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.join();
    }
}
