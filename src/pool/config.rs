//! Pool configuration.

use crate::error::{PoolError, Result};
use crate::logging::LogArgs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default worker threads per process.
pub const DEFAULT_THREADS_PER_PROC: usize = 8;

/// Default watchdog interval.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of times a dead worker process is respawned per slot.
pub const DEFAULT_MAX_PROCESS_RESTARTS: usize = 3;

/// What happens when a callback panics.
///
/// In every policy the item is marked done, left out of the results and
/// counted as crashed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanicPolicy {
    /// The thread exits and the watchdog starts a replacement.
    #[default]
    ReplaceThread,
    /// The thread keeps draining, as for a domain error.
    Contain,
    /// Abort the whole call with [`PoolError::WorkerPanicked`].
    FailFast,
}

impl FromStr for PanicPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "replace-thread" | "replace" => Ok(Self::ReplaceThread),
            "contain" => Ok(Self::Contain),
            "fail-fast" => Ok(Self::FailFast),
            _ => Err(format!(
                "Unknown panic policy: '{}'. Valid options: replace-thread, contain, fail-fast",
                s
            )),
        }
    }
}

impl std::fmt::Display for PanicPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReplaceThread => write!(f, "replace-thread"),
            Self::Contain => write!(f, "contain"),
            Self::FailFast => write!(f, "fail-fast"),
        }
    }
}

/// Configuration for [`MultiProcWorkPool`](super::MultiProcWorkPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker processes. 0 runs everything inline on the caller's thread.
    pub procs: usize,
    /// Worker threads per process (must be > 0).
    pub threads_per_proc: usize,
    /// Global thread cap, spread evenly over the processes.
    pub max_threads: Option<usize>,
    /// How long the watchdog waits for a thread-exit notification before
    /// checking anyway.
    pub watchdog_interval: Duration,
    pub panic_policy: PanicPolicy,
    /// Program re-executed as a worker (default: the current executable).
    ///
    /// Its `main` must call [`run_if_worker`](crate::run_if_worker) before
    /// anything else. Otherwise each worker re-runs the host's `main`; a
    /// pool started from there fails with [`PoolError::Precondition`]
    /// instead of spawning workers of its own.
    pub worker_program: Option<PathBuf>,
    /// Respawns allowed per process slot after a worker process dies.
    pub max_process_restarts: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            procs: default_procs(),
            threads_per_proc: DEFAULT_THREADS_PER_PROC,
            max_threads: None,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            panic_policy: PanicPolicy::default(),
            worker_program: None,
            max_process_restarts: DEFAULT_MAX_PROCESS_RESTARTS,
        }
    }
}

/// Detected core count.
pub fn default_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run inline on the caller's thread.
    pub fn inline() -> Self {
        Self::default().with_procs(0)
    }

    pub fn with_procs(mut self, procs: usize) -> Self {
        self.procs = procs;
        self
    }

    pub fn with_threads_per_proc(mut self, threads: usize) -> Self {
        self.threads_per_proc = threads;
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_max_process_restarts(mut self, restarts: usize) -> Self {
        self.max_process_restarts = restarts;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(procs) = env_parse("MPWORK_PROCS") {
            self.procs = procs;
        }
        if let Some(threads) = env_parse("MPWORK_THREADS_PER_PROC") {
            self.threads_per_proc = threads;
        }
        if let Some(max) = env_parse("MPWORK_MAX_THREADS") {
            self.max_threads = Some(max);
        }
        if let Some(ms) = env_parse::<u64>("MPWORK_WATCHDOG_INTERVAL_MS") {
            self.watchdog_interval = Duration::from_millis(ms);
        }
        if let Ok(program) = std::env::var("MPWORK_WORKER_PROGRAM") {
            self.worker_program = Some(PathBuf::from(program));
        }
        self
    }

    /// Threads each process starts with, after applying `max_threads`.
    pub fn effective_threads_per_proc(&self) -> usize {
        match self.max_threads {
            Some(max) => (max / self.procs.max(1)).max(1),
            None => self.threads_per_proc,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads_per_proc == 0 {
            return Err(PoolError::Precondition(
                "threads_per_proc must be greater than zero".into(),
            ));
        }
        if self.watchdog_interval.is_zero() {
            return Err(PoolError::Precondition(
                "watchdog_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Per-call options for [`MultiProcWorkPool::execute`](super::MultiProcWorkPool::execute).
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Collect and return the processed items.
    pub return_objects: bool,
    /// Pass a [`WorkLogger`](crate::logging::WorkLogger) to the callback.
    pub provide_logger: bool,
    /// Extra arguments for a [`LoggerInit::WithArgs`](crate::logging::LoggerInit::WithArgs) initializer.
    pub logger_init_args: LogArgs,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            return_objects: true,
            provide_logger: false,
            logger_init_args: LogArgs::new(),
        }
    }
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn return_objects(mut self, enabled: bool) -> Self {
        self.return_objects = enabled;
        self
    }

    pub fn provide_logger(mut self, enabled: bool) -> Self {
        self.provide_logger = enabled;
        self
    }

    pub fn logger_init_arg(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.logger_init_args.insert(key.into(), value.into());
        self
    }
}
