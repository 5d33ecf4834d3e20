//! mpwork - two-level parallel work pool.
//!
//! A batch of homogeneous work items is drained by a set of worker
//! processes, each running a set of worker threads. A per-process watchdog
//! replaces threads whose callback panicked, so a few bad items cannot stall
//! the rest of the batch.
//!
//! Worker processes re-execute the host binary. Its `main` must call
//! [`run_if_worker`] with a [`JobRegistry`] holding every job the pool may
//! run, before anything else:
//!
//! ```no_run
//! use mpwork::samples;
//!
//! fn main() {
//!     mpwork::run_if_worker(&samples::registry());
//!     // ... normal program ...
//! }
//! ```

pub mod error;
pub mod job;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod samples;

pub use error::{CallbackError, PoolError, Result};
pub use job::{Callback, Job, JobRegistry, WorkItem};
pub use logging::{LogArgs, LogConfig, LoggerInit, WorkLogger};
pub use pool::{
    ExecuteOptions, MultiProcWorkPool, PanicPolicy, PoolConfig, ProcessReport, RunStats,
    run_if_worker, thread_debug_info,
};
