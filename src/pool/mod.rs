//! Two-level work pool: worker processes, each running worker threads.
//!
//! # Architecture
//!
//! ```text
//!                      ┌───────────────────────────┐
//!                      │      Caller process       │
//!                      │  MultiProcWorkPool        │
//!                      │  input queue + drain count│
//!                      │  output queue             │
//!                      └─────────────┬─────────────┘
//!                                    │ one broker thread per slot
//!               ┌────────────────────┼────────────────────┐
//!               │ JSON lines         │                    │
//!         ┌─────▼─────┐        ┌─────▼─────┐        ┌─────▼─────┐
//!         │ Worker 1  │        │ Worker 2  │        │ Worker N  │
//!         │ M threads │        │ M threads │        │ M threads │
//!         │ watchdog  │        │ watchdog  │        │ watchdog  │
//!         └───────────┘        └───────────┘        └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process parallelism**: worker processes re-execute the host binary
//! - **Thread self-healing**: each process's watchdog replaces threads whose
//!   callback panicked, woken by thread-exit notifications
//! - **Crash recovery**: dead worker processes are respawned, their in-flight
//!   items written off
//! - **Inline mode**: `procs == 0` runs everything on the caller's thread

mod broker;
mod config;
mod entry;
mod ipc;
mod manager;
mod proc;
mod protocol;
mod signals;
mod source;
mod spawn;
mod thread;
mod watchdog;
pub mod worker_main;

pub use config::{
    DEFAULT_MAX_PROCESS_RESTARTS, DEFAULT_THREADS_PER_PROC, DEFAULT_WATCHDOG_INTERVAL,
    ExecuteOptions, PanicPolicy, PoolConfig, default_procs,
};
pub use entry::ProcessReport;
pub use manager::{MultiProcWorkPool, RunStats};
pub use signals::TerminationReason;
pub use spawn::WORKER_ENV;
pub use thread::thread_debug_info;
pub use worker_main::{is_worker, run_if_worker, run_worker_main};
