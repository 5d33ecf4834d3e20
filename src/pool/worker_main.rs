//! Worker process main.
//!
//! Runs when the host binary is started with the worker environment marker.
//! The process announces itself, receives its start instructions, looks the
//! job up in the registry and drains the parent's queue with its own threads
//! and watchdog.

use super::entry::{self, EntrySettings};
use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{ParentMessage, WorkerMessage};
use super::signals::install_worker_dispositions;
use super::source::RemoteSource;
use super::spawn::WORKER_ENV;
use crate::error::{PoolError, Result};
use crate::job::JobRegistry;
use crate::logging::{self, LogConfig};
use std::io;
use std::os::unix::io::AsFd;
use std::sync::Arc;
use std::time::Duration;

/// Exit code after refusing the start instructions.
pub const EXIT_REJECTED: i32 = 2;

/// Is this process a pool worker?
pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some_and(|v| v == "1")
}

/// Become a worker process if this process was started as one.
///
/// Call this first thing in `main`, with every job the pool may run
/// registered. Returns normally only in a non-worker process, after
/// installing the registry there so the pool can check the jobs it is
/// handed against it.
pub fn run_if_worker(registry: &JobRegistry) {
    if is_worker() {
        run_worker_main(registry);
    }
    registry.clone().install();
}

/// Run the worker process to completion and exit.
pub fn run_worker_main(registry: &JobRegistry) -> ! {
    install_worker_dispositions();

    let (reader, writer) = match take_stdio() {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("Worker error: cannot set up IPC: {}", e);
            std::process::exit(1);
        }
    };

    match serve(registry, reader, writer) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "Worker process failed");
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Move the IPC pipe off fd 1 and point stdout at stderr, so anything a
/// callback prints cannot corrupt the protocol.
fn take_stdio() -> io::Result<(LineReader, LineWriter)> {
    let ipc_in = io::stdin().as_fd().try_clone_to_owned()?;
    let ipc_out = io::stdout().as_fd().try_clone_to_owned()?;
    nix::unistd::dup2_stdout(io::stderr()).map_err(io::Error::from)?;
    Ok((
        LineReader::new(PipeFd::new(ipc_in)),
        LineWriter::new(PipeFd::new(ipc_out)),
    ))
}

fn reject(writer: &mut LineWriter, message: String) -> Result<i32> {
    writer.send_worker(&WorkerMessage::Rejected { message })?;
    Ok(EXIT_REJECTED)
}

fn serve(registry: &JobRegistry, mut reader: LineReader, mut writer: LineWriter) -> Result<i32> {
    writer.send_worker(&WorkerMessage::Ready {
        pid: std::process::id(),
    })?;

    let spec = match reader.recv_parent()? {
        Some(ParentMessage::Start(spec)) => spec,
        Some(ParentMessage::Exit) | None => return Ok(0),
        Some(other) => {
            return Err(PoolError::Worker(format!(
                "Expected start instructions, got {:?}",
                other
            )));
        }
    };

    let Some(job) = registry.get(&spec.job) else {
        return reject(
            &mut writer,
            format!(
                "Unknown job '{}'. Registered jobs: {}",
                spec.job,
                registry.names().join(", ")
            ),
        );
    };
    if job.item_type() != spec.item_type {
        return reject(
            &mut writer,
            format!(
                "Job '{}' runs on {} but the batch holds {}",
                spec.job,
                job.item_type(),
                spec.item_type
            ),
        );
    }
    if job.takes_logger() != spec.provide_logger {
        return reject(
            &mut writer,
            format!(
                "Job '{}' {} a logger but provide_logger is {}",
                spec.job,
                if job.takes_logger() { "takes" } else { "does not take" },
                spec.provide_logger
            ),
        );
    }

    let logger = if spec.provide_logger {
        Some(logging::init_work_logging(
            job.logger_init(),
            &spec.logger_init_args,
        ))
    } else {
        logging::init_once(LogConfig::for_worker().with_env_overrides());
        None
    };

    tracing::debug!(job = %spec.job, threads = spec.threads_per_proc, "Worker process starting");
    let source = Arc::new(RemoteSource::new(reader, writer, spec.return_objects));
    let settings = EntrySettings {
        threads_per_proc: spec.threads_per_proc,
        policy: spec.panic_policy,
        watchdog_interval: Duration::from_millis(spec.watchdog_interval_ms),
        logger,
    };
    let report = entry::run_process(Arc::clone(&source), job, settings)?;
    source.report(report)?;
    Ok(0)
}
