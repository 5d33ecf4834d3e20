//! Worker process and thread spawning.
//!
//! Worker processes re-execute a program (by default the current executable)
//! with [`WORKER_ENV`] set. The program's `main` must call
//! [`run_if_worker`](crate::run_if_worker) before doing anything else.

use super::proc::Proc;
use crate::error::{PoolError, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;

/// Set in the environment of every worker process.
pub const WORKER_ENV: &str = "MPWORK_INTERNAL_WORKER";

/// The program to run as a worker: the configured one, else the current executable.
pub fn resolve_worker_program(configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::current_exe().map_err(|e| {
            PoolError::Worker(format!("Failed to get current executable: {}", e))
        }),
    }
}

/// Spawn one worker process.
///
/// stdin/stdout carry the IPC; stderr is inherited so worker logs reach the
/// caller's terminal.
pub fn spawn_worker(program: &Path) -> Result<Proc> {
    let mut cmd = Command::new(program);
    cmd.env(WORKER_ENV, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let child = cmd.spawn().map_err(|e| {
        PoolError::Worker(format!(
            "Failed to spawn worker '{}': {}",
            program.display(),
            e
        ))
    })?;

    tracing::trace!(pid = child.id(), program = %program.display(), "Spawned worker process");
    Proc::from_child(child)
}

/// Spawn a named thread, surfacing spawn failures as errors.
pub fn spawn_named<F, T>(name: String, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(std::thread::Builder::new().name(name).spawn(f)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_worker_program() {
        let explicit = resolve_worker_program(Some(Path::new("/bin/true"))).unwrap();
        assert_eq!(explicit, PathBuf::from("/bin/true"));

        let current = resolve_worker_program(None).unwrap();
        assert_eq!(current, std::env::current_exe().unwrap());
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = spawn_worker(Path::new("/nonexistent/mpwork-worker")).err().unwrap();
        assert!(matches!(err, PoolError::Worker(_)));
        assert!(err.to_string().contains("/nonexistent/mpwork-worker"));
    }

    #[test]
    fn test_spawn_named_thread() {
        let handle = spawn_named("test-thread".into(), || {
            std::thread::current().name().map(String::from)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("test-thread"));
    }
}
