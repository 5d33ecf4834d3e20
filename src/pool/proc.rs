//! Handle to a worker process with its IPC channels.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{ParentMessage, WorkerMessage};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::OwnedFd;
use std::time::{Duration, Instant};

/// A spawned worker process.
pub struct Proc {
    pid: Pid,
    writer: LineWriter,
    reader: LineReader,
    reaped: bool,
}

impl Proc {
    /// Take over a spawned child's stdin and stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdout not captured".into()))?;

        Ok(Self {
            pid,
            writer: LineWriter::new(PipeFd::new(OwnedFd::from(stdin))),
            reader: LineReader::new(PipeFd::new(OwnedFd::from(stdout))),
            reaped: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn send(&mut self, message: &ParentMessage) -> Result<()> {
        self.writer.send_parent(message).map_err(|e| {
            PoolError::Worker(format!("Failed to send to worker {}: {}", self.pid, e))
        })
    }

    /// Next message from the worker. `None` if it closed its end.
    pub fn recv(&mut self) -> Result<Option<WorkerMessage>> {
        self.reader.recv_worker()
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Err(PoolError::Worker("Process already reaped".into()));
        }
        let status = waitpid(self.pid, None)
            .map_err(|e| PoolError::Worker(format!("waitpid failed: {}", e)))?;
        self.reaped = true;
        Ok(analyze_wait_status(status))
    }

    /// Non-blocking wait. `None` while the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if self.reaped {
            return Err(PoolError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(analyze_wait_status(status)))
            }
            Err(e) => Err(PoolError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// SIGKILL and reap.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }
        // ESRCH: already gone but not yet reaped
        let _ = signal::kill(self.pid, Signal::SIGKILL);
        self.wait()
    }

    /// Ask the worker to exit, then kill it if it has not gone by `timeout`.
    pub fn stop(&mut self, timeout: Duration) -> Result<TerminationReason> {
        if self.reaped {
            return Ok(TerminationReason::Unknown);
        }
        let _ = self.send(&ParentMessage::Exit);

        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(reason) = self.try_wait()? {
                return Ok(reason);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        tracing::debug!(pid = %self.pid, "Worker did not exit in time, killing");
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}
