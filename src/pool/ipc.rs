//! Line-based IPC over pipes.
//!
//! Reads and writes retry on EINTR. Each message is one line of JSON.

use super::protocol::{ParentMessage, WorkerMessage};
use crate::error::{PoolError, Result};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

/// Buffer size for IPC (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// An owned pipe end with EINTR-safe Read/Write.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl From<OwnedFd> for PipeFd {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered line reader.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, fd),
            line: String::with_capacity(4096),
        }
    }

    /// Read one line without its terminator. `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let trimmed = self.line.trim_end_matches(['\n', '\r']).len();
        self.line.truncate(trimmed);
        Ok(Some(&self.line))
    }

    /// Read the next message from the parent. `None` on EOF.
    pub fn recv_parent(&mut self) -> Result<Option<ParentMessage>> {
        match self.read_line()? {
            Some(line) => Ok(Some(ParentMessage::from_line(line).map_err(|e| {
                PoolError::Worker(format!("Invalid message from parent: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    /// Read the next message from a worker process. `None` on EOF.
    pub fn recv_worker(&mut self) -> Result<Option<WorkerMessage>> {
        match self.read_line()? {
            Some(line) => Ok(Some(WorkerMessage::from_line(line).map_err(|e| {
                PoolError::Worker(format!("Invalid message from worker: {}", e))
            })?)),
            None => Ok(None),
        }
    }
}

/// Buffered line writer. Every line is flushed immediately.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(BUFFER_SIZE, fd),
        }
    }

    /// Write a line (newline appended if missing) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    pub fn send_parent(&mut self, message: &ParentMessage) -> Result<()> {
        self.write_line(&message.to_line()?)?;
        Ok(())
    }

    pub fn send_worker(&mut self, message: &WorkerMessage) -> Result<()> {
        self.write_line(&message.to_line()?)?;
        Ok(())
    }
}

/// Create a connected reader/writer pair.
#[cfg(test)]
pub(crate) fn pipe() -> Result<(LineReader, LineWriter)> {
    let (read_fd, write_fd) = nix::unistd::pipe()
        .map_err(|e| PoolError::Io(io::Error::from_raw_os_error(e as i32)))?;
    Ok((
        LineReader::new(PipeFd::new(read_fd)),
        LineWriter::new(PipeFd::new(write_fd)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_roundtrip_and_eof() {
        let (mut reader, mut writer) = pipe().unwrap();

        writer.write_line("hello").unwrap();
        writer.write_line("world\n").unwrap();
        writer.write_line("").unwrap();
        writer.write_line("dos\r\n").unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap(), Some("hello"));
        assert_eq!(reader.read_line().unwrap(), Some("world"));
        assert_eq!(reader.read_line().unwrap(), Some(""));
        assert_eq!(reader.read_line().unwrap(), Some("dos"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_typed_messages() {
        let (mut reader, mut writer) = pipe().unwrap();
        writer.send_worker(&WorkerMessage::Take).unwrap();
        writer
            .send_worker(&WorkerMessage::Ready { pid: 42 })
            .unwrap();
        drop(writer);

        assert_eq!(reader.recv_worker().unwrap(), Some(WorkerMessage::Take));
        assert_eq!(
            reader.recv_worker().unwrap(),
            Some(WorkerMessage::Ready { pid: 42 })
        );
        assert!(reader.recv_worker().unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_a_worker_error() {
        let (mut reader, mut writer) = pipe().unwrap();
        writer.write_line("{{{").unwrap();
        let err = reader.recv_parent().unwrap_err();
        assert!(matches!(err, PoolError::Worker(_)));
    }
}
