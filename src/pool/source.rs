//! Queue access from inside a process.
//!
//! Worker threads never touch the shared queues directly. They go through a
//! [`WorkSource`]: [`LocalSource`] wraps queues in the same process (inline
//! mode), [`RemoteSource`] reaches the parent's queues over the worker pipe.

use super::entry::ProcessReport;
use super::ipc::{LineReader, LineWriter};
use super::protocol::{ItemOutcome, ParentMessage, WorkerMessage};
use crate::error::{PoolError, Result};
use crate::queue::{OutputQueue, Ticket, WorkQueue};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

/// An item handed to a worker thread. The thread owns it until it calls
/// [`WorkSource::finish`].
#[derive(Debug)]
pub struct Lease<I> {
    pub ticket: Ticket,
    pub item: I,
}

/// Result of running the callback on a leased item.
#[derive(Debug)]
pub enum Outcome<I> {
    Completed(I),
    Failed(String),
    Crashed(String),
}

/// Where worker threads get items from and report them back to.
pub trait WorkSource: Send + Sync + 'static {
    type Item: Send;

    /// Non-blocking take. `None` when the queue is empty.
    fn take(&self) -> Result<Option<Lease<Self::Item>>>;

    /// Report a leased item. Always marks it done in the drain counter.
    fn finish(&self, ticket: Ticket, outcome: Outcome<Self::Item>) -> Result<()>;

    /// Items still waiting to be taken.
    fn remaining(&self) -> Result<usize>;
}

impl<W: WorkSource> WorkSource for Arc<W> {
    type Item = W::Item;

    fn take(&self) -> Result<Option<Lease<Self::Item>>> {
        (**self).take()
    }

    fn finish(&self, ticket: Ticket, outcome: Outcome<Self::Item>) -> Result<()> {
        (**self).finish(ticket, outcome)
    }

    fn remaining(&self) -> Result<usize> {
        (**self).remaining()
    }
}

/// Queues living in this process.
pub struct LocalSource<T> {
    queue: Arc<WorkQueue<T>>,
    output: Option<Arc<OutputQueue<T>>>,
}

impl<T> LocalSource<T> {
    pub fn new(queue: Arc<WorkQueue<T>>, output: Option<Arc<OutputQueue<T>>>) -> Self {
        Self { queue, output }
    }
}

impl<T: Send + 'static> WorkSource for LocalSource<T> {
    type Item = T;

    fn take(&self) -> Result<Option<Lease<T>>> {
        Ok(self
            .queue
            .try_take()
            .map(|(ticket, item)| Lease { ticket, item }))
    }

    fn finish(&self, _ticket: Ticket, outcome: Outcome<T>) -> Result<()> {
        // Output first: once the drain counter hits zero the caller collects.
        if let (Outcome::Completed(item), Some(output)) = (outcome, &self.output) {
            output.push(item);
        }
        self.queue.task_done()
    }

    fn remaining(&self) -> Result<usize> {
        Ok(self.queue.remaining())
    }
}

struct Channel {
    reader: LineReader,
    writer: LineWriter,
}

/// The parent's queues, reached over the worker pipe.
///
/// Each request and its answer are exchanged under one lock, so threads of
/// the same process never interleave on the pipe.
pub struct RemoteSource {
    channel: Mutex<Channel>,
    return_objects: bool,
}

impl RemoteSource {
    pub fn new(reader: LineReader, writer: LineWriter, return_objects: bool) -> Self {
        Self {
            channel: Mutex::new(Channel { reader, writer }),
            return_objects,
        }
    }

    fn channel(&self) -> MutexGuard<'_, Channel> {
        self.channel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn request(&self, message: &WorkerMessage) -> Result<ParentMessage> {
        let mut channel = self.channel();
        channel.writer.send_worker(message)?;
        channel
            .reader
            .recv_parent()?
            .ok_or_else(|| PoolError::Worker("Parent closed the connection".into()))
    }

    /// Tell the parent this process is done.
    pub fn report(&self, report: ProcessReport) -> Result<()> {
        self.channel()
            .writer
            .send_worker(&WorkerMessage::Finished { report })
    }
}

impl WorkSource for RemoteSource {
    type Item = Value;

    fn take(&self) -> Result<Option<Lease<Value>>> {
        match self.request(&WorkerMessage::Take)? {
            ParentMessage::Item { ticket, item } => Ok(Some(Lease { ticket, item })),
            ParentMessage::Empty | ParentMessage::Exit => Ok(None),
            other => Err(PoolError::Worker(format!(
                "Unexpected answer to take: {:?}",
                other
            ))),
        }
    }

    fn finish(&self, ticket: Ticket, outcome: Outcome<Value>) -> Result<()> {
        let outcome = match outcome {
            Outcome::Completed(item) => ItemOutcome::Completed {
                item: self.return_objects.then_some(item),
            },
            Outcome::Failed(message) => ItemOutcome::Failed { message },
            Outcome::Crashed(message) => ItemOutcome::Crashed { message },
        };
        self.channel()
            .writer
            .send_worker(&WorkerMessage::Done { ticket, outcome })
    }

    fn remaining(&self) -> Result<usize> {
        match self.request(&WorkerMessage::Size)? {
            ParentMessage::Size { remaining } => Ok(remaining),
            ParentMessage::Exit => Ok(0),
            other => Err(PoolError::Worker(format!(
                "Unexpected answer to size: {:?}",
                other
            ))),
        }
    }
}
