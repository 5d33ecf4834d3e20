//! IPC protocol between the pool and its worker processes.
//!
//! Messages are JSON-serialized and newline-delimited. The worker process
//! drives the exchange: after the start handshake it asks for queue sizes and
//! items, and reports each finished item back. The parent only ever answers.

use super::config::PanicPolicy;
use super::entry::ProcessReport;
use crate::logging::LogArgs;
use crate::queue::Ticket;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from a worker process to the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Process is up and waiting for its start instructions.
    Ready { pid: u32 },

    /// The start instructions cannot be honored (unknown job, type mismatch).
    Rejected { message: String },

    /// How many items are still waiting in the shared queue?
    Size,

    /// Hand out the next item.
    Take,

    /// An item has been processed.
    Done { ticket: Ticket, outcome: ItemOutcome },

    /// All threads have exited; the process is about to exit.
    Finished { report: ProcessReport },
}

/// Message from the parent to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Start instructions for this process.
    Start(StartSpec),

    /// Answer to [`WorkerMessage::Size`].
    Size { remaining: usize },

    /// Answer to [`WorkerMessage::Take`].
    Item { ticket: Ticket, item: Value },

    /// Answer to [`WorkerMessage::Take`] when the queue is empty.
    Empty,

    /// Stop taking work and exit.
    Exit,
}

/// Everything a worker process needs to run its share of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSpec {
    /// Registered job name.
    pub job: String,
    /// `std::any::type_name` of the batch's item type.
    pub item_type: String,
    pub threads_per_proc: usize,
    pub return_objects: bool,
    pub provide_logger: bool,
    pub watchdog_interval_ms: u64,
    pub panic_policy: PanicPolicy,
    #[serde(default)]
    pub logger_init_args: LogArgs,
}

/// What happened to one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// The callback returned normally. `item` is the mutated item when the
    /// caller asked for results.
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item: Option<Value>,
    },
    /// The callback returned a domain error.
    Failed { message: String },
    /// The callback panicked.
    Crashed { message: String },
}

fn to_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    Ok(json)
}

impl WorkerMessage {
    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        to_line(self)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl ParentMessage {
    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        to_line(self)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
