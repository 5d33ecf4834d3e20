//! Shared work queues.
//!
//! [`WorkQueue`] is the input side: a FIFO of ticketed items plus an
//! unfinished-work counter. Every [`WorkQueue::put`] raises the counter, every
//! [`WorkQueue::task_done`] lowers it, and [`WorkQueue::wait_drained`] blocks
//! until it reaches zero. [`OutputQueue`] collects finished items.
//!
//! Individual operations are atomic. Callers that need check-then-act
//! sequences wrap them in their own lock.

use crate::error::{PoolError, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Identifies one submitted item for the lifetime of a batch.
pub type Ticket = u64;

/// FIFO input queue with drain tracking.
pub struct WorkQueue<T> {
    tx: Sender<(Ticket, T)>,
    rx: Receiver<(Ticket, T)>,
    next_ticket: AtomicU64,
    unfinished: Mutex<usize>,
    drained: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            next_ticket: AtomicU64::new(0),
            unfinished: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn counter(&self) -> MutexGuard<'_, usize> {
        // The counter is a plain integer; a poisoned guard still holds a valid value.
        self.unfinished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue an item and count it as unfinished.
    pub fn put(&self, item: T) -> Ticket {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        *self.counter() += 1;
        // Both channel ends live in `self`, so the send cannot fail.
        let _ = self.tx.send((ticket, item));
        ticket
    }

    /// Non-blocking dequeue. `None` means the queue is empty right now.
    pub fn try_take(&self) -> Option<(Ticket, T)> {
        self.rx.try_recv().ok()
    }

    /// Number of items waiting to be taken.
    pub fn remaining(&self) -> usize {
        self.rx.len()
    }

    /// Number of items not yet marked done (queued plus in flight).
    pub fn unfinished(&self) -> usize {
        *self.counter()
    }

    /// Mark one taken item as done.
    pub fn task_done(&self) -> Result<()> {
        let mut unfinished = self.counter();
        if *unfinished == 0 {
            return Err(PoolError::Queue(
                "task_done() called more times than items were queued".into(),
            ));
        }
        *unfinished -= 1;
        if *unfinished == 0 {
            self.drained.notify_all();
        }
        Ok(())
    }

    /// Block until every queued item has been marked done, or until `timeout`.
    ///
    /// Returns `true` once drained.
    pub fn wait_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut unfinished = self.counter();
        while *unfinished > 0 {
            match deadline {
                None => {
                    unfinished = self
                        .drained
                        .wait(unfinished)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    unfinished = self
                        .drained
                        .wait_timeout(unfinished, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
        }
        true
    }

    /// Block until drained.
    pub fn join(&self) {
        self.wait_drained(None);
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects finished items in completion order.
pub struct OutputQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> OutputQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: T) {
        let _ = self.tx.send(item);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Take everything currently queued without blocking.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }
}

impl<T> Default for OutputQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
