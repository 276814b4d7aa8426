//! Bounded work queue shared by a node's producers and workers.
//!
//! Items travel through a bounded crossbeam channel, so producers block while
//! the queue is full (backpressure, never loss). Termination drops the sender
//! of a separate shutdown channel; blocked producers and waiting workers both
//! select on it. Workers drain what is left with `try_recv` before exiting.

use crate::defaults;
use crate::error::{DuplexError, Result};
use crate::pipeline::stats::NamedStats;
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Bounded multi-producer multi-consumer queue with explicit termination.
pub struct AsyncQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    /// Never sent on; dropped by [`AsyncQueue::terminate`].
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    capacity: usize,
    poll_interval: Duration,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl<T> AsyncQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            sender,
            receiver,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            capacity,
            poll_interval: defaults::POLL_INTERVAL,
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    /// Overrides the bounded wait used by [`AsyncQueue::pop`].
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Appends an item, blocking while the queue is full.
    ///
    /// Fails with [`DuplexError::QueueClosed`] once the queue is terminated,
    /// including while blocked on a full queue.
    pub fn push(&self, item: T) -> Result<()> {
        if self.is_terminated() {
            return Err(DuplexError::QueueClosed);
        }
        select! {
            send(self.sender, item) -> sent => sent.map_err(|_| DuplexError::QueueClosed)?,
            recv(self.shutdown_rx) -> _ => return Err(DuplexError::QueueClosed),
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.receiver.try_recv().ok()?;
        self.popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Removes the oldest item, waiting until one arrives.
    ///
    /// Returns `None` only when the queue is both empty and terminated.
    pub fn pop(&self) -> Option<T> {
        loop {
            select! {
                recv(self.receiver) -> item => {
                    // The queue holds its own sender, so the channel never disconnects.
                    let item = item.ok()?;
                    self.popped.fetch_add(1, Ordering::Relaxed);
                    return Some(item);
                }
                recv(self.shutdown_rx) -> _ => return self.try_pop(),
                default(self.poll_interval) => {}
            }
        }
    }

    /// Closes the queue for input and wakes every waiter. Idempotent.
    pub fn terminate(&self) {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.shutdown_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert("queue_capacity".to_string(), self.capacity as f64);
        stats.insert("queue_size".to_string(), self.len() as f64);
        stats.insert(
            "messages_in".to_string(),
            self.pushed.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "messages_out".to_string(),
            self.popped.load(Ordering::Relaxed) as f64,
        );
        stats
    }
}
