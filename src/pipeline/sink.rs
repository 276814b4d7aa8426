//! Terminal sinks: where messages leave the node graph.

use crate::error::{DuplexError, Result};
use crate::pipeline::station::MessageSink;
use crate::pipeline::stats::NamedStats;
use crate::pipeline::types::Message;
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Forwards every message into a crossbeam channel.
///
/// Terminating drops the sender, so a receiver iterating the channel ends
/// once everything already sent has been read.
pub struct ChannelSink {
    name: String,
    sender: Mutex<Option<Sender<Message>>>,
    forwarded: AtomicU64,
}

impl ChannelSink {
    pub fn new(name: impl Into<String>, sender: Sender<Message>) -> Self {
        Self {
            name: name.into(),
            sender: Mutex::new(Some(sender)),
            forwarded: AtomicU64::new(0),
        }
    }
}

impl MessageSink for ChannelSink {
    fn push_message(&self, message: Message) -> Result<()> {
        // Clone the sender so a blocking send doesn't hold the lock.
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DuplexError::QueueClosed)?;
        sender.send(message).map_err(|_| DuplexError::QueueClosed)?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn terminate(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "messages_out".to_string(),
            self.forwarded.load(Ordering::Relaxed) as f64,
        );
        stats
    }
}

/// Collects messages in memory and counts terminations.
///
/// Handy at the end of a chain in tests and small tools.
pub struct CollectorSink {
    name: String,
    messages: Mutex<Vec<Message>>,
    terminations: AtomicUsize,
    len_at_termination: Mutex<Option<usize>>,
}

impl CollectorSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(Vec::new()),
            terminations: AtomicUsize::new(0),
            len_at_termination: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything collected so far.
    pub fn take_messages(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn terminate_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    /// True when no message arrived after the first terminate.
    pub fn terminated_after_all_messages(&self) -> bool {
        let at_termination = *self
            .len_at_termination
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        at_termination == Some(self.len())
    }
}

impl MessageSink for CollectorSink {
    fn push_message(&self, message: Message) -> Result<()> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }

    fn terminate(&self) {
        if self.terminations.fetch_add(1, Ordering::SeqCst) == 0 {
            let len = self.len();
            *self
                .len_at_termination
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(len);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert("messages_in".to_string(), self.len() as f64);
        stats
    }
}
