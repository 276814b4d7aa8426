//! Core station abstraction and the worker-pool node that runs it.
//!
//! A [`Node`] owns a bounded [`AsyncQueue`] of [`Message`]s and a pool of
//! worker threads. Every worker pops messages, hands them to the node's
//! [`Station`], and pushes the outputs to the downstream [`MessageSink`].
//! When the input is terminated and drained, the last worker to exit
//! terminates the downstream sink, exactly once.

use crate::defaults;
use crate::error::{DuplexError, Result};
use crate::pipeline::error::{ErrorReporter, LogReporter, StationError};
use crate::pipeline::queue::AsyncQueue;
use crate::pipeline::stats::{self, NamedStats};
use crate::pipeline::types::Message;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

/// Anything messages can be pushed into.
pub trait MessageSink: Send + Sync {
    /// Queues a message, blocking while the sink is full.
    fn push_message(&self, message: Message) -> Result<()>;

    /// Signals that no more messages will arrive. Must be idempotent.
    fn terminate(&self);

    /// Name for logging and statistics.
    fn name(&self) -> &str;

    /// Snapshot of this sink's counters.
    fn sample_stats(&self) -> NamedStats {
        NamedStats::new()
    }
}

/// A processing stage run by a [`Node`].
///
/// Stations are shared by all workers of their node, so they take `&self`
/// and keep mutable state behind their own locks or atomics.
pub trait Station: Send + Sync + 'static {
    /// Processes one message, returning zero or more messages for downstream.
    ///
    /// Variants the station does not handle should be returned unchanged.
    fn process(&self, message: Message) -> std::result::Result<Vec<Message>, StationError>;

    /// Returns the name of this station for logging and error reporting.
    fn name(&self) -> &'static str;

    /// Station-specific counters, merged into the node's statistics.
    fn stats(&self) -> NamedStats {
        NamedStats::new()
    }

    /// Called once, by the last worker, before downstream is terminated.
    fn shutdown(&self) {}
}

/// Settings for spawning a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOptions {
    pub num_workers: usize,
    pub queue_capacity: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            num_workers: 1,
            queue_capacity: defaults::QUEUE_CAPACITY,
        }
    }
}

impl NodeOptions {
    pub fn new(num_workers: usize, queue_capacity: usize) -> Self {
        Self {
            num_workers,
            queue_capacity,
        }
    }
}

struct NodeShared<S: Station> {
    station: S,
    queue: AsyncQueue<Message>,
    downstream: Arc<dyn MessageSink>,
    active_workers: AtomicUsize,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl<S: Station> NodeShared<S> {
    /// Retires `count` workers; the call that retires the last one shuts down.
    fn retire_workers(&self, count: usize) {
        if count == 0 {
            return;
        }
        if self.active_workers.fetch_sub(count, Ordering::SeqCst) == count {
            // Nobody is left to consume, so producers must not block on us.
            self.queue.terminate();
            self.station.shutdown();
            stats::log_stats(self.station.name(), &self.station.stats());
            self.downstream.terminate();
        }
    }
}

/// Retires its worker on drop, so a panicking station still lets the
/// termination cascade complete.
struct WorkerExitGuard<'a, S: Station> {
    shared: &'a NodeShared<S>,
}

impl<S: Station> Drop for WorkerExitGuard<'_, S> {
    fn drop(&mut self) {
        self.shared.retire_workers(1);
    }
}

/// A station plus its input queue and worker threads.
pub struct Node<S: Station> {
    shared: Arc<NodeShared<S>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Station> Node<S> {
    /// Spawns `options.num_workers` workers (at least one) feeding `downstream`.
    pub fn spawn(
        station: S,
        downstream: Arc<dyn MessageSink>,
        options: NodeOptions,
    ) -> Result<Arc<Self>> {
        Self::spawn_with_reporter(station, downstream, options, Arc::new(LogReporter))
    }

    /// Like [`Node::spawn`] with a custom error reporter.
    pub fn spawn_with_reporter(
        station: S,
        downstream: Arc<dyn MessageSink>,
        options: NodeOptions,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Arc<Self>> {
        let num_workers = options.num_workers.max(1);
        let station_name = station.name();
        let shared = Arc::new(NodeShared {
            station,
            queue: AsyncQueue::new(options.queue_capacity),
            downstream,
            active_workers: AtomicUsize::new(num_workers),
            error_reporter,
        });

        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{station_name}-{index}"))
                .spawn(move || Self::run_worker(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.queue.terminate();
                    shared.retire_workers(num_workers - index);
                    for handle in workers {
                        if handle.join().is_err() {
                            log::error!("{station_name}: worker panicked during failed spawn");
                        }
                    }
                    return Err(DuplexError::Io(e));
                }
            }
        }

        log::debug!("{station_name}: started {num_workers} worker(s)");
        Ok(Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        }))
    }

    /// Main processing loop for one worker.
    fn run_worker(shared: &NodeShared<S>) {
        let _exit = WorkerExitGuard { shared };
        let station_name = shared.station.name();

        while let Some(message) = shared.queue.pop() {
            match shared.station.process(message) {
                Ok(outputs) => {
                    for output in outputs {
                        if let Err(e) = shared.downstream.push_message(output) {
                            shared.error_reporter.report(
                                station_name,
                                &StationError::Fatal(format!(
                                    "push to {} failed: {e}",
                                    shared.downstream.name()
                                )),
                            );
                        }
                    }
                }
                Err(error @ StationError::Recoverable(_)) => {
                    shared.error_reporter.report(station_name, &error);
                }
                Err(error @ StationError::Fatal(_)) => {
                    shared.error_reporter.report(station_name, &error);
                    break;
                }
            }
        }
    }

    /// Waits for every worker to exit.
    ///
    /// Returns an error naming the station if any worker panicked.
    pub fn join(&self) -> std::result::Result<(), String> {
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            Err(format!(
                "Station '{}': {panicked} worker thread(s) panicked",
                self.shared.station.name()
            ))
        } else {
            Ok(())
        }
    }

    /// Terminates the input queue and waits for the workers to drain it.
    pub fn finish(&self) -> std::result::Result<(), String> {
        self.shared.queue.terminate();
        self.join()
    }

    /// Borrow the station, e.g. to read its counters.
    pub fn station(&self) -> &S {
        &self.shared.station
    }

    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::SeqCst)
    }
}

impl<S: Station> MessageSink for Node<S> {
    fn push_message(&self, message: Message) -> Result<()> {
        self.shared.queue.push(message)
    }

    fn terminate(&self) {
        self.shared.queue.terminate();
    }

    fn name(&self) -> &str {
        self.shared.station.name()
    }

    fn sample_stats(&self) -> NamedStats {
        let mut stats = self.shared.queue.sample_stats();
        stats.extend(self.shared.station.stats());
        stats
    }
}

impl<S: Station> Drop for Node<S> {
    fn drop(&mut self) {
        if let Err(msg) = self.finish() {
            log::error!("{msg}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sink::CollectorSink;
    use crate::pipeline::types::{CandidatePairRejectedMessage, Read, SamRecord};
    use candle_core::{DType, Device, Tensor};
    use std::sync::atomic::AtomicBool;

    fn read(id: &str) -> Message {
        let signal = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        Read::new(id, signal).into()
    }

    fn record_id(message: &Message) -> String {
        match message {
            Message::Record(record) => record.qname.clone(),
            Message::Read(read) => read.read_id.clone(),
            other => other.kind().to_string(),
        }
    }

    // Turns reads into records named after them; passes everything else through
    struct RecordStation {
        shutdown_called: Arc<AtomicBool>,
    }

    impl Station for RecordStation {
        fn process(&self, message: Message) -> std::result::Result<Vec<Message>, StationError> {
            match message {
                Message::Read(read) => Ok(vec![Message::Record(SamRecord {
                    qname: read.read_id.clone(),
                    flag: 4,
                    seq: String::new(),
                    qual: String::new(),
                    tags: Vec::new(),
                })]),
                other => Ok(vec![other]),
            }
        }

        fn name(&self) -> &'static str {
            "Record"
        }

        fn shutdown(&self) {
            self.shutdown_called.store(true, Ordering::SeqCst);
        }
    }

    // Fails recoverably on reads whose id starts with "bad"
    struct PickyStation;

    impl Station for PickyStation {
        fn process(&self, message: Message) -> std::result::Result<Vec<Message>, StationError> {
            match message {
                Message::Read(read) if read.read_id.starts_with("bad") => Err(
                    StationError::Recoverable(format!("rejected {}", read.read_id)),
                ),
                other => Ok(vec![other]),
            }
        }

        fn name(&self) -> &'static str {
            "Picky"
        }
    }

    struct PanickingStation;

    impl Station for PanickingStation {
        fn process(&self, _message: Message) -> std::result::Result<Vec<Message>, StationError> {
            panic!("station bug");
        }

        fn name(&self) -> &'static str {
            "Panicking"
        }
    }

    // Mock error reporter that collects errors
    #[derive(Default)]
    struct MockReporter {
        errors: Mutex<Vec<(String, String)>>,
    }

    impl ErrorReporter for MockReporter {
        fn report(&self, station: &str, error: &StationError) {
            let mut errors = self.errors.lock().unwrap();
            errors.push((station.to_string(), error.to_string()));
        }
    }

    #[test]
    fn test_node_processes_and_terminates_downstream() {
        let sink = Arc::new(CollectorSink::new("collector"));
        let shutdown = Arc::new(AtomicBool::new(false));
        let node = Node::spawn(
            RecordStation {
                shutdown_called: shutdown.clone(),
            },
            sink.clone(),
            NodeOptions::new(1, 10),
        )
        .unwrap();

        node.push_message(read("r1")).unwrap();
        node.push_message(read("r2")).unwrap();
        node.finish().unwrap();

        let ids: Vec<String> = sink.take_messages().iter().map(record_id).collect();
        assert_eq!(ids, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(sink.terminate_count(), 1);
        assert!(shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn test_terminate_propagates_exactly_once_for_many_workers() {
        for num_workers in [1, 2, 4, 8] {
            let sink = Arc::new(CollectorSink::new("collector"));
            let node = Node::spawn(
                RecordStation {
                    shutdown_called: Arc::new(AtomicBool::new(false)),
                },
                sink.clone(),
                NodeOptions::new(num_workers, 4),
            )
            .unwrap();

            for i in 0..200 {
                node.push_message(read(&format!("r{i}"))).unwrap();
            }
            node.terminate();
            node.join().unwrap();

            assert_eq!(sink.terminate_count(), 1, "workers: {num_workers}");
            assert_eq!(sink.len(), 200, "workers: {num_workers}");
            assert!(sink.terminated_after_all_messages());
        }
    }

    #[test]
    fn test_unknown_variants_pass_through() {
        let sink = Arc::new(CollectorSink::new("collector"));
        let node = Node::spawn(
            RecordStation {
                shutdown_called: Arc::new(AtomicBool::new(false)),
            },
            sink.clone(),
            NodeOptions::default(),
        )
        .unwrap();

        node.push_message(Message::CandidatePairRejected(CandidatePairRejectedMessage))
            .unwrap();
        node.finish().unwrap();

        let messages = sink.take_messages();
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], Message::CandidatePairRejected(_)));
    }

    #[test]
    fn test_recoverable_errors_are_reported_and_processing_continues() {
        let sink = Arc::new(CollectorSink::new("collector"));
        let reporter = Arc::new(MockReporter::default());
        let node = Node::spawn_with_reporter(
            PickyStation,
            sink.clone(),
            NodeOptions::new(1, 10),
            reporter.clone(),
        )
        .unwrap();

        node.push_message(read("good1")).unwrap();
        node.push_message(read("bad1")).unwrap();
        node.push_message(read("good2")).unwrap();
        node.finish().unwrap();

        let ids: Vec<String> = sink.take_messages().iter().map(record_id).collect();
        assert_eq!(ids, vec!["good1".to_string(), "good2".to_string()]);

        let errors = reporter.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "Picky");
        assert!(errors[0].1.contains("rejected bad1"));
    }

    #[test]
    fn test_push_after_finish_is_rejected() {
        let sink = Arc::new(CollectorSink::new("collector"));
        let node = Node::spawn(PickyStation, sink, NodeOptions::default()).unwrap();
        node.finish().unwrap();
        assert!(matches!(
            node.push_message(read("late")),
            Err(DuplexError::QueueClosed)
        ));
    }

    #[test]
    fn test_panicking_worker_still_terminates_downstream() {
        let sink = Arc::new(CollectorSink::new("collector"));
        let node = Node::spawn(PanickingStation, sink.clone(), NodeOptions::new(1, 10)).unwrap();

        node.push_message(read("r1")).unwrap();
        let result = node.join();

        assert!(result.is_err());
        assert!(result.unwrap_err().contains("Panicking"));
        assert_eq!(sink.terminate_count(), 1);
    }

    #[test]
    fn test_drop_drains_and_terminates() {
        let sink = Arc::new(CollectorSink::new("collector"));
        {
            let node = Node::spawn(PickyStation, sink.clone(), NodeOptions::new(2, 10)).unwrap();
            node.push_message(read("r1")).unwrap();
        }
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.terminate_count(), 1);
    }

    #[test]
    fn test_stats_merge_queue_and_station() {
        let sink = Arc::new(CollectorSink::new("collector"));
        let node = Node::spawn(PickyStation, sink, NodeOptions::new(1, 16)).unwrap();
        let stats = node.sample_stats();
        assert_eq!(stats["queue_capacity"], 16.0);
        assert_eq!(node.name(), "Picky");
    }
}
