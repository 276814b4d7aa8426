//! Feeds reads from signal stores into the pipeline.

use crate::error::{DuplexError, Result};
use crate::pipeline::station::MessageSink;
use crate::pipeline::types::Read;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Enough about a stored read to filter and order it without loading signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSummary {
    pub read_id: String,
    pub channel: i32,
    pub start_time_ms: u64,
}

/// A source of raw reads, e.g. one signal file.
///
/// This trait allows swapping implementations (file formats vs in-memory mock).
pub trait SignalStore: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    /// All reads in storage order.
    fn summaries(&self) -> Result<Vec<ReadSummary>>;

    /// Loads one read, signal included.
    fn load(&self, read_id: &str) -> Result<Read>;

    /// Acquisition sample rate, if the store records one.
    fn sample_rate(&self) -> Option<u32>;
}

/// Order in which reads leave the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadOrder {
    /// Store by store, in storage order.
    #[default]
    Unrestricted,
    /// Sorted by channel, then by start time, across all stores. Reads from
    /// the same pore arrive in acquisition order, which is what pairing wants.
    ByChannel,
}

/// Include and exclude lists for read ids. Exclusion wins.
#[derive(Debug, Clone, Default)]
pub struct ReadSelection {
    pub include: Option<HashSet<String>>,
    pub exclude: HashSet<String>,
    pub max_reads: Option<usize>,
}

impl ReadSelection {
    pub fn is_wanted(&self, read_id: &str) -> bool {
        if self.exclude.contains(read_id) {
            return false;
        }
        self.include
            .as_ref()
            .is_none_or(|include| include.contains(read_id))
    }
}

pub struct DataLoader {
    sink: Arc<dyn MessageSink>,
    selection: ReadSelection,
}

impl DataLoader {
    pub fn new(sink: Arc<dyn MessageSink>, selection: ReadSelection) -> Self {
        Self { sink, selection }
    }

    /// Pushes every selected read into the sink; returns the number pushed.
    ///
    /// The sink is not terminated.
    pub fn load_reads(&self, stores: &[&dyn SignalStore], order: ReadOrder) -> Result<usize> {
        let selected = select(stores, &self.selection, order)?;
        let mut pushed = 0;
        for (store_idx, summary) in selected {
            let store = stores[store_idx];
            let read = store.load(&summary.read_id)?;
            self.sink.push_message(read.into())?;
            pushed += 1;
        }
        log::info!("loaded {pushed} reads from {} stores", stores.len());
        Ok(pushed)
    }

    /// Number of reads [`DataLoader::load_reads`] would push.
    pub fn get_num_reads(stores: &[&dyn SignalStore], selection: &ReadSelection) -> Result<usize> {
        Ok(select(stores, selection, ReadOrder::Unrestricted)?.len())
    }

    /// Sample rate of the first store that records one.
    pub fn get_sample_rate(stores: &[&dyn SignalStore]) -> Option<u32> {
        stores.iter().find_map(|store| store.sample_rate())
    }
}

fn select(
    stores: &[&dyn SignalStore],
    selection: &ReadSelection,
    order: ReadOrder,
) -> Result<Vec<(usize, ReadSummary)>> {
    let mut selected = Vec::new();
    for (store_idx, store) in stores.iter().enumerate() {
        let summaries = store.summaries()?;
        log::debug!("{}: {} reads", store.name(), summaries.len());
        selected.extend(
            summaries
                .into_iter()
                .filter(|summary| selection.is_wanted(&summary.read_id))
                .map(|summary| (store_idx, summary)),
        );
    }
    if order == ReadOrder::ByChannel {
        selected.sort_by_key(|(_, summary)| (summary.channel, summary.start_time_ms));
    }
    if let Some(max) = selection.max_reads {
        selected.truncate(max);
    }
    Ok(selected)
}

/// In-memory store for testing.
#[derive(Debug, Clone, Default)]
pub struct MockSignalStore {
    name: String,
    reads: Vec<Read>,
    sample_rate: Option<u32>,
    should_fail_load: bool,
}

impl MockSignalStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_read(mut self, read: Read) -> Self {
        self.reads.push(read);
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn with_load_failure(mut self) -> Self {
        self.should_fail_load = true;
        self
    }

    fn index(&self) -> HashMap<&str, &Read> {
        self.reads.iter().map(|r| (r.read_id.as_str(), r)).collect()
    }
}

impl SignalStore for MockSignalStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn summaries(&self) -> Result<Vec<ReadSummary>> {
        Ok(self
            .reads
            .iter()
            .map(|read| ReadSummary {
                read_id: read.read_id.clone(),
                channel: read.channel,
                start_time_ms: read.start_time_ms,
            })
            .collect())
    }

    fn load(&self, read_id: &str) -> Result<Read> {
        if self.should_fail_load {
            return Err(DuplexError::Other(format!("{}: mock load failure", self.name)));
        }
        self.index()
            .get(read_id)
            .map(|read| (*read).clone())
            .ok_or_else(|| DuplexError::Other(format!("{}: no read {read_id}", self.name)))
    }

    fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }
}
