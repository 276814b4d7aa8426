//! Read filter station: drops low-quality, short and excluded reads.

use crate::duplex::sequence::mean_qscore;
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::stats::NamedStats;
use crate::pipeline::types::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadFilterSettings {
    /// Reads with a mean qscore below this are dropped.
    pub min_qscore: f32,
    /// Reads with fewer bases than this are dropped.
    pub min_read_length: usize,
    /// Read ids to drop unconditionally.
    pub read_ids_to_filter: HashSet<String>,
}

impl Default for ReadFilterSettings {
    fn default() -> Self {
        Self {
            min_qscore: 0.0,
            min_read_length: 0,
            read_ids_to_filter: HashSet::new(),
        }
    }
}

pub struct ReadFilterStation {
    settings: ReadFilterSettings,
    reads_filtered: AtomicU64,
}

impl ReadFilterStation {
    pub fn new(settings: ReadFilterSettings) -> Self {
        Self {
            settings,
            reads_filtered: AtomicU64::new(0),
        }
    }

    pub fn reads_filtered(&self) -> u64 {
        self.reads_filtered.load(Ordering::Relaxed)
    }
}

impl Station for ReadFilterStation {
    fn name(&self) -> &'static str {
        "ReadFilter"
    }

    fn process(&self, message: Message) -> Result<Vec<Message>, StationError> {
        match message {
            Message::Read(read) => {
                let keep = mean_qscore(&read.qstring) >= self.settings.min_qscore
                    && read.seq.len() >= self.settings.min_read_length
                    && !self.settings.read_ids_to_filter.contains(&read.read_id);
                if keep {
                    Ok(vec![Message::Read(read)])
                } else {
                    log::trace!("{}: filtered", read.read_id);
                    self.reads_filtered.fetch_add(1, Ordering::Relaxed);
                    Ok(Vec::new())
                }
            }
            Message::CandidatePairRejected(_) => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }

    fn stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert("reads_filtered".to_string(), self.reads_filtered() as f64);
        stats
    }
}
