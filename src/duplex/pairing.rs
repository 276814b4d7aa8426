//! Template/complement pairing.
//!
//! Reads are matched either from an explicit template→complement list or,
//! without one, by looking for reads from the same pore occupancy that follow
//! each other closely in time and have similar lengths.

use crate::defaults;
use crate::error::{DuplexError, Result};
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::stats::NamedStats;
use crate::pipeline::types::{Message, Read, ReadPair, UniquePoreIdentifierKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Limits for pairing without a pair list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSettings {
    /// Pores tracked at once; the oldest pore is forgotten first.
    pub max_num_keys: usize,
    /// Reads cached per pore; the earliest read is forgotten first.
    pub max_num_reads: usize,
    pub max_time_delta_ms: u64,
    pub min_seq_len_ratio: f32,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            max_num_keys: defaults::PAIRING_MAX_NUM_KEYS,
            max_num_reads: defaults::PAIRING_MAX_NUM_READS,
            max_time_delta_ms: defaults::PAIRING_MAX_TIME_DELTA_MS,
            min_seq_len_ratio: defaults::PAIRING_MIN_SEQ_LEN_RATIO,
        }
    }
}

impl PairingSettings {
    /// Whether `complement` may directly follow `template` in the same pore.
    pub fn accepts(&self, template: &Read, complement: &Read) -> bool {
        let gap = complement.start_time_ms as i64 - template.end_time_ms() as i64;
        if gap < 0 || gap as u64 > self.max_time_delta_ms {
            return false;
        }
        let (a, b) = (template.seq.len(), complement.seq.len());
        let longer = a.max(b);
        if longer == 0 {
            return false;
        }
        a.min(b) as f32 / longer as f32 >= self.min_seq_len_ratio
    }
}

/// Reads a template → complement list, one whitespace- or comma-separated pair
/// per line. Blank lines and `#` comments are skipped.
pub fn read_pair_list(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Err(DuplexError::ConfigFileNotFound {
            path: path.display().to_string(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    let mut pairs = HashMap::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|f| !f.is_empty())
            .collect();
        let [template, complement] = fields.as_slice() else {
            return Err(DuplexError::ConfigParse {
                message: format!(
                    "{}:{}: expected 'template complement', got '{line}'",
                    path.display(),
                    line_no + 1
                ),
            });
        };
        pairs.insert(template.to_string(), complement.to_string());
    }
    Ok(pairs)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct PoreBuckets {
    buckets: HashMap<UniquePoreIdentifierKey, VecDeque<Arc<Read>>>,
    /// Keys in creation order.
    keys: VecDeque<UniquePoreIdentifierKey>,
}

enum Mode {
    PairList {
        template_to_complement: Mutex<HashMap<String, String>>,
        complement_to_template: Mutex<HashMap<String, String>>,
        read_cache: Mutex<HashMap<String, Arc<Read>>>,
    },
    Implicit {
        settings: PairingSettings,
        pores: Mutex<PoreBuckets>,
    },
}

/// Holds reads until their partner shows up.
pub struct PairingIndex {
    mode: Mode,
}

impl PairingIndex {
    /// Pairs reads named in a template id → complement id list.
    pub fn from_pair_list(pairs: HashMap<String, String>) -> Self {
        let complement_to_template = pairs
            .iter()
            .map(|(t, c)| (c.clone(), t.clone()))
            .collect();
        Self {
            mode: Mode::PairList {
                template_to_complement: Mutex::new(pairs),
                complement_to_template: Mutex::new(complement_to_template),
                read_cache: Mutex::new(HashMap::new()),
            },
        }
    }

    /// Pairs consecutive reads from the same pore.
    pub fn implicit(settings: PairingSettings) -> Self {
        Self {
            mode: Mode::Implicit {
                settings,
                pores: Mutex::new(PoreBuckets::default()),
            },
        }
    }

    /// Offers a read; returns the pair it completes, if any.
    ///
    /// The template of an emitted pair has its candidate counter incremented.
    pub fn insert(&self, read: Arc<Read>) -> Option<ReadPair> {
        let pair = match &self.mode {
            Mode::PairList {
                template_to_complement,
                complement_to_template,
                read_cache,
            } => {
                Self::insert_listed(template_to_complement, complement_to_template, read_cache, read)
            }
            Mode::Implicit { settings, pores } => Self::insert_implicit(settings, pores, read),
        }?;
        pair.template
            .num_duplex_candidate_pairs
            .fetch_add(1, Ordering::SeqCst);
        Some(pair)
    }

    fn insert_listed(
        template_to_complement: &Mutex<HashMap<String, String>>,
        complement_to_template: &Mutex<HashMap<String, String>>,
        read_cache: &Mutex<HashMap<String, Arc<Read>>>,
        read: Arc<Read>,
    ) -> Option<ReadPair> {
        let as_template = lock(template_to_complement).get(&read.read_id).cloned();
        let (partner_id, read_is_template) = match as_template {
            Some(partner) => (partner, true),
            None => (lock(complement_to_template).get(&read.read_id).cloned()?, false),
        };

        let mut cache = lock(read_cache);
        let Some(partner) = cache.remove(&partner_id) else {
            cache.insert(read.read_id.clone(), read);
            return None;
        };
        drop(cache);

        Some(if read_is_template {
            ReadPair {
                template: read,
                complement: partner,
            }
        } else {
            ReadPair {
                template: partner,
                complement: read,
            }
        })
    }

    fn insert_implicit(
        settings: &PairingSettings,
        pores: &Mutex<PoreBuckets>,
        read: Arc<Read>,
    ) -> Option<ReadPair> {
        let key = read.pore_key();
        let mut pores = lock(pores);
        let PoreBuckets { buckets, keys } = &mut *pores;

        let Some(bucket) = buckets.get_mut(&key) else {
            if keys.len() >= settings.max_num_keys.max(1)
                && let Some(oldest) = keys.pop_front()
            {
                buckets.remove(&oldest);
            }
            keys.push_back(key.clone());
            buckets.insert(key, VecDeque::from([read]));
            return None;
        };

        // First cached read starting at or after this one
        let later = bucket.partition_point(|cached| cached.start_time_ms < read.start_time_ms);

        if later > 0 && settings.accepts(&bucket[later - 1], &read) {
            let template = bucket.remove(later - 1)?;
            return Some(ReadPair {
                template,
                complement: read,
            });
        }
        if later < bucket.len() && settings.accepts(&read, &bucket[later]) {
            let complement = bucket.remove(later)?;
            return Some(ReadPair {
                template: read,
                complement,
            });
        }

        let mut position = later;
        if bucket.len() >= settings.max_num_reads.max(1) {
            bucket.pop_front();
            position = position.saturating_sub(1);
        }
        bucket.insert(position, read);
        None
    }

    /// Number of reads waiting for a partner.
    pub fn cached_reads(&self) -> usize {
        match &self.mode {
            Mode::PairList { read_cache, .. } => lock(read_cache).len(),
            Mode::Implicit { pores, .. } => lock(pores).buckets.values().map(VecDeque::len).sum(),
        }
    }

    /// Whether `read_id` is waiting for a partner.
    pub fn is_cached(&self, read_id: &str) -> bool {
        match &self.mode {
            Mode::PairList { read_cache, .. } => lock(read_cache).contains_key(read_id),
            Mode::Implicit { pores, .. } => lock(pores)
                .buckets
                .values()
                .flatten()
                .any(|read| read.read_id == read_id),
        }
    }
}

/// Node stage that turns a read stream into template/complement pairs.
///
/// Only pairs leave this stage; other message kinds pass through.
pub struct PairingStation {
    index: PairingIndex,
    reads_seen: AtomicU64,
    pairs_emitted: AtomicU64,
}

impl PairingStation {
    pub fn new(index: PairingIndex) -> Self {
        Self {
            index,
            reads_seen: AtomicU64::new(0),
            pairs_emitted: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> &PairingIndex {
        &self.index
    }
}

impl Station for PairingStation {
    fn name(&self) -> &'static str {
        "Pairing"
    }

    fn process(&self, message: Message) -> std::result::Result<Vec<Message>, StationError> {
        match message {
            Message::Read(read) => {
                self.reads_seen.fetch_add(1, Ordering::Relaxed);
                match self.index.insert(Arc::from(read)) {
                    Some(pair) => {
                        self.pairs_emitted.fetch_add(1, Ordering::Relaxed);
                        Ok(vec![pair.into()])
                    }
                    None => Ok(Vec::new()),
                }
            }
            other => Ok(vec![other]),
        }
    }

    fn stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "reads_seen".to_string(),
            self.reads_seen.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "pairs_emitted".to_string(),
            self.pairs_emitted.load(Ordering::Relaxed) as f64,
        );
        stats.insert("reads_cached".to_string(), self.index.cached_reads() as f64);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    // 4000 samples at 4 kHz: each read lasts one second
    fn read(id: &str, channel: i32, start_time_ms: u64, len: usize) -> Arc<Read> {
        let raw = Tensor::zeros(4000, DType::F32, &Device::Cpu).unwrap();
        Arc::new(
            Read::new(id, raw)
                .with_basecall("A".repeat(len), "5".repeat(len), vec![1; len], 1)
                .with_pore(channel, 1, "run", "FC1", 0)
                .with_start_time(start_time_ms)
                .with_sample_rate(4000),
        )
    }

    fn ids(pair: &ReadPair) -> (&str, &str) {
        (pair.template.read_id.as_str(), pair.complement.read_id.as_str())
    }

    #[test]
    fn test_settings_accept_gap_and_length() {
        let settings = PairingSettings::default();
        let r1 = read("r1", 1, 0, 100);
        // Gap of 500 ms
        assert!(settings.accepts(&r1, &read("r2", 1, 1500, 90)));
        // Gap boundary is inclusive
        assert!(settings.accepts(&r1, &read("r2", 1, 2000, 90)));
        assert!(!settings.accepts(&r1, &read("r2", 1, 2001, 90)));
        // Overlapping reads
        assert!(!settings.accepts(&r1, &read("r2", 1, 500, 90)));
        // Length ratio 10 / 100 below 0.2
        assert!(!settings.accepts(&r1, &read("r2", 1, 1500, 10)));
    }

    #[test]
    fn test_implicit_pairs_shared_key_and_evicts_both() {
        let index = PairingIndex::implicit(PairingSettings::default());

        assert!(index.insert(read("r1", 1, 0, 100)).is_none());
        let pair = index.insert(read("r2", 1, 1200, 100)).unwrap();
        assert_eq!(ids(&pair), ("r1", "r2"));
        assert_eq!(pair.template.candidate_pairs(), 1);

        assert!(index.insert(read("r3", 1, 10_000, 100)).is_none());
        assert!(!index.is_cached("r1"));
        assert!(!index.is_cached("r2"));
        assert!(index.is_cached("r3"));
        assert_eq!(index.cached_reads(), 1);
    }

    #[test]
    fn test_implicit_pairs_out_of_order_arrival() {
        let index = PairingIndex::implicit(PairingSettings::default());
        assert!(index.insert(read("late", 1, 1200, 100)).is_none());
        let pair = index.insert(read("early", 1, 0, 100)).unwrap();
        // Earlier read is always the template
        assert_eq!(ids(&pair), ("early", "late"));
    }

    #[test]
    fn test_implicit_requires_same_pore() {
        let index = PairingIndex::implicit(PairingSettings::default());
        assert!(index.insert(read("r1", 1, 0, 100)).is_none());
        assert!(index.insert(read("r2", 2, 1200, 100)).is_none());
        assert_eq!(index.cached_reads(), 2);
    }

    #[test]
    fn test_implicit_key_limit_evicts_oldest_pore() {
        let settings = PairingSettings {
            max_num_keys: 2,
            ..PairingSettings::default()
        };
        let index = PairingIndex::implicit(settings);
        index.insert(read("c1", 1, 0, 100));
        index.insert(read("c2", 2, 0, 100));
        index.insert(read("c3", 3, 0, 100));

        assert!(!index.is_cached("c1"));
        assert!(index.is_cached("c2"));
        assert!(index.is_cached("c3"));
        // Partner of the forgotten read finds nothing
        assert!(index.insert(read("c1b", 1, 1200, 100)).is_none());
    }

    #[test]
    fn test_implicit_bucket_limit_drops_earliest_read() {
        let settings = PairingSettings {
            max_num_reads: 2,
            ..PairingSettings::default()
        };
        let index = PairingIndex::implicit(settings);
        // Far apart in time, so none of them pair
        for (i, start) in [0u64, 10_000, 20_000].into_iter().enumerate() {
            index.insert(read(&format!("r{i}"), 1, start, 100));
        }
        assert!(!index.is_cached("r0"));
        assert!(index.is_cached("r1"));
        assert!(index.is_cached("r2"));
    }

    #[test]
    fn test_pair_list_matches_regardless_of_order() {
        let list = HashMap::from([("t1".to_string(), "c1".to_string())]);
        let index = PairingIndex::from_pair_list(list);

        assert!(index.insert(read("c1", 1, 0, 100)).is_none());
        assert!(index.is_cached("c1"));
        let pair = index.insert(read("t1", 9, 99_000, 10)).unwrap();
        assert_eq!(ids(&pair), ("t1", "c1"));
        assert_eq!(pair.template.candidate_pairs(), 1);
        assert_eq!(index.cached_reads(), 0);
    }

    #[test]
    fn test_read_pair_list_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# template complement").unwrap();
        writeln!(file, "t1 c1").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "t2,c2").unwrap();

        let pairs = read_pair_list(file.path()).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs["t1"], "c1");
        assert_eq!(pairs["t2"], "c2");
    }

    #[test]
    fn test_read_pair_list_rejects_malformed_line() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "t1 c1 extra").unwrap();
        assert!(matches!(
            read_pair_list(file.path()),
            Err(DuplexError::ConfigParse { .. })
        ));
        assert!(matches!(
            read_pair_list(Path::new("/nonexistent/pairs.txt")),
            Err(DuplexError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_pair_list_ignores_unlisted_reads() {
        let index = PairingIndex::from_pair_list(HashMap::new());
        assert!(index.insert(read("stray", 1, 0, 100)).is_none());
        assert_eq!(index.cached_reads(), 0);
    }

    #[test]
    fn test_station_emits_pairs_only() {
        let station = PairingStation::new(PairingIndex::implicit(PairingSettings::default()));
        let first = Arc::try_unwrap(read("r1", 1, 0, 100)).unwrap();
        let second = Arc::try_unwrap(read("r2", 1, 1200, 100)).unwrap();

        assert!(station.process(first.into()).unwrap().is_empty());
        let out = station.process(second.into()).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Message::ReadPair(_)));

        let stats = station.stats();
        assert_eq!(stats["reads_seen"], 2.0);
        assert_eq!(stats["pairs_emitted"], 1.0);
        assert_eq!(stats["reads_cached"], 0.0);
    }
}
