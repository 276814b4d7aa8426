//! Formats finished reads as unmapped SAM records.

use crate::defaults;
use crate::duplex::sequence::mean_qscore;
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::stats::NamedStats;
use crate::pipeline::types::{BaseModInfo, Message, Read, SamRecord};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// SAM flag for an unmapped read.
const FLAG_UNMAPPED: u16 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordSettings {
    /// Adds an `mv` tag with the model stride and move table.
    pub emit_moves: bool,
    /// RNA is sequenced 3' to 5', so sequence and qualities are reversed.
    pub rna: bool,
    /// Modification calls below this probability are left out of MM/ML.
    pub modbase_threshold: f32,
}

impl Default for RecordSettings {
    fn default() -> Self {
        Self {
            emit_moves: false,
            rna: false,
            modbase_threshold: defaults::MODBASE_THRESHOLD,
        }
    }
}

impl RecordSettings {
    /// Threshold as a probability byte: `min(threshold * 256, 255)`.
    pub fn threshold_byte(&self) -> u8 {
        (self.modbase_threshold * 256.0).clamp(0.0, 255.0) as u8
    }
}

pub struct ReadToRecordStation {
    settings: RecordSettings,
    records_emitted: AtomicU64,
}

impl ReadToRecordStation {
    pub fn new(settings: RecordSettings) -> Self {
        Self {
            settings,
            records_emitted: AtomicU64::new(0),
        }
    }

    /// Builds the record for one read.
    pub fn to_record(&self, read: &Read) -> SamRecord {
        let mut seq = read.seq.clone();
        let mut qual = read.qstring.clone();
        let mut mod_probs = read.base_mod_probs.clone();
        if self.settings.rna {
            seq = seq.chars().rev().collect();
            qual = qual.chars().rev().collect();
            if let (Some(probs), Some(info)) = (mod_probs.as_mut(), read.base_mod_info.as_ref()) {
                reverse_positions(probs, info.num_states());
            }
        }

        let mut tags = vec![
            format!("qs:i:{}", mean_qscore(&read.qstring).round() as i64),
            format!("ns:i:{}", read.num_samples()),
            format!("ch:i:{}", read.channel),
            format!("mx:i:{}", read.mux),
            format!("st:Z:{}", read.start_time_ms),
        ];
        if read.is_duplex {
            tags.push("dx:i:1".to_string());
        }
        if let Some(parent) = &read.parent_read_id {
            tags.push(format!("pi:Z:{parent}"));
        }
        if self.settings.emit_moves && !read.moves.is_empty() {
            let moves: Vec<String> = read.moves.iter().map(u8::to_string).collect();
            tags.push(format!("mv:B:c,{},{}", read.model_stride, moves.join(",")));
        }
        if let (Some(probs), Some(info)) = (&mod_probs, &read.base_mod_info) {
            let (mm, ml) = modbase_tags(&seq, probs, info, self.settings.threshold_byte());
            tags.push(mm);
            tags.push(ml);
        }

        SamRecord {
            qname: read.read_id.clone(),
            flag: FLAG_UNMAPPED,
            seq,
            qual,
            tags,
        }
    }
}

impl Default for ReadToRecordStation {
    fn default() -> Self {
        Self::new(RecordSettings::default())
    }
}

impl Station for ReadToRecordStation {
    fn name(&self) -> &'static str {
        "ReadToRecord"
    }

    fn process(&self, message: Message) -> Result<Vec<Message>, StationError> {
        match message {
            Message::Read(read) => {
                self.records_emitted.fetch_add(1, Ordering::Relaxed);
                Ok(vec![self.to_record(&read).into()])
            }
            Message::CandidatePairRejected(_) => Ok(Vec::new()),
            other => {
                log::debug!("record formatter forwarding {}", other.kind());
                Ok(vec![other])
            }
        }
    }

    fn stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "records_emitted".to_string(),
            self.records_emitted.load(Ordering::Relaxed) as f64,
        );
        stats
    }
}

fn reverse_positions(probs: &mut [u8], num_states: usize) {
    if num_states == 0 {
        return;
    }
    let positions = probs.len() / num_states;
    for i in 0..positions / 2 {
        let j = positions - 1 - i;
        for s in 0..num_states {
            probs.swap(i * num_states + s, j * num_states + s);
        }
    }
}

/// MM and ML tags for every modification in `info`.
///
/// Positions count occurrences of the canonical base; each listed call is
/// preceded by the number of skipped occurrences since the previous one.
pub fn modbase_tags(seq: &str, probs: &[u8], info: &BaseModInfo, threshold: u8) -> (String, String) {
    let num_states = info.num_states();
    let alphabet = info.alphabet.as_bytes();
    let mut mm = String::from("MM:Z:");
    let mut ml = String::from("ML:B:C");

    let mut canonical = b'N';
    for (state, &code) in alphabet.iter().enumerate() {
        if b"ACGT".contains(&code) {
            canonical = code;
            continue;
        }
        mm.push_str(&format!("{}+{}?", canonical as char, code as char));
        let mut skipped = 0usize;
        for (pos, base) in seq.bytes().enumerate() {
            if base.to_ascii_uppercase() != canonical {
                continue;
            }
            let prob = probs.get(pos * num_states + state).copied().unwrap_or(0);
            if prob >= threshold {
                mm.push_str(&format!(",{skipped}"));
                ml.push_str(&format!(",{prob}"));
                skipped = 0;
            } else {
                skipped += 1;
            }
        }
        mm.push(';');
    }
    (mm, ml)
}
