//! Stereo encoding: fuses a template and complement read into one 13-channel tensor.
//!
//! The two base sequences are aligned, trimmed to their confident interior and
//! walked column by column. Each column copies the signal samples of the aligned
//! base from each strand (the complement's signal reversed) and marks the base
//! identity and quality of both strands over the span of those samples.

use crate::defaults;
use crate::duplex::alignment::{PairAlignment, TrimmedWindow};
use crate::duplex::sequence::{base_to_int, expand_moves, qscore_to_float, reverse_complement};
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::stats::NamedStats;
use crate::pipeline::types::{CandidatePairRejectedMessage, Message, Read, ReadPair};
use candle_core::{Device, Tensor};
use std::sync::atomic::{AtomicU64, Ordering};

pub const NUM_FEATURES: usize = 13;
pub const FEATURE_TEMPLATE_SIGNAL: usize = 0;
pub const FEATURE_COMPLEMENT_SIGNAL: usize = 1;
pub const FEATURE_TEMPLATE_FIRST_BASE: usize = 2;
pub const FEATURE_COMPLEMENT_FIRST_BASE: usize = 6;
pub const FEATURE_MOVE: usize = 10;
pub const FEATURE_TEMPLATE_QSCORE: usize = 11;
pub const FEATURE_COMPLEMENT_QSCORE: usize = 12;

/// Thresholds deciding whether a pair can be encoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoEncoder {
    pub trim_window: usize,
    pub min_trimmed_length: usize,
    pub max_error_rate: f32,
    pub pad_factor: f32,
}

impl Default for StereoEncoder {
    fn default() -> Self {
        Self {
            trim_window: defaults::STEREO_TRIM_WINDOW,
            min_trimmed_length: defaults::MIN_TRIMMED_ALIGNMENT_LENGTH,
            max_error_rate: defaults::MAX_ALIGNMENT_ERROR_RATE,
            pad_factor: defaults::STEREO_PAD_FACTOR,
        }
    }
}

/// Signal, moves and bases of one strand as walked by the encoder.
struct Strand<'a> {
    signal: Vec<f32>,
    moves: Vec<u8>,
    seq: &'a [u8],
    signal_cursor: usize,
    base_cursor: usize,
}

impl Strand<'_> {
    /// Places the signal cursor on the first sample of base `base_cursor`.
    fn seek(&mut self) -> Option<()> {
        let mut seen = usize::from(*self.moves.first()?);
        while seen < self.base_cursor + 1 {
            self.signal_cursor += 1;
            seen += usize::from(*self.moves.get(self.signal_cursor)?);
        }
        Some(())
    }

    /// Copies the samples of the current base into `row` at `at`, returning the count.
    fn copy_segment(&mut self, row: &mut [f32], at: usize) -> Option<usize> {
        let start = self.signal_cursor;
        *row.get_mut(at)? = *self.signal.get(start)?;

        let rest = self.moves.get(start + 1..).unwrap_or(&[]);
        let run = rest.iter().position(|&m| m == 1).unwrap_or(rest.len());
        let end = start + 1 + run;
        let samples = self.signal.get(start + 1..end)?;
        row.get_mut(at + 1..at + 1 + run)?.copy_from_slice(samples);

        self.signal_cursor = end;
        Some(1 + run)
    }
}

pub(crate) fn pad_value(template: &[f32], complement: &[f32], factor: f32) -> f32 {
    let min = template
        .iter()
        .chain(complement)
        .copied()
        .fold(f32::INFINITY, f32::min);
    if min.is_finite() { factor * min } else { 0.0 }
}

impl StereoEncoder {
    /// Encodes a pair, or returns `Ok(None)` when the pair cannot be fused.
    pub fn encode(&self, template: &Read, complement: &Read) -> candle_core::Result<Option<Read>> {
        let complement_rc = reverse_complement(&complement.seq);
        let alignment = PairAlignment::global(template.seq.as_bytes(), complement_rc.as_bytes());

        let Some(window) = alignment.trimmed_window(self.trim_window) else {
            return Ok(None);
        };
        let consensus_possible = !window.is_empty()
            && window.len() > self.min_trimmed_length
            && alignment.error_rate() < self.max_error_rate;
        if !consensus_possible {
            return Ok(None);
        }

        let template_signal = template.signal_f32()?;
        let mut complement_signal = complement.signal_f32()?;
        complement_signal.reverse();

        let template_moves = expand_moves(
            &template.moves,
            template.model_stride,
            template_signal.len(),
        );
        let mut complement_moves = expand_moves(
            &complement.moves,
            complement.model_stride,
            complement_signal.len(),
        );
        complement_moves.push(1);
        complement_moves.reverse();
        complement_moves.pop();

        let pad = pad_value(&template_signal, &complement_signal, self.pad_factor);
        let mut template_strand = Strand {
            signal: template_signal,
            moves: template_moves,
            seq: template.seq.as_bytes(),
            signal_cursor: 0,
            base_cursor: window.template_start,
        };
        let mut complement_strand = Strand {
            signal: complement_signal,
            moves: complement_moves,
            seq: complement_rc.as_bytes(),
            signal_cursor: 0,
            base_cursor: window.complement_start,
        };

        let Some(columns) = self.fill_features(
            &alignment,
            window,
            &mut template_strand,
            &mut complement_strand,
            template.qstring.as_bytes(),
            complement.qstring.as_bytes(),
            pad,
        ) else {
            log::debug!(
                "{};{}: signal cursor overran its read",
                template.read_id,
                complement.read_id
            );
            return Ok(None);
        };

        let num_columns = columns.first().map_or(0, Vec::len);
        let data: Vec<f32> = columns.into_iter().flatten().collect();
        let tensor = Tensor::from_vec(data, (NUM_FEATURES, num_columns), &Device::Cpu)?
            .to_dtype(template.raw_data.dtype())?;

        let mut read = Read::new(
            format!("{};{}", template.read_id, complement.read_id),
            tensor,
        );
        read.read_tag = template.read_tag;
        read.run_id = template.run_id.clone();
        read.is_duplex = true;
        Ok(Some(read))
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_features(
        &self,
        alignment: &PairAlignment,
        window: TrimmedWindow,
        template: &mut Strand<'_>,
        complement: &mut Strand<'_>,
        template_qstring: &[u8],
        complement_qstring: &[u8],
        pad: f32,
    ) -> Option<Vec<Vec<f32>>> {
        template.seek()?;
        complement.seek()?;

        let max_columns = template.signal.len() + complement.signal.len();
        let mut features = vec![vec![0f32; max_columns]; NUM_FEATURES];
        features[FEATURE_TEMPLATE_SIGNAL].fill(pad);
        features[FEATURE_COMPLEMENT_SIGNAL].fill(pad);

        let mut cursor = 0;
        for op in &alignment.ops[window.start..window.end] {
            let mut template_len = 0;
            let mut complement_len = 0;
            if op.consumes_template() {
                template_len =
                    template.copy_segment(&mut features[FEATURE_TEMPLATE_SIGNAL], cursor)?;
            }
            if op.consumes_complement() {
                complement_len =
                    complement.copy_segment(&mut features[FEATURE_COMPLEMENT_SIGNAL], cursor)?;
            }
            let span = cursor..cursor + template_len.max(complement_len);

            if op.consumes_template() {
                let base = *template.seq.get(template.base_cursor)?;
                if let Some(idx) = base_to_int(base) {
                    features[FEATURE_TEMPLATE_FIRST_BASE + idx][span.clone()].fill(1.0);
                }
                let q = *template_qstring.get(template.base_cursor)?;
                features[FEATURE_TEMPLATE_QSCORE][span.clone()].fill(qscore_to_float(q));
                template.base_cursor += 1;
            }
            if op.consumes_complement() {
                let base = *complement.seq.get(complement.base_cursor)?;
                if let Some(idx) = base_to_int(base) {
                    features[FEATURE_COMPLEMENT_FIRST_BASE + idx][span.clone()].fill(1.0);
                }
                // Complement qualities are stored in sequencing order
                let q_index = complement_qstring
                    .len()
                    .checked_sub(1 + complement.base_cursor)?;
                let q = complement_qstring[q_index];
                features[FEATURE_COMPLEMENT_QSCORE][span.clone()].fill(qscore_to_float(q));
                complement.base_cursor += 1;
            }

            features[FEATURE_MOVE][cursor] = 1.0;
            cursor = span.end;
        }

        for row in &mut features {
            row.truncate(cursor);
        }
        Some(features)
    }
}

/// Node stage that stereo-encodes read pairs and passes simplex reads through.
pub struct StereoEncoderStation {
    encoder: StereoEncoder,
    encoded_pairs: AtomicU64,
    discarded_pairs: AtomicU64,
}

impl StereoEncoderStation {
    pub fn new(encoder: StereoEncoder) -> Self {
        Self {
            encoder,
            encoded_pairs: AtomicU64::new(0),
            discarded_pairs: AtomicU64::new(0),
        }
    }

    pub fn discarded_pairs(&self) -> u64 {
        self.discarded_pairs.load(Ordering::Relaxed)
    }

    fn reject(&self, pair: &ReadPair) -> Message {
        // The pairing stage counted this pair against the template.
        let _ = pair.template.num_duplex_candidate_pairs.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        self.discarded_pairs.fetch_add(1, Ordering::Relaxed);
        Message::CandidatePairRejected(CandidatePairRejectedMessage)
    }
}

impl Default for StereoEncoderStation {
    fn default() -> Self {
        Self::new(StereoEncoder::default())
    }
}

impl Station for StereoEncoderStation {
    fn name(&self) -> &'static str {
        "StereoEncoder"
    }

    fn process(&self, message: Message) -> Result<Vec<Message>, StationError> {
        match message {
            Message::ReadPair(pair) => {
                match self.encoder.encode(&pair.template, &pair.complement) {
                    Ok(Some(read)) => {
                        self.encoded_pairs.fetch_add(1, Ordering::Relaxed);
                        Ok(vec![read.into()])
                    }
                    Ok(None) => Ok(vec![self.reject(&pair)]),
                    Err(e) => {
                        log::warn!(
                            "{};{}: stereo encoding failed: {e}",
                            pair.template.read_id,
                            pair.complement.read_id
                        );
                        Ok(vec![self.reject(&pair)])
                    }
                }
            }
            other => Ok(vec![other]),
        }
    }

    fn stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "encoded_pairs".to_string(),
            self.encoded_pairs.load(Ordering::Relaxed) as f64,
        );
        stats.insert("discarded_pairs".to_string(), self.discarded_pairs() as f64);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const STRIDE: usize = 2;
    // Each base spans two move entries
    const SAMPLES_PER_BASE: usize = 2 * STRIDE;

    fn pseudo_random_seq(len: usize, seed: u64) -> String {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                b"ACGT"[(state >> 33) as usize % 4] as char
            })
            .collect()
    }

    fn strand_read(id: &str, seq: &str, base_level: f32) -> Read {
        let num_samples = seq.len() * SAMPLES_PER_BASE;
        let signal: Vec<f32> = (0..num_samples)
            .map(|i| base_level + (i % 7) as f32)
            .collect();
        let moves: Vec<u8> = seq.bytes().flat_map(|_| [1u8, 0]).collect();
        let qstring: String = (0..seq.len()).map(|i| (b'!' + 10 + (i % 30) as u8) as char).collect();
        let raw = Tensor::from_vec(signal, num_samples, &Device::Cpu).unwrap();
        Read::new(id, raw).with_basecall(seq, qstring, moves, STRIDE)
    }

    fn duplex_pair(len: usize) -> (Read, Read) {
        let seq = pseudo_random_seq(len, 7);
        let template = strand_read("t", &seq, 100.0);
        let complement = strand_read("c", &reverse_complement(&seq), 90.0);
        (template, complement)
    }

    #[test]
    fn test_encodes_matching_pair() {
        let (template, complement) = duplex_pair(80);
        let read = StereoEncoder::default()
            .encode(&template, &complement)
            .unwrap()
            .unwrap();

        assert_eq!(read.read_id, "t;c");
        assert!(read.is_duplex);
        assert_eq!(read.raw_data.dims(), &[NUM_FEATURES, 80 * SAMPLES_PER_BASE]);

        let features = read.raw_data.to_vec2::<f32>().unwrap();
        // One move per aligned column
        let moves: f32 = features[FEATURE_MOVE].iter().sum();
        assert_eq!(moves, 80.0);
        // Template signal copied verbatim
        assert_eq!(features[FEATURE_TEMPLATE_SIGNAL][..7], [100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 106.0]);
        // Complement signal reversed: its last sample comes first
        let last = (80 * SAMPLES_PER_BASE - 1) % 7;
        assert_eq!(features[FEATURE_COMPLEMENT_SIGNAL][0], 90.0 + last as f32);
    }

    #[test]
    fn test_bases_and_qualities_marked_over_each_column() {
        let (template, complement) = duplex_pair(60);
        let read = StereoEncoder::default()
            .encode(&template, &complement)
            .unwrap()
            .unwrap();
        let features = read.raw_data.to_vec2::<f32>().unwrap();

        let first = base_to_int(template.seq.as_bytes()[0]).unwrap();
        for col in 0..SAMPLES_PER_BASE {
            assert_eq!(features[FEATURE_TEMPLATE_FIRST_BASE + first][col], 1.0);
            // rc(complement) equals the template
            assert_eq!(features[FEATURE_COMPLEMENT_FIRST_BASE + first][col], 1.0);
        }
        let q = qscore_to_float(template.qstring.as_bytes()[0]);
        assert!((features[FEATURE_TEMPLATE_QSCORE][0] - q).abs() < 1e-6);
        let cq = qscore_to_float(*complement.qstring.as_bytes().last().unwrap());
        assert!((features[FEATURE_COMPLEMENT_QSCORE][0] - cq).abs() < 1e-6);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let (template, complement) = duplex_pair(70);
        let encoder = StereoEncoder::default();
        let a = encoder.encode(&template, &complement).unwrap().unwrap();
        let b = encoder.encode(&template, &complement).unwrap().unwrap();
        assert_eq!(
            a.raw_data.to_vec2::<f32>().unwrap(),
            b.raw_data.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_trimmed_length_boundary() {
        let encoder = StereoEncoder::default();

        let (template, complement) = duplex_pair(50);
        assert!(encoder.encode(&template, &complement).unwrap().is_none());

        let (template, complement) = duplex_pair(51);
        assert!(encoder.encode(&template, &complement).unwrap().is_some());
    }

    #[test]
    fn test_high_error_rate_rejected() {
        let template = strand_read("t", &pseudo_random_seq(120, 1), 100.0);
        let complement = strand_read("c", &pseudo_random_seq(120, 99), 90.0);
        assert!(
            StereoEncoder::default()
                .encode(&template, &complement)
                .unwrap()
                .is_none()
        );
    }

    /// A 100-base pair whose only differences are `substitutions` mismatches,
    /// four bases apart, starting after a clean 12-base prefix.
    fn pair_with_substitutions(substitutions: usize) -> (Read, Read) {
        let seq = pseudo_random_seq(100, 13);
        let mut mutated = seq.clone().into_bytes();
        for pos in (12..).step_by(4).take(substitutions) {
            mutated[pos] = if mutated[pos] == b'A' { b'C' } else { b'A' };
        }
        let mutated = String::from_utf8(mutated).unwrap();
        (
            strand_read("t", &seq, 100.0),
            strand_read("c", &reverse_complement(&mutated), 90.0),
        )
    }

    #[test]
    fn test_error_rate_boundary() {
        let encoder = StereoEncoder::default();
        assert_eq!(encoder.max_error_rate, 0.2);

        // 20 edits over 100 columns sits exactly on the limit
        let (template, complement) = pair_with_substitutions(20);
        let alignment = PairAlignment::global(
            template.seq.as_bytes(),
            reverse_complement(&complement.seq).as_bytes(),
        );
        assert_eq!(alignment.edit_distance, 20);
        assert_eq!(alignment.error_rate(), 0.2);
        assert!(encoder.encode(&template, &complement).unwrap().is_none());

        let (template, complement) = pair_with_substitutions(19);
        let read = encoder.encode(&template, &complement).unwrap().unwrap();
        assert_eq!(read.read_id, "t;c");
    }

    #[test]
    fn test_pad_value_uses_smaller_signal() {
        assert_eq!(pad_value(&[100.0, 120.0], &[90.0, 95.0], 0.8), 72.0);
        assert_eq!(pad_value(&[], &[], 0.8), 0.0);
    }

    #[test]
    fn test_station_rejection_updates_counters() {
        let template = Arc::new(strand_read("t", &pseudo_random_seq(120, 1), 100.0));
        template.num_duplex_candidate_pairs.store(1, Ordering::SeqCst);
        let complement = Arc::new(strand_read("c", &pseudo_random_seq(120, 99), 90.0));

        let station = StereoEncoderStation::default();
        let out = station
            .process(Message::ReadPair(ReadPair {
                template: template.clone(),
                complement,
            }))
            .unwrap();

        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Message::CandidatePairRejected(_)));
        assert_eq!(template.candidate_pairs(), 0);
        assert_eq!(station.discarded_pairs(), 1);
        assert_eq!(station.stats()["discarded_pairs"], 1.0);
    }

    #[test]
    fn test_station_passes_simplex_reads() {
        let station = StereoEncoderStation::default();
        let out = station.process(strand_read("simplex", "ACGT", 1.0).into()).unwrap();
        match &out[..] {
            [Message::Read(read)] => assert_eq!(read.read_id, "simplex"),
            other => panic!("unexpected output: {other:?}"),
        }
    }
}
