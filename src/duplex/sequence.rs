//! Base sequence, quality string and move table helpers.

use crate::defaults::{QSCORE_ASCII_OFFSET, QSCORE_STEREO_SCALE};

/// Number of canonical bases.
pub const NUM_BASES: usize = 4;

/// Reverse complement of a DNA sequence. Non-ACGT symbols become `N`.
pub fn reverse_complement(seq: &str) -> String {
    seq.bytes()
        .rev()
        .map(|b| match b.to_ascii_uppercase() {
            b'A' => 'T',
            b'C' => 'G',
            b'G' => 'C',
            b'T' => 'A',
            _ => 'N',
        })
        .collect()
}

/// Maps `A`, `C`, `G`, `T` to 0..4.
pub fn base_to_int(base: u8) -> Option<usize> {
    match base.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

/// Base indices for a whole sequence; unknown symbols are reported as `None`.
pub fn sequence_to_ints(seq: &str) -> Vec<Option<usize>> {
    seq.bytes().map(base_to_int).collect()
}

/// Inclusive running sum of a move table.
///
/// `sums[i]` is the number of bases emitted by moves `0..=i`.
pub fn move_cum_sums(moves: &[u8]) -> Vec<usize> {
    moves
        .iter()
        .scan(0usize, |total, &m| {
            *total += usize::from(m);
            Some(*total)
        })
        .collect()
}

/// First signal sample of each base, followed by `raw_len`.
///
/// The result has one entry per base plus a terminating entry, so base `i`
/// spans samples `map[i]..map[i + 1]`.
pub fn moves_to_map(moves: &[u8], stride: usize, raw_len: usize) -> Vec<usize> {
    let mut map: Vec<usize> = moves
        .iter()
        .enumerate()
        .filter(|&(_, &m)| m == 1)
        .map(|(i, _)| i * stride)
        .collect();
    map.push(raw_len);
    map
}

/// Expands a move table to one entry per signal sample.
///
/// Each move is followed by `stride - 1` zeros; the result is zero padded or
/// truncated to `signal_len`.
pub fn expand_moves(moves: &[u8], stride: usize, signal_len: usize) -> Vec<u8> {
    let mut expanded = vec![0u8; signal_len];
    for (i, &m) in moves.iter().enumerate() {
        let pos = i * stride;
        if pos >= signal_len {
            break;
        }
        expanded[pos] = m;
    }
    expanded
}

/// Phred score of one quality character.
pub fn qscore(q: u8) -> f32 {
    f32::from(q.saturating_sub(QSCORE_ASCII_OFFSET))
}

/// Quality character scaled for the stereo tensor.
pub fn qscore_to_float(q: u8) -> f32 {
    (f32::from(q) - f32::from(QSCORE_ASCII_OFFSET)) / QSCORE_STEREO_SCALE
}

/// Mean quality of a read, averaged in error-probability space.
///
/// Returns 0 for an empty quality string.
pub fn mean_qscore(qstring: &str) -> f32 {
    if qstring.is_empty() {
        return 0.0;
    }
    let total_error: f64 = qstring
        .bytes()
        .map(|q| 10f64.powf(-f64::from(qscore(q)) / 10.0))
        .sum();
    let mean_error = total_error / qstring.len() as f64;
    (-10.0 * mean_error.log10()) as f32
}
