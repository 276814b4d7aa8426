//! Model inputs for modified-base calling: motif hits, per-sample k-mer
//! encodings and fixed-size chunks centred on a base.

use crate::duplex::sequence::NUM_BASES;

/// Positions of the modifiable base in every (possibly overlapping) motif hit.
pub fn motif_hits(seq: &str, motif: &str, motif_offset: usize) -> Vec<usize> {
    let seq = seq.as_bytes();
    let motif = motif.as_bytes();
    if motif.is_empty() || motif.len() > seq.len() {
        return Vec::new();
    }
    seq.windows(motif.len())
        .enumerate()
        .filter(|(_, window)| window.eq_ignore_ascii_case(motif))
        .map(|(pos, _)| pos + motif_offset)
        .collect()
}

/// One-hot k-mer context for every signal sample of a basecalled read.
///
/// Row `s` holds `kmer_len` groups of four bytes. Group `k` one-hot encodes the
/// base at `b - bases_before + k`, where `b` is the base that sample `s` belongs
/// to. Bases outside the read or not in `ACGT` encode as all zeros.
#[derive(Debug, Clone)]
pub struct KmerEncoding {
    row_len: usize,
    data: Vec<u8>,
}

impl KmerEncoding {
    /// `seq_to_sig_map` has one entry per base plus the signal length.
    pub fn new(
        seq_ints: &[Option<usize>],
        seq_to_sig_map: &[usize],
        bases_before: usize,
        bases_after: usize,
    ) -> Self {
        let kmer_len = bases_before + bases_after + 1;
        let row_len = kmer_len * NUM_BASES;
        let signal_len = seq_to_sig_map.last().copied().unwrap_or(0);
        let mut data = vec![0u8; signal_len * row_len];

        let mut kmer = vec![0u8; row_len];
        for (base, bounds) in seq_to_sig_map.windows(2).enumerate() {
            kmer.fill(0);
            for k in 0..kmer_len {
                let Some(pos) = (base + k).checked_sub(bases_before) else {
                    continue;
                };
                if let Some(Some(b)) = seq_ints.get(pos) {
                    kmer[k * NUM_BASES + b] = 1;
                }
            }
            let end = bounds[1].min(signal_len);
            for sample in bounds[0]..end {
                data[sample * row_len..(sample + 1) * row_len].copy_from_slice(&kmer);
            }
        }

        Self { row_len, data }
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn num_samples(&self) -> usize {
        self.data.len() / self.row_len.max(1)
    }

    pub fn row(&self, sample: usize) -> Option<&[u8]> {
        self.data
            .get(sample * self.row_len..(sample + 1) * self.row_len)
    }
}

/// A model input window centred on one base.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub signal: Vec<f32>,
    pub kmers: Vec<u8>,
}

/// Cuts `context_before + context_after` samples around base `base`.
///
/// The centre is the middle of the base's samples. Samples outside the read are
/// zero in both the signal and the k-mer rows. Returns `None` for a base with no
/// entry in the map.
pub fn extract_chunk(
    signal: &[f32],
    kmers: &KmerEncoding,
    seq_to_sig_map: &[usize],
    base: usize,
    context_before: usize,
    context_after: usize,
) -> Option<Chunk> {
    let start = *seq_to_sig_map.get(base)?;
    let end = *seq_to_sig_map.get(base + 1)?;
    let centre = (start + end) / 2;
    let chunk_len = context_before + context_after;
    let row_len = kmers.row_len();

    let mut chunk = Chunk {
        signal: vec![0.0; chunk_len],
        kmers: vec![0; chunk_len * row_len],
    };
    for i in 0..chunk_len {
        let Some(sample) = (centre + i).checked_sub(context_before) else {
            continue;
        };
        if let Some(value) = signal.get(sample) {
            chunk.signal[i] = *value;
        }
        if let Some(row) = kmers.row(sample) {
            chunk.kmers[i * row_len..(i + 1) * row_len].copy_from_slice(row);
        }
    }
    Some(chunk)
}
