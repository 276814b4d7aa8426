//! Rough signal rescaling against expected k-mer current levels.

use crate::duplex::sequence::NUM_BASES;

/// Fits `levels ≈ scale * signal + shift` by least squares over per-base means.
#[derive(Debug, Clone)]
pub struct RoughRescaler {
    kmer_levels: Vec<f32>,
    kmer_len: usize,
    center_idx: usize,
}

impl RoughRescaler {
    pub fn new(kmer_levels: Vec<f32>, kmer_len: usize, center_idx: usize) -> Self {
        Self {
            kmer_levels,
            kmer_len,
            center_idx,
        }
    }

    /// Expected level of the k-mer centred on `base`, if it lies fully inside
    /// the read and contains only canonical bases.
    pub fn expected_level(&self, seq_ints: &[Option<usize>], base: usize) -> Option<f32> {
        let first = base.checked_sub(self.center_idx)?;
        let kmer = seq_ints.get(first..first + self.kmer_len)?;
        let index = kmer
            .iter()
            .try_fold(0usize, |acc, b| b.map(|b| acc * NUM_BASES + b))?;
        self.kmer_levels.get(index).copied()
    }

    /// Returns `(scale, shift)`, or `None` when the read has too few usable
    /// bases or no signal variance.
    pub fn fit(
        &self,
        signal: &[f32],
        seq_ints: &[Option<usize>],
        seq_to_sig_map: &[usize],
    ) -> Option<(f32, f32)> {
        let mut points = Vec::with_capacity(seq_ints.len());
        for (base, bounds) in seq_to_sig_map.windows(2).enumerate() {
            let Some(samples) = signal.get(bounds[0]..bounds[1]) else {
                continue;
            };
            if samples.is_empty() {
                continue;
            }
            let Some(level) = self.expected_level(seq_ints, base) else {
                continue;
            };
            let mean = samples.iter().map(|&s| f64::from(s)).sum::<f64>() / samples.len() as f64;
            points.push((mean, f64::from(level)));
        }
        if points.len() < 2 {
            return None;
        }

        let n = points.len() as f64;
        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
        let (mut cov, mut var) = (0.0, 0.0);
        for (x, y) in &points {
            cov += (x - mean_x) * (y - mean_y);
            var += (x - mean_x) * (x - mean_x);
        }
        if var <= f64::EPSILON {
            return None;
        }
        let scale = cov / var;
        let shift = mean_y - scale * mean_x;
        Some((scale as f32, shift as f32))
    }

    /// Rescales `signal`, or returns it unchanged when no fit is possible.
    pub fn rescale(
        &self,
        signal: &[f32],
        seq_ints: &[Option<usize>],
        seq_to_sig_map: &[usize],
    ) -> Vec<f32> {
        match self.fit(signal, seq_ints, seq_to_sig_map) {
            Some((scale, shift)) => signal.iter().map(|s| scale * s + shift).collect(),
            None => {
                log::trace!("rough rescale skipped, no usable fit");
                signal.to_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duplex::sequence::sequence_to_ints;

    /// 1-mer levels A=0, C=1, G=2, T=3.
    fn one_mer() -> RoughRescaler {
        RoughRescaler::new(vec![0.0, 1.0, 2.0, 3.0], 1, 0)
    }

    #[test]
    fn test_expected_level_index() {
        // 2-mers, centre on the second base: level index = 4 * prev + this.
        let levels: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let scaler = RoughRescaler::new(levels, 2, 1);
        let seq = sequence_to_ints("ACGT");
        assert_eq!(scaler.expected_level(&seq, 0), None);
        assert_eq!(scaler.expected_level(&seq, 1), Some(1.0));
        assert_eq!(scaler.expected_level(&seq, 3), Some(11.0));
    }

    #[test]
    fn test_expected_level_skips_unknown_base() {
        let seq = sequence_to_ints("ANT");
        assert_eq!(one_mer().expected_level(&seq, 1), None);
        assert_eq!(one_mer().expected_level(&seq, 2), Some(3.0));
    }

    #[test]
    fn test_fit_recovers_linear_transform() {
        let seq = sequence_to_ints("ACGTAC");
        let map = [0, 2, 4, 6, 8, 10, 12];
        // signal = (level - 1) / 2, so level = 2 * signal + 1
        let signal: Vec<f32> = [0.0f32, 1.0, 2.0, 3.0, 0.0, 1.0]
            .iter()
            .flat_map(|l| [(l - 1.0) / 2.0; 2])
            .collect();

        let (scale, shift) = one_mer().fit(&signal, &seq, &map).unwrap();
        assert!((scale - 2.0).abs() < 1e-5);
        assert!((shift - 1.0).abs() < 1e-5);

        let rescaled = one_mer().rescale(&signal, &seq, &map);
        assert!((rescaled[4] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_flat_signal_is_unchanged() {
        let seq = sequence_to_ints("ACGT");
        let map = [0, 1, 2, 3, 4];
        let signal = vec![0.5; 4];
        assert!(one_mer().fit(&signal, &seq, &map).is_none());
        assert_eq!(one_mer().rescale(&signal, &seq, &map), signal);
    }
}
