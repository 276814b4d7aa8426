//! Per-worker staging of chunks for the modified-base caller.

use crate::duplex::sequence::NUM_BASES;
use crate::error::{DuplexError, Result};
use crate::modbase::caller::ModBaseCaller;
use crate::modbase::encode::{self, Chunk};
use crate::modbase::params::ModBaseParams;
use crate::modbase::scaler::RoughRescaler;
use crate::pipeline::stats::NamedStats;
use candle_core::{Device, Tensor};
use std::sync::Arc;

/// Host-side input buffers for one model, sized for a full batch.
struct StagingBuffers {
    chunk_len: usize,
    kmer_row_len: usize,
    sigs: Vec<f32>,
    seqs: Vec<u8>,
}

/// Collects chunks into batches and submits them to a shared [`ModBaseCaller`].
///
/// Not shared between threads; each worker owns one.
pub struct ModBaseRunner {
    caller: Arc<ModBaseCaller>,
    buffers: Vec<StagingBuffers>,
    scalers: Vec<Option<RoughRescaler>>,
    num_batches_called: usize,
}

impl ModBaseRunner {
    pub fn new(caller: Arc<ModBaseCaller>) -> Self {
        let batch_size = caller.batch_size();
        let mut buffers = Vec::with_capacity(caller.num_models());
        let mut scalers = Vec::with_capacity(caller.num_models());
        for model_id in 0..caller.num_models() {
            let Ok(params) = caller.params(model_id) else {
                continue;
            };
            let chunk_len = params.chunk_len();
            let kmer_row_len = params.kmer_len() * NUM_BASES;
            buffers.push(StagingBuffers {
                chunk_len,
                kmer_row_len,
                sigs: vec![0.0; batch_size * chunk_len],
                seqs: vec![0; batch_size * chunk_len * kmer_row_len],
            });
            scalers.push(rescaler_for(params));
        }
        Self {
            caller,
            buffers,
            scalers,
            num_batches_called: 0,
        }
    }

    pub fn num_callers(&self) -> usize {
        self.buffers.len()
    }

    pub fn batch_size(&self) -> usize {
        self.caller.batch_size()
    }

    pub fn get_motif_hits(&self, model_id: usize, seq: &str) -> Result<Vec<usize>> {
        let params = self.caller.params(model_id)?;
        Ok(encode::motif_hits(seq, &params.motif, params.motif_offset))
    }

    /// Applies the model's rough rescale, if it has one.
    pub fn scale_signal(
        &self,
        model_id: usize,
        signal: &[f32],
        seq_ints: &[Option<usize>],
        seq_to_sig_map: &[usize],
    ) -> Vec<f32> {
        match self.scalers.get(model_id) {
            Some(Some(scaler)) => scaler.rescale(signal, seq_ints, seq_to_sig_map),
            _ => signal.to_vec(),
        }
    }

    /// Copies `chunk` into slot `chunk_idx` of the model's staging buffers.
    pub fn accept_chunk(&mut self, model_id: usize, chunk_idx: usize, chunk: &Chunk) -> Result<()> {
        let batch_size = self.caller.batch_size();
        let buffers = self.buffers.get_mut(model_id).ok_or_else(|| {
            DuplexError::Other(format!("no modified-base model with id {model_id}"))
        })?;
        if chunk_idx >= batch_size
            || chunk.signal.len() != buffers.chunk_len
            || chunk.kmers.len() != buffers.chunk_len * buffers.kmer_row_len
        {
            return Err(DuplexError::Other(format!(
                "chunk {chunk_idx} does not fit the staging buffers of model {model_id}"
            )));
        }

        let sig_len = buffers.chunk_len;
        let seq_len = sig_len * buffers.kmer_row_len;
        buffers.sigs[chunk_idx * sig_len..(chunk_idx + 1) * sig_len].copy_from_slice(&chunk.signal);
        buffers.seqs[chunk_idx * seq_len..(chunk_idx + 1) * seq_len].copy_from_slice(&chunk.kmers);
        Ok(())
    }

    /// Runs the first `num_chunks` staged chunks; returns `[num_chunks, num_mods + 1]`.
    pub fn call_chunks(&mut self, model_id: usize, num_chunks: usize) -> Result<Tensor> {
        let buffers = self.buffers.get(model_id).ok_or_else(|| {
            DuplexError::Other(format!("no modified-base model with id {model_id}"))
        })?;
        let num_chunks = num_chunks.min(self.caller.batch_size());
        let sig_len = buffers.chunk_len;
        let seq_len = sig_len * buffers.kmer_row_len;

        let sigs = Tensor::from_slice(
            &buffers.sigs[..num_chunks * sig_len],
            (num_chunks, 1, sig_len),
            &Device::Cpu,
        )?;
        let seqs = Tensor::from_slice(
            &buffers.seqs[..num_chunks * seq_len],
            (num_chunks, sig_len, buffers.kmer_row_len),
            &Device::Cpu,
        )?;

        let out = self.caller.call_chunks(model_id, &sigs, &seqs, num_chunks)?;
        self.num_batches_called += 1;
        Ok(out)
    }

    pub fn sample_stats(&self) -> NamedStats {
        let mut stats = self.caller.sample_stats();
        stats.insert(
            "runner_batches_called".to_string(),
            self.num_batches_called as f64,
        );
        stats
    }
}

fn rescaler_for(params: &ModBaseParams) -> Option<RoughRescaler> {
    if !params.refine_do_rough_rescale || params.refine_kmer_levels.is_empty() {
        return None;
    }
    Some(RoughRescaler::new(
        params.refine_kmer_levels.clone(),
        params.refine_kmer_len,
        params.refine_kmer_center_idx,
    ))
}
