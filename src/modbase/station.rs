//! Node stage that attaches modified-base probabilities to basecalled reads.

use crate::duplex::sequence::{moves_to_map, sequence_to_ints};
use crate::modbase::caller::ModBaseCaller;
use crate::modbase::encode::{self, KmerEncoding};
use crate::modbase::params;
use crate::modbase::runner::ModBaseRunner;
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::stats::NamedStats;
use crate::pipeline::types::{BaseModInfo, Message, Read};
use candle_core::DType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Byte encoding of a probability: `min(floor(p * 256), 255)`.
pub fn quantize_probability(p: f32) -> u8 {
    (p * 256.0).floor().clamp(0.0, 255.0) as u8
}

pub struct ModBaseCallerStation {
    caller: Arc<ModBaseCaller>,
    info: Arc<BaseModInfo>,
    runners: Mutex<Vec<ModBaseRunner>>,
    reads_processed: AtomicU64,
    chunks_called: AtomicU64,
}

impl ModBaseCallerStation {
    pub fn new(caller: Arc<ModBaseCaller>) -> Self {
        let all_params: Vec<_> = (0..caller.num_models())
            .filter_map(|id| caller.params(id).ok())
            .collect();
        let info = Arc::new(params::base_mod_info(&all_params));
        Self {
            caller,
            info,
            runners: Mutex::new(Vec::new()),
            reads_processed: AtomicU64::new(0),
            chunks_called: AtomicU64::new(0),
        }
    }

    pub fn base_mod_info(&self) -> &Arc<BaseModInfo> {
        &self.info
    }

    /// Borrows an idle runner, creating one if every runner is busy.
    fn with_runner<R>(&self, f: impl FnOnce(&mut ModBaseRunner) -> R) -> R {
        let idle = self
            .runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut runner = idle.unwrap_or_else(|| ModBaseRunner::new(Arc::clone(&self.caller)));
        let result = f(&mut runner);
        self.runners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(runner);
        result
    }

    fn call_mods(&self, read: &mut Read) -> Result<(), StationError> {
        let signal = read.signal_f32()?;
        let seq_ints = sequence_to_ints(&read.seq);
        let seq_to_sig_map = moves_to_map(&read.moves, read.model_stride, signal.len());
        if seq_to_sig_map.len() != seq_ints.len() + 1 {
            return Err(StationError::Recoverable(format!(
                "{}: {} bases but {} moves",
                read.read_id,
                seq_ints.len(),
                seq_to_sig_map.len().saturating_sub(1)
            )));
        }

        let num_states = self.info.num_states();
        let mut probs = vec![0u8; seq_ints.len() * num_states];
        for (pos, base) in read.seq.bytes().enumerate() {
            if let Some(state) = self.info.canonical_state(base) {
                probs[pos * num_states + state] = u8::MAX;
            }
        }

        self.with_runner(|runner| -> Result<(), StationError> {
            for model_id in 0..runner.num_callers() {
                let params = self.caller.params(model_id)?;
                let Some(state_offset) = self.info.canonical_state(params.canonical_base()) else {
                    continue;
                };
                let hits = runner.get_motif_hits(model_id, &read.seq)?;
                if hits.is_empty() {
                    continue;
                }

                let scaled = runner.scale_signal(model_id, &signal, &seq_ints, &seq_to_sig_map);
                let kmers = KmerEncoding::new(
                    &seq_ints,
                    &seq_to_sig_map,
                    params.bases_before,
                    params.bases_after,
                );

                for batch in hits.chunks(runner.batch_size()) {
                    let mut staged = Vec::with_capacity(batch.len());
                    for &hit in batch {
                        let Some(chunk) = encode::extract_chunk(
                            &scaled,
                            &kmers,
                            &seq_to_sig_map,
                            hit,
                            params.context_before,
                            params.context_after,
                        ) else {
                            continue;
                        };
                        runner.accept_chunk(model_id, staged.len(), &chunk)?;
                        staged.push(hit);
                    }
                    if staged.is_empty() {
                        continue;
                    }

                    let rows = runner
                        .call_chunks(model_id, staged.len())?
                        .to_dtype(DType::F32)?
                        .to_vec2::<f32>()?;
                    for (hit, row) in staged.iter().zip(rows) {
                        let first = hit * num_states + state_offset;
                        for (j, p) in row.iter().take(params.base_mod_count + 1).enumerate() {
                            if let Some(slot) = probs.get_mut(first + j) {
                                *slot = quantize_probability(*p);
                            }
                        }
                    }
                    self.chunks_called
                        .fetch_add(staged.len() as u64, Ordering::Relaxed);
                }
            }
            Ok(())
        })?;

        read.base_mod_probs = Some(probs);
        read.base_mod_info = Some(Arc::clone(&self.info));
        Ok(())
    }
}

impl Station for ModBaseCallerStation {
    fn name(&self) -> &'static str {
        "ModBaseCaller"
    }

    fn process(&self, message: Message) -> Result<Vec<Message>, StationError> {
        let Message::Read(mut read) = message else {
            return Ok(vec![message]);
        };
        // Stereo-encoded and unbasecalled reads have nothing to score.
        if read.seq.is_empty() || read.moves.is_empty() || read.raw_data.rank() != 1 {
            return Ok(vec![Message::Read(read)]);
        }
        self.call_mods(&mut read)?;
        self.reads_processed.fetch_add(1, Ordering::Relaxed);
        Ok(vec![Message::Read(read)])
    }

    fn stats(&self) -> NamedStats {
        let mut stats = self.caller.sample_stats();
        stats.insert(
            "reads_processed".to_string(),
            self.reads_processed.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "chunks_called".to_string(),
            self.chunks_called.load(Ordering::Relaxed) as f64,
        );
        stats
    }

    fn shutdown(&self) {
        self.caller.terminate();
    }
}
