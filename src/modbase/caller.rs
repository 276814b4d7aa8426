//! Batched modified-base inference.
//!
//! Each loaded model gets a dispatch thread that owns its device context. Callers
//! hand over a batch with [`ModBaseCaller::call_chunks`] and block until the
//! dispatch thread has run it. Requests are pushed at the front of the model's
//! queue and taken from the back.

use crate::defaults;
use crate::error::{DuplexError, Result};
use crate::modbase::params::ModBaseParams;
use crate::pipeline::stats::NamedStats;
use candle_core::{DType, Device, Tensor};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// A modified-base network.
///
/// `sigs` is `[batch, 1, chunk_len]`, `seqs` is `[batch, chunk_len, 4 * kmer_len]`,
/// both in the caller's element type. The output is `[batch, num_mods + 1]`:
/// the canonical probability followed by one per modification.
pub trait ModBaseModel: Send + Sync {
    fn forward(&self, sigs: &Tensor, seqs: &Tensor) -> candle_core::Result<Tensor>;
}

impl<T: ModBaseModel> ModBaseModel for Arc<T> {
    fn forward(&self, sigs: &Tensor, seqs: &Tensor) -> candle_core::Result<Tensor> {
        (**self).forward(sigs, seqs)
    }
}

/// Builds a model from a model directory for a device and element type.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_dir: &Path, device: &Device, dtype: DType)
    -> Result<Arc<dyn ModBaseModel>>;
}

/// Resolves a device name to a candle device and the element type used on it.
///
/// `metal` runs on the CPU path.
pub fn parse_device(device: &str) -> Result<(Device, DType)> {
    match device {
        "cpu" => Ok((Device::Cpu, DType::F32)),
        "metal" => {
            log::debug!("metal requested, running modified-base models on cpu");
            Ok((Device::Cpu, DType::F32))
        }
        "cuda" => Ok((Device::new_cuda(0)?, DType::F16)),
        other => {
            let ordinal = other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| DuplexError::ConfigInvalidValue {
                    key: "device".to_string(),
                    message: format!("unknown device '{other}', expected cpu, metal or cuda:N"),
                })?;
            Ok((Device::new_cuda(ordinal)?, DType::F16))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One pending batch and the slot its result is written to.
struct ModBaseTask {
    sigs: Tensor,
    seqs: Tensor,
    num_chunks: usize,
    output: Mutex<Option<candle_core::Result<Tensor>>>,
    done: Condvar,
}

impl ModBaseTask {
    fn complete(&self, result: candle_core::Result<Tensor>) {
        *lock(&self.output) = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> candle_core::Result<Tensor> {
        let mut output = lock(&self.output);
        loop {
            if let Some(result) = output.take() {
                return result;
            }
            output = self
                .done
                .wait(output)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct ModelSlot {
    model: Arc<dyn ModBaseModel>,
    params: ModBaseParams,
    queue: Mutex<VecDeque<Arc<ModBaseTask>>>,
    input_ready: Condvar,
}

#[derive(Default)]
struct CallerCounters {
    terminate: AtomicBool,
    batches_called: AtomicU64,
    model_ms: AtomicU64,
}

pub struct ModBaseCaller {
    device_name: String,
    device: Device,
    dtype: DType,
    batch_size: usize,
    slots: Vec<Arc<ModelSlot>>,
    counters: Arc<CallerCounters>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ModBaseCaller {
    /// Loads every model directory and starts one dispatch thread per model.
    pub fn load(
        model_dirs: &[PathBuf],
        batch_size: usize,
        device: &str,
        loader: &dyn ModelLoader,
    ) -> Result<Self> {
        let (candle_device, dtype) = parse_device(device)?;
        let mut models = Vec::with_capacity(model_dirs.len());
        for dir in model_dirs {
            let params = ModBaseParams::parse(dir)?;
            let model = loader.load(dir, &candle_device, dtype)?;
            log::debug!(
                "loaded modified-base model {} (motif {}, mods {})",
                dir.display(),
                params.motif,
                params.mod_bases
            );
            models.push((model, params));
        }
        Self::start(models, batch_size, device, candle_device, dtype)
    }

    /// Starts the caller with already constructed models.
    pub fn with_models(
        models: Vec<(Arc<dyn ModBaseModel>, ModBaseParams)>,
        batch_size: usize,
        device: &str,
    ) -> Result<Self> {
        let (candle_device, dtype) = parse_device(device)?;
        Self::start(models, batch_size, device, candle_device, dtype)
    }

    fn start(
        models: Vec<(Arc<dyn ModBaseModel>, ModBaseParams)>,
        batch_size: usize,
        device_name: &str,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(DuplexError::ConfigInvalidValue {
                key: "batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let slots: Vec<Arc<ModelSlot>> = models
            .into_iter()
            .map(|(model, params)| {
                Arc::new(ModelSlot {
                    model,
                    params,
                    queue: Mutex::new(VecDeque::new()),
                    input_ready: Condvar::new(),
                })
            })
            .collect();

        let caller = Self {
            device_name: device_name.to_string(),
            device,
            dtype,
            batch_size,
            slots,
            counters: Arc::new(CallerCounters::default()),
            threads: Mutex::new(Vec::new()),
        };

        for (model_id, slot) in caller.slots.iter().enumerate() {
            let slot = Arc::clone(slot);
            let counters = Arc::clone(&caller.counters);
            // On failure `caller` is dropped, which stops the threads already started.
            let handle = thread::Builder::new()
                .name(format!("modbase-dispatch-{model_id}"))
                .spawn(move || dispatch_loop(&slot, &counters))?;
            lock(&caller.threads).push(handle);
        }

        Ok(caller)
    }

    /// Runs `num_chunks` chunks through model `model_id`, blocking until done.
    ///
    /// Inputs are copied to the caller's device and element type. The result
    /// lives on the CPU and has `num_chunks` rows.
    pub fn call_chunks(
        &self,
        model_id: usize,
        sigs: &Tensor,
        seqs: &Tensor,
        num_chunks: usize,
    ) -> Result<Tensor> {
        let slot = self.slot(model_id)?;
        let task = Arc::new(ModBaseTask {
            sigs: sigs.to_device(&self.device)?.to_dtype(self.dtype)?,
            seqs: seqs.to_device(&self.device)?.to_dtype(self.dtype)?,
            num_chunks,
            output: Mutex::new(None),
            done: Condvar::new(),
        });

        {
            let mut queue = lock(&slot.queue);
            if self.counters.terminate.load(Ordering::SeqCst) {
                return Err(DuplexError::QueueClosed);
            }
            queue.push_front(Arc::clone(&task));
        }
        slot.input_ready.notify_one();

        Ok(task.wait()?)
    }

    /// Stops all dispatch threads once their queues are empty.
    pub fn terminate(&self) {
        self.counters.terminate.store(true, Ordering::SeqCst);
        for slot in &self.slots {
            slot.input_ready.notify_all();
        }
    }

    pub fn params(&self, model_id: usize) -> Result<&ModBaseParams> {
        Ok(&self.slot(model_id)?.params)
    }

    pub fn num_models(&self) -> usize {
        self.slots.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn name(&self) -> String {
        format!("ModBaseCaller_{}", self.device_name)
    }

    pub fn sample_stats(&self) -> NamedStats {
        let mut stats = NamedStats::new();
        stats.insert(
            "batches_called".to_string(),
            self.counters.batches_called.load(Ordering::Relaxed) as f64,
        );
        stats.insert(
            "model_ms".to_string(),
            self.counters.model_ms.load(Ordering::Relaxed) as f64,
        );
        stats
    }

    fn slot(&self, model_id: usize) -> Result<&ModelSlot> {
        self.slots
            .get(model_id)
            .map(Arc::as_ref)
            .ok_or_else(|| DuplexError::Other(format!("no modified-base model with id {model_id}")))
    }
}

impl Drop for ModBaseCaller {
    fn drop(&mut self) {
        self.terminate();
        for handle in lock(&self.threads).drain(..) {
            if handle.join().is_err() {
                log::error!("modified-base dispatch thread panicked");
            }
        }
    }
}

fn dispatch_loop(slot: &ModelSlot, counters: &CallerCounters) {
    loop {
        let task = {
            let mut queue = lock(&slot.queue);
            while queue.is_empty() && !counters.terminate.load(Ordering::SeqCst) {
                queue = slot
                    .input_ready
                    .wait_timeout(queue, defaults::POLL_INTERVAL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            match queue.pop_back() {
                Some(task) => task,
                // Empty and terminated.
                None => return,
            }
        };

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            slot.model.forward(&task.sigs, &task.seqs)
        }))
        .unwrap_or_else(|_| Err(candle_core::Error::Msg("model forward panicked".to_string())))
        .and_then(|out| out.to_device(&Device::Cpu))
        .and_then(|out| {
            if out.dim(0)? > task.num_chunks {
                out.narrow(0, 0, task.num_chunks)
            } else {
                Ok(out)
            }
        });

        counters
            .model_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        counters.batches_called.fetch_add(1, Ordering::Relaxed);
        task.complete(result);
    }
}

/// Model used in tests and benchmarks.
///
/// By default column 0 is the mean of each chunk's signal and the remaining
/// columns the mean of its sequence encoding, so outputs can be checked against
/// inputs. `with_response` returns a fixed row for every chunk instead.
#[derive(Debug)]
pub struct MockModel {
    num_outputs: usize,
    response: Option<Vec<f32>>,
    should_fail: bool,
    calls: AtomicUsize,
}

impl MockModel {
    pub fn new(num_outputs: usize) -> Self {
        Self {
            num_outputs: num_outputs.max(1),
            response: None,
            should_fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_response(mut self, probs: Vec<f32>) -> Self {
        self.num_outputs = probs.len();
        self.response = Some(probs);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModBaseModel for MockModel {
    fn forward(&self, sigs: &Tensor, seqs: &Tensor) -> candle_core::Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(candle_core::Error::Msg("mock model failure".to_string()));
        }

        let batch = sigs.dim(0)?;
        if let Some(probs) = &self.response {
            let rows = probs.repeat(batch);
            return Tensor::from_vec(rows, (batch, probs.len()), sigs.device())?
                .to_dtype(sigs.dtype());
        }

        let sig_mean = sigs.flatten_from(1)?.mean_keepdim(1)?;
        let seq_mean = seqs.to_dtype(sigs.dtype())?.flatten_from(1)?.mean_keepdim(1)?;
        let mut columns = vec![&sig_mean];
        columns.extend(std::iter::repeat_n(&seq_mean, self.num_outputs - 1));
        Tensor::cat(&columns, 1)
    }
}

/// Loader handing out [`MockModel`]s.
#[derive(Debug, Default)]
pub struct MockModelLoader {
    response: Option<Vec<f32>>,
    should_fail: bool,
}

impl MockModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, probs: Vec<f32>) -> Self {
        self.response = Some(probs);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

impl ModelLoader for MockModelLoader {
    fn load(
        &self,
        model_dir: &Path,
        _device: &Device,
        _dtype: DType,
    ) -> Result<Arc<dyn ModBaseModel>> {
        if self.should_fail {
            return Err(DuplexError::ModelLoad {
                path: model_dir.display().to_string(),
                message: "mock loader failure".to_string(),
            });
        }
        let params = ModBaseParams::parse(model_dir)?;
        let model = match &self.response {
            Some(probs) => MockModel::new(probs.len()).with_response(probs.clone()),
            None => MockModel::new(params.base_mod_count + 1),
        };
        Ok(Arc::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbase::params::{CONFIG_FILE, CPG_CONFIG};
    use tempfile::tempdir;

    fn cpg_params() -> ModBaseParams {
        ModBaseParams::from_toml(CPG_CONFIG).unwrap()
    }

    fn caller_with(model: MockModel) -> (ModBaseCaller, Arc<MockModel>) {
        let model = Arc::new(model);
        let dyn_model: Arc<dyn ModBaseModel> = Arc::new(Arc::clone(&model));
        let caller = ModBaseCaller::with_models(vec![(dyn_model, cpg_params())], 4, "cpu").unwrap();
        (caller, model)
    }

    fn inputs(batch: usize, value: f32) -> (Tensor, Tensor) {
        let sigs = Tensor::full(value, (batch, 1, 8), &Device::Cpu).unwrap();
        let seqs = Tensor::zeros((batch, 8, 36), DType::U8, &Device::Cpu).unwrap();
        (sigs, seqs)
    }

    #[test]
    fn test_parse_device() {
        let (device, dtype) = parse_device("cpu").unwrap();
        assert!(device.is_cpu());
        assert_eq!(dtype, DType::F32);

        let (device, dtype) = parse_device("metal").unwrap();
        assert!(device.is_cpu());
        assert_eq!(dtype, DType::F32);

        assert!(matches!(
            parse_device("tpu:0"),
            Err(DuplexError::ConfigInvalidValue { .. })
        ));
    }

    #[test]
    fn test_call_chunks_returns_model_output() {
        let (caller, model) = caller_with(MockModel::new(3));
        let (sigs, seqs) = inputs(2, 0.5);

        let out = caller.call_chunks(0, &sigs, &seqs, 2).unwrap();

        assert_eq!(out.dims(), &[2, 3]);
        let rows = out.to_vec2::<f32>().unwrap();
        assert!((rows[0][0] - 0.5).abs() < 1e-6);
        assert_eq!(rows[1][1], 0.0);
        assert_eq!(model.calls(), 1);
        assert_eq!(caller.sample_stats()["batches_called"], 1.0);
    }

    #[test]
    fn test_output_is_narrowed_to_num_chunks() {
        let (caller, _) = caller_with(MockModel::new(1).with_response(vec![0.25, 0.75]));
        let (sigs, seqs) = inputs(4, 1.0);
        let out = caller.call_chunks(0, &sigs, &seqs, 3).unwrap();
        assert_eq!(out.dims(), &[3, 2]);
    }

    #[test]
    fn test_concurrent_calls_match_direct_forward() {
        let (caller, model) = caller_with(MockModel::new(3));
        let caller = Arc::new(caller);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let caller = Arc::clone(&caller);
                thread::spawn(move || {
                    let (sigs, seqs) = inputs(2, i as f32);
                    let out = caller.call_chunks(0, &sigs, &seqs, 2).unwrap();
                    (i, out.to_vec2::<f32>().unwrap())
                })
            })
            .collect();

        for handle in handles {
            let (i, rows) = handle.join().unwrap();
            let (sigs, seqs) = inputs(2, i as f32);
            let direct = MockModel::new(3)
                .forward(&sigs, &seqs)
                .unwrap()
                .to_vec2::<f32>()
                .unwrap();
            assert_eq!(rows, direct);
        }
        assert_eq!(model.calls(), 8);
        assert_eq!(caller.sample_stats()["batches_called"], 8.0);
    }

    #[test]
    fn test_model_failure_is_returned_to_caller() {
        let (caller, _) = caller_with(MockModel::new(3).with_failure());
        let (sigs, seqs) = inputs(1, 0.0);
        assert!(matches!(
            caller.call_chunks(0, &sigs, &seqs, 1),
            Err(DuplexError::Inference(_))
        ));
    }

    #[test]
    fn test_call_after_terminate_is_rejected() {
        let (caller, model) = caller_with(MockModel::new(3));
        caller.terminate();
        let (sigs, seqs) = inputs(1, 0.0);
        assert!(matches!(
            caller.call_chunks(0, &sigs, &seqs, 1),
            Err(DuplexError::QueueClosed)
        ));
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn test_unknown_model_id() {
        let (caller, _) = caller_with(MockModel::new(3));
        let (sigs, seqs) = inputs(1, 0.0);
        assert!(caller.call_chunks(1, &sigs, &seqs, 1).is_err());
        assert!(caller.params(1).is_err());
        assert_eq!(caller.params(0).unwrap().motif, "CG");
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        let model: Arc<dyn ModBaseModel> = Arc::new(MockModel::new(3));
        assert!(ModBaseCaller::with_models(vec![(model, cpg_params())], 0, "cpu").is_err());
    }

    #[test]
    fn test_load_from_model_dirs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), CPG_CONFIG).unwrap();

        let caller = ModBaseCaller::load(
            &[dir.path().to_path_buf()],
            16,
            "cpu",
            &MockModelLoader::new(),
        )
        .unwrap();

        assert_eq!(caller.num_models(), 1);
        assert_eq!(caller.batch_size(), 16);
        assert_eq!(caller.dtype(), DType::F32);
        assert_eq!(caller.name(), "ModBaseCaller_cpu");
    }

    #[test]
    fn test_load_failure_propagates() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), CPG_CONFIG).unwrap();
        let result = ModBaseCaller::load(
            &[dir.path().to_path_buf()],
            16,
            "cpu",
            &MockModelLoader::new().with_failure(),
        );
        assert!(matches!(result, Err(DuplexError::ModelLoad { .. })));
    }

    /// Records the signal value of every batch and holds each one until released.
    struct GatedModel {
        started: crossbeam_channel::Sender<()>,
        release: crossbeam_channel::Receiver<()>,
        seen: Mutex<Vec<f32>>,
    }

    impl ModBaseModel for GatedModel {
        fn forward(&self, sigs: &Tensor, seqs: &Tensor) -> candle_core::Result<Tensor> {
            let value = sigs.flatten_all()?.get(0)?.to_scalar::<f32>()?;
            lock(&self.seen).push(value);
            let _ = self.started.send(());
            let _ = self.release.recv();
            MockModel::new(1).forward(sigs, seqs)
        }
    }

    fn wait_for_queue_len(caller: &ModBaseCaller, len: usize) {
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while lock(&caller.slots[0].queue).len() < len {
            assert!(Instant::now() < deadline, "queue never reached {len} tasks");
            thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn test_requests_dispatched_in_arrival_order() {
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let model = Arc::new(GatedModel {
            started: started_tx,
            release: release_rx,
            seen: Mutex::new(Vec::new()),
        });
        let dyn_model: Arc<dyn ModBaseModel> = Arc::new(Arc::clone(&model));
        let caller = Arc::new(
            ModBaseCaller::with_models(vec![(dyn_model, cpg_params())], 4, "cpu").unwrap(),
        );

        let submit = |value: f32| {
            let caller = Arc::clone(&caller);
            thread::spawn(move || {
                let (sigs, seqs) = inputs(1, value);
                caller.call_chunks(0, &sigs, &seqs, 1).unwrap();
            })
        };

        // The first batch occupies the dispatch thread while the rest queue up
        let first = submit(0.0);
        started_rx.recv().unwrap();
        let second = submit(1.0);
        wait_for_queue_len(&caller, 1);
        let third = submit(2.0);
        wait_for_queue_len(&caller, 2);

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        for handle in [first, second, third] {
            handle.join().unwrap();
        }

        assert_eq!(*lock(&model.seen), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_caller_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ModBaseCaller>();
    }
}
