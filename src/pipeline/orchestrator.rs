//! Builds the node chain from a [`Config`] and drives it to completion.
//!
//! Reads flow split detector → pairing → stereo encoder → modified-base
//! caller → read filter → record formatter → caller's sink. Duplex and
//! modified-base stages are only present when configured.

use crate::config::Config;
use crate::duplex::pairing::read_pair_list;
use crate::duplex::{
    DuplexSplitStation, PairingIndex, PairingStation, StereoEncoder, StereoEncoderStation,
};
use crate::error::{DuplexError, Result};
use crate::modbase::{ModBaseCaller, ModBaseCallerStation, ModelLoader};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::filter_station::ReadFilterStation;
use crate::pipeline::record_station::ReadToRecordStation;
use crate::pipeline::station::{MessageSink, Node, NodeOptions, Station};
use crate::pipeline::stats::{self, NamedStats};
use crate::pipeline::types::{Message, Read};
use std::sync::Arc;

/// A spawned node, seen without its station type.
trait RunningNode: Send + Sync {
    fn name(&self) -> &str;
    fn join(&self) -> std::result::Result<(), String>;
    fn sample_stats(&self) -> NamedStats;
}

impl<S: Station> RunningNode for Node<S> {
    fn name(&self) -> &str {
        MessageSink::name(self)
    }

    fn join(&self) -> std::result::Result<(), String> {
        Node::join(self)
    }

    fn sample_stats(&self) -> NamedStats {
        MessageSink::sample_stats(self)
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    input: Arc<dyn MessageSink>,
    /// Upstream first.
    nodes: Vec<Arc<dyn RunningNode>>,
}

impl PipelineHandle {
    /// Queues a read, blocking while the first node is full.
    pub fn push(&self, read: Read) -> Result<()> {
        self.input.push_message(read.into())
    }

    pub fn push_message(&self, message: Message) -> Result<()> {
        self.input.push_message(message)
    }

    /// The first node, e.g. for a [`crate::loader::DataLoader`].
    pub fn input(&self) -> Arc<dyn MessageSink> {
        Arc::clone(&self.input)
    }

    /// Names of the running nodes, upstream first.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }

    /// Counters of every node, keyed `node.counter`.
    pub fn stats(&self) -> NamedStats {
        let mut all = NamedStats::new();
        for node in &self.nodes {
            stats::merge_prefixed(&mut all, node.name(), node.sample_stats());
        }
        all
    }

    /// Terminates the input, waits for every node to drain and returns the
    /// final counters. The sink has been terminated when this returns.
    pub fn finish(self) -> Result<NamedStats> {
        self.input.terminate();
        let mut failures = Vec::new();
        for node in &self.nodes {
            if let Err(msg) = node.join() {
                failures.push(msg);
            }
        }
        let final_stats = self.stats();
        stats::log_stats("pipeline", &final_stats);
        if failures.is_empty() {
            Ok(final_stats)
        } else {
            Err(DuplexError::Other(failures.join("; ")))
        }
    }
}

/// Pipeline builder.
pub struct Pipeline {
    config: Config,
    error_reporter: Arc<dyn ErrorReporter>,
    modbase_caller: Option<Arc<ModBaseCaller>>,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            error_reporter: Arc::new(LogReporter),
            modbase_caller: None,
        }
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Uses an already running modified-base caller.
    pub fn with_modbase_caller(mut self, caller: Arc<ModBaseCaller>) -> Self {
        self.modbase_caller = Some(caller);
        self
    }

    /// Loads the configured modified-base models with `loader`.
    ///
    /// Does nothing when no model directories are configured.
    pub fn with_model_loader(mut self, loader: &dyn ModelLoader) -> Result<Self> {
        let pipeline = &self.config.pipeline;
        if pipeline.modbase_models.is_empty() {
            return Ok(self);
        }
        let caller = ModBaseCaller::load(
            &pipeline.modbase_models,
            pipeline.batch_size,
            &pipeline.device,
            loader,
        )?;
        self.modbase_caller = Some(Arc::new(caller));
        Ok(self)
    }

    /// Spawns every node, wiring the last one into `sink`.
    pub fn start(self, sink: Arc<dyn MessageSink>) -> Result<PipelineHandle> {
        let config = &self.config;
        let pipeline = &config.pipeline;
        let options = |workers: usize| NodeOptions::new(workers, pipeline.queue_capacity);

        // Built back to front so each node knows its downstream.
        let mut nodes: Vec<Arc<dyn RunningNode>> = Vec::new();
        let mut downstream = sink;

        let record = self.spawn(
            ReadToRecordStation::new(config.output.clone()),
            downstream,
            options(pipeline.record_workers),
        )?;
        downstream = record.clone();
        nodes.push(record);

        let filter = self.spawn(
            ReadFilterStation::new(config.filter.clone()),
            downstream,
            options(pipeline.filter_workers),
        )?;
        downstream = filter.clone();
        nodes.push(filter);

        if let Some(caller) = &self.modbase_caller {
            let modbase = self.spawn(
                ModBaseCallerStation::new(Arc::clone(caller)),
                downstream,
                options(pipeline.modbase_workers),
            )?;
            downstream = modbase.clone();
            nodes.push(modbase);
        }

        if pipeline.duplex {
            let stereo = self.spawn(
                StereoEncoderStation::new(StereoEncoder::default()),
                downstream,
                options(pipeline.stereo_workers),
            )?;
            downstream = stereo.clone();
            nodes.push(stereo);

            let index = match &pipeline.pair_list {
                Some(path) => PairingIndex::from_pair_list(read_pair_list(path)?),
                None => PairingIndex::implicit(config.pairing.clone()),
            };
            let pairing = self.spawn(
                PairingStation::new(index),
                downstream,
                options(pipeline.pairing_workers),
            )?;
            downstream = pairing.clone();
            nodes.push(pairing);

            let split = self.spawn(
                DuplexSplitStation::new(config.split.clone()),
                downstream,
                options(pipeline.split_workers),
            )?;
            downstream = split.clone();
            nodes.push(split);
        }

        nodes.reverse();
        log::info!(
            "pipeline started: {}",
            nodes.iter().map(|n| n.name()).collect::<Vec<_>>().join(" -> ")
        );
        Ok(PipelineHandle {
            input: downstream,
            nodes,
        })
    }

    fn spawn<S: Station>(
        &self,
        station: S,
        downstream: Arc<dyn MessageSink>,
        options: NodeOptions,
    ) -> Result<Arc<Node<S>>> {
        Node::spawn_with_reporter(station, downstream, options, Arc::clone(&self.error_reporter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sink::CollectorSink;
    use candle_core::{DType, Device, Tensor};

    fn simplex_config() -> Config {
        let mut config = Config::default();
        config.pipeline.duplex = false;
        config
    }

    fn read(id: &str) -> Read {
        let signal = Tensor::zeros(8, DType::F32, &Device::Cpu).unwrap();
        Read::new(id, signal).with_basecall("ACGT", "5555", vec![1, 1, 1, 1], 2)
    }

    #[test]
    fn test_simplex_chain_formats_records() {
        let sink = Arc::new(CollectorSink::new("out"));
        let handle = Pipeline::new(simplex_config()).start(sink.clone()).unwrap();
        assert_eq!(handle.node_names(), vec!["ReadFilter", "ReadToRecord"]);

        for i in 0..10 {
            handle.push(read(&format!("r{i}"))).unwrap();
        }
        let stats = handle.finish().unwrap();

        assert_eq!(sink.len(), 10);
        assert_eq!(sink.terminate_count(), 1);
        assert!(sink.terminated_after_all_messages());
        assert_eq!(stats["ReadToRecord.records_emitted"], 10.0);
        assert_eq!(stats["ReadFilter.reads_filtered"], 0.0);
    }

    #[test]
    fn test_duplex_chain_layout() {
        let sink = Arc::new(CollectorSink::new("out"));
        let handle = Pipeline::new(Config::default()).start(sink.clone()).unwrap();
        assert_eq!(
            handle.node_names(),
            vec![
                "DuplexSplit",
                "Pairing",
                "StereoEncoder",
                "ReadFilter",
                "ReadToRecord"
            ]
        );
        handle.finish().unwrap();
        assert_eq!(sink.terminate_count(), 1);
    }

    #[test]
    fn test_missing_pair_list_fails_start() {
        let mut config = Config::default();
        config.pipeline.pair_list = Some("/nonexistent/pairs.txt".into());
        let sink = Arc::new(CollectorSink::new("out"));
        assert!(Pipeline::new(config).start(sink).is_err());
    }

    #[test]
    fn test_push_after_finish_fails() {
        let sink = Arc::new(CollectorSink::new("out"));
        let handle = Pipeline::new(simplex_config()).start(sink).unwrap();
        let input = handle.input();
        handle.finish().unwrap();
        assert!(matches!(
            input.push_message(read("late").into()),
            Err(DuplexError::QueueClosed)
        ));
    }

    #[test]
    fn test_no_models_configured_keeps_chain_short() {
        let sink = Arc::new(CollectorSink::new("out"));
        let pipeline = Pipeline::new(simplex_config())
            .with_model_loader(&crate::modbase::MockModelLoader::new())
            .unwrap();
        let handle = pipeline.start(sink).unwrap();
        assert_eq!(handle.node_names().len(), 2);
        handle.finish().unwrap();
    }
}
