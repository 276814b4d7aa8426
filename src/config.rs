use crate::defaults;
use crate::duplex::{DuplexSplitSettings, PairingSettings};
use crate::pipeline::filter_station::ReadFilterSettings;
use crate::pipeline::record_station::RecordSettings;
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub split: DuplexSplitSettings,
    pub pairing: PairingSettings,
    pub filter: ReadFilterSettings,
    pub output: RecordSettings,
}

/// Node layout, inference device and model configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Run split detection, pairing and stereo encoding.
    pub duplex: bool,
    /// Whitespace-separated `template complement` lines. Without one, pairs
    /// are found from pore identity and timing.
    pub pair_list: Option<PathBuf>,
    /// Modified-base model directories; empty disables modified-base calling.
    pub modbase_models: Vec<PathBuf>,
    pub device: String,
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub split_workers: usize,
    pub pairing_workers: usize,
    pub stereo_workers: usize,
    pub modbase_workers: usize,
    pub filter_workers: usize,
    pub record_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            duplex: true,
            pair_list: None,
            modbase_models: Vec::new(),
            device: defaults::DEVICE.to_string(),
            batch_size: defaults::MODBASE_BATCH_SIZE,
            queue_capacity: defaults::QUEUE_CAPACITY,
            split_workers: defaults::SPLIT_WORKERS,
            pairing_workers: defaults::PAIRING_WORKERS,
            stereo_workers: defaults::STEREO_WORKERS,
            modbase_workers: defaults::MODBASE_WORKERS,
            filter_workers: defaults::FILTER_WORKERS,
            record_workers: defaults::RECORD_WORKERS,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML or invalid values.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                log::debug!("no configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Checks values that parse but cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        let pipeline = &self.pipeline;
        if pipeline.batch_size == 0 {
            bail!("pipeline.batch_size must be at least 1");
        }
        if pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be at least 1");
        }
        let workers = [
            ("split_workers", pipeline.split_workers),
            ("pairing_workers", pipeline.pairing_workers),
            ("stereo_workers", pipeline.stereo_workers),
            ("modbase_workers", pipeline.modbase_workers),
            ("filter_workers", pipeline.filter_workers),
            ("record_workers", pipeline.record_workers),
        ];
        for (name, count) in workers {
            if count == 0 {
                bail!("pipeline.{name} must be at least 1");
            }
        }
        if self.split.adapter.len() > crate::duplex::split::MAX_ADAPTER_LEN {
            bail!(
                "split.adapter is longer than {} bases",
                crate::duplex::split::MAX_ADAPTER_LEN
            );
        }
        if !(0.0..=1.0).contains(&self.output.modbase_threshold) {
            bail!("output.modbase_threshold must be between 0 and 1");
        }
        Ok(())
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DUPLEXFLOW_DEVICE → pipeline.device
    /// - DUPLEXFLOW_BATCH_SIZE → pipeline.batch_size
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var("DUPLEXFLOW_DEVICE")
            && !device.is_empty()
        {
            self.pipeline.device = device;
        }

        if let Ok(batch_size) = std::env::var("DUPLEXFLOW_BATCH_SIZE")
            && !batch_size.is_empty()
        {
            match batch_size.parse::<usize>() {
                Ok(n) if n > 0 => self.pipeline.batch_size = n,
                _ => log::warn!("ignoring DUPLEXFLOW_BATCH_SIZE={batch_size}"),
            }
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/duplexflow/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duplexflow")
            .join("config.toml")
    }
}
