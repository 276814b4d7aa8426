//! Modified-base model parameters, read from a model directory.
//!
//! A model directory holds `config.toml` with a `[modbases]` table and, for
//! models that support rough rescaling, a `[refinement]` table plus the expected
//! k-mer current levels in `refine_kmer_levels.safetensors`.

use crate::error::{DuplexError, Result};
use crate::pipeline::types::BaseModInfo;
use candle_core::{DType, Device};
use serde::Deserialize;
use std::path::Path;

pub const CONFIG_FILE: &str = "config.toml";
pub const KMER_LEVELS_FILE: &str = "refine_kmer_levels.safetensors";
pub const KMER_LEVELS_TENSOR: &str = "refine_kmer_levels";

const CANONICAL_BASES: &str = "ACGT";

#[derive(Debug, Deserialize)]
struct RawModelConfig {
    modbases: RawModBases,
    refinement: Option<RawRefinement>,
}

#[derive(Debug, Deserialize)]
struct RawModBases {
    motif: String,
    motif_offset: usize,
    mod_bases: String,
    chunk_context_0: usize,
    chunk_context_1: usize,
    kmer_context_bases_0: usize,
    kmer_context_bases_1: usize,
    offset: usize,
    #[serde(flatten)]
    extra: toml::Table,
}

#[derive(Debug, Deserialize)]
struct RawRefinement {
    refine_do_rough_rescale: i64,
    refine_kmer_center_idx: Option<usize>,
}

/// Everything the caller needs to know about one modified-base model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModBaseParams {
    /// Sequence context the model scores, e.g. `CG`.
    pub motif: String,
    /// Position of the modifiable base within the motif.
    pub motif_offset: usize,
    /// One code per modification, e.g. `hm`.
    pub mod_bases: String,
    pub mod_long_names: Vec<String>,
    pub base_mod_count: usize,
    /// Signal samples before the base in each chunk.
    pub context_before: usize,
    /// Signal samples after the base in each chunk.
    pub context_after: usize,
    pub bases_before: usize,
    pub bases_after: usize,
    pub offset: usize,
    pub refine_do_rough_rescale: bool,
    pub refine_kmer_center_idx: usize,
    pub refine_kmer_levels: Vec<f32>,
    pub refine_kmer_len: usize,
}

impl ModBaseParams {
    /// Parses `config.toml` (and the k-mer levels, if used) from `model_dir`.
    pub fn parse(model_dir: &Path) -> Result<Self> {
        let config_path = model_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(DuplexError::ConfigFileNotFound {
                path: config_path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(&config_path)?;
        let mut params = Self::from_toml(&content)?;

        if params.refine_do_rough_rescale {
            params.refine_kmer_levels = load_kmer_levels(&model_dir.join(KMER_LEVELS_FILE))?;
            params.refine_kmer_len = kmer_len_for_levels(params.refine_kmer_levels.len())?;
            if params.refine_kmer_center_idx >= params.refine_kmer_len {
                return Err(invalid(
                    "refine_kmer_center_idx",
                    format!("must be below the k-mer length {}", params.refine_kmer_len),
                ));
            }
        }
        Ok(params)
    }

    /// Parses the model configuration text without touching the filesystem.
    ///
    /// K-mer levels are left empty.
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawModelConfig = toml::from_str(content)?;
        let modbases = raw.modbases;

        if modbases.motif.is_empty() {
            return Err(invalid("motif", "must not be empty"));
        }
        if modbases.motif_offset >= modbases.motif.len() {
            return Err(invalid(
                "motif_offset",
                format!("{} is outside motif {}", modbases.motif_offset, modbases.motif),
            ));
        }
        if modbases.mod_bases.is_empty() {
            return Err(invalid("mod_bases", "at least one modification is required"));
        }

        let mod_long_names = (0..modbases.mod_bases.len())
            .map(|i| {
                let key = format!("mod_long_names_{i}");
                modbases
                    .extra
                    .get(&key)
                    .and_then(toml::Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| invalid(&key, "missing or not a string"))
            })
            .collect::<Result<Vec<_>>>()?;

        let (refine_do_rough_rescale, refine_kmer_center_idx) = match raw.refinement {
            Some(refinement) if refinement.refine_do_rough_rescale == 1 => {
                let center = refinement.refine_kmer_center_idx.ok_or_else(|| {
                    invalid("refine_kmer_center_idx", "required when rough rescaling is on")
                })?;
                (true, center)
            }
            _ => (false, 0),
        };

        Ok(Self {
            base_mod_count: mod_long_names.len(),
            motif: modbases.motif.to_ascii_uppercase(),
            motif_offset: modbases.motif_offset,
            mod_bases: modbases.mod_bases,
            mod_long_names,
            context_before: modbases.chunk_context_0,
            context_after: modbases.chunk_context_1,
            bases_before: modbases.kmer_context_bases_0,
            bases_after: modbases.kmer_context_bases_1,
            offset: modbases.offset,
            refine_do_rough_rescale,
            refine_kmer_center_idx,
            refine_kmer_levels: Vec::new(),
            refine_kmer_len: 0,
        })
    }

    /// The canonical base this model scores.
    pub fn canonical_base(&self) -> u8 {
        self.motif.as_bytes().get(self.motif_offset).copied().unwrap_or(b'N')
    }

    /// Samples per chunk.
    pub fn chunk_len(&self) -> usize {
        self.context_before + self.context_after
    }

    /// Bases in each sequence context window.
    pub fn kmer_len(&self) -> usize {
        self.bases_before + self.bases_after + 1
    }
}

fn invalid(key: &str, message: impl Into<String>) -> DuplexError {
    DuplexError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn load_kmer_levels(path: &Path) -> Result<Vec<f32>> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| {
        DuplexError::ModelLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        }
    })?;
    let levels = tensors
        .get(KMER_LEVELS_TENSOR)
        .ok_or_else(|| DuplexError::ModelLoad {
            path: path.display().to_string(),
            message: format!("missing tensor {KMER_LEVELS_TENSOR}"),
        })?;
    Ok(levels.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

/// Length of the k-mers indexed by a table of `num_levels` levels (4^k entries).
pub fn kmer_len_for_levels(num_levels: usize) -> Result<usize> {
    if num_levels == 0 {
        return Err(invalid(KMER_LEVELS_TENSOR, "level table is empty"));
    }
    let kmer_len = ((num_levels as f64).ln() / 4f64.ln()).round() as usize;
    if 4usize.checked_pow(kmer_len as u32) != Some(num_levels) {
        return Err(invalid(
            KMER_LEVELS_TENSOR,
            format!("{num_levels} levels is not a power of four"),
        ));
    }
    Ok(kmer_len)
}

/// Combined modification alphabet for a set of models.
///
/// Each canonical base is followed by the codes of the models scoring it.
pub fn base_mod_info(models: &[&ModBaseParams]) -> BaseModInfo {
    let mut alphabet = String::new();
    let mut contexts = Vec::with_capacity(CANONICAL_BASES.len());
    let mut long_names = Vec::new();

    for canonical in CANONICAL_BASES.bytes() {
        alphabet.push(canonical as char);
        let mut context = "_".to_string();
        for params in models.iter().filter(|p| p.canonical_base() == canonical) {
            alphabet.push_str(&params.mod_bases);
            long_names.extend(params.mod_long_names.iter().cloned());
            context = params.motif.clone();
        }
        contexts.push(context);
    }

    BaseModInfo {
        alphabet,
        long_names: long_names.join(" "),
        context: contexts.join(":"),
    }
}

/// A 5hmC/5mC CpG model configuration used across unit tests.
#[cfg(test)]
pub(crate) const CPG_CONFIG: &str = r#"
[modbases]
motif = "CG"
motif_offset = 0
mod_bases = "hm"
mod_long_names_0 = "5hmC"
mod_long_names_1 = "5mC"
chunk_context_0 = 50
chunk_context_1 = 50
kmer_context_bases_0 = 4
kmer_context_bases_1 = 4
offset = 0
"#;
