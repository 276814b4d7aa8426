//! Default configuration constants for duplexflow.
//!
//! Shared by the configuration structs and the individual stations so that a
//! station built by hand behaves like one built from a config file.

use std::time::Duration;

/// Default bounded capacity of a node's input queue.
pub const QUEUE_CAPACITY: usize = 1000;

/// Interval at which idle workers and dispatch threads re-check for shutdown.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default number of worker threads for the split detector.
pub const SPLIT_WORKERS: usize = 5;

/// Default number of worker threads for the pairing index.
pub const PAIRING_WORKERS: usize = 2;

/// Default number of worker threads for stereo encoding.
pub const STEREO_WORKERS: usize = 4;

/// Default number of worker threads for the read filter.
pub const FILTER_WORKERS: usize = 2;

/// Default number of worker threads for the record formatter.
pub const RECORD_WORKERS: usize = 2;

/// Default number of worker threads for the modified-base caller.
pub const MODBASE_WORKERS: usize = 2;

/// Default chunk batch size for modified-base inference.
pub const MODBASE_BATCH_SIZE: usize = 1024;

/// Modification calls below this probability are left out of MM/ML tags.
pub const MODBASE_THRESHOLD: f32 = 0.05;

/// Default inference device.
pub const DEVICE: &str = "cpu";

/// Number of consecutive matching bases that delimit the confident alignment window.
pub const STEREO_TRIM_WINDOW: usize = 11;

/// The trimmed alignment must be strictly longer than this to be stereo encoded.
pub const MIN_TRIMMED_ALIGNMENT_LENGTH: usize = 50;

/// Alignment error rates at or above this reject a candidate pair.
pub const MAX_ALIGNMENT_ERROR_RATE: f32 = 0.2;

/// Fraction of the minimum observed signal used to pad stereo gaps.
pub const STEREO_PAD_FACTOR: f32 = 0.8;

/// Offset subtracted from an ASCII quality character.
pub const QSCORE_ASCII_OFFSET: u8 = 33;

/// Divisor mapping a phred score into the stereo quality channel.
pub const QSCORE_STEREO_SCALE: f32 = 90.0;

/// Maximum number of distinct pores tracked by implicit pairing.
pub const PAIRING_MAX_NUM_KEYS: usize = 10;

/// Maximum number of reads cached per pore by implicit pairing.
pub const PAIRING_MAX_NUM_READS: usize = 10;

/// Maximum gap between the end of a template and the start of its complement.
pub const PAIRING_MAX_TIME_DELTA_MS: u64 = 1000;

/// Minimum ratio of shorter to longer read length for an implicit pair.
pub const PAIRING_MIN_SEQ_LEN_RATIO: f32 = 0.2;

/// Head adapter with the first four bases clipped.
pub const DUPLEX_ADAPTER: &str = "TACTTCGTTCAGTTACGTATTGCT";

/// Report the inference backend compiled into this build.
pub fn gpu_backend() -> &'static str {
    if cfg!(feature = "cuda") { "CUDA" } else { "CPU" }
}
