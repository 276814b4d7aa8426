//! duplexflow - streaming duplex pipeline for nanopore signal
//!
//! Splits concatenated reads, pairs templates with their complements,
//! stereo-encodes the pairs and runs batched modified-base inference.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod config;
pub mod defaults;
pub mod duplex;
pub mod error;
pub mod loader;
pub mod modbase;
pub mod pipeline;

// Core traits (source → process → sink)
pub use loader::{DataLoader, ReadOrder, ReadSelection, SignalStore};
pub use modbase::{ModBaseModel, ModelLoader};
pub use pipeline::station::{MessageSink, Station};

// Pipeline
pub use pipeline::orchestrator::{Pipeline, PipelineHandle};
pub use pipeline::types::{Message, Read, ReadPair};

// Error handling
pub use error::{DuplexError, Result};

// Config
pub use config::Config;

// Station framework (for advanced users)
pub use pipeline::error::{ErrorReporter, StationError};
pub use pipeline::station::{Node, NodeOptions};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_contains_plus_when_git_hash_present() {
        let ver = version_string();
        if option_env!("GIT_HASH").is_some_and(|h| !h.is_empty()) {
            let hash_part = ver.split('+').nth(1).unwrap_or("");
            assert_eq!(hash_part.len(), 7, "Git hash should be 7 chars, got: {}", ver);
        } else {
            assert_eq!(ver, env!("CARGO_PKG_VERSION"));
        }
    }
}
