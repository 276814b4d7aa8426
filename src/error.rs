//! Error types for duplexflow.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DuplexError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Model errors
    #[error("Failed to load model from {path}: {message}")]
    ModelLoad { path: String, message: String },

    #[error("Inference failed: {0}")]
    Inference(#[from] candle_core::Error),

    // Pipeline errors
    #[error("Push to terminated queue")]
    QueueClosed,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, DuplexError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_file_not_found_display() {
        let error = DuplexError::ConfigFileNotFound {
            path: "/models/5mCG/config.toml".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Configuration file not found at /models/5mCG/config.toml"
        );
    }

    #[test]
    fn test_config_invalid_value_display() {
        let error = DuplexError::ConfigInvalidValue {
            key: "motif_offset".to_string(),
            message: "must be inside the motif".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for motif_offset: must be inside the motif"
        );
    }

    #[test]
    fn test_model_load_display() {
        let error = DuplexError::ModelLoad {
            path: "/models/6mA".to_string(),
            message: "weights missing".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to load model from /models/6mA: weights missing"
        );
    }

    #[test]
    fn test_queue_closed_display() {
        assert_eq!(DuplexError::QueueClosed.to_string(), "Push to terminated queue");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: DuplexError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: DuplexError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: DuplexError = io_error.into();

        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<DuplexError>();
        assert_sync::<DuplexError>();
    }
}
