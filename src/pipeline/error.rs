//! Error types and reporting for pipeline stations.

use crate::error::DuplexError;
use std::fmt;

/// Errors that can occur while a station processes one message.
#[derive(Debug, Clone)]
pub enum StationError {
    /// Recoverable error that allows the station to continue processing.
    Recoverable(String),
    /// Fatal error that stops the worker that hit it.
    Fatal(String),
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            StationError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for StationError {}

impl From<candle_core::Error> for StationError {
    fn from(error: candle_core::Error) -> Self {
        StationError::Recoverable(format!("tensor operation failed: {error}"))
    }
}

impl From<DuplexError> for StationError {
    fn from(error: DuplexError) -> Self {
        match error {
            DuplexError::QueueClosed => StationError::Fatal(error.to_string()),
            other => StationError::Recoverable(other.to_string()),
        }
    }
}

/// Trait for reporting station errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a station.
    fn report(&self, station: &str, error: &StationError);
}

/// Reporter that forwards to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, station: &str, error: &StationError) {
        match error {
            StationError::Recoverable(_) => log::warn!("[{}] {}", station, error),
            StationError::Fatal(_) => log::error!("[{}] {}", station, error),
        }
    }
}
