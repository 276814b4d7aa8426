//! Streaming read pipeline.
//!
//! Each node owns a bounded queue and a pool of worker threads running one
//! station. Nodes are chained through the [`MessageSink`] capability, and
//! termination cascades downstream once every worker of a node has exited.

pub mod error;
pub mod filter_station;
pub mod orchestrator;
pub mod queue;
pub mod record_station;
pub mod sink;
pub mod station;
pub mod stats;
pub mod types;

pub use error::{ErrorReporter, LogReporter, StationError};
pub use filter_station::{ReadFilterSettings, ReadFilterStation};
pub use orchestrator::{Pipeline, PipelineHandle};
pub use queue::AsyncQueue;
pub use record_station::{ReadToRecordStation, RecordSettings};
pub use sink::{ChannelSink, CollectorSink};
pub use station::{MessageSink, Node, NodeOptions, Station};
pub use stats::NamedStats;
pub use types::{
    BaseModInfo, CandidatePairRejectedMessage, Message, PosRange, Read, ReadPair, SamRecord,
    UniquePoreIdentifierKey,
};
