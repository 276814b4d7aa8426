//! Modified-base calling: model parameters, the batching engine and the node
//! stage that scores motif hits.

pub mod caller;
pub mod encode;
pub mod params;
pub mod runner;
pub mod scaler;
pub mod station;

pub use caller::{MockModel, MockModelLoader, ModBaseCaller, ModBaseModel, ModelLoader};
pub use params::ModBaseParams;
pub use runner::ModBaseRunner;
pub use scaler::RoughRescaler;
pub use station::ModBaseCallerStation;
