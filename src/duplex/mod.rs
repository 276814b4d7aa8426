//! Duplex engines: split detection, pairing and stereo encoding.

pub mod alignment;
pub mod pairing;
pub mod sequence;
pub mod split;
pub mod stereo;

pub use pairing::{PairingIndex, PairingSettings, PairingStation};
pub use split::{DuplexSplitSettings, DuplexSplitStation, DuplexSplitter, SplitFinder};
pub use stereo::{StereoEncoder, StereoEncoderStation};
