pub mod audio;
pub mod capture;
pub mod crypto;
pub mod decode;
pub mod engine;
pub mod jitter;
pub mod simulcast;
pub mod transport;
#[cfg(feature = "vpx")]
pub mod vpx;

pub use engine::{EngineCommand, EngineEvent, EngineIo, MediaEngine, VideoCodecs};
pub use transport::TransportHandle;
