//! Core domain types for audiotrack.

pub mod pcm;
pub mod repeat;
pub mod stream;

pub use pcm::PcmBuffer;
pub use repeat::Repeat;
pub use stream::StreamSettings;
