//! # audiotrack
//!
//! Real-time audio tracks on top of cpal.
//!
//! Features:
//! - Output tracks playing live PCM or audio files, with smooth volume fades
//! - Repeat counts and end-of-file handlers that run off the audio thread
//! - Input tracks with a non-blocking, drop-oldest capture queue
//! - Streaming decode through a lock-free ring buffer, or whole-file decode
//! - FFmpeg conversion for files that do not match the stream
//! - A manually pumped device for offline rendering and tests

pub mod audiofile;
pub mod buffer;
pub mod config;
pub mod control;
pub mod convert;
pub mod decode;
pub mod device;
mod engine;
pub mod envelope;
mod events;
pub mod input;
pub mod output;
mod source;

pub use audiofile::{AudioFile, OnEnd};
pub use config::{config, set_config, update_config, Config};
pub use control::TrackState;
pub use convert::Converter;
pub use device::{AudioDevice, CpalDevice, ManualDevice, StreamHandle};
pub use events::TrackEvent;
pub use input::{InputTrack, InputTrackBuilder};
pub use output::{OutputTrack, OutputTrackBuilder, PlayOptions, QueueSender};

pub use audiotrack_core::{Error, PcmBuffer, Repeat, Result, StreamSettings};
