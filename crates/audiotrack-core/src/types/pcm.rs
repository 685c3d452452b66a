//! Interleaved PCM blocks.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::time::Duration;

use crate::{Error, Result, StreamSettings};

/// A chunk of interleaved `f32` samples with its format.
///
/// Immutable once built: the engine hands these between threads and never
/// edits one in place.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl PcmBuffer {
    /// Wrap interleaved samples.
    ///
    /// The sample count must be a whole number of frames.
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(Error::InvalidArgument("PCM buffer needs at least one channel".into()));
        }
        if sample_rate == 0 {
            return Err(Error::InvalidArgument("PCM buffer needs a sample rate".into()));
        }
        if samples.len() % usize::from(channels) != 0 {
            return Err(Error::InvalidArgument(format!(
                "{} samples is not a whole number of {channels}-channel frames",
                samples.len()
            )));
        }

        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// A buffer of `frames` zeroed frames.
    pub fn silence(frames: usize, channels: u16, sample_rate: u32) -> Result<Self> {
        Self::new(vec![0.0; frames * usize::from(channels)], channels, sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub const fn channels(&self) -> u16 {
        self.channels
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_count(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_count() as f64 / f64::from(self.sample_rate))
    }

    /// Whether this buffer can be written to a stream without conversion.
    pub const fn matches(&self, settings: &StreamSettings) -> bool {
        self.channels == settings.channels && self.sample_rate == settings.sample_rate
    }
}
