//! Device stream settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Shape of a device stream: how many frames each callback handles, at
/// which rate, with how many interleaved channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamSettings {
    /// Frames per device callback.
    pub block_size: u32,
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channels per frame.
    pub channels: u16,
}

impl StreamSettings {
    pub const fn new(block_size: u32, sample_rate: u32, channels: u16) -> Self {
        Self {
            block_size,
            sample_rate,
            channels,
        }
    }

    /// Reject settings no device can honour.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidArgument("block size must be non-zero".into()));
        }
        if self.sample_rate == 0 {
            return Err(Error::InvalidArgument("sample rate must be non-zero".into()));
        }
        if self.channels == 0 {
            return Err(Error::InvalidArgument("channel count must be non-zero".into()));
        }
        Ok(())
    }

    /// Interleaved samples in one block.
    pub const fn block_samples(&self) -> usize {
        self.block_size as usize * self.channels as usize
    }

    /// Wall-clock length of one block.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.block_size) / f64::from(self.sample_rate))
    }

    /// Number of frames covering `duration` at this rate, rounded.
    pub fn frames_for(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * f64::from(self.sample_rate)).round() as u64
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            block_size: 512,
            sample_rate: 48000,
            channels: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(StreamSettings::new(512, 16000, 1).validate().is_ok());
        assert!(StreamSettings::new(0, 16000, 1).validate().is_err());
        assert!(StreamSettings::new(512, 0, 1).validate().is_err());
        assert!(StreamSettings::new(512, 16000, 0).validate().is_err());
    }

    #[test]
    fn test_block_math() {
        let settings = StreamSettings::new(512, 16000, 2);
        assert_eq!(settings.block_samples(), 1024);
        assert_eq!(settings.block_duration(), Duration::from_millis(32));
        assert_eq!(settings.frames_for(Duration::from_millis(10)), 160);
    }
}
