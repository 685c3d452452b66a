//! Library configuration.
//!
//! A process-wide [`Config`] supplies defaults for tracks built through the
//! builders and tells the converter where to put converted files. It can be
//! replaced at startup or loaded from a JSON file.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::{Path, PathBuf};

use audiotrack_core::{Result, StreamSettings};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tunables for tracks and file conversion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory that receives converted copies of unplayable files.
    pub conversion_path: PathBuf,
    /// ffmpeg binary used for conversion.
    pub ffmpeg_path: PathBuf,
    /// Frames per device callback.
    pub block_size: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Initial gain of new output tracks.
    pub default_volume: f32,
    /// Ramp length in seconds used by `set_volume_default`.
    pub default_smoothness: f32,
    /// Blocks an input track keeps before dropping the oldest.
    pub input_queue_capacity: usize,
    /// Blocks an output track's live queue keeps before dropping the oldest.
    pub output_queue_capacity: usize,
    /// Frames buffered ahead of the callback when streaming a file.
    pub stream_buffer_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conversion_path: default_conversion_path(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            block_size: 512,
            sample_rate: 48000,
            channels: 2,
            default_volume: 1.0,
            default_smoothness: 0.5,
            input_queue_capacity: 64,
            output_queue_capacity: 64,
            stream_buffer_frames: 48000,
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Stream shape new tracks use unless told otherwise.
    pub const fn stream_settings(&self) -> StreamSettings {
        StreamSettings::new(self.block_size, self.sample_rate, self.channels)
    }
}

fn default_conversion_path() -> PathBuf {
    ProjectDirs::from("", "", "audiotrack").map_or_else(
        || std::env::temp_dir().join("audiotrack").join("conversions"),
        |dirs| dirs.cache_dir().join("conversions"),
    )
}

static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));

/// Snapshot of the process-wide configuration.
pub fn config() -> Config {
    CONFIG.read().clone()
}

/// Replace the process-wide configuration.
pub fn set_config(config: Config) {
    *CONFIG.write() = config;
}

/// Edit the process-wide configuration in place.
pub fn update_config(f: impl FnOnce(&mut Config)) {
    f(&mut CONFIG.write());
}
