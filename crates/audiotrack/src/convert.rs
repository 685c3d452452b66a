//! FFmpeg-based conversion of files the decoder cannot play as-is.
//!
//! A file is playable when symphonia can open it and its sample rate and
//! channel count match the stream it is going to. Anything else is
//! transcoded to 16-bit PCM WAV in the conversion directory. Converted files
//! are kept and reused on later calls; their names carry a hash of the
//! source's canonical path, size and modification time, so a different or
//! edited source never picks up a stale conversion.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::UNIX_EPOCH;

use audiotrack_core::{Error, Result, StreamSettings};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::decode::AudioDecoder;

/// Converts audio files into the format a stream expects.
#[derive(Debug, Clone)]
pub struct Converter {
    ffmpeg_path: PathBuf,
    output_dir: PathBuf,
}

impl Converter {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.ffmpeg_path, &config.conversion_path)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Whether `path` can be streamed to `settings` without conversion.
    pub fn is_playable(path: &Path, settings: &StreamSettings) -> bool {
        match AudioDecoder::open(path) {
            Ok(decoder) => {
                decoder.sample_rate() == settings.sample_rate
                    && decoder.channels() == settings.channels
            }
            Err(e) => {
                debug!("{} is not playable as-is: {e}", path.display());
                false
            }
        }
    }

    /// Where the converted copy of `path` for `settings` lives.
    pub fn converted_path(&self, path: &Path, settings: &StreamSettings) -> PathBuf {
        let stem = path
            .file_stem()
            .map_or_else(|| "audio".into(), |s| s.to_string_lossy());
        self.output_dir.join(format!(
            "{stem}-{}-{}hz-{}ch.wav",
            source_key(path),
            settings.sample_rate,
            settings.channels
        ))
    }

    /// Return a playable path for `path`, converting only when needed.
    pub fn convert_if_invalid(&self, path: &Path, settings: &StreamSettings) -> Result<PathBuf> {
        if Self::is_playable(path, settings) {
            return Ok(path.to_path_buf());
        }
        self.convert(path, settings)
    }

    /// Transcode `path` for `settings`, reusing an earlier conversion.
    pub fn convert(&self, path: &Path, settings: &StreamSettings) -> Result<PathBuf> {
        if !path.exists() {
            return Err(Error::Conversion(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let target = self.converted_path(path, settings);
        if target.exists() && Self::is_playable(&target, settings) {
            debug!("Reusing converted file {}", target.display());
            return Ok(target);
        }

        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            Error::Conversion(format!(
                "Failed to create {}: {e}",
                self.output_dir.display()
            ))
        })?;

        // Write under a temporary name so a half-written file is never reused
        let partial = target.with_extension("wav.part");

        info!(
            "Converting {} to {} Hz, {} channels",
            path.display(),
            settings.sample_rate,
            settings.channels
        );

        // -y                = overwrite the partial file
        // -v error          = only report failures
        // -ar / -ac         = target rate and channel count
        // -c:a pcm_s16le    = 16-bit PCM
        // -f wav            = container (the .part extension says nothing)
        let output = Command::new(&self.ffmpeg_path)
            .arg("-y")
            .args(["-v", "error", "-i"])
            .arg(path)
            .arg("-ar")
            .arg(settings.sample_rate.to_string())
            .arg("-ac")
            .arg(settings.channels.to_string())
            .args(["-c:a", "pcm_s16le", "-f", "wav"])
            .arg(&partial)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::Conversion(format!(
                    "ffmpeg not found at {}",
                    self.ffmpeg_path.display()
                )),
                _ => Error::Conversion(format!("Failed to run ffmpeg: {e}")),
            })?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&partial);
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("ffmpeg failed on {}: {}", path.display(), stderr.trim());
            return Err(Error::Conversion(format!(
                "ffmpeg exited with {} for {}",
                output.status,
                path.display()
            )));
        }

        std::fs::rename(&partial, &target)?;

        if !Self::is_playable(&target, settings) {
            return Err(Error::Conversion(format!(
                "{} is still not playable after conversion",
                target.display()
            )));
        }

        info!("Converted {} -> {}", path.display(), target.display());
        Ok(target)
    }
}

/// Short hash identifying one version of one source file.
fn source_key(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    if let Ok(meta) = std::fs::metadata(&canonical) {
        hasher.update(meta.len().to_le_bytes());
        if let Some(modified) = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        {
            hasher.update(modified.as_nanos().to_le_bytes());
        }
    }
    hex::encode(&hasher.finalize()[..8])
}

impl Default for Converter {
    fn default() -> Self {
        Self::from_config(&crate::config::config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::write_ramp_wav;

    #[test]
    fn test_converted_path() {
        let converter = Converter::new("ffmpeg", "/cache");
        let path = converter.converted_path(
            Path::new("/music/bass.mp3"),
            &StreamSettings::new(512, 16000, 1),
        );
        assert_eq!(path.parent(), Some(Path::new("/cache")));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("bass-"));
        assert!(name.ends_with("-16000hz-1ch.wav"));
        // stem, 16 hex digits, rate, channels
        assert_eq!(name.len(), "bass-".len() + 16 + "-16000hz-1ch.wav".len());
    }

    #[test]
    fn test_same_stem_in_different_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a").join("bass.wav");
        let second = dir.path().join("b").join("bass.wav");
        for path in [&first, &second] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            write_ramp_wav(path, 160, 44100, 2);
        }

        let converter = Converter::new("/nonexistent/ffmpeg", dir.path().join("conv"));
        let settings = StreamSettings::new(512, 16000, 1);
        let cached = converter.converted_path(&first, &settings);
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        write_ramp_wav(&cached, 160, 16000, 1);

        assert_ne!(converter.converted_path(&second, &settings), cached);
        // The second file is not served the first one's conversion
        let err = converter.convert(&second, &settings).unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }

    #[test]
    fn test_edited_source_is_converted_again() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("loop.wav");
        write_ramp_wav(&source, 160, 44100, 2);

        let converter = Converter::new("ffmpeg", dir.path().join("conv"));
        let settings = StreamSettings::new(512, 16000, 1);
        let before = converter.converted_path(&source, &settings);

        write_ramp_wav(&source, 320, 44100, 2);
        assert_ne!(converter.converted_path(&source, &settings), before);
    }

    #[test]
    fn test_playable_file_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.wav");
        write_ramp_wav(&path, 160, 16000, 1);

        // ffmpeg is never consulted for a matching file
        let converter = Converter::new("/nonexistent/ffmpeg", dir.path().join("conv"));
        let settings = StreamSettings::new(512, 16000, 1);
        assert!(Converter::is_playable(&path, &settings));
        assert_eq!(converter.convert_if_invalid(&path, &settings).unwrap(), path);
    }

    #[test]
    fn test_mismatch_needs_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_ramp_wav(&path, 160, 44100, 2);

        let settings = StreamSettings::new(512, 16000, 1);
        assert!(!Converter::is_playable(&path, &settings));

        let converter = Converter::new("/nonexistent/ffmpeg", dir.path().join("conv"));
        let err = converter.convert_if_invalid(&path, &settings).unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }

    #[test]
    fn test_reuses_existing_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("drums.wav");
        write_ramp_wav(&source, 160, 44100, 2);

        let converter = Converter::new("/nonexistent/ffmpeg", dir.path().join("conv"));
        let settings = StreamSettings::new(512, 16000, 1);
        let cached = converter.converted_path(&source, &settings);
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        write_ramp_wav(&cached, 160, 16000, 1);

        assert_eq!(converter.convert(&source, &settings).unwrap(), cached);
    }

    #[test]
    fn test_missing_source() {
        let converter = Converter::new("ffmpeg", "/tmp");
        let err = converter
            .convert(Path::new("/nonexistent/x.mp3"), &StreamSettings::default())
            .unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
    }
}
