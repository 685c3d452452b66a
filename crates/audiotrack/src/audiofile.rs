//! Audio files queued for playback.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use audiotrack_core::{Error, Repeat, Result, StreamSettings};
use tracing::debug;

use crate::convert::Converter;
use crate::decode::{self, AudioDecoder};

/// Handler run each time a file finishes a pass and is about to replay.
///
/// Receives the file and the replays left after this one. Returning
/// `Some(repeat)` replaces the remaining replay count, so a handler that
/// returns `Some(left.incremented())` loops the file until the track is
/// stopped. The handler runs on the track's event thread, never on the
/// device callback.
pub type OnEnd = Arc<dyn Fn(&AudioFile, Repeat) -> Option<Repeat> + Send + Sync>;

/// A file plus how it should be played.
#[derive(Clone)]
pub struct AudioFile {
    /// File the decoder reads; a converted copy once converted.
    path: PathBuf,
    /// File the caller asked for.
    original_path: PathBuf,
    repeat: Repeat,
    on_end: Option<OnEnd>,
}

impl AudioFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            original_path: path.clone(),
            path,
            repeat: Repeat::default(),
            on_end: None,
        }
    }

    pub fn with_repeat(mut self, repeat: impl Into<Repeat>) -> Self {
        self.repeat = repeat.into();
        self
    }

    pub fn with_on_end(
        mut self,
        on_end: impl Fn(&Self, Repeat) -> Option<Repeat> + Send + Sync + 'static,
    ) -> Self {
        self.on_end = Some(Arc::new(on_end));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn original_path(&self) -> &Path {
        &self.original_path
    }

    pub const fn repeat(&self) -> Repeat {
        self.repeat
    }

    pub fn has_on_end(&self) -> bool {
        self.on_end.is_some()
    }

    /// Make sure the file can be decoded straight into `settings`,
    /// converting it with the configured converter when it cannot.
    pub fn convert_if_invalid(&mut self, settings: &StreamSettings) -> Result<&Path> {
        self.convert_with(&Converter::default(), settings)
    }

    /// Like [`convert_if_invalid`](Self::convert_if_invalid) with an explicit converter.
    pub fn convert_with(
        &mut self,
        converter: &Converter,
        settings: &StreamSettings,
    ) -> Result<&Path> {
        let playable = converter.convert_if_invalid(&self.original_path, settings)?;
        if playable != self.path {
            debug!(
                "{} will play from {}",
                self.original_path.display(),
                playable.display()
            );
        }
        self.path = playable;
        Ok(&self.path)
    }

    /// Open a decoder on the playable path, checking it matches `settings`.
    pub fn open_decoder(&self, settings: &StreamSettings) -> Result<AudioDecoder> {
        let decoder = AudioDecoder::open(&self.path)?;
        check_format(&self.path, decoder.sample_rate(), decoder.channels(), settings)?;
        Ok(decoder)
    }

    /// Decode the whole playable file, checking it matches `settings`.
    pub fn decode_all(&self, settings: &StreamSettings) -> Result<Arc<[f32]>> {
        let decoded = decode::decode_all(&self.path)?;
        check_format(&self.path, decoded.sample_rate, decoded.channels, settings)?;
        if decoded.samples.is_empty() {
            return Err(Error::Decode(format!(
                "{} contains no audio",
                self.path.display()
            )));
        }
        Ok(decoded.samples.into())
    }

    /// Run the end-of-pass handler, if any.
    pub(crate) fn notify_end(&self, repeat_left: Repeat) -> Option<Repeat> {
        self.on_end
            .as_ref()
            .and_then(|on_end| on_end(self, repeat_left))
    }
}

fn check_format(
    path: &Path,
    sample_rate: u32,
    channels: u16,
    settings: &StreamSettings,
) -> Result<()> {
    if sample_rate != settings.sample_rate || channels != settings.channels {
        return Err(Error::Configuration(format!(
            "{} is {sample_rate} Hz with {channels} channels, stream is {} Hz with {} channels",
            path.display(),
            settings.sample_rate,
            settings.channels
        )));
    }
    Ok(())
}

impl fmt::Debug for AudioFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFile")
            .field("path", &self.path)
            .field("original_path", &self.original_path)
            .field("repeat", &self.repeat)
            .field("on_end", &self.on_end.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::write_ramp_wav;

    #[test]
    fn test_builder() {
        let file = AudioFile::new("/music/vine_boom.mp3").with_repeat(3);
        assert_eq!(file.repeat(), Repeat::Times(3));
        assert_eq!(file.path(), Path::new("/music/vine_boom.mp3"));
        assert!(!file.has_on_end());
    }

    #[test]
    fn test_on_end_can_extend_playback() {
        let file = AudioFile::new("sfx.wav")
            .with_repeat(1)
            .with_on_end(|_, left| Some(left.incremented()));
        assert_eq!(file.notify_end(Repeat::Times(0)), Some(Repeat::Times(1)));
    }

    #[test]
    fn test_convert_keeps_playable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piano.wav");
        write_ramp_wav(&path, 160, 16000, 1);

        let converter = Converter::new("/nonexistent/ffmpeg", dir.path().join("conv"));
        let mut file = AudioFile::new(&path);
        let playable = file
            .convert_with(&converter, &StreamSettings::new(512, 16000, 1))
            .unwrap()
            .to_path_buf();
        assert_eq!(playable, path);
        assert_eq!(file.original_path(), path);
    }

    #[test]
    fn test_decode_all_checks_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_ramp_wav(&path, 320, 16000, 1);
        let file = AudioFile::new(&path);

        let samples = file.decode_all(&StreamSettings::new(512, 16000, 1)).unwrap();
        assert_eq!(samples.len(), 320);

        let err = file
            .decode_all(&StreamSettings::new(512, 48000, 2))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(matches!(
            file.open_decoder(&StreamSettings::new(512, 44100, 1)),
            Err(Error::Configuration(_))
        ));
    }
}
