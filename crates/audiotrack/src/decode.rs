//! Audio file decoding using symphonia.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use audiotrack_core::{Error, PcmBuffer, Result};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, trace, warn};

/// Sequential decoder over one audio file.
pub struct AudioDecoder {
    path: PathBuf,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    /// Reused interleaving buffer, grown to the largest packet seen.
    scratch: Option<SampleBuffer<f32>>,
}

impl AudioDecoder {
    /// Open and probe `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Decode(format!("Failed to open {}: {e}", path.display())))?;
        let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|e| Error::Decode(format!("Failed to probe {}: {e}", path.display())))?;

        let format = probed.format;

        // Find the first audio track
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode(format!("No audio tracks in {}", path.display())))?;

        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode(format!("Unknown sample rate in {}", path.display())))?;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::Decode(format!("Unknown channel layout in {}", path.display())))?;

        debug!(
            "Opened {}: track={}, sample_rate={}, channels={}",
            path.display(),
            track_id,
            sample_rate,
            channels
        );

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("Failed to create decoder: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            scratch: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Decode the next packet. `Ok(None)` at end of file.
    pub fn decode_next(&mut self) -> Result<Option<PcmBuffer>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => {
                    return Err(Error::Decode(format!("Failed to read packet: {e}")));
                }
            };

            // Skip packets for other tracks
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() == 0 {
                        continue;
                    }
                    let spec = *decoded.spec();
                    let channels = spec.channels.count();
                    let needed = decoded.capacity() as u64;
                    if self
                        .scratch
                        .as_ref()
                        .is_some_and(|buf| buf.capacity() < decoded.capacity() * channels)
                    {
                        self.scratch = None;
                    }
                    let scratch = self
                        .scratch
                        .get_or_insert_with(|| SampleBuffer::new(needed, spec));
                    scratch.copy_interleaved_ref(decoded);
                    trace!("Decoded {} samples", scratch.samples().len());
                    return PcmBuffer::new(
                        scratch.samples().to_vec(),
                        channels as u16,
                        spec.rate,
                    )
                    .map(Some);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Corrupt frame, keep going
                    warn!("Decode error in {} (skipping): {e}", self.path.display());
                }
                Err(e) => {
                    return Err(Error::Decode(format!("Decode failed: {e}")));
                }
            }
        }
    }

    /// Total duration, if the container declares it.
    pub fn duration(&self) -> Option<Duration> {
        let track = self
            .format
            .tracks()
            .iter()
            .find(|t| t.id == self.track_id)?;

        let time_base = track.codec_params.time_base?;
        let n_frames = track.codec_params.n_frames?;
        let time = time_base.calc_time(n_frames);

        Some(Duration::from_secs(time.seconds) + Duration::from_secs_f64(time.frac))
    }
}

/// A whole file decoded into memory.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn frame_count(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }
}

/// Decode every packet of `path`.
pub fn decode_all(path: impl AsRef<Path>) -> Result<DecodedAudio> {
    let mut decoder = AudioDecoder::open(path)?;
    let mut samples = Vec::new();
    while let Some(buffer) = decoder.decode_next()? {
        samples.extend_from_slice(buffer.samples());
    }

    debug!(
        "Decoded {} into memory ({} samples)",
        decoder.path().display(),
        samples.len()
    );

    Ok(DecodedAudio {
        samples,
        sample_rate: decoder.sample_rate(),
        channels: decoder.channels(),
    })
}
