//! Where an output track's samples come from.
//!
//! An [`AudioSource`] is owned by the device callback. Everything here is
//! non-blocking on the callback side: the queue source pops with
//! `try_recv`, in-memory files copy from a shared slice and streamed files
//! read from a ring buffer that a feeder thread keeps topped up.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use audiotrack_core::{Error, PcmBuffer, Repeat, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::audiofile::AudioFile;
use crate::buffer::{shared_ring_buffer, SharedRingBuffer};
use crate::decode::AudioDecoder;
use crate::events::{post, Notice};

/// How long the feeder sleeps when the ring buffer is full.
const FEED_INTERVAL: Duration = Duration::from_millis(5);

const FOREVER: u64 = u64::MAX;

/// Replays left for the file being played, shared between the callback
/// (which consumes replays) and the event thread (where `on_end` may reset
/// the count).
///
/// While an `on_end` handler has not returned yet the counter is
/// unsettled, and the callback must not decide whether the next pass ends
/// the file.
#[derive(Debug)]
pub struct RepeatCounter {
    left: AtomicU64,
    unsettled: AtomicBool,
}

impl RepeatCounter {
    pub fn new(repeat: Repeat) -> Self {
        Self {
            left: AtomicU64::new(Self::encode(repeat)),
            unsettled: AtomicBool::new(false),
        }
    }

    const fn encode(repeat: Repeat) -> u64 {
        match repeat {
            Repeat::Times(n) => n as u64,
            Repeat::Forever => FOREVER,
        }
    }

    const fn decode(value: u64) -> Repeat {
        if value == FOREVER {
            Repeat::Forever
        } else {
            Repeat::Times(value as u32)
        }
    }

    pub fn get(&self) -> Repeat {
        Self::decode(self.left.load(Ordering::Acquire))
    }

    pub fn set(&self, repeat: Repeat) {
        self.left.store(Self::encode(repeat), Ordering::Release);
    }

    /// A handler is about to see the end of a pass.
    pub fn unsettle(&self) {
        self.unsettled.store(true, Ordering::Release);
    }

    /// The handler has run and any new count is stored.
    pub fn settle(&self) {
        self.unsettled.store(false, Ordering::Release);
    }

    pub fn is_unsettled(&self) -> bool {
        self.unsettled.load(Ordering::Acquire)
    }

    /// Use up one replay. Returns the replays left afterwards, or `None`
    /// when there was nothing left to use.
    pub fn consume(&self) -> Option<Repeat> {
        self.left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| match value {
                0 => None,
                FOREVER => Some(FOREVER),
                n => Some(n - 1),
            })
            .ok()
            .and_then(|previous| Self::decode(previous).decremented())
    }
}

/// Result of pulling samples out of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// This many samples were written.
    Samples(usize),
    /// Nothing ready yet; the source may produce more later.
    Underrun,
    /// The current pass is over.
    Exhausted,
    /// The source cannot produce any more audio.
    Failed,
}

/// Live blocks pushed by the application.
pub struct QueueSource {
    rx: Receiver<PcmBuffer>,
    current: Option<PcmBuffer>,
    offset: usize,
    frames_played: u64,
}

impl QueueSource {
    pub fn new(rx: Receiver<PcmBuffer>) -> Self {
        Self {
            rx,
            current: None,
            offset: 0,
            frames_played: 0,
        }
    }

    /// Copy as many queued samples as fit into `out`. Fully played blocks
    /// are handed to `release` so they are not freed on the caller.
    pub fn fill(&mut self, out: &mut [f32], release: &mut dyn FnMut(PcmBuffer)) -> usize {
        let mut written = 0;
        while written < out.len() {
            if self.current.is_none() {
                match self.rx.try_recv() {
                    Ok(next) => {
                        self.current = Some(next);
                        self.offset = 0;
                    }
                    Err(_) => break,
                }
            }
            let Some(buffer) = &self.current else {
                break;
            };

            let samples = &buffer.samples()[self.offset..];
            let n = samples.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&samples[..n]);
            written += n;
            self.offset += n;
            self.frames_played += (n / usize::from(buffer.channels())) as u64;

            if self.offset >= buffer.samples().len() {
                if let Some(done) = self.current.take() {
                    release(done);
                }
            }
        }
        written
    }

    pub const fn frames_played(&self) -> u64 {
        self.frames_played
    }
}

/// Decoded samples of a file.
enum FileData {
    InMemory { samples: Arc<[f32]>, cursor: usize },
    Streamed(StreamedFile),
}

/// A file being played, possibly several times over.
pub struct FileSource {
    file: Arc<AudioFile>,
    repeat: Arc<RepeatCounter>,
    channels: usize,
    data: FileData,
    /// Frames played in the current pass.
    position: u64,
}

impl FileSource {
    /// Play from samples already in memory.
    pub fn in_memory(file: AudioFile, samples: Arc<[f32]>, channels: u16) -> Self {
        Self::with_data(
            file,
            channels,
            FileData::InMemory { samples, cursor: 0 },
        )
    }

    /// Play by decoding on a feeder thread into a ring of `buffer_frames`.
    pub(crate) fn streamed(
        file: AudioFile,
        decoder: AudioDecoder,
        buffer_frames: usize,
        notices: Sender<Notice>,
    ) -> Result<Self> {
        let channels = decoder.channels();
        let streamed = StreamedFile::spawn(decoder, buffer_frames, notices)?;
        Ok(Self::with_data(file, channels, FileData::Streamed(streamed)))
    }

    fn with_data(file: AudioFile, channels: u16, data: FileData) -> Self {
        let repeat = Arc::new(RepeatCounter::new(file.repeat()));
        Self {
            file: Arc::new(file),
            repeat,
            channels: usize::from(channels.max(1)),
            data,
            position: 0,
        }
    }

    pub fn file(&self) -> &Arc<AudioFile> {
        &self.file
    }

    pub fn repeat(&self) -> &Arc<RepeatCounter> {
        &self.repeat
    }

    pub const fn position(&self) -> u64 {
        self.position
    }

    pub fn pull(&mut self, out: &mut [f32]) -> Pull {
        let pulled = match &mut self.data {
            FileData::InMemory { samples, cursor } => {
                let rest = &samples[*cursor..];
                if rest.is_empty() {
                    return Pull::Exhausted;
                }
                let n = rest.len().min(out.len());
                out[..n].copy_from_slice(&rest[..n]);
                *cursor += n;
                Pull::Samples(n)
            }
            FileData::Streamed(streamed) => streamed.pull(out),
        };
        if let Pull::Samples(n) = pulled {
            self.position += (n / self.channels) as u64;
        }
        pulled
    }

    /// Go back to the first frame for another pass.
    pub fn rewind(&mut self) {
        self.position = 0;
        match &mut self.data {
            FileData::InMemory { cursor, .. } => *cursor = 0,
            FileData::Streamed(streamed) => streamed.rewind(),
        }
    }
}

/// Ring buffer fed by a decoder thread.
struct StreamedFile {
    ring: SharedRingBuffer,
    eof: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    /// Dropping this sender shuts the feeder down.
    rewind_tx: Sender<()>,
}

impl StreamedFile {
    fn spawn(decoder: AudioDecoder, buffer_frames: usize, notices: Sender<Notice>) -> Result<Self> {
        let ring = shared_ring_buffer(buffer_frames.max(1), decoder.channels());
        let eof = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let (rewind_tx, rewind_rx) = bounded(1);

        let name = decoder
            .path()
            .file_name()
            .map_or_else(|| "file".into(), |n| n.to_string_lossy().into_owned());
        let feeder = Feeder {
            decoder,
            ring: ring.clone(),
            eof: eof.clone(),
            failed: failed.clone(),
            rewind_rx,
            notices,
        };
        thread::Builder::new()
            .name(format!("audiotrack-feed-{name}"))
            .spawn(move || feeder.run())
            .map_err(|e| Error::Internal(format!("Failed to spawn feeder thread: {e}")))?;

        Ok(Self {
            ring,
            eof,
            failed,
            rewind_tx,
        })
    }

    fn pull(&mut self, out: &mut [f32]) -> Pull {
        let n = self.ring.read(out);
        if n > 0 {
            return Pull::Samples(n);
        }
        if self.failed.load(Ordering::Acquire) {
            return Pull::Failed;
        }
        // The feeder writes its last samples before raising eof
        if self.eof.load(Ordering::Acquire) && self.ring.is_empty() {
            return Pull::Exhausted;
        }
        Pull::Underrun
    }

    fn rewind(&mut self) {
        self.eof.store(false, Ordering::Release);
        let _ = self.rewind_tx.try_send(());
    }
}

struct Feeder {
    decoder: AudioDecoder,
    ring: SharedRingBuffer,
    eof: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    rewind_rx: Receiver<()>,
    notices: Sender<Notice>,
}

impl Feeder {
    fn run(mut self) {
        debug!("Feeding {}", self.decoder.path().display());
        let mut pending: Vec<f32> = Vec::new();
        let mut offset = 0;

        loop {
            if offset < pending.len() {
                offset += self.ring.write(&pending[offset..]);
                if offset < pending.len() {
                    match self.rewind_rx.recv_timeout(FEED_INTERVAL) {
                        Err(RecvTimeoutError::Disconnected) => break,
                        // Rewinds only come after eof
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    }
                }
                continue;
            }

            match self.decoder.decode_next() {
                Ok(Some(buffer)) => {
                    pending = buffer.into_samples();
                    offset = 0;
                }
                Ok(None) => {
                    self.eof.store(true, Ordering::Release);
                    if self.rewind_rx.recv().is_err() {
                        break;
                    }
                    if let Err(e) = self.reopen() {
                        self.fail(e);
                        break;
                    }
                }
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        debug!("Stopped feeding {}", self.decoder.path().display());
    }

    fn reopen(&mut self) -> Result<()> {
        self.decoder = AudioDecoder::open(self.decoder.path())?;
        Ok(())
    }

    fn fail(&self, error: Error) {
        warn!("Streaming {} failed: {error}", self.decoder.path().display());
        self.failed.store(true, Ordering::Release);
        post(&self.notices, Notice::Error(error));
    }
}

/// Source currently feeding a track.
pub enum AudioSource {
    Queue(QueueSource),
    File(FileSource),
}

impl AudioSource {
    /// Frames played by the source, within the current pass for files.
    pub const fn position(&self) -> u64 {
        match self {
            Self::Queue(queue) => queue.frames_played(),
            Self::File(file) => file.position(),
        }
    }
}
