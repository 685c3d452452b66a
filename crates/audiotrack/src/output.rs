//! Output tracks.
//!
//! An [`OutputTrack`] owns one output stream. It plays either its live
//! queue or an audio file, and can be paused, resumed, stopped and faded
//! from any thread while the device keeps pulling blocks.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use audiotrack_core::{Error, PcmBuffer, Result, StreamSettings};
use crossbeam_channel::{bounded, Sender};
use tracing::{debug, info, warn};

use crate::audiofile::AudioFile;
use crate::buffer::{PcmQueue, SharedPcmQueue};
use crate::config::config;
use crate::control::{TrackState, VolumeCommand};
use crate::convert::Converter;
use crate::device::{AudioDevice, CpalDevice, ErrorCallback, StreamHandle};
use crate::engine::{EngineShared, OutputEngine, SourceSwap};
use crate::envelope::ramp_frames;
use crate::events::{
    post, Dispatcher, EventQueue, Notice, TrackEvent, EVENT_CAPACITY, NOTICE_CAPACITY,
};
use crate::source::{AudioSource, FileSource, QueueSource};

/// How [`OutputTrack::play_audio_file`] plays a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayOptions {
    /// Return only once the file has finished, been stopped or replaced.
    pub blocking: bool,
    /// Decode the whole file before playing instead of streaming it.
    pub load_in_memory: bool,
    /// Convert files that do not match the stream first. When off, such
    /// files are rejected.
    pub convert: bool,
}

impl PlayOptions {
    #[must_use]
    pub const fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    #[must_use]
    pub const fn load_in_memory(mut self, load_in_memory: bool) -> Self {
        self.load_in_memory = load_in_memory;
        self
    }

    #[must_use]
    pub const fn convert(mut self, convert: bool) -> Self {
        self.convert = convert;
        self
    }
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            blocking: false,
            load_in_memory: false,
            convert: true,
        }
    }
}

/// Producer handle on a track's live queue.
///
/// The queue is bounded: while nothing plays it (a file is playing or the
/// track is stopped) or the producer outruns the device, the oldest blocks
/// are dropped.
#[derive(Clone)]
pub struct QueueSender {
    queue: SharedPcmQueue,
    settings: StreamSettings,
}

impl QueueSender {
    /// Queue a block for playback. Blocks must match the track's sample
    /// rate and channel count.
    ///
    /// Returns the number of older blocks dropped to make room.
    pub fn push(&self, buffer: PcmBuffer) -> Result<usize> {
        if !buffer.matches(&self.settings) {
            return Err(Error::Configuration(format!(
                "buffer is {} Hz with {} channels, track is {} Hz with {} channels",
                buffer.sample_rate(),
                buffer.channels(),
                self.settings.sample_rate,
                self.settings.channels
            )));
        }
        Ok(self.queue.push(buffer))
    }

    /// Blocks dropped from the live queue since the track opened.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

fn check_gain(gain: f32) -> Result<()> {
    if !gain.is_finite() || gain < 0.0 {
        return Err(Error::InvalidArgument(format!(
            "volume must be a finite, non-negative number, got {gain}"
        )));
    }
    Ok(())
}

/// Builder for [`OutputTrack`], starting from the global config.
pub struct OutputTrackBuilder {
    name: String,
    settings: StreamSettings,
    volume: f32,
    smoothness: f32,
    stream_buffer_frames: usize,
    queue_capacity: usize,
    converter: Converter,
    device: Option<Arc<dyn AudioDevice>>,
}

impl OutputTrackBuilder {
    fn new(name: String) -> Self {
        let config = config();
        Self {
            name,
            settings: config.stream_settings(),
            volume: config.default_volume,
            smoothness: config.default_smoothness,
            stream_buffer_frames: config.stream_buffer_frames,
            queue_capacity: config.output_queue_capacity,
            converter: Converter::from_config(&config),
            device: None,
        }
    }

    #[must_use]
    pub const fn settings(mut self, settings: StreamSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub const fn block_size(mut self, block_size: u32) -> Self {
        self.settings.block_size = block_size;
        self
    }

    #[must_use]
    pub const fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.settings.sample_rate = sample_rate;
        self
    }

    #[must_use]
    pub const fn channels(mut self, channels: u16) -> Self {
        self.settings.channels = channels;
        self
    }

    #[must_use]
    pub const fn volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    /// Ramp length used by [`OutputTrack::set_volume_default`].
    #[must_use]
    pub const fn smoothness(mut self, smoothness: f32) -> Self {
        self.smoothness = smoothness;
        self
    }

    #[must_use]
    pub const fn stream_buffer_frames(mut self, frames: usize) -> Self {
        self.stream_buffer_frames = frames;
        self
    }

    /// Blocks the live queue keeps before dropping the oldest.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn converter(mut self, converter: Converter) -> Self {
        self.converter = converter;
        self
    }

    #[must_use]
    pub fn device(mut self, device: Arc<dyn AudioDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn open(mut self) -> Result<OutputTrack> {
        match self.device.take() {
            Some(device) => OutputTrack::open(self, device.as_ref()),
            None => OutputTrack::open(self, &CpalDevice::default_device()),
        }
    }
}

/// A named output stream with volume control.
pub struct OutputTrack {
    name: String,
    settings: StreamSettings,
    shared: Arc<EngineShared>,
    queue: SharedPcmQueue,
    events: Arc<EventQueue>,
    /// `None` only while closing.
    notices: Option<Sender<Notice>>,
    converter: Converter,
    default_smoothness: f32,
    stream_buffer_frames: usize,
    stream: Option<StreamHandle>,
    dispatcher: Option<JoinHandle<()>>,
}

impl OutputTrack {
    /// Open a track on the default output device.
    pub fn new(name: impl Into<String>, settings: StreamSettings, volume: f32) -> Result<Self> {
        Self::with_device(name, settings, volume, &CpalDevice::default_device())
    }

    /// Open a track on `device`.
    pub fn with_device(
        name: impl Into<String>,
        settings: StreamSettings,
        volume: f32,
        device: &dyn AudioDevice,
    ) -> Result<Self> {
        let builder = Self::builder(name).settings(settings).volume(volume);
        Self::open(builder, device)
    }

    pub fn builder(name: impl Into<String>) -> OutputTrackBuilder {
        OutputTrackBuilder::new(name.into())
    }

    fn open(builder: OutputTrackBuilder, device: &dyn AudioDevice) -> Result<Self> {
        let OutputTrackBuilder {
            name,
            settings,
            volume,
            smoothness,
            stream_buffer_frames,
            queue_capacity,
            converter,
            ..
        } = builder;
        settings.validate()?;
        check_gain(volume)?;

        let events = Arc::new(EventQueue::new(EVENT_CAPACITY));
        let (notice_tx, notice_rx) = bounded(NOTICE_CAPACITY);
        let dispatcher = Dispatcher::new(name.as_str(), events.clone()).spawn(notice_rx)?;

        let queue = Arc::new(PcmQueue::bounded(queue_capacity));
        let shared = Arc::new(EngineShared::new(TrackState::Playing, volume));
        let mut engine = OutputEngine::new(
            shared.clone(),
            settings,
            Some(AudioSource::Queue(QueueSource::new(queue.receiver()))),
            notice_tx.clone(),
        );

        let error_tx = notice_tx.clone();
        let on_error: ErrorCallback = Arc::new(move |e| {
            post(&error_tx, Notice::Error(e));
        });
        let stream = device.open_output(
            &settings,
            Box::new(move |out: &mut [f32]| engine.render(out)),
            on_error,
        )?;

        info!(
            "Opened output track '{name}' on {}: {} Hz, {} channels, block {}",
            device.name(),
            settings.sample_rate,
            settings.channels,
            settings.block_size
        );

        Ok(Self {
            name,
            settings,
            shared,
            queue,
            events,
            notices: Some(notice_tx),
            converter,
            default_smoothness: smoothness,
            stream_buffer_frames,
            stream: Some(stream),
            dispatcher: Some(dispatcher),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn settings(&self) -> StreamSettings {
        self.settings
    }

    pub fn state(&self) -> TrackState {
        self.shared.state.get()
    }

    /// Play `file` from its first frame, replacing whatever was playing.
    ///
    /// Conversion, probing and (with `load_in_memory`) decoding happen on
    /// the calling thread; errors are returned before the track changes.
    pub fn play_audio_file(&self, mut file: AudioFile, options: PlayOptions) -> Result<()> {
        if options.convert {
            file.convert_with(&self.converter, &self.settings)?;
        }

        let source = if options.load_in_memory {
            let samples = file.decode_all(&self.settings)?;
            FileSource::in_memory(file, samples, self.settings.channels)
        } else {
            let decoder = file.open_decoder(&self.settings)?;
            FileSource::streamed(file, decoder, self.stream_buffer_frames, self.notice_sender()?)?
        };

        let path = source.file().original_path().to_path_buf();
        info!(
            "'{}': playing {} (repeat {}, {})",
            self.name,
            path.display(),
            source.repeat().get(),
            if options.load_in_memory { "in memory" } else { "streamed" }
        );

        let generation = self
            .shared
            .schedule(SourceSwap::Install(AudioSource::File(source)));
        self.enter_playing();
        self.events.emit(TrackEvent::FileStarted(path));

        if options.blocking {
            self.wait_while_current(generation);
        }
        Ok(())
    }

    /// Switch back to the live queue.
    pub fn play_queue(&self) {
        self.shared.schedule(SourceSwap::Install(AudioSource::Queue(
            QueueSource::new(self.queue.receiver()),
        )));
        self.enter_playing();
        debug!("'{}': playing queue", self.name);
    }

    /// Handle for pushing live audio to this track.
    pub fn queue(&self) -> QueueSender {
        QueueSender {
            queue: self.queue.clone(),
            settings: self.settings,
        }
    }

    /// Blocks waiting in the live queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Fade to `target` over `smoothness` seconds, starting from the gain
    /// the track is at. Zero smoothness changes the gain at the next block.
    pub fn set_volume(&self, target: f32, smoothness: f32) -> Result<()> {
        check_gain(target)?;
        let frames = ramp_frames(smoothness, self.settings.sample_rate);
        let command = if frames == 0 {
            VolumeCommand::Immediate(target)
        } else {
            VolumeCommand::Ramp { target, frames }
        };
        self.shared.volume.submit(command);
        debug!("'{}': volume -> {target} over {frames} frames", self.name);
        Ok(())
    }

    /// [`set_volume`](Self::set_volume) with the track's default smoothness.
    pub fn set_volume_default(&self, target: f32) -> Result<()> {
        self.set_volume(target, self.default_smoothness)
    }

    /// Set the gain immediately, cancelling any fade in progress.
    pub fn set_gain(&self, gain: f32) -> Result<()> {
        check_gain(gain)?;
        self.shared.volume.submit(VolumeCommand::Immediate(gain));
        Ok(())
    }

    /// Gain applied to the most recent block. A change made with
    /// [`set_gain`](Self::set_gain) shows up here once a block has used it.
    pub fn gain(&self) -> f32 {
        self.shared.volume.current()
    }

    /// Gain the track is fading towards.
    pub fn target_gain(&self) -> f32 {
        self.shared.volume.target()
    }

    /// Position in the current file pass, or time of queued audio played.
    pub fn position(&self) -> Duration {
        Duration::from_secs_f64(
            self.shared.position() as f64 / f64::from(self.settings.sample_rate),
        )
    }

    /// Returns `false` if the track was not playing.
    pub fn pause(&self) -> bool {
        let paused = self.shared.state.pause();
        if paused {
            debug!("'{}': paused", self.name);
            self.events.emit(TrackEvent::StateChanged(TrackState::Paused));
        }
        paused
    }

    /// Returns `false` if the track was not paused.
    pub fn resume(&self) -> bool {
        let resumed = self.shared.state.resume();
        if resumed {
            debug!("'{}': resumed", self.name);
            self.events.emit(TrackEvent::StateChanged(TrackState::Playing));
        }
        resumed
    }

    /// Stop playback and drop the current source along with any queued
    /// blocks. Returns `false` if the track was already stopped.
    pub fn stop(&self) -> bool {
        if !self.shared.state.stop() {
            return false;
        }
        self.shared.schedule(SourceSwap::Clear);
        let drained = self.queue.clear();
        info!("'{}': stopped ({drained} queued blocks dropped)", self.name);
        self.events.emit(TrackEvent::StateChanged(TrackState::Stopped));
        true
    }

    pub fn try_recv_event(&self) -> Option<TrackEvent> {
        self.events.try_recv()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<TrackEvent> {
        self.events.recv_timeout(timeout)
    }

    fn enter_playing(&self) {
        let previous = self.shared.state.set(TrackState::Playing);
        if previous != TrackState::Playing {
            debug!("'{}': {previous} -> playing", self.name);
            self.events.emit(TrackEvent::StateChanged(TrackState::Playing));
        }
    }

    fn notice_sender(&self) -> Result<Sender<Notice>> {
        self.notices
            .clone()
            .ok_or_else(|| Error::Internal("Output track is closing".to_string()))
    }

    /// Sleep until the source of `generation` is replaced or the track stops.
    fn wait_while_current(&self, generation: u64) {
        let interval = self.settings.block_duration();
        while self.shared.generation() == generation && self.state() != TrackState::Stopped {
            thread::sleep(interval);
        }
    }
}

impl Drop for OutputTrack {
    fn drop(&mut self) {
        self.shared.state.set(TrackState::Stopped);
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        // Every notice sender must go before the dispatcher can finish
        self.shared.discard_pending();
        self.notices = None;
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                warn!("Event thread of '{}' panicked", self.name);
            }
        }
        info!("Closed output track '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::write_ramp_wav;
    use crate::device::ManualDevice;
    use audiotrack_core::Repeat;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    const RATE: u32 = 8000;
    const BLOCK: usize = 16;
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn open_track(device: &Arc<ManualDevice>, settings: StreamSettings) -> OutputTrack {
        let dir = std::env::temp_dir().join("audiotrack-test-conversions");
        OutputTrack::builder("test")
            .settings(settings)
            .volume(1.0)
            .converter(Converter::new("/nonexistent/ffmpeg", dir))
            .device(device.clone())
            .open()
            .unwrap()
    }

    fn mono_track(device: &Arc<ManualDevice>) -> OutputTrack {
        open_track(device, StreamSettings::new(BLOCK as u32, RATE, 1))
    }

    /// Frame `i` of a ramp file of `frames` frames.
    fn ramp(i: usize, frames: usize) -> f32 {
        i as f32 / frames as f32
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-3,
            "expected {expected}, got {actual}"
        );
    }

    fn ramp_file(dir: &Path, frames: u32) -> AudioFile {
        let path = dir.join(format!("ramp-{frames}.wav"));
        write_ramp_wav(&path, frames, RATE, 1);
        AudioFile::new(path)
    }

    fn in_memory() -> PlayOptions {
        PlayOptions::default().load_in_memory(true)
    }

    fn pump_until_stopped(device: &ManualDevice, track: &OutputTrack) -> Vec<f32> {
        let deadline = Instant::now() + TIMEOUT;
        let mut out = Vec::new();
        while track.state() != TrackState::Stopped {
            assert!(Instant::now() < deadline, "track never stopped");
            out.extend(device.pump_output(BLOCK));
            thread::sleep(Duration::from_millis(1));
        }
        out
    }

    fn wait_for_event(track: &OutputTrack, wanted: impl Fn(&TrackEvent) -> bool) -> TrackEvent {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match track.recv_event_timeout(remaining) {
                Some(event) if wanted(&event) => return event,
                Some(_) => {}
                None => panic!("event did not arrive"),
            }
        }
    }

    #[test]
    fn test_new_track_plays_queue() {
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        assert_eq!(track.state(), TrackState::Playing);

        track
            .queue()
            .push(PcmBuffer::new(vec![0.5; 24], 1, RATE).unwrap())
            .unwrap();
        assert_eq!(device.pump_output(BLOCK), vec![0.5; BLOCK]);

        let second = device.pump_output(BLOCK);
        assert_eq!(&second[..8], &[0.5; 8]);
        assert_eq!(&second[8..], &[0.0; 8]);
    }

    #[test]
    fn test_queue_stays_bounded_without_a_consumer() {
        let device = Arc::new(ManualDevice::new());
        let track = OutputTrack::builder("live")
            .settings(StreamSettings::new(BLOCK as u32, RATE, 1))
            .volume(1.0)
            .queue_capacity(8)
            .device(device.clone())
            .open()
            .unwrap();
        assert!(track.stop());

        let queue = track.queue();
        for i in 0..1000 {
            queue
                .push(PcmBuffer::new(vec![i as f32; BLOCK], 1, RATE).unwrap())
                .unwrap();
            device.pump_output(BLOCK);
        }
        assert_eq!(track.queued(), 8);
        assert_eq!(queue.dropped(), 992);

        // The newest blocks are what plays once the queue is back on
        track.play_queue();
        assert_eq!(device.pump_output(BLOCK), vec![992.0; BLOCK]);
    }

    #[test]
    fn test_queue_rejects_other_format() {
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        let err = track
            .queue()
            .push(PcmBuffer::new(vec![0.0; 32], 2, RATE).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_rejects_rate_mismatch_without_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cd.wav");
        write_ramp_wav(&path, 64, 44100, 1);

        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        let err = track
            .play_audio_file(AudioFile::new(&path), PlayOptions::default().convert(false))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        // Conversion needs ffmpeg, which this converter does not have
        let err = track
            .play_audio_file(AudioFile::new(&path), PlayOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Conversion(_)));
        assert_eq!(track.state(), TrackState::Playing);
    }

    #[test]
    fn test_stop_then_play_restarts_at_first_frame() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        let file = ramp_file(dir.path(), 64);

        track.play_audio_file(file.clone(), in_memory()).unwrap();
        let first = device.pump_output(BLOCK);
        assert_close(first[5], ramp(5, 64));

        assert!(track.stop());
        assert!(!track.stop());
        assert_eq!(device.pump_output(BLOCK), vec![0.0; BLOCK]);

        track.play_audio_file(file, in_memory()).unwrap();
        let again = device.pump_output(BLOCK);
        assert_close(again[0], 0.0);
        assert_close(again[5], ramp(5, 64));
    }

    #[test]
    fn test_pause_resume_keeps_position() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        track
            .play_audio_file(ramp_file(dir.path(), 64), in_memory())
            .unwrap();

        device.pump_output(BLOCK);
        assert!(track.pause());
        assert!(!track.pause());
        assert_eq!(device.pump_output(BLOCK), vec![0.0; BLOCK]);
        assert_eq!(track.position(), Duration::from_secs_f64(16.0 / 8000.0));

        assert!(track.resume());
        let resumed = device.pump_output(BLOCK);
        assert_close(resumed[0], ramp(16, 64));
    }

    #[test]
    fn test_invalid_transitions_are_noops() {
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        assert!(!track.resume());
        assert!(track.stop());
        assert!(!track.pause());
        assert!(!track.resume());
        assert_eq!(track.state(), TrackState::Stopped);
    }

    #[test]
    fn test_repeat_runs_on_end_each_time() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let file = ramp_file(dir.path(), 40)
            .with_repeat(2)
            .with_on_end(move |_, left| {
                seen.lock().push(left);
                None
            });
        track.play_audio_file(file, in_memory()).unwrap();

        let out = pump_until_stopped(&device, &track);
        // Three passes; the first frame of each is zero
        let audible = out.iter().filter(|s| s.abs() > 1e-6).count();
        assert_eq!(audible, 3 * 39);
        assert_close(*out.iter().find(|s| s.abs() > 1e-6).unwrap(), ramp(1, 40));

        wait_for_event(&track, |e| matches!(e, TrackEvent::PlaybackFinished(_)));
        assert_eq!(*calls.lock(), vec![Repeat::Times(1), Repeat::Times(0)]);
    }

    #[test]
    fn test_incrementing_on_end_loops_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);

        let file = ramp_file(dir.path(), 64)
            .with_repeat(1)
            .with_on_end(|_, left| Some(left.incremented()));
        track.play_audio_file(file, in_memory()).unwrap();

        device.pump_output(BLOCK);
        for _ in 0..5 {
            // One pass; the end of the previous one is noticed on the way
            for _ in 0..4 {
                device.pump_output(BLOCK);
            }
            wait_for_event(&track, |e| matches!(e, TrackEvent::FileEnded { .. }));
        }
        assert_eq!(track.state(), TrackState::Playing);

        assert!(track.stop());
        assert_eq!(device.pump_output(BLOCK), vec![0.0; BLOCK]);
        assert_eq!(track.state(), TrackState::Stopped);
    }

    #[test]
    fn test_file_shorter_than_block_loops_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);

        let file = ramp_file(dir.path(), 4)
            .with_repeat(1)
            .with_on_end(|_, left| Some(left.incremented()));
        track.play_audio_file(file, in_memory()).unwrap();

        for _ in 0..50 {
            device.pump_output(BLOCK);
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(track.state(), TrackState::Playing);

        assert!(track.stop());
        assert_eq!(device.pump_output(BLOCK), vec![0.0; BLOCK]);
    }

    #[test]
    fn test_streamed_file_plays_to_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);

        track
            .play_audio_file(ramp_file(dir.path(), 400), PlayOptions::default())
            .unwrap();
        let out = pump_until_stopped(&device, &track);

        // Underruns while the feeder starts up are silent, so only count
        // the samples that carry the ramp
        let audible = out.iter().filter(|s| s.abs() > 1e-6).count();
        assert_eq!(audible, 399);
        wait_for_event(&track, |e| matches!(e, TrackEvent::PlaybackFinished(_)));
    }

    #[test]
    fn test_blocking_play_returns_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        let file = ramp_file(dir.path(), 100);

        let done = Arc::new(AtomicBool::new(false));
        let pump = {
            let device = device.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    device.pump_output(BLOCK);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        track
            .play_audio_file(file, in_memory().blocking(true))
            .unwrap();
        assert_eq!(track.state(), TrackState::Stopped);

        done.store(true, Ordering::Release);
        pump.join().unwrap();
    }

    #[test]
    fn test_volume_fades_at_16khz() {
        let device = Arc::new(ManualDevice::new());
        let track = open_track(&device, StreamSettings::new(512, 16000, 1));
        let queue = track.queue();
        let ones = || PcmBuffer::new(vec![1.0; 512], 1, 16000).unwrap();

        track.set_volume(0.0, 0.01).unwrap();
        assert_eq!(track.target_gain(), 0.0);
        queue.push(ones()).unwrap();
        let out = device.pump_output(512);
        // 160-frame ramp
        assert_close(out[0], 1.0 - 1.0 / 160.0);
        assert_close(out[79], 0.5);
        assert!(out[160..].iter().all(|s| *s == 0.0));
        assert_eq!(track.gain(), 0.0);

        track.set_volume(1.0, 0.01).unwrap();
        queue.push(ones()).unwrap();
        let out = device.pump_output(512);
        assert_close(out[0], 1.0 / 160.0);
        assert!(out[160..].iter().all(|s| *s == 1.0));
        assert_eq!(track.gain(), 1.0);
    }

    #[test]
    fn test_set_gain_cancels_fade() {
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        let queue = track.queue();

        track.set_volume(0.0, 1.0).unwrap();
        queue.push(PcmBuffer::new(vec![1.0; BLOCK], 1, RATE).unwrap()).unwrap();
        device.pump_output(BLOCK);

        track.set_gain(0.5).unwrap();
        assert_eq!(track.target_gain(), 0.5);
        queue.push(PcmBuffer::new(vec![1.0; BLOCK], 1, RATE).unwrap()).unwrap();
        assert_eq!(device.pump_output(BLOCK), vec![0.5; BLOCK]);
        assert_eq!(track.gain(), 0.5);
    }

    #[test]
    fn test_rejects_bad_volume() {
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        assert!(matches!(
            track.set_volume(-0.5, 0.1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            track.set_gain(f32::NAN),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_drop_closes_stream() {
        let device = Arc::new(ManualDevice::new());
        let track = mono_track(&device);
        assert_eq!(device.open_streams(), 1);
        drop(track);
        assert_eq!(device.open_streams(), 0);
    }
}
