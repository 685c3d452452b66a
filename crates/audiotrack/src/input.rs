//! Input tracks.
//!
//! The capture callback cuts the incoming stream into chunks of a fixed
//! number of frames and queues them. [`InputTrack::read`] hands them out
//! without ever blocking; a reader that falls behind loses the oldest
//! chunks, not the newest.
//!
//! Chunk storage is pooled: dropped chunks and chunks handed back through
//! [`InputTrack::recycle`] are refilled by the callback, so a warmed-up
//! track captures without allocating or freeing on the device thread.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::Arc;
use std::time::Duration;

use audiotrack_core::{Error, PcmBuffer, Result, StreamSettings};
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{error, info};

use crate::buffer::{PcmQueue, SharedPcmQueue};
use crate::config::config;
use crate::device::{AudioDevice, CpalDevice, ErrorCallback, StreamHandle};
use crate::events::{EventQueue, TrackEvent, EVENT_CAPACITY};

/// Capture-side chunker run by the device callback.
pub struct InputEngine {
    settings: StreamSettings,
    chunk_samples: usize,
    staging: Vec<f32>,
    queue: SharedPcmQueue,
    spare_tx: Sender<Vec<f32>>,
    spare_rx: Receiver<Vec<f32>>,
}

impl InputEngine {
    pub fn new(settings: StreamSettings, chunk_size: usize, queue: SharedPcmQueue) -> Self {
        let chunk_samples = chunk_size.max(1) * usize::from(settings.channels.max(1));
        let pool = queue.capacity().unwrap_or(0) + 2;
        let (spare_tx, spare_rx) = bounded(pool);
        Self {
            settings,
            chunk_samples,
            staging: Vec::with_capacity(chunk_samples),
            queue,
            spare_tx,
            spare_rx,
        }
    }

    /// Handle for returning chunk storage to the pool.
    pub fn recycler(&self) -> Sender<Vec<f32>> {
        self.spare_tx.clone()
    }

    fn next_staging(&self) -> Vec<f32> {
        match self.spare_rx.try_recv() {
            Ok(mut spare) => {
                spare.clear();
                spare
            }
            Err(_) => Vec::with_capacity(self.chunk_samples),
        }
    }

    /// Consume one block of captured samples.
    pub fn capture(&mut self, mut input: &[f32]) {
        while !input.is_empty() {
            let n = (self.chunk_samples - self.staging.len()).min(input.len());
            self.staging.extend_from_slice(&input[..n]);
            input = &input[n..];

            if self.staging.len() == self.chunk_samples {
                let next = self.next_staging();
                let samples = std::mem::replace(&mut self.staging, next);
                if let Ok(chunk) =
                    PcmBuffer::new(samples, self.settings.channels, self.settings.sample_rate)
                {
                    let spare = &self.spare_tx;
                    self.queue.push_with(chunk, |oldest| {
                        let _ = spare.try_send(oldest.into_samples());
                    });
                }
            }
        }
    }
}

/// Builder for [`InputTrack`], starting from the global config.
pub struct InputTrackBuilder {
    name: String,
    settings: StreamSettings,
    chunk_size: usize,
    queue_capacity: usize,
    device: Option<Arc<dyn AudioDevice>>,
}

impl InputTrackBuilder {
    fn new(name: String) -> Self {
        let config = config();
        Self {
            name,
            settings: config.stream_settings(),
            chunk_size: config.block_size as usize,
            queue_capacity: config.input_queue_capacity,
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

    /// Frames per chunk returned by [`InputTrack::read`].
    #[must_use]
    pub const fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Chunks kept before the oldest is dropped.
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn device(mut self, device: Arc<dyn AudioDevice>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn open(mut self) -> Result<InputTrack> {
        match self.device.take() {
            Some(device) => InputTrack::open(self, device.as_ref()),
            None => InputTrack::open(self, &CpalDevice::default_device()),
        }
    }
}

/// A named capture stream.
pub struct InputTrack {
    name: String,
    settings: StreamSettings,
    chunk_size: usize,
    queue: SharedPcmQueue,
    recycler: Sender<Vec<f32>>,
    events: Arc<EventQueue>,
    stream: Option<StreamHandle>,
}

impl InputTrack {
    /// Open a track on the default input device.
    pub fn new(name: impl Into<String>, settings: StreamSettings, chunk_size: usize) -> Result<Self> {
        Self::with_device(name, settings, chunk_size, &CpalDevice::default_device())
    }

    /// Open a track on `device`.
    pub fn with_device(
        name: impl Into<String>,
        settings: StreamSettings,
        chunk_size: usize,
        device: &dyn AudioDevice,
    ) -> Result<Self> {
        let builder = Self::builder(name).settings(settings).chunk_size(chunk_size);
        Self::open(builder, device)
    }

    pub fn builder(name: impl Into<String>) -> InputTrackBuilder {
        InputTrackBuilder::new(name.into())
    }

    fn open(builder: InputTrackBuilder, device: &dyn AudioDevice) -> Result<Self> {
        let InputTrackBuilder {
            name,
            settings,
            chunk_size,
            queue_capacity,
            ..
        } = builder;
        settings.validate()?;
        if chunk_size == 0 {
            return Err(Error::InvalidArgument(
                "chunk size must be non-zero".to_string(),
            ));
        }

        let queue = Arc::new(PcmQueue::bounded(queue_capacity));
        let events = Arc::new(EventQueue::new(EVENT_CAPACITY));
        let mut engine = InputEngine::new(settings, chunk_size, queue.clone());
        let recycler = engine.recycler();

        let on_error: ErrorCallback = {
            let events = events.clone();
            let name = name.clone();
            Arc::new(move |e| {
                error!("'{name}': {e}");
                events.emit(TrackEvent::Error(e.to_string()));
            })
        };
        let stream = device.open_input(
            &settings,
            Box::new(move |input: &[f32]| engine.capture(input)),
            on_error,
        )?;

        info!(
            "Opened input track '{name}' on {}: {} Hz, {} channels, chunks of {chunk_size} frames",
            device.name(),
            settings.sample_rate,
            settings.channels
        );

        Ok(Self {
            name,
            settings,
            chunk_size,
            queue,
            recycler,
            events,
            stream: Some(stream),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn settings(&self) -> StreamSettings {
        self.settings
    }

    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Oldest captured chunk, or `None` if nothing is ready. Never blocks.
    pub fn read(&self) -> Option<PcmBuffer> {
        self.queue.pop()
    }

    /// Give a chunk returned by [`read`](Self::read) back for reuse.
    /// Chunks too small to hold a full chunk are just dropped.
    pub fn recycle(&self, chunk: PcmBuffer) {
        let samples = chunk.into_samples();
        let needed = self.chunk_size * usize::from(self.settings.channels);
        if samples.capacity() >= needed {
            let _ = self.recycler.try_send(samples);
        }
    }

    /// Chunks waiting to be read.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Chunks lost because the reader fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Device errors reported while capturing.
    pub fn try_recv_event(&self) -> Option<TrackEvent> {
        self.events.try_recv()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<TrackEvent> {
        self.events.recv_timeout(timeout)
    }
}

impl Drop for InputTrack {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        info!("Closed input track '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ManualDevice;

    fn open_track(device: &Arc<ManualDevice>, chunk_size: usize, capacity: usize) -> InputTrack {
        InputTrack::builder("mic")
            .settings(StreamSettings::new(4, 16000, 1))
            .chunk_size(chunk_size)
            .queue_capacity(capacity)
            .device(device.clone())
            .open()
            .unwrap()
    }

    #[test]
    fn test_read_never_blocks() {
        let device = Arc::new(ManualDevice::new());
        let track = open_track(&device, 4, 8);
        assert!(track.read().is_none());
        assert_eq!(track.pending(), 0);
    }

    #[test]
    fn test_chunks_span_blocks() {
        let device = Arc::new(ManualDevice::new());
        let track = open_track(&device, 4, 8);

        device.push_input(&[0.0, 0.1, 0.2]);
        assert!(track.read().is_none());
        device.push_input(&[0.3, 0.4, 0.5, 0.6, 0.7, 0.8]);

        let first = track.read().unwrap();
        assert_eq!(first.samples(), &[0.0, 0.1, 0.2, 0.3]);
        assert_eq!(first.sample_rate(), 16000);
        let second = track.read().unwrap();
        assert_eq!(second.samples(), &[0.4, 0.5, 0.6, 0.7]);
        assert!(track.read().is_none());
    }

    #[test]
    fn test_slow_reader_loses_oldest() {
        let device = Arc::new(ManualDevice::new());
        let track = open_track(&device, 2, 3);

        for i in 0..5 {
            let value = i as f32;
            device.push_input(&[value, value]);
        }

        assert_eq!(track.pending(), 3);
        assert_eq!(track.dropped(), 2);
        assert_eq!(track.read().unwrap().samples(), &[2.0, 2.0]);
        assert_eq!(track.read().unwrap().samples(), &[3.0, 3.0]);
        assert_eq!(track.read().unwrap().samples(), &[4.0, 4.0]);
    }

    #[test]
    fn test_recycled_chunks_are_reused() {
        let device = Arc::new(ManualDevice::new());
        let track = open_track(&device, 4, 8);

        device.push_input(&[0.1; 4]);
        let first = track.read().unwrap();
        let storage = first.samples().as_ptr();
        track.recycle(first);

        // The chunk after next is built in the recycled storage
        device.push_input(&[0.2; 4]);
        device.push_input(&[0.3; 4]);
        assert_eq!(track.read().unwrap().samples(), &[0.2; 4]);
        let reused = track.read().unwrap();
        assert_eq!(reused.samples(), &[0.3; 4]);
        assert_eq!(reused.samples().as_ptr(), storage);
    }

    #[test]
    fn test_dropped_chunks_feed_the_pool() {
        let queue = Arc::new(PcmQueue::bounded(1));
        let mut engine = InputEngine::new(StreamSettings::new(4, 8000, 1), 2, queue.clone());

        engine.capture(&[1.0, 1.0]);
        engine.capture(&[2.0, 2.0]);
        // The evicted chunk's storage waits in the pool
        assert_eq!(engine.spare_rx.len(), 1);

        // From here on every chunk reuses what the last one evicted
        for i in 3..10 {
            let value = i as f32;
            engine.capture(&[value, value]);
            assert_eq!(engine.spare_rx.len(), 1);
        }
        assert_eq!(queue.pop().unwrap().samples(), &[9.0, 9.0]);
        assert_eq!(queue.dropped(), 8);
    }

    #[test]
    fn test_stereo_chunk_counts_frames() {
        let queue = Arc::new(PcmQueue::bounded(4));
        let mut engine = InputEngine::new(StreamSettings::new(4, 8000, 2), 2, queue.clone());
        engine.capture(&[0.1, 0.2, 0.3, 0.4, 0.5]);

        let chunk = queue.pop().unwrap();
        assert_eq!(chunk.frame_count(), 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let device = Arc::new(ManualDevice::new());
        let result = InputTrack::with_device(
            "mic",
            StreamSettings::new(4, 16000, 1),
            0,
            device.as_ref(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_drop_closes_stream() {
        let device = Arc::new(ManualDevice::new());
        let track = open_track(&device, 4, 8);
        assert_eq!(device.open_streams(), 1);
        drop(track);
        assert_eq!(device.open_streams(), 0);
    }
}
