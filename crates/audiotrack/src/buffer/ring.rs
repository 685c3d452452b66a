//! Lock-free ring buffer for streamed file playback.
//!
//! A decode thread writes samples and the device callback reads them. Both
//! sides move whole frames only, so the reader never sees half a frame even
//! when the writer is interrupted mid-chunk.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free single-producer, single-consumer ring of interleaved samples.
///
/// Allocates once at construction; `read` and `write` never allocate, which
/// makes `read` safe to call from a real-time callback.
pub struct RingBuffer {
    /// The underlying sample storage.
    buffer: Box<[UnsafeCell<f32>]>,
    /// Samples read so far (monotonic, wrapping).
    read_pos: AtomicUsize,
    /// Samples written so far (monotonic, wrapping).
    write_pos: AtomicUsize,
    /// Buffer capacity in samples, a whole number of frames.
    capacity: usize,
    channels: usize,
}

impl RingBuffer {
    /// Create a ring holding at least `frames` frames of `channels` samples.
    pub fn new(frames: usize, channels: u16) -> Self {
        let channels = usize::from(channels.max(1));
        let capacity = frames.max(1) * channels;
        let buffer = (0..capacity).map(|_| UnsafeCell::new(0.0f32)).collect();

        Self {
            buffer,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            capacity,
            channels,
        }
    }

    /// Capacity in samples.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Samples available for reading.
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Free slots for writing, in samples.
    pub fn free(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free() < self.channels
    }

    /// Write as many whole frames from `samples` as fit.
    ///
    /// Returns the number of samples written. Producer side only.
    pub fn write(&self, samples: &[f32]) -> usize {
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let read_pos = self.read_pos.load(Ordering::Acquire);

        let space = self.capacity - write_pos.wrapping_sub(read_pos);
        let to_write = align_down(samples.len().min(space), self.channels);
        if to_write == 0 {
            return 0;
        }

        for (offset, sample) in samples[..to_write].iter().enumerate() {
            let slot = &self.buffer[write_pos.wrapping_add(offset) % self.capacity];
            // SAFETY: slots between write_pos and read_pos + capacity belong
            // to the single producer until write_pos is published below.
            #[allow(unsafe_code)]
            unsafe {
                *slot.get() = *sample;
            }
        }

        self.write_pos
            .store(write_pos.wrapping_add(to_write), Ordering::Release);

        to_write
    }

    /// Read whole frames into `output`.
    ///
    /// Returns the number of samples read. Consumer side only.
    pub fn read(&self, output: &mut [f32]) -> usize {
        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);

        let available = write_pos.wrapping_sub(read_pos);
        let to_read = align_down(output.len().min(available), self.channels);
        if to_read == 0 {
            return 0;
        }

        for (offset, out) in output[..to_read].iter_mut().enumerate() {
            let slot = &self.buffer[read_pos.wrapping_add(offset) % self.capacity];
            // SAFETY: slots between read_pos and write_pos were published by
            // the producer and are not touched again until read_pos moves.
            #[allow(unsafe_code)]
            unsafe {
                *out = *slot.get();
            }
        }

        self.read_pos
            .store(read_pos.wrapping_add(to_read), Ordering::Release);

        to_read
    }
}

const fn align_down(samples: usize, channels: usize) -> usize {
    samples - samples % channels
}

// SAFETY: producer and consumer touch disjoint slot ranges, coordinated by
// the acquire/release positions above.
#[allow(unsafe_code)]
unsafe impl Send for RingBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for RingBuffer {}

/// Thread-safe reference to a ring buffer.
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer.
pub fn shared_ring_buffer(frames: usize, channels: u16) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(frames, channels))
}
