//! Buffers shared between real-time callbacks and ordinary threads.

pub mod queue;
pub mod ring;

pub use queue::{PcmQueue, SharedPcmQueue};
pub use ring::{shared_ring_buffer, RingBuffer, SharedRingBuffer};
