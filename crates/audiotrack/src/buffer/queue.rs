//! FIFO queues of PCM blocks.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use audiotrack_core::PcmBuffer;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Multi-producer FIFO of [`PcmBuffer`]s.
///
/// Pushing and popping never block. A full queue makes room
/// by discarding its oldest block, so a slow reader costs audio, not memory,
/// and never stalls the producing callback.
pub struct PcmQueue {
    tx: Sender<PcmBuffer>,
    rx: Receiver<PcmBuffer>,
    dropped: AtomicU64,
}

impl PcmQueue {
    /// Queue holding at most `capacity` blocks.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a block, discarding the oldest ones while the queue is full.
    ///
    /// Returns the number of blocks discarded to make room.
    pub fn push(&self, buffer: PcmBuffer) -> usize {
        self.push_with(buffer, drop)
    }

    /// [`push`](Self::push), handing discarded blocks to `evicted` instead
    /// of freeing them.
    pub fn push_with(&self, mut buffer: PcmBuffer, mut evicted: impl FnMut(PcmBuffer)) -> usize {
        let mut discarded = 0;
        loop {
            match self.tx.try_send(buffer) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    // A concurrent reader may have emptied a slot already
                    if let Ok(oldest) = self.rx.try_recv() {
                        discarded += 1;
                        evicted(oldest);
                    }
                    buffer = rejected;
                }
                // Both ends live in self
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        if discarded > 0 {
            self.dropped.fetch_add(discarded as u64, Ordering::Relaxed);
        }
        discarded
    }

    /// Oldest block, or `None` when empty.
    pub fn pop(&self) -> Option<PcmBuffer> {
        self.rx.try_recv().ok()
    }

    /// Discard everything queued. Returns the number of blocks removed.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    /// Total blocks discarded by [`push`](Self::push) since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Consumer handle.
    pub fn receiver(&self) -> Receiver<PcmBuffer> {
        self.rx.clone()
    }
}

/// Thread-safe reference to a PCM queue.
pub type SharedPcmQueue = Arc<PcmQueue>;
