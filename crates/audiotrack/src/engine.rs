//! Output render loop run by the device callback.
//!
//! [`OutputEngine::render`] is the only code that runs on the real-time
//! thread. Per block it:
//! 1. installs a newly scheduled source, if the generation moved
//! 2. applies a pending volume command
//! 3. pulls samples from the source (silence when paused or stopped)
//! 4. handles end of file: replay, or stop and retire the source
//! 5. applies the volume envelope and publishes gain and position
//!
//! It never blocks: shared slots are `try_lock`ed and everything that must
//! allocate, free or run user code is posted to the dispatcher thread.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use audiotrack_core::{PcmBuffer, StreamSettings};
use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::control::{ControlState, TrackState, VolumeControl};
use crate::envelope::VolumeEnvelope;
use crate::events::{post, Notice};
use crate::source::{AudioSource, Pull};

/// Source change requested by a control thread.
pub(crate) enum SourceSwap {
    Install(AudioSource),
    Clear,
}

/// State shared between a track's control surface and its engine.
pub(crate) struct EngineShared {
    pub state: ControlState,
    pub volume: VolumeControl,
    /// Bumped every time a swap is scheduled.
    generation: AtomicU64,
    swap: Mutex<Option<SourceSwap>>,
    /// Frames into the current file pass, or frames of queued audio played.
    position: AtomicU64,
}

impl EngineShared {
    pub fn new(state: TrackState, gain: f32) -> Self {
        Self {
            state: ControlState::new(state),
            volume: VolumeControl::new(gain),
            generation: AtomicU64::new(0),
            swap: Mutex::new(None),
            position: AtomicU64::new(0),
        }
    }

    /// Hand a new source to the engine. A swap the engine has not picked up
    /// yet is replaced. Returns the new generation.
    pub fn schedule(&self, swap: SourceSwap) -> u64 {
        let (replaced, generation) = {
            let mut slot = self.swap.lock();
            let replaced = slot.replace(swap);
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            (replaced, generation)
        };
        // Freed outside the lock
        drop(replaced);
        generation
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Drop a swap the engine never picked up.
    pub fn discard_pending(&self) {
        let pending = self.swap.lock().take();
        drop(pending);
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Engine side: take the scheduled swap without waiting, along with
    /// the generation it belongs to. `None` while a control thread holds
    /// the slot.
    fn try_take(&self) -> Option<(Option<SourceSwap>, u64)> {
        let mut slot = self.swap.try_lock()?;
        Some((slot.take(), self.generation.load(Ordering::Acquire)))
    }
}

/// Render state owned by the device callback.
pub(crate) struct OutputEngine {
    shared: Arc<EngineShared>,
    settings: StreamSettings,
    source: Option<AudioSource>,
    /// Generation of the source currently installed.
    installed: u64,
    envelope: VolumeEnvelope,
    notices: Sender<Notice>,
}

impl OutputEngine {
    pub fn new(
        shared: Arc<EngineShared>,
        settings: StreamSettings,
        source: Option<AudioSource>,
        notices: Sender<Notice>,
    ) -> Self {
        let envelope = VolumeEnvelope::new(shared.volume.current());
        let installed = shared.generation();
        Self {
            shared,
            settings,
            source,
            installed,
            envelope,
            notices,
        }
    }

    /// Fill one interleaved output block.
    pub fn render(&mut self, out: &mut [f32]) {
        let channels = usize::from(self.settings.channels);

        if self.shared.generation() != self.installed && !self.install_pending() {
            // Mid-swap; the old source must not play and the new one is not
            // reachable yet
            out.fill(0.0);
            return;
        }

        if let Some(command) = self.shared.volume.take_pending() {
            command.apply_to(&mut self.envelope);
        }

        if self.shared.state.get().is_audible() {
            self.fill(out);
        } else {
            out.fill(0.0);
        }

        self.envelope.apply(out, channels);
        self.shared.volume.publish(self.envelope.current());
        if let Some(source) = &self.source {
            self.shared
                .position
                .store(source.position(), Ordering::Release);
        }
    }

    /// Returns `false` if the swap slot was busy.
    fn install_pending(&mut self) -> bool {
        let Some((swap, generation)) = self.shared.try_take() else {
            return false;
        };
        self.installed = generation;

        let previous = match swap {
            Some(SourceSwap::Install(source)) => self.source.replace(source),
            Some(SourceSwap::Clear) => self.source.take(),
            None => None,
        };
        self.shared.position.store(0, Ordering::Release);
        if let Some(previous) = previous {
            post(&self.notices, Notice::Retired(previous));
        }
        true
    }

    fn fill(&mut self, out: &mut [f32]) {
        let Self {
            source, notices, ..
        } = self;
        let notices: &Sender<Notice> = notices;

        let mut written = 0;
        let mut finished = false;
        match source {
            None => {}
            Some(AudioSource::Queue(queue)) => {
                let mut release = |buffer: PcmBuffer| {
                    post(notices, Notice::Released(buffer));
                };
                written = queue.fill(out, &mut release);
            }
            Some(AudioSource::File(file)) => {
                // Samples since the last rewind; a pass that yields nothing
                // must not spin
                let mut since_rewind = usize::MAX;
                while written < out.len() {
                    match file.pull(&mut out[written..]) {
                        Pull::Samples(n) => {
                            written += n;
                            since_rewind = since_rewind.saturating_add(n);
                        }
                        Pull::Underrun | Pull::Failed => break,
                        Pull::Exhausted => {
                            if since_rewind == 0 {
                                break;
                            }
                            // on_end may still change the count; wait for it
                            if file.repeat().is_unsettled() {
                                break;
                            }
                            match file.repeat().consume() {
                                Some(repeat_left) => {
                                    let handled = file.file().has_on_end();
                                    if handled {
                                        file.repeat().unsettle();
                                    }
                                    let posted = post(
                                        notices,
                                        Notice::FileEnded {
                                            file: file.file().clone(),
                                            repeat: file.repeat().clone(),
                                            repeat_left,
                                        },
                                    );
                                    if handled && !posted {
                                        file.repeat().settle();
                                    }
                                    file.rewind();
                                    since_rewind = 0;
                                }
                                None => {
                                    finished = true;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        out[written..].fill(0.0);

        if finished {
            self.finish();
        }
    }

    /// Last pass played out: stop unless a control thread already moved the
    /// state, and hand the source off.
    ///
    /// Runs with the swap slot held so that a source scheduled concurrently
    /// either lands before the check or finds the track already stopped.
    /// A busy slot defers the finish to the next block.
    fn finish(&mut self) {
        let stopped = {
            let Some(_slot) = self.shared.swap.try_lock() else {
                return;
            };
            // A replacement is already scheduled and owns the state now
            self.shared.generation() == self.installed
                && self
                    .shared
                    .state
                    .transition(TrackState::Playing, TrackState::Stopped)
        };
        if !stopped {
            return;
        }
        if let Some(source) = self.source.take() {
            if let AudioSource::File(file) = &source {
                post(
                    &self.notices,
                    Notice::Finished {
                        file: file.file().clone(),
                    },
                );
            }
            post(&self.notices, Notice::Retired(source));
        }
    }
}
