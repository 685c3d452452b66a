//! Track control state shared between control threads and the device callback.
//!
//! Control threads only ever write here; the callback reads every block.
//! Nothing in this module makes the callback wait: state is atomic and the
//! volume slot is only `try_lock`ed from the callback side.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::envelope::VolumeEnvelope;

/// Playback state of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackState {
    Playing,
    Paused,
    #[default]
    Stopped,
}

impl TrackState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Playing => 0,
            Self::Paused => 1,
            Self::Stopped => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Playing,
            1 => Self::Paused,
            _ => Self::Stopped,
        }
    }

    /// Whether the callback should pull from the source.
    pub const fn is_audible(self) -> bool {
        matches!(self, Self::Playing)
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Atomic [`TrackState`] cell.
///
/// Transitions are compare-and-swap so concurrent callers cannot interleave
/// into a state neither of them asked for. Transitions that do not apply to
/// the current state are no-ops reported as `false`.
#[derive(Debug)]
pub struct ControlState {
    state: AtomicU8,
}

impl ControlState {
    pub const fn new(initial: TrackState) -> Self {
        Self {
            state: AtomicU8::new(initial.to_u8()),
        }
    }

    pub fn get(&self) -> TrackState {
        TrackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Unconditionally set, returning the previous state.
    pub fn set(&self, state: TrackState) -> TrackState {
        TrackState::from_u8(self.state.swap(state.to_u8(), Ordering::AcqRel))
    }

    /// Move `from` -> `to` only if currently `from`.
    pub fn transition(&self, from: TrackState, to: TrackState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn pause(&self) -> bool {
        self.transition(TrackState::Playing, TrackState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(TrackState::Paused, TrackState::Playing)
    }

    /// Returns `false` if the state was already `Stopped`.
    pub fn stop(&self) -> bool {
        self.set(TrackState::Stopped) != TrackState::Stopped
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new(TrackState::Stopped)
    }
}

/// Atomic `f32`, stored as its bit pattern.
#[derive(Debug)]
pub struct AtomicF32 {
    bits: AtomicU32,
}

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicU32::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> f32 {
        f32::from_bits(self.bits.load(ordering))
    }

    #[inline]
    pub fn store(&self, value: f32, ordering: Ordering) {
        self.bits.store(value.to_bits(), ordering);
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// A volume change waiting for the callback to pick it up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeCommand {
    /// Ramp from wherever the gain is to `target` over `frames` frames.
    Ramp { target: f32, frames: u32 },
    /// Set the gain now, cancelling any ramp.
    Immediate(f32),
}

impl VolumeCommand {
    pub const fn target(self) -> f32 {
        match self {
            Self::Ramp { target, .. } | Self::Immediate(target) => target,
        }
    }

    pub fn apply_to(self, envelope: &mut VolumeEnvelope) {
        match self {
            Self::Ramp { target, frames } => envelope.ramp_to(target, frames),
            Self::Immediate(gain) => envelope.set_immediate(gain),
        }
    }
}

/// Control-side handle on a track's gain.
///
/// Writers store the latest command in a single slot (a newer command
/// replaces one the callback has not consumed yet). The callback publishes
/// the gain it actually reached after every block.
#[derive(Debug)]
pub struct VolumeControl {
    pending: Mutex<Option<VolumeCommand>>,
    current: AtomicF32,
    target: AtomicF32,
}

impl VolumeControl {
    pub fn new(gain: f32) -> Self {
        Self {
            pending: Mutex::new(None),
            current: AtomicF32::new(gain),
            target: AtomicF32::new(gain),
        }
    }

    /// Queue a command for the next callback.
    pub fn submit(&self, command: VolumeCommand) {
        {
            let mut pending = self.pending.lock();
            *pending = Some(command);
            self.target.store(command.target(), Ordering::Release);
        }
    }

    /// Callback side: take the pending command without waiting.
    ///
    /// Returns `None` both when nothing is pending and when a control thread
    /// holds the slot; in the latter case the command is seen next block.
    pub fn take_pending(&self) -> Option<VolumeCommand> {
        self.pending.try_lock().and_then(|mut pending| pending.take())
    }

    /// Callback side: publish the gain reached at the end of a block.
    pub fn publish(&self, gain: f32) {
        self.current.store(gain, Ordering::Release);
    }

    /// Most recently published gain.
    pub fn current(&self) -> f32 {
        self.current.load(Ordering::Acquire)
    }

    /// Gain the track is heading to.
    pub fn target(&self) -> f32 {
        self.target.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_transitions() {
        let control = ControlState::new(TrackState::Playing);

        assert!(control.pause());
        assert_eq!(control.get(), TrackState::Paused);
        assert!(!control.pause());

        assert!(control.resume());
        assert_eq!(control.get(), TrackState::Playing);

        assert!(control.stop());
        assert!(!control.stop());
        assert_eq!(control.get(), TrackState::Stopped);
    }

    #[test]
    fn test_resume_while_stopped_is_noop() {
        let control = ControlState::default();
        assert!(!control.resume());
        assert!(!control.pause());
        assert_eq!(control.get(), TrackState::Stopped);
    }

    #[test]
    fn test_latest_volume_command_wins() {
        let volume = VolumeControl::new(1.0);
        volume.submit(VolumeCommand::Ramp {
            target: 0.0,
            frames: 160,
        });
        volume.submit(VolumeCommand::Ramp {
            target: 1.0,
            frames: 160,
        });

        assert!((volume.target() - 1.0).abs() < f32::EPSILON);
        assert_eq!(
            volume.take_pending(),
            Some(VolumeCommand::Ramp {
                target: 1.0,
                frames: 160
            })
        );
        assert_eq!(volume.take_pending(), None);
    }

    #[test]
    fn test_only_the_callback_publishes_gain() {
        let volume = VolumeControl::new(1.0);
        volume.submit(VolumeCommand::Immediate(0.0));
        assert!(volume.target().abs() < f32::EPSILON);
        // A block already in flight still reports the gain it played at
        assert!((volume.current() - 1.0).abs() < f32::EPSILON);

        volume.publish(0.0);
        assert!(volume.current().abs() < f32::EPSILON);
    }

    #[test]
    fn test_take_pending_does_not_wait() {
        let volume = VolumeControl::new(1.0);
        volume.submit(VolumeCommand::Immediate(0.5));

        let guard = volume.pending.lock();
        assert_eq!(volume.take_pending(), None);
        drop(guard);
        assert_eq!(volume.take_pending(), Some(VolumeCommand::Immediate(0.5)));
    }

    #[test]
    fn test_concurrent_stop_and_pause() {
        let control = Arc::new(ControlState::new(TrackState::Playing));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let control = control.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            control.pause();
                            control.resume();
                        } else {
                            control.stop();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // Once stopped, pause/resume can never leave Stopped
        assert_eq!(control.get(), TrackState::Stopped);
    }
}
