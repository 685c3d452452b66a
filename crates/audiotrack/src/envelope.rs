//! Per-track gain with linear ramps.
//!
//! The envelope advances once per frame: every channel of a frame gets the
//! same gain, so ramp length does not depend on the channel count.

/// Frames a ramp of `smoothness` seconds takes at `sample_rate`.
///
/// Zero (or negative, or NaN) smoothness means an instantaneous change; any
/// positive value lasts at least one frame.
pub fn ramp_frames(smoothness: f32, sample_rate: u32) -> u32 {
    if smoothness.is_nan() || smoothness <= 0.0 {
        return 0;
    }
    let frames = (f64::from(smoothness) * f64::from(sample_rate)).round();
    frames.clamp(1.0, f64::from(u32::MAX)) as u32
}

/// Gain state evaluated inside the device callback.
///
/// Invariant: `remaining == 0` implies `current == target`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeEnvelope {
    current: f32,
    target: f32,
    step: f32,
    remaining: u32,
}

impl VolumeEnvelope {
    pub const fn new(gain: f32) -> Self {
        Self {
            current: gain,
            target: gain,
            step: 0.0,
            remaining: 0,
        }
    }

    pub const fn current(&self) -> f32 {
        self.current
    }

    pub const fn target(&self) -> f32 {
        self.target
    }

    /// Frames left in the ramp in flight.
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }

    pub const fn is_ramping(&self) -> bool {
        self.remaining > 0
    }

    /// Jump to `gain`, cancelling any ramp in flight.
    pub fn set_immediate(&mut self, gain: f32) {
        self.current = gain;
        self.target = gain;
        self.step = 0.0;
        self.remaining = 0;
    }

    /// Start a linear ramp from the current gain to `target` over `frames`.
    ///
    /// Replaces any ramp in flight; the new ramp starts wherever the old one
    /// had got to, so the gain never jumps.
    pub fn ramp_to(&mut self, target: f32, frames: u32) {
        if frames == 0 {
            self.set_immediate(target);
            return;
        }
        self.target = target;
        self.remaining = frames;
        self.step = (target - self.current) / frames as f32;
    }

    /// Gain for the next frame.
    #[inline]
    pub fn next_gain(&mut self) -> f32 {
        if self.remaining > 0 {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.current = self.target;
            } else {
                self.current += self.step;
            }
        }
        self.current
    }

    /// Scale an interleaved block in place, advancing one step per frame.
    pub fn apply(&mut self, samples: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        if !self.is_ramping() {
            let gain = self.current;
            if (gain - 1.0).abs() > f32::EPSILON {
                samples.iter_mut().for_each(|s| *s *= gain);
            }
            return;
        }

        for frame in samples.chunks_mut(channels) {
            let gain = self.next_gain();
            frame.iter_mut().for_each(|s| *s *= gain);
        }
    }
}

impl Default for VolumeEnvelope {
    fn default() -> Self {
        Self::new(1.0)
    }
}
