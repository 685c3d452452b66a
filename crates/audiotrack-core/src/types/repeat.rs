//! Repeat counts for file playback.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How many more times a file should be replayed after the current pass.
///
/// `Times(0)` plays the file once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Repeat {
    Times(u32),
    Forever,
}

impl Default for Repeat {
    fn default() -> Self {
        Self::Times(0)
    }
}

impl Repeat {
    /// Remaining replays, `None` for `Forever`.
    pub const fn remaining(self) -> Option<u32> {
        match self {
            Self::Times(n) => Some(n),
            Self::Forever => None,
        }
    }

    /// One more replay. `Forever` stays `Forever`.
    pub const fn incremented(self) -> Self {
        match self.remaining() {
            Some(n) => Self::Times(n.saturating_add(1)),
            None => Self::Forever,
        }
    }

    /// One fewer replay, or `None` when nothing is left.
    pub const fn decremented(self) -> Option<Self> {
        match self.remaining() {
            Some(0) => None,
            Some(n) => Some(Self::Times(n - 1)),
            None => Some(Self::Forever),
        }
    }
}

impl From<u32> for Repeat {
    fn from(n: u32) -> Self {
        Self::Times(n)
    }
}

impl fmt::Display for Repeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remaining() {
            Some(n) => write!(f, "{n}"),
            None => f.write_str("forever"),
        }
    }
}
