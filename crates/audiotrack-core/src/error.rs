//! Error types for audiotrack.

use thiserror::Error;

/// Result type alias using audiotrack's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for audiotrack.
///
/// Errors raised on a control thread are returned to the caller. Errors that
/// happen on the real-time device thread are never raised there: the track
/// emits silence and reports the error on its event channel instead.
#[derive(Error, Debug)]
pub enum Error {
    // Device errors
    #[error("Audio device error: {0}")]
    Device(String),

    // Source errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Configuration mismatch: {0}")]
    Configuration(String),

    #[error("Audio conversion failed: {0}")]
    Conversion(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if the track that produced this error cannot continue.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Device(_))
    }

    /// Returns true if the error was caused by the source material rather
    /// than by the device or the caller.
    pub const fn is_source_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Conversion(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        assert!(Error::Device("gone".into()).is_fatal());
        assert!(!Error::Decode("corrupt".into()).is_fatal());
        assert!(!Error::Configuration("rate".into()).is_fatal());
    }

    #[test]
    fn test_error_source() {
        assert!(Error::Decode("corrupt".into()).is_source_error());
        assert!(Error::Conversion("no ffmpeg".into()).is_source_error());
        assert!(!Error::InvalidArgument("x".into()).is_source_error());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Configuration("sample rate 44100 != 16000".into());
        assert_eq!(
            err.to_string(),
            "Configuration mismatch: sample rate 44100 != 16000"
        );
    }
}
