//! Error types for loopcap
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues.

use thiserror::Error;

/// Top-level error type for the loopcap application
#[derive(Error, Debug)]
pub enum LoopcapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audio capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by device enumeration, capture backends and the session engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("No audio capture devices available. Install or enable a loopback source (PulseAudio monitor, WASAPI loopback, BlackHole).")]
    NoDeviceAvailable,

    #[error("Failed to open audio device '{device}': {reason}")]
    DeviceOpenFailed { device: String, reason: String },

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("No recording in progress")]
    NotRecording,

    #[error("Recording is already paused")]
    AlreadyPaused,

    #[error("Recording is not paused")]
    NotPaused,

    #[error("Audio read failed: {0}")]
    AudioReadFailed(String),

    #[error("Chunk callback failed: {0}")]
    CallbackError(String),

    #[error("Failed to write audio chunk: {0}")]
    ChunkWrite(String),

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),
}

impl CaptureError {
    /// Whether this error is a state-machine misuse (expected under racing callers)
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            CaptureError::AlreadyRecording
                | CaptureError::NotRecording
                | CaptureError::AlreadyPaused
                | CaptureError::NotPaused
        )
    }
}

impl From<hound::Error> for CaptureError {
    fn from(e: hound::Error) -> Self {
        CaptureError::ChunkWrite(e.to_string())
    }
}

/// Result type alias using LoopcapError
pub type Result<T> = std::result::Result<T, LoopcapError>;
