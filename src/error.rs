//! Error taxonomy of the live voice core.
//!
//! None of these terminate a session: device and transport failures are
//! reported through the status label, payload and protocol failures are
//! confined to the single frame that caused them.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveError {
    /// The capture device could not be acquired. Playback keeps working.
    DevicePermissionDenied(String),
    /// An inbound payload was not valid transport-encoded PCM.
    MalformedPayload(String),
    /// Socket-level failure. The caller decides whether to reopen.
    Transport(String),
    /// A frame parsed, but did not have the expected envelope shape.
    ProtocolViolation(String),
    /// The output device could not be opened. Capture keeps working.
    OutputUnavailable(String),
    /// Configuration could not be loaded or resolved.
    Config(String),
}

impl fmt::Display for LiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveError::DevicePermissionDenied(msg) => {
                write!(f, "Capture device unavailable: {}", msg)
            }
            LiveError::MalformedPayload(msg) => write!(f, "Malformed payload: {}", msg),
            LiveError::Transport(msg) => write!(f, "Transport error: {}", msg),
            LiveError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            LiveError::OutputUnavailable(msg) => write!(f, "Audio output unavailable: {}", msg),
            LiveError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for LiveError {}

impl From<::config::ConfigError> for LiveError {
    fn from(err: ::config::ConfigError) -> Self {
        LiveError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(err: serde_json::Error) -> Self {
        LiveError::ProtocolViolation(err.to_string())
    }
}

pub type LiveResult<T> = Result<T, LiveError>;
