//! Error types for the steering core
//!
//! Chunk-level failures never leave the stream session; connection-level
//! failures drive its state machine. Only `SessionLost` needs the user to act.

use thiserror::Error;

/// A parameter value that was rejected before anything was sent upstream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("bpm {value} is outside the supported range {min}..={max}")]
    BpmOutOfRange { value: u16, min: u16, max: u16 },

    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },

    #[error("prompt {index} has empty text")]
    EmptyPrompt { index: usize },

    #[error("prompt {index} weight must be within [0, 1], got {weight}")]
    PromptWeight { index: usize, weight: f32 },

    #[error("unknown scale {0:?}")]
    UnknownScale(String),
}

/// Steering core errors
#[derive(Error, Debug, Clone)]
pub enum SteerError {
    /// Bad parameter value, rejected locally
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Initial handshake with the model failed
    #[error("Connect error: {0}")]
    Connect(String),

    /// A single chunk could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The stream to the model dropped
    #[error("Connection dropped: {0}")]
    ConnectionDropped(String),

    /// Reconnect attempts were exhausted
    #[error("Session lost: {0}")]
    SessionLost(String),

    /// Playback has been starved for several callbacks in a row
    #[error("Playback stalled after {consecutive} empty callbacks")]
    PlaybackStalled { consecutive: u32 },

    /// Audio device initialization or operation error
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    /// Channel communication error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SteerError {
    /// Check if this error is recoverable
    ///
    /// Recoverable errors are absorbed by the session and show up as brief
    /// silence at most. The rest need a restart or user intervention.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SteerError::Validation(_) => true,
            // The controller retries the handshake before giving up
            SteerError::Connect(_) => true,
            SteerError::Decode(_) => true,
            SteerError::ConnectionDropped(_) => true,
            SteerError::SessionLost(_) => false,
            SteerError::PlaybackStalled { .. } => true,
            SteerError::AudioDevice(_) => false,
            SteerError::Channel(_) => false,
            SteerError::Config(_) => false,
        }
    }

    /// Get a user-friendly description of the error
    pub fn user_message(&self) -> String {
        match self {
            SteerError::Validation(e) => format!("Invalid parameter: {}", e),
            SteerError::Connect(_) => {
                "Could not connect to the music model. Please try again.".to_string()
            }
            SteerError::Decode(_) => "Some audio could not be decoded and was skipped.".to_string(),
            SteerError::ConnectionDropped(_) => "Connection interrupted, reconnecting...".to_string(),
            SteerError::SessionLost(_) => {
                "Connection lost. Start the session again to resume.".to_string()
            }
            SteerError::PlaybackStalled { .. } => "Waiting for audio from the model...".to_string(),
            SteerError::AudioDevice(_) => {
                "Audio device error. Please check your speakers.".to_string()
            }
            SteerError::Channel(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            SteerError::Config(_) => "Configuration error. Please check settings.".to_string(),
        }
    }
}

/// Result type alias for steering operations
pub type Result<T> = std::result::Result<T, SteerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_converts() {
        let err: SteerError = ValidationError::BpmOutOfRange {
            value: 250,
            min: 60,
            max: 200,
        }
        .into();
        assert!(matches!(err, SteerError::Validation(_)));
        assert!(err.to_string().contains("250"));
    }

    #[test]
    fn test_only_session_lost_needs_user() {
        assert!(!SteerError::SessionLost("gone".into()).is_recoverable());
        assert!(SteerError::ConnectionDropped("eof".into()).is_recoverable());
        assert!(SteerError::Decode("bad".into()).is_recoverable());
        assert!(SteerError::PlaybackStalled { consecutive: 5 }.is_recoverable());
    }

    #[test]
    fn test_user_message_not_empty() {
        let err = SteerError::AudioDevice("no device".into());
        assert!(!err.user_message().is_empty());
    }
}
