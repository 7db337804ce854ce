//! Error types shared by the synthesis pipeline.

use std::path::PathBuf;

/// Errors raised while turning a speech request into audio.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// A request field is missing or out of range. Always client-correctable.
    #[error("invalid '{field}': {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// No audio sample exists for the requested voice.
    #[error("voice '{0}' not found")]
    ProfileNotFound(String),

    /// The audio sample exists but its transcript does not.
    #[error("voice '{voice}' is missing its transcript file {}", transcript.display())]
    ProfileIncomplete { voice: String, transcript: PathBuf },

    /// The model layer failed. The cause is for logs, not for clients.
    #[error("synthesis failed: {0}")]
    SynthesisFailed(#[from] SynthesisCause),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Why a synthesis attempt failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SynthesisCause {
    /// The voice profile passed resolution but could not be read when the job ran.
    #[error("voice profile '{voice}' is unreadable: {reason}")]
    ProfileUnreadable { voice: String, reason: String },

    /// The model reported an error while starting or during generation.
    #[error("{0}")]
    Model(String),

    /// The model panicked; the worker recovered and keeps serving.
    #[error("model panicked: {0}")]
    Panicked(String),

    /// The model worker thread is gone.
    #[error("model worker is not running")]
    WorkerUnavailable,
}

/// Convenience alias used across the crate.
pub type SpeechResult<T> = Result<T, SpeechError>;

impl SpeechError {
    /// Create a validation error for `field`.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Create a synthesis failure carrying a model message.
    pub fn model(message: impl Into<String>) -> Self {
        Self::SynthesisFailed(SynthesisCause::Model(message.into()))
    }

    /// The request field this error should be reported against, if any.
    pub fn param(&self) -> Option<&'static str> {
        match self {
            Self::Validation { field, .. } => Some(*field),
            Self::ProfileNotFound(_) | Self::ProfileIncomplete { .. } => Some("voice"),
            _ => None,
        }
    }
}
