//! Error types for the Cadence voice pipeline

use serde::Serialize;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Capture permission denied: {0}")]
    CapturePermission(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Response stream error: {0}")]
    Response(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Coarse failure classes surfaced to the application.
///
/// Unit-level failures (`Synthesis`, `Playback`) are absorbed by the component
/// that owns the unit; only turn-level ones reach the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Synthesis,
    Playback,
    Transcription,
    Network,
    UnrecoverableInit,
    Internal,
}

impl VoiceError {
    /// Classify this error for recovery decisions.
    pub fn kind(&self) -> FailureKind {
        match self {
            VoiceError::Tts(_) => FailureKind::Synthesis,
            VoiceError::Playback(_) => FailureKind::Playback,
            VoiceError::Stt(_) => FailureKind::Transcription,
            VoiceError::Network(_) | VoiceError::Response(_) => FailureKind::Network,
            VoiceError::AudioDevice(_)
            | VoiceError::CapturePermission(_)
            | VoiceError::AudioStream(_)
            | VoiceError::VadInit(_) => FailureKind::UnrecoverableInit,
            _ => FailureKind::Internal,
        }
    }

    /// Whether the conversation can continue after this error.
    pub fn is_fatal(&self) -> bool {
        self.kind() == FailureKind::UnrecoverableInit
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
