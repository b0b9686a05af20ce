//! Error types for the voxgate voice pipeline

use crate::bridge::PeerId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur anywhere in the detection, playback or bridge paths
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Invalid audio frame: {0}")]
    InvalidFrame(String),

    /// The backend failed for this frame only; the detector treats it as silence.
    #[error("Classifier error: {0}")]
    ClassifierTransient(String),

    #[error("Classifier did not answer within {0:?}")]
    ClassifierTimeout(Duration),

    /// The backend is unusable; the owning stream halts.
    #[error("Classifier failed permanently: {0}")]
    ClassifierFatal(String),

    #[error("Sink write failed: {0}")]
    SinkWrite(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("Peer {0} disconnected")]
    PeerDisconnected(PeerId),

    #[error("Peer {0} is not connected")]
    PeerNotConnected(PeerId),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Resampler error: {0}")]
    Resample(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Channel receive error: {0}")]
    ChannelReceive(String),

    #[error("No {kind} backend registered under '{name}'")]
    UnknownBackend { kind: &'static str, name: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAV encoding error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Failures the detector absorbs as a neutral classification.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VoiceError::ClassifierTransient(_) | VoiceError::ClassifierTimeout(_)
        )
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<rodio::StreamError> for VoiceError {
    fn from(err: rodio::StreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<rodio::PlayError> for VoiceError {
    fn from(err: rodio::PlayError) -> Self {
        VoiceError::Playback(err.to_string())
    }
}
