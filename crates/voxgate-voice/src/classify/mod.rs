//! Classifier ports
//!
//! The detector treats every classifier as a black box returning a score.
//! Two reference voice-activity backends ship in-tree ([`EnergyClassifier`]
//! and [`WebRtcClassifier`]); anything else plugs in through the traits here,
//! either directly or via the [`crate::registry`].
//!
//! Closures implement the ports too, which keeps tests and one-off adapters
//! short:
//!
//! ```
//! use voxgate_voice::classify::{Classification, VoiceActivityClassifier};
//! use voxgate_voice::{AudioFrame, VoiceResult};
//!
//! let mut loud = |frame: &AudioFrame| -> VoiceResult<Classification> { Ok(if frame.rms() > 0.1 {
//!     Classification::speech(1.0)
//! } else {
//!     Classification::non_speech(0.0)
//! }) };
//! # let _ = &mut loud as &mut dyn VoiceActivityClassifier;
//! ```

mod bounded;
mod energy;
mod webrtc;

pub use bounded::{BoundedClassifier, BoundedSpeakerIdentifier, BoundedWakeWord};
pub use energy::{EnergyClassifier, EnergyConfig};
pub use webrtc::{WebRtcClassifier, WebRtcConfig};

use crate::error::VoiceResult;
use crate::frame::AudioFrame;
use serde::{Deserialize, Serialize};

/// Binary activity label reported alongside a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLabel {
    Speech,
    NonSpeech,
}

/// Result of classifying one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Confidence in [0.0, 1.0]
    pub score: f32,
    pub label: ActivityLabel,
}

impl Classification {
    /// What a frame counts as when its backend failed.
    pub const NEUTRAL: Classification = Classification {
        score: 0.0,
        label: ActivityLabel::NonSpeech,
    };

    pub fn speech(score: f32) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            label: ActivityLabel::Speech,
        }
    }

    pub fn non_speech(score: f32) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            label: ActivityLabel::NonSpeech,
        }
    }

    /// Positive activity: labelled speech with a score at or above `threshold`.
    pub fn is_speech(&self, threshold: f32) -> bool {
        self.label == ActivityLabel::Speech && self.score >= threshold
    }
}

/// Frame → speech / non-speech
pub trait VoiceActivityClassifier {
    fn classify(&mut self, frame: &AudioFrame) -> VoiceResult<Classification>;

    /// Forget per-stream state before classifying an unrelated stream.
    fn reset(&mut self) {}
}

impl<F> VoiceActivityClassifier for F
where
    F: FnMut(&AudioFrame) -> VoiceResult<Classification>,
{
    fn classify(&mut self, frame: &AudioFrame) -> VoiceResult<Classification> {
        self(frame)
    }
}

/// Outcome of a wake-word check on one frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordDetection {
    /// Detected keyword id, if any
    pub keyword: Option<String>,

    /// Per-keyword scores, when the backend reports them
    pub scores: Vec<(String, f32)>,
}

impl KeywordDetection {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn detected(keyword: impl Into<String>, score: f32) -> Self {
        let keyword = keyword.into();
        Self {
            scores: vec![(keyword.clone(), score)],
            keyword: Some(keyword),
        }
    }
}

/// Frame → detected keyword or none
pub trait WakeWordClassifier {
    fn detect(&mut self, frame: &AudioFrame) -> VoiceResult<KeywordDetection>;

    fn reset(&mut self) {}
}

impl<F> WakeWordClassifier for F
where
    F: FnMut(&AudioFrame) -> VoiceResult<KeywordDetection>,
{
    fn detect(&mut self, frame: &AudioFrame) -> VoiceResult<KeywordDetection> {
        self(frame)
    }
}
