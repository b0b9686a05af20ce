//! RMS energy voice-activity classifier

use super::{Classification, VoiceActivityClassifier};
use crate::error::{VoiceError, VoiceResult};
use crate::frame::AudioFrame;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Configuration for [`EnergyClassifier`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyConfig {
    /// RMS level (normalized, 0.0-1.0) at which a frame counts as speech
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f32,
}

fn default_energy_threshold() -> f32 {
    0.02
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            energy_threshold: default_energy_threshold(),
        }
    }
}

/// Labels a frame as speech when its RMS level reaches the threshold.
///
/// The score is scaled so that a frame exactly at the threshold scores 0.5
/// and twice the threshold saturates at 1.0, which lines up with the
/// detector's default activity threshold.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    config: EnergyConfig,
}

impl EnergyClassifier {
    pub fn new(config: EnergyConfig) -> VoiceResult<Self> {
        if !(config.energy_threshold > 0.0 && config.energy_threshold < 1.0) {
            return Err(VoiceError::Config(format!(
                "energy threshold must be in (0, 1), got {}",
                config.energy_threshold
            )));
        }
        Ok(Self { config })
    }
}

impl VoiceActivityClassifier for EnergyClassifier {
    fn classify(&mut self, frame: &AudioFrame) -> VoiceResult<Classification> {
        let rms = frame.rms();
        let score = rms / (2.0 * self.config.energy_threshold);
        trace!(rms, score, "energy classification");
        Ok(if rms >= self.config.energy_threshold {
            Classification::speech(score)
        } else {
            Classification::non_speech(score)
        })
    }
}
