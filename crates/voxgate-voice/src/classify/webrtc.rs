//! Voice Activity Detection using WebRTC VAD
//!
//! Wraps the WebRTC VAD as a [`VoiceActivityClassifier`]. The engine only
//! accepts 10, 20 or 30 ms windows at 8/16/32/48 kHz, so incoming frames are
//! cut into windows (carrying the remainder over to the next frame) and the
//! frame score is the fraction of voiced windows.
//!
//! `webrtc_vad::Vad` is not `Send`; run it on the detector thread or inside a
//! [`super::BoundedClassifier`] worker.

use super::{Classification, VoiceActivityClassifier};
use crate::error::{VoiceError, VoiceResult};
use crate::frame::AudioFrame;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for the WebRTC classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Detection mode (0-3, where 3 is most aggressive)
    #[serde(default = "default_mode")]
    pub mode: u8,

    /// Analysis window in milliseconds (10, 20 or 30)
    #[serde(default = "default_window_ms")]
    pub window_ms: u32,
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_mode() -> u8 {
    3
}

fn default_window_ms() -> u32 {
    30
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            mode: default_mode(),
            window_ms: default_window_ms(),
        }
    }
}

/// Voice-activity classifier backed by WebRTC VAD
pub struct WebRtcClassifier {
    vad: Vad,
    config: WebRtcConfig,
    window: usize,
    carry: Vec<i16>,
    last: Classification,
}

impl WebRtcClassifier {
    pub fn new(config: WebRtcConfig) -> VoiceResult<Self> {
        info!(
            sample_rate = config.sample_rate,
            mode = config.mode,
            "🎙️ Initializing WebRTC VAD"
        );
        if !matches!(config.window_ms, 10 | 20 | 30) {
            return Err(VoiceError::Config(format!(
                "WebRTC VAD windows must be 10, 20 or 30 ms, got {}",
                config.window_ms
            )));
        }
        let vad = build_vad(&config)?;
        let window = (config.sample_rate * config.window_ms / 1000) as usize;
        Ok(Self {
            vad,
            config,
            window,
            carry: Vec::new(),
            last: Classification::NEUTRAL,
        })
    }

    /// Samples per analysis window.
    pub fn window(&self) -> usize {
        self.window
    }
}

fn build_vad(config: &WebRtcConfig) -> VoiceResult<Vad> {
    let sample_rate = match config.sample_rate {
        8000 => SampleRate::Rate8kHz,
        16000 => SampleRate::Rate16kHz,
        32000 => SampleRate::Rate32kHz,
        48000 => SampleRate::Rate48kHz,
        other => {
            return Err(VoiceError::Config(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {other}"
            )))
        }
    };
    let mode = match config.mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        3 => VadMode::VeryAggressive,
        other => {
            return Err(VoiceError::Config(format!(
                "VAD mode must be 0-3, got {other}"
            )))
        }
    };
    let mut vad = Vad::new();
    vad.set_mode(mode);
    vad.set_sample_rate(sample_rate);
    Ok(vad)
}

impl VoiceActivityClassifier for WebRtcClassifier {
    fn classify(&mut self, frame: &AudioFrame) -> VoiceResult<Classification> {
        let format = frame.format();
        if format.sample_rate != self.config.sample_rate {
            return Err(VoiceError::ClassifierFatal(format!(
                "WebRTC VAD configured for {} Hz, frame is {format}",
                self.config.sample_rate
            )));
        }

        let channels = format.channels.max(1) as usize;
        let samples = frame.to_i16();
        self.carry.extend(
            samples
                .chunks_exact(channels)
                .map(|s| (s.iter().map(|v| *v as i32).sum::<i32>() / channels as i32) as i16),
        );

        let mut windows = 0usize;
        let mut voiced = 0usize;
        let mut offset = 0;
        while self.carry.len() - offset >= self.window {
            let window = &self.carry[offset..offset + self.window];
            let is_voice = self.vad.is_voice_segment(window).map_err(|_| {
                VoiceError::ClassifierTransient(format!(
                    "WebRTC VAD rejected a {} sample window",
                    window.len()
                ))
            })?;
            windows += 1;
            voiced += usize::from(is_voice);
            offset += self.window;
        }
        self.carry.drain(..offset);

        if windows == 0 {
            // frame shorter than one window: hold the previous decision
            return Ok(self.last);
        }

        let score = voiced as f32 / windows as f32;
        debug!(windows, voiced, "WebRTC VAD result");
        self.last = if voiced * 2 >= windows {
            Classification::speech(score)
        } else {
            Classification::non_speech(score)
        };
        Ok(self.last)
    }

    fn reset(&mut self) {
        // WebRTC VAD has no explicit reset; rebuild it
        if let Ok(vad) = build_vad(&self.config) {
            self.vad = vad;
        }
        self.carry.clear();
        self.last = Classification::NEUTRAL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AudioFormat;
    use std::time::Duration;

    fn frame(rate: u32, samples: usize) -> AudioFrame {
        AudioFrame::silence(AudioFormat::pcm16_mono(rate), samples, Duration::ZERO, 0).unwrap()
    }

    #[test]
    fn test_vad_initialization() {
        let classifier = WebRtcClassifier::new(WebRtcConfig::default()).unwrap();
        assert_eq!(classifier.window(), 480); // 30ms at 16kHz
    }

    #[test]
    fn test_invalid_sample_rate() {
        let config = WebRtcConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(WebRtcClassifier::new(config).is_err());
    }

    #[test]
    fn test_silence_detection() {
        let mut classifier = WebRtcClassifier::new(WebRtcConfig::default()).unwrap();
        let result = classifier.classify(&frame(16_000, 960)).unwrap();
        assert!(!result.is_speech(0.5));
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_short_frames_carry_over() {
        let mut classifier = WebRtcClassifier::new(WebRtcConfig::default()).unwrap();
        // 320 + 320 samples → one 480 window plus 160 carried
        classifier.classify(&frame(16_000, 320)).unwrap();
        classifier.classify(&frame(16_000, 320)).unwrap();
        assert_eq!(classifier.carry.len(), 160);
        classifier.reset();
        assert!(classifier.carry.is_empty());
    }

    #[test]
    fn test_rate_mismatch_is_fatal() {
        let mut classifier = WebRtcClassifier::new(WebRtcConfig::default()).unwrap();
        let err = classifier.classify(&frame(8_000, 240)).unwrap_err();
        assert!(matches!(err, VoiceError::ClassifierFatal(_)));
        assert!(!err.is_transient());
    }
}
