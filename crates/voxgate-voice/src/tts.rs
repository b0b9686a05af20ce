//! **Text-to-Speech**: turn reply text into frames for the playback engine.

use crate::error::{VoiceError, VoiceResult};
use crate::frame::{AudioFormat, AudioFrame, FrameClock};
use crate::registry::{parse_options, BackendRegistry};
use serde::Deserialize;
use std::f32::consts::TAU;
use std::time::Duration;

/// Synthesis port
pub trait SpeechSynthesizer: Send + Sync {
    /// Format of the frames [`synthesize`](Self::synthesize) returns.
    fn format(&self) -> AudioFormat;

    /// Render `text` as ordered chunks. An empty result plays nothing.
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<AudioFrame>>;
}

/// Placeholder synthesizer: a quiet tone whose length follows the text.
///
/// Useful for exercising playback and barge-in without a speech provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaceholderSynthesizer {
    pub sample_rate: u32,
    pub tone_hz: f32,
    pub amplitude: f32,
    pub ms_per_char: u64,
    pub chunk_ms: u64,
}

impl Default for PlaceholderSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            tone_hz: 440.0,
            amplitude: 0.1,
            ms_per_char: 50,
            chunk_ms: 100,
        }
    }
}

impl SpeechSynthesizer for PlaceholderSynthesizer {
    fn format(&self) -> AudioFormat {
        AudioFormat::pcm16_mono(self.sample_rate)
    }

    fn synthesize(&self, text: &str) -> VoiceResult<Vec<AudioFrame>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        if self.chunk_ms == 0 {
            return Err(VoiceError::Synthesis("chunk_ms must be non-zero".into()));
        }
        let format = self.format();
        let total = format.samples_in(Duration::from_millis(self.ms_per_char * text.chars().count() as u64));
        let chunk = format.samples_in(Duration::from_millis(self.chunk_ms)).max(1);

        let mut clock = FrameClock::new(format);
        let mut frames = Vec::with_capacity(total.div_ceil(chunk));
        let mut offset = 0;
        while offset < total {
            let len = chunk.min(total - offset);
            let samples: Vec<f32> = (offset..offset + len)
                .map(|n| self.amplitude * (TAU * self.tone_hz * n as f32 / self.sample_rate as f32).sin())
                .collect();
            let (timestamp, sequence) = clock.advance(len);
            frames.push(AudioFrame::from_f32(&samples, format, timestamp, sequence)?);
            offset += len;
        }
        Ok(frames)
    }
}

/// Registry preloaded with `"placeholder"`.
pub fn synthesizer_registry() -> BackendRegistry<dyn SpeechSynthesizer> {
    let mut registry: BackendRegistry<dyn SpeechSynthesizer> = BackendRegistry::new("synthesizer");
    registry.register("placeholder", |options| {
        let backend: PlaceholderSynthesizer = parse_options(options)?;
        Ok(Box::new(backend) as Box<dyn SpeechSynthesizer>)
    });
    registry
}
