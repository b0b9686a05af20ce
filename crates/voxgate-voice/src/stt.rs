//! **Speech-to-Text**: turn a closed [`Utterance`] into text.
//!
//! Concrete providers live outside this crate; implement [`Transcriber`] for
//! them and register a constructor in a [`BackendRegistry`].

use crate::detector::Utterance;
use crate::error::VoiceResult;
use crate::registry::{parse_options, BackendRegistry};
use serde::Deserialize;

/// Transcription port
pub trait Transcriber: Send + Sync {
    /// Transcribe one segment. `prompt` is the text heard so far in the
    /// current user turn, for providers that accept context. Return an empty
    /// string when nothing intelligible was said.
    fn transcribe(&self, utterance: &Utterance, prompt: Option<&str>) -> VoiceResult<String>;
}

impl<F> Transcriber for F
where
    F: Fn(&Utterance, Option<&str>) -> VoiceResult<String> + Send + Sync,
{
    fn transcribe(&self, utterance: &Utterance, prompt: Option<&str>) -> VoiceResult<String> {
        self(utterance, prompt)
    }
}

/// Placeholder transcriber: describes the audio instead of transcribing it.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PlaceholderTranscriber {
    /// If set, return this instead of the description.
    #[serde(default)]
    pub response: Option<String>,
}

impl PlaceholderTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
        }
    }
}

impl Transcriber for PlaceholderTranscriber {
    fn transcribe(&self, utterance: &Utterance, _prompt: Option<&str>) -> VoiceResult<String> {
        if let Some(ref response) = self.response {
            return Ok(response.clone());
        }
        Ok(format!(
            "[transcription placeholder: {} frames, {:.1}s]",
            utterance.frame_count(),
            utterance.duration().as_secs_f32()
        ))
    }
}

/// Registry preloaded with `"placeholder"`.
pub fn transcriber_registry() -> BackendRegistry<dyn Transcriber> {
    let mut registry: BackendRegistry<dyn Transcriber> = BackendRegistry::new("transcriber");
    registry.register("placeholder", |options| {
        let backend: PlaceholderTranscriber = parse_options(options)?;
        Ok(Box::new(backend) as Box<dyn Transcriber>)
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classification;
    use crate::detector::{CloseReason, SpeechDetector, SpeechEvent};
    use crate::frame::{AudioFormat, AudioFrame};
    use serde_json::json;
    use std::time::Duration;

    fn utterance() -> Utterance {
        let mut detector = SpeechDetector::builder(|_: &AudioFrame| -> VoiceResult<Classification> {
            Ok(Classification::speech(1.0))
        })
        .build()
        .unwrap();
        let frame = AudioFrame::silence(AudioFormat::pcm16_mono(16_000), 1_600, Duration::ZERO, 0).unwrap();
        detector.process_frame(frame).unwrap();
        match detector.force_close(CloseReason::EndOfStream) {
            Some(SpeechEvent::SpeechEnded { segment, .. }) => segment,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_placeholder_describes_audio() {
        let text = PlaceholderTranscriber::new().transcribe(&utterance(), None).unwrap();
        assert_eq!(text, "[transcription placeholder: 1 frames, 0.1s]");
    }

    #[test]
    fn test_registry_passes_options() {
        let registry = transcriber_registry();
        let backend = registry
            .create("placeholder", &json!({ "response": "hello there" }))
            .unwrap();
        assert_eq!(backend.transcribe(&utterance(), Some("hi")).unwrap(), "hello there");
    }
}
