//! Speaker attribution
//!
//! Profiles are enrolled in memory only. Identification accumulates per-frame
//! similarity scores over a whole utterance, normalizes them, and reports the
//! best profile if its share of the total clears a minimum confidence.

use crate::error::{VoiceError, VoiceResult};
use crate::frame::AudioFrame;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Identity resolved for an utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerMatch {
    pub name: String,

    /// Position of the profile in the store at identification time
    pub index: usize,

    /// Normalized share of the accumulated score, in [0.0, 1.0]
    pub confidence: f32,
}

/// Identity of the speaker of an accumulated utterance
pub trait SpeakerIdentifier {
    fn identify(&mut self, frames: &[AudioFrame]) -> VoiceResult<Option<SpeakerMatch>>;

    fn reset(&mut self) {}
}

impl<F> SpeakerIdentifier for F
where
    F: FnMut(&[AudioFrame]) -> VoiceResult<Option<SpeakerMatch>>,
{
    fn identify(&mut self, frames: &[AudioFrame]) -> VoiceResult<Option<SpeakerMatch>> {
        self(frames)
    }
}

/// One enrolled voice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerProfile {
    pub name: String,
    pub embedding: Vec<f32>,
}

/// In-memory set of enrolled speakers
///
/// Cloning shares the underlying set, so enrolment is visible to identifiers
/// already running on a detector thread.
#[derive(Debug, Clone, Default)]
pub struct SpeakerProfileStore {
    profiles: Arc<RwLock<Vec<SpeakerProfile>>>,
}

impl SpeakerProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&self, name: impl Into<String>, embedding: Vec<f32>) -> VoiceResult<()> {
        let name = name.into();
        if embedding.is_empty() {
            return Err(VoiceError::Config(format!(
                "speaker '{name}' has an empty embedding"
            )));
        }
        let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
        if profiles.iter().any(|p| p.name == name) {
            return Err(VoiceError::Config(format!(
                "speaker '{name}' is already enrolled"
            )));
        }
        debug!(speaker = %name, dims = embedding.len(), "enrolled speaker");
        profiles.push(SpeakerProfile { name, embedding });
        Ok(())
    }

    pub fn remove(&self, name: &str) -> VoiceResult<SpeakerProfile> {
        let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
        let index = profiles
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| VoiceError::Config(format!("speaker '{name}' is not enrolled")))?;
        Ok(profiles.remove(index))
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|p| p.name).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SpeakerProfile> {
        self.profiles.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Produces a voice embedding for one frame (the external model boundary)
pub trait EmbeddingExtractor {
    /// `Ok(None)` when the frame carries too little audio to embed.
    fn embed(&mut self, frame: &AudioFrame) -> VoiceResult<Option<Vec<f32>>>;
}

impl<F> EmbeddingExtractor for F
where
    F: FnMut(&AudioFrame) -> VoiceResult<Option<Vec<f32>>>,
{
    fn embed(&mut self, frame: &AudioFrame) -> VoiceResult<Option<Vec<f32>>> {
        self(frame)
    }
}

/// Minimum normalized share a profile needs to be reported.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.2;

/// Matches utterances against a [`SpeakerProfileStore`] by cosine similarity
pub struct EnrolledSpeakerIdentifier<E> {
    store: SpeakerProfileStore,
    extractor: E,
    min_confidence: f32,
}

impl<E: EmbeddingExtractor> EnrolledSpeakerIdentifier<E> {
    pub fn new(store: SpeakerProfileStore, extractor: E) -> Self {
        Self {
            store,
            extractor,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }
}

impl<E: EmbeddingExtractor> SpeakerIdentifier for EnrolledSpeakerIdentifier<E> {
    fn identify(&mut self, frames: &[AudioFrame]) -> VoiceResult<Option<SpeakerMatch>> {
        let profiles = self.store.snapshot();
        if profiles.is_empty() {
            return Ok(None);
        }

        let mut totals = vec![0.0f32; profiles.len()];
        for frame in frames {
            let Some(embedding) = self.extractor.embed(frame)? else {
                continue;
            };
            for (total, profile) in totals.iter_mut().zip(&profiles) {
                match cosine_similarity(&embedding, &profile.embedding) {
                    Some(similarity) => *total += similarity.max(0.0),
                    None => warn!(
                        speaker = %profile.name,
                        "embedding size mismatch, skipping profile for this frame"
                    ),
                }
            }
        }

        Ok(best_match(&totals, &profiles, self.min_confidence))
    }
}

fn best_match(totals: &[f32], profiles: &[SpeakerProfile], min_confidence: f32) -> Option<SpeakerMatch> {
    let sum: f32 = totals.iter().sum();
    if sum <= 0.0 {
        return None;
    }
    let (index, best) = totals
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    let confidence = best / sum;
    if confidence < min_confidence {
        debug!(confidence, "best speaker below minimum confidence");
        return None;
    }
    Some(SpeakerMatch {
        name: profiles[index].name.clone(),
        index,
        confidence,
    })
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some(dot / (norm_a * norm_b))
}
