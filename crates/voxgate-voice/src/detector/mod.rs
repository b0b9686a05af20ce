//! Speech boundary detection
//!
//! Turns a frame stream into speech lifecycle events:
//!
//! ```text
//!            wake word               onset                  negative frame
//!   IDLE ───────────────▶ ARMED ───────────────▶ ACTIVE ───────────────────▶ HANGING
//!    ▲                      ▲                      ▲  │                          │
//!    │   re-arm timeout     │                      │  │ ceiling                  │
//!    └──────────────────────┤                      │  ▼                          │
//!                           └───── SpeechEnded ◀───┴──┴──── hold-off expired ◀──┘
//! ```
//!
//! Everything is counted in frames, never wall-clock time, so the output for
//! a given input is the same however fast the classifiers run.

mod runner;
mod utterance;

pub use runner::{spawn_detector, DetectorHandle, SpeechEvents};
pub use utterance::{CloseReason, SpeechEvent, Utterance};

use crate::classify::{Classification, VoiceActivityClassifier, WakeWordClassifier};
use crate::error::{VoiceError, VoiceResult};
use crate::frame::AudioFrame;
use crate::speaker::SpeakerIdentifier;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error, info, warn};
use utterance::UtteranceBuffer;

/// Metadata key carrying a detected wake word.
pub const META_WAKE_WORD: &str = "wake_word";
/// Metadata key announcing gate changes.
pub const META_GATE: &str = "gate";

/// Detector tuning, expressed in frames
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Minimum speech score for a frame to count as activity (default: 0.5)
    pub activity_threshold: f32,

    /// Non-speech frames tolerated inside a segment before it closes (default: 25)
    pub hold_off_frames: usize,

    /// Emit a partial report every this many live frames (default: off)
    pub partial_interval_frames: Option<usize>,

    /// Live frames after which a segment is force-closed (default: 500)
    pub max_segment_frames: usize,

    /// Non-speech frames kept and prepended to a new segment (default: 10)
    pub pre_roll_frames: usize,

    /// Frames an armed, gated detector waits for speech before re-gating (default: off)
    pub rearm_after_frames: Option<usize>,

    /// Consecutive transient classifier failures tolerated before halting (default: 5)
    pub max_consecutive_failures: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            activity_threshold: 0.5,
            hold_off_frames: 25,
            partial_interval_frames: None,
            max_segment_frames: 500,
            pre_roll_frames: 10,
            rearm_after_frames: None,
            max_consecutive_failures: 5,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> VoiceResult<()> {
        if !(0.0..=1.0).contains(&self.activity_threshold) {
            return Err(VoiceError::Config(format!(
                "activity threshold must be in [0, 1], got {}",
                self.activity_threshold
            )));
        }
        if self.max_segment_frames == 0 {
            return Err(VoiceError::Config("max segment length must be at least one frame".into()));
        }
        if self.partial_interval_frames == Some(0) {
            return Err(VoiceError::Config("partial interval must be at least one frame".into()));
        }
        if self.max_consecutive_failures == 0 {
            return Err(VoiceError::Config("max consecutive failures must be at least 1".into()));
        }
        Ok(())
    }
}

/// Where the detector is in the segment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorState {
    /// Waiting for a wake word (or, ungated, for speech onset)
    Idle,
    /// Watching for speech onset
    Armed,
    /// Accumulating an utterance
    Active,
    /// Inside an utterance, below threshold, within the hold-off window
    Hanging,
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectorState::Idle => "idle",
            DetectorState::Armed => "armed",
            DetectorState::Active => "active",
            DetectorState::Hanging => "hanging",
        };
        f.write_str(name)
    }
}

/// Builder for [`SpeechDetector`]
pub struct DetectorBuilder {
    config: DetectorConfig,
    vad: Box<dyn VoiceActivityClassifier>,
    wake: Option<Box<dyn WakeWordClassifier>>,
    speaker: Option<Box<dyn SpeakerIdentifier>>,
}

impl DetectorBuilder {
    pub fn config(mut self, config: DetectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Gate segments behind this wake-word classifier.
    pub fn wake_word(mut self, classifier: impl WakeWordClassifier + 'static) -> Self {
        self.wake = Some(Box::new(classifier));
        self
    }

    pub fn wake_word_boxed(mut self, classifier: Box<dyn WakeWordClassifier>) -> Self {
        self.wake = Some(classifier);
        self
    }

    /// Attribute closed segments with this identifier.
    pub fn speaker_identifier(mut self, identifier: impl SpeakerIdentifier + 'static) -> Self {
        self.speaker = Some(Box::new(identifier));
        self
    }

    pub fn speaker_identifier_boxed(mut self, identifier: Box<dyn SpeakerIdentifier>) -> Self {
        self.speaker = Some(identifier);
        self
    }

    pub fn build(self) -> VoiceResult<SpeechDetector> {
        self.config.validate()?;
        info!(
            gated = self.wake.is_some(),
            speaker_id = self.speaker.is_some(),
            hold_off = self.config.hold_off_frames,
            ceiling = self.config.max_segment_frames,
            "🎙️ Speech detector ready"
        );
        Ok(SpeechDetector {
            pre_roll: VecDeque::with_capacity(self.config.pre_roll_frames),
            config: self.config,
            vad: self.vad,
            wake: self.wake,
            speaker: self.speaker,
            state: DetectorState::Idle,
            buffer: None,
            pending_keyword: None,
            hang_frames: 0,
            armed_frames: 0,
            consecutive_failures: 0,
            frames_processed: 0,
            segments_closed: 0,
        })
    }
}

/// Activity decision for one frame
#[derive(Debug, Clone, Copy)]
struct Verdict {
    active: bool,
    score: f32,
}

/// The speech boundary state machine
///
/// Owns the in-progress utterance exclusively; every other stage only sees
/// copies emitted in events.
pub struct SpeechDetector {
    config: DetectorConfig,
    vad: Box<dyn VoiceActivityClassifier>,
    wake: Option<Box<dyn WakeWordClassifier>>,
    speaker: Option<Box<dyn SpeakerIdentifier>>,
    state: DetectorState,
    buffer: Option<UtteranceBuffer>,
    pre_roll: VecDeque<AudioFrame>,
    pending_keyword: Option<String>,
    hang_frames: usize,
    armed_frames: usize,
    consecutive_failures: u32,
    frames_processed: u64,
    segments_closed: u64,
}

impl SpeechDetector {
    pub fn builder(vad: impl VoiceActivityClassifier + 'static) -> DetectorBuilder {
        Self::builder_boxed(Box::new(vad))
    }

    /// Builder for a classifier obtained from a [`crate::registry::BackendRegistry`].
    pub fn builder_boxed(vad: Box<dyn VoiceActivityClassifier>) -> DetectorBuilder {
        DetectorBuilder {
            config: DetectorConfig::default(),
            vad,
            wake: None,
            speaker: None,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn is_gated(&self) -> bool {
        self.wake.is_some()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn segments_closed(&self) -> u64 {
        self.segments_closed
    }

    /// Feed one frame and collect the events it triggers, in order.
    ///
    /// An error means the classifier failed permanently. The open segment is
    /// left in place so the caller can [`force_close`](Self::force_close) it
    /// before halting the stream.
    pub fn process_frame(&mut self, frame: AudioFrame) -> VoiceResult<Vec<SpeechEvent>> {
        self.frames_processed += 1;
        let mut events = Vec::new();

        match self.state {
            DetectorState::Idle if self.wake.is_some() => {
                self.listen_for_wake_word(&frame, &mut events)?;
                self.remember(frame);
            }
            DetectorState::Idle | DetectorState::Armed => {
                let verdict = self.classify_activity(&frame)?;
                if verdict.active {
                    self.open_segment(frame, verdict.score, &mut events);
                } else {
                    self.count_armed_silence(&mut events);
                    self.remember(frame);
                }
            }
            DetectorState::Active | DetectorState::Hanging => {
                let verdict = self.classify_activity(&frame)?;
                self.continue_segment(frame, verdict, &mut events);
            }
        }

        Ok(events)
    }

    /// Close any open segment now, whatever the hold-off state.
    pub fn force_close(&mut self, reason: CloseReason) -> Option<SpeechEvent> {
        match self.state {
            DetectorState::Active | DetectorState::Hanging => self.close_segment(reason),
            DetectorState::Idle | DetectorState::Armed => None,
        }
    }

    /// Drop all stream state, including any open segment, without emitting.
    pub fn reset(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            debug!(segment = %buffer.id(), "discarding open segment on reset");
        }
        self.pre_roll.clear();
        self.pending_keyword = None;
        self.hang_frames = 0;
        self.armed_frames = 0;
        self.consecutive_failures = 0;
        self.state = DetectorState::Idle;
        self.vad.reset();
        if let Some(wake) = self.wake.as_mut() {
            wake.reset();
        }
        if let Some(speaker) = self.speaker.as_mut() {
            speaker.reset();
        }
    }

    fn listen_for_wake_word(&mut self, frame: &AudioFrame, events: &mut Vec<SpeechEvent>) -> VoiceResult<()> {
        let Some(wake) = self.wake.as_mut() else {
            return Ok(());
        };
        let result = wake.detect(frame);
        let detection = self.absorb_failure(result, Default::default)?;
        if let Some(keyword) = detection.keyword {
            info!(keyword = %keyword, "🔔 Wake word detected");
            events.push(SpeechEvent::MetaData {
                key: META_WAKE_WORD.to_string(),
                value: keyword.clone(),
            });
            self.pending_keyword = Some(keyword);
            self.state = DetectorState::Armed;
            self.armed_frames = 0;
        }
        Ok(())
    }

    fn classify_activity(&mut self, frame: &AudioFrame) -> VoiceResult<Verdict> {
        let result = self.vad.classify(frame);
        let classification = self.absorb_failure(result, || Classification::NEUTRAL)?;
        Ok(Verdict {
            active: classification.is_speech(self.config.activity_threshold),
            score: classification.score,
        })
    }

    /// Turn transient failures into `neutral`, escalating after too many in a row.
    fn absorb_failure<T>(&mut self, result: VoiceResult<T>, neutral: impl FnOnce() -> T) -> VoiceResult<T> {
        match result {
            Ok(value) => {
                self.consecutive_failures = 0;
                Ok(value)
            }
            Err(e) if e.is_transient() => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.max_consecutive_failures {
                    error!(failures = self.consecutive_failures, error = %e, "classifier keeps failing, giving up");
                    return Err(VoiceError::ClassifierFatal(format!(
                        "{} consecutive classifier failures, last: {e}",
                        self.consecutive_failures
                    )));
                }
                warn!(failures = self.consecutive_failures, error = %e, "classifier failed, treating frame as silence");
                Ok(neutral())
            }
            Err(e) => {
                error!(error = %e, "classifier failed permanently");
                Err(e)
            }
        }
    }

    fn remember(&mut self, frame: AudioFrame) {
        if self.config.pre_roll_frames == 0 {
            return;
        }
        if self.pre_roll.len() == self.config.pre_roll_frames {
            self.pre_roll.pop_front();
        }
        self.pre_roll.push_back(frame);
    }

    fn count_armed_silence(&mut self, events: &mut Vec<SpeechEvent>) {
        let (Some(limit), true) = (self.config.rearm_after_frames, self.wake.is_some()) else {
            return;
        };
        if self.state != DetectorState::Armed {
            return;
        }
        self.armed_frames += 1;
        if self.armed_frames >= limit {
            info!(frames = self.armed_frames, "⏳ No speech after wake word, waiting for wake word again");
            self.state = DetectorState::Idle;
            self.armed_frames = 0;
            self.pending_keyword = None;
            if let Some(wake) = self.wake.as_mut() {
                wake.reset();
            }
            events.push(SpeechEvent::MetaData {
                key: META_GATE.to_string(),
                value: "waiting_for_wake_word".to_string(),
            });
        }
    }

    fn open_segment(&mut self, onset: AudioFrame, score: f32, events: &mut Vec<SpeechEvent>) {
        let buffer = UtteranceBuffer::open(&onset, self.pre_roll.drain(..), self.pending_keyword.take());
        info!(segment = %buffer.id(), at_ms = onset.timestamp().as_millis() as u64, "🎤 Speech started");
        events.push(SpeechEvent::SpeechStarted {
            segment: buffer.id(),
            timestamp: onset.timestamp(),
        });
        self.buffer = Some(buffer);
        self.state = DetectorState::Active;
        self.hang_frames = 0;
        self.append(onset, score, events);
    }

    fn continue_segment(&mut self, frame: AudioFrame, verdict: Verdict, events: &mut Vec<SpeechEvent>) {
        if verdict.active {
            if self.state == DetectorState::Hanging {
                debug!(after = self.hang_frames, "speech resumed");
            }
            self.state = DetectorState::Active;
            self.hang_frames = 0;
        } else {
            self.hang_frames += 1;
            if self.hang_frames > self.config.hold_off_frames {
                events.extend(self.close_segment(CloseReason::HoldOffExpired));
                self.remember(frame);
                return;
            }
            if self.state == DetectorState::Active {
                debug!("silence inside segment, holding");
            }
            self.state = DetectorState::Hanging;
        }
        self.append(frame, verdict.score, events);
    }

    fn append(&mut self, frame: AudioFrame, score: f32, events: &mut Vec<SpeechEvent>) {
        let Some(buffer) = self.buffer.as_mut() else {
            return;
        };
        buffer.push(frame, score);
        let live = buffer.live_frames();

        if let Some(interval) = self.config.partial_interval_frames {
            if live % interval == 0 {
                debug!(segment = %buffer.id(), frames = live, "partial report");
                events.push(SpeechEvent::PartialSpeechEnded {
                    segment: buffer.snapshot(),
                });
            }
        }

        if live >= self.config.max_segment_frames {
            warn!(frames = live, "⏱️ Max segment length reached, closing");
            events.extend(self.close_segment(CloseReason::Ceiling));
        }
    }

    fn close_segment(&mut self, reason: CloseReason) -> Option<SpeechEvent> {
        let buffer = self.buffer.take()?;
        let speaker = match self.speaker.as_mut() {
            Some(identifier) => match identifier.identify(buffer.frames()) {
                Ok(found) => found,
                Err(e) => {
                    warn!(error = %e, "speaker identification failed");
                    None
                }
            },
            None => None,
        };

        // a gated detector stays armed for the follow-up utterance
        self.state = if self.wake.is_some() {
            DetectorState::Armed
        } else {
            DetectorState::Idle
        };
        self.hang_frames = 0;
        self.armed_frames = 0;
        self.segments_closed += 1;

        let segment = buffer.finish(speaker);
        info!(
            segment = %segment.id(),
            frames = segment.frame_count(),
            duration_ms = segment.duration().as_millis() as u64,
            reason = %reason,
            speaker = segment.speaker().map(|s| s.name.as_str()).unwrap_or("-"),
            "🎯 Speech ended"
        );
        Some(SpeechEvent::SpeechEnded { segment, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::KeywordDetection;
    use crate::frame::{AudioFormat, FrameClock};
    use crate::speaker::{EnrolledSpeakerIdentifier, SpeakerMatch, SpeakerProfileStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const LOUD: i16 = 8_000;

    fn frames(levels: &[i16]) -> Vec<AudioFrame> {
        let format = AudioFormat::pcm16_mono(16_000);
        let mut clock = FrameClock::new(format);
        levels
            .iter()
            .map(|level| {
                let (ts, seq) = clock.advance(320);
                AudioFrame::from_i16(&[*level; 320], format, ts, seq).unwrap()
            })
            .collect()
    }

    fn loudness(frame: &AudioFrame) -> VoiceResult<Classification> {
        Ok(if frame.rms() > 0.1 {
            Classification::speech(1.0)
        } else {
            Classification::non_speech(0.0)
        })
    }

    fn config(hold_off: usize) -> DetectorConfig {
        DetectorConfig {
            hold_off_frames: hold_off,
            pre_roll_frames: 0,
            ..Default::default()
        }
    }

    fn run(detector: &mut SpeechDetector, levels: &[i16]) -> Vec<SpeechEvent> {
        let mut events = Vec::new();
        for frame in frames(levels) {
            events.extend(detector.process_frame(frame).unwrap());
        }
        events
    }

    #[test]
    fn test_basic_segment() {
        let mut detector = SpeechDetector::builder(loudness).config(config(1)).build().unwrap();
        assert_eq!(detector.state(), DetectorState::Idle);

        let events = run(&mut detector, &[0, LOUD, LOUD, 0, 0, 0]);
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["speech_started", "speech_ended"]);

        match &events[1] {
            SpeechEvent::SpeechEnded { segment, reason } => {
                assert_eq!(*reason, CloseReason::HoldOffExpired);
                // two speech frames plus one tolerated silent frame
                assert_eq!(segment.frame_count(), 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn test_hanging_then_resume() {
        let mut detector = SpeechDetector::builder(loudness).config(config(2)).build().unwrap();
        run(&mut detector, &[LOUD, 0]);
        assert_eq!(detector.state(), DetectorState::Hanging);
        run(&mut detector, &[LOUD]);
        assert_eq!(detector.state(), DetectorState::Active);
    }

    #[test]
    fn test_pre_roll_is_prepended() {
        let cfg = DetectorConfig {
            hold_off_frames: 0,
            pre_roll_frames: 2,
            ..Default::default()
        };
        let mut detector = SpeechDetector::builder(loudness).config(cfg).build().unwrap();
        let events = run(&mut detector, &[0, 0, 0, LOUD, 0]);
        let SpeechEvent::SpeechEnded { segment, .. } = events.last().unwrap() else {
            panic!("expected SpeechEnded");
        };
        assert_eq!(segment.pre_roll_count(), 2);
        assert_eq!(segment.live_frame_count(), 1);
        assert_eq!(segment.frames()[0].sequence(), 1);
        assert_eq!(segment.speech_started_at(), segment.frames()[2].timestamp());
    }

    #[test]
    fn test_wake_word_gating() {
        let wake = |frame: &AudioFrame| -> VoiceResult<KeywordDetection> {
            Ok(if frame.sequence() == 2 {
                KeywordDetection::detected("computer", 0.9)
            } else {
                KeywordDetection::none()
            })
        };
        let mut detector = SpeechDetector::builder(loudness)
            .config(config(0))
            .wake_word(wake)
            .build()
            .unwrap();
        assert_eq!(detector.state(), DetectorState::Idle);

        // speech before the wake word is ignored
        let events = run(&mut detector, &[LOUD, LOUD, 0, LOUD, 0]);
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["meta_data", "speech_started", "speech_ended"]);
        let SpeechEvent::SpeechEnded { segment, .. } = &events[2] else {
            panic!("expected SpeechEnded");
        };
        assert_eq!(segment.keyword(), Some("computer"));
        assert_eq!(detector.state(), DetectorState::Armed);
    }

    #[test]
    fn test_keyword_during_speech_is_ignored() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&checks);
        let wake = move |_: &AudioFrame| -> VoiceResult<KeywordDetection> {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(KeywordDetection::detected("computer", 0.9))
        };
        let mut detector = SpeechDetector::builder(loudness)
            .config(config(0))
            .wake_word(wake)
            .build()
            .unwrap();

        let events = run(&mut detector, &[0, LOUD, LOUD, LOUD, 0]);
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["meta_data", "speech_started", "speech_ended"]);
        // only the idle frame was checked for the keyword
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        let SpeechEvent::SpeechEnded { segment, .. } = &events[2] else {
            panic!("expected SpeechEnded");
        };
        assert_eq!(segment.keyword(), Some("computer"));
        assert_eq!(segment.live_frame_count(), 3);
    }

    #[test]
    fn test_segment_is_attributed_to_enrolled_speaker() {
        let store = SpeakerProfileStore::new();
        store.enroll("ada", vec![1.0, 0.0]).unwrap();
        store.enroll("grace", vec![0.0, 1.0]).unwrap();
        let extractor = |_: &AudioFrame| -> VoiceResult<Option<Vec<f32>>> { Ok(Some(vec![0.9, 0.1])) };
        let mut detector = SpeechDetector::builder(loudness)
            .config(config(0))
            .speaker_identifier(EnrolledSpeakerIdentifier::new(store, extractor))
            .build()
            .unwrap();

        let events = run(&mut detector, &[LOUD, LOUD, 0]);
        let SpeechEvent::SpeechEnded { segment, .. } = events.last().unwrap() else {
            panic!("expected SpeechEnded");
        };
        let speaker = segment.speaker().unwrap();
        assert_eq!(speaker.name, "ada");
        assert_eq!(speaker.index, 0);
    }

    #[test]
    fn test_failed_identification_leaves_speaker_unknown() {
        let failing = |_: &[AudioFrame]| -> VoiceResult<Option<SpeakerMatch>> {
            Err(VoiceError::ClassifierTransient("embedding model offline".into()))
        };
        let mut detector = SpeechDetector::builder(loudness)
            .config(config(0))
            .speaker_identifier(failing)
            .build()
            .unwrap();

        let events = run(&mut detector, &[LOUD, LOUD, 0]);
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["speech_started", "speech_ended"]);
        let SpeechEvent::SpeechEnded { segment, reason } = &events[1] else {
            panic!("expected SpeechEnded");
        };
        assert_eq!(*reason, CloseReason::HoldOffExpired);
        assert!(segment.speaker().is_none());
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn test_rearm_timeout_returns_to_idle() {
        let wake = |frame: &AudioFrame| -> VoiceResult<KeywordDetection> {
            Ok(if frame.sequence() == 0 {
                KeywordDetection::detected("computer", 0.9)
            } else {
                KeywordDetection::none()
            })
        };
        let cfg = DetectorConfig {
            rearm_after_frames: Some(3),
            ..config(0)
        };
        let mut detector = SpeechDetector::builder(loudness).config(cfg).wake_word(wake).build().unwrap();
        let events = run(&mut detector, &[0, 0, 0, 0, LOUD]);
        assert_eq!(detector.state(), DetectorState::Idle);
        assert!(events.iter().any(|e| matches!(
            e,
            SpeechEvent::MetaData { key, value } if key == META_GATE && value == "waiting_for_wake_word"
        )));
        assert!(!events.iter().any(|e| e.kind() == "speech_started"));
    }

    #[test]
    fn test_transient_failures_are_neutral() {
        let mut calls = 0;
        let flaky = move |frame: &AudioFrame| -> VoiceResult<Classification> {
            calls += 1;
            if calls % 2 == 0 {
                Err(VoiceError::ClassifierTransient("glitch".into()))
            } else {
                loudness(frame)
            }
        };
        let mut detector = SpeechDetector::builder(flaky).config(config(3)).build().unwrap();
        let events = run(&mut detector, &[LOUD; 8]);
        // failures inside the segment count as silence but never exceed the hold-off
        assert_eq!(events.len(), 1);
        assert_eq!(detector.state(), DetectorState::Hanging);
    }

    #[test]
    fn test_repeated_failures_escalate() {
        let broken = |_: &AudioFrame| -> VoiceResult<Classification> {
            Err(VoiceError::ClassifierTransient("model offline".into()))
        };
        let cfg = DetectorConfig {
            max_consecutive_failures: 3,
            ..config(1)
        };
        let mut detector = SpeechDetector::builder(broken).config(cfg).build().unwrap();
        let mut input = frames(&[0, 0, 0]).into_iter();
        assert!(detector.process_frame(input.next().unwrap()).is_ok());
        assert!(detector.process_frame(input.next().unwrap()).is_ok());
        let err = detector.process_frame(input.next().unwrap()).unwrap_err();
        assert!(matches!(err, VoiceError::ClassifierFatal(_)));
    }

    #[test]
    fn test_reset_discards_open_segment() {
        let mut detector = SpeechDetector::builder(loudness).config(config(5)).build().unwrap();
        run(&mut detector, &[LOUD, LOUD]);
        detector.reset();
        assert_eq!(detector.state(), DetectorState::Idle);
        assert!(detector.force_close(CloseReason::EndOfStream).is_none());
    }

    #[test]
    fn test_invalid_config() {
        let cfg = DetectorConfig {
            activity_threshold: 1.5,
            ..Default::default()
        };
        assert!(SpeechDetector::builder(loudness).config(cfg).build().is_err());
    }
}
