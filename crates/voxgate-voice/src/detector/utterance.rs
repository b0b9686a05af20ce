//! Utterance accumulation and the events that carry it

use crate::error::VoiceResult;
use crate::frame::{AudioFormat, AudioFrame};
use crate::speaker::SpeakerMatch;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::time::Duration;
use uuid::Uuid;

/// Why a segment was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Activity stayed below threshold for the whole hold-off window.
    HoldOffExpired,
    /// The segment reached the maximum duration.
    Ceiling,
    /// The network peer feeding the stream went away.
    Disconnected,
    /// The source ended or the detector was stopped.
    EndOfStream,
    /// The classifier failed permanently; the stream halts after this.
    Aborted,
}

impl CloseReason {
    /// Every close except a natural hold-off expiry is forced.
    pub fn is_forced(&self) -> bool {
        !matches!(self, CloseReason::HoldOffExpired)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::HoldOffExpired => "hold_off_expired",
            CloseReason::Ceiling => "ceiling",
            CloseReason::Disconnected => "disconnected",
            CloseReason::EndOfStream => "end_of_stream",
            CloseReason::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Speech lifecycle events, in stream order
#[derive(Debug, Clone)]
pub enum SpeechEvent {
    /// Out-of-band information (detected wake word, gate changes)
    MetaData { key: String, value: String },

    /// Speech onset at `timestamp` (stream time of the onset frame)
    SpeechStarted { segment: Uuid, timestamp: Duration },

    /// Copy of the segment accumulated so far; buffering continues
    PartialSpeechEnded { segment: Utterance },

    /// The complete segment
    SpeechEnded { segment: Utterance, reason: CloseReason },
}

impl SpeechEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SpeechEvent::MetaData { .. } => "meta_data",
            SpeechEvent::SpeechStarted { .. } => "speech_started",
            SpeechEvent::PartialSpeechEnded { .. } => "partial_speech_ended",
            SpeechEvent::SpeechEnded { .. } => "speech_ended",
        }
    }

    /// Segment id for segment-scoped events.
    pub fn segment_id(&self) -> Option<Uuid> {
        match self {
            SpeechEvent::MetaData { .. } => None,
            SpeechEvent::SpeechStarted { segment, .. } => Some(*segment),
            SpeechEvent::PartialSpeechEnded { segment } | SpeechEvent::SpeechEnded { segment, .. } => {
                Some(segment.id())
            }
        }
    }
}

/// A closed (or snapshotted) segment of speech; never mutated after emission
#[derive(Debug, Clone)]
pub struct Utterance {
    id: Uuid,
    format: AudioFormat,
    frames: Vec<AudioFrame>,
    pre_roll: usize,
    speech_started_at: Duration,
    peak_confidence: f32,
    keyword: Option<String>,
    speaker: Option<SpeakerMatch>,
    created_at: DateTime<Utc>,
}

impl Utterance {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// All frames, pre-roll first.
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Frames retained from before the onset.
    pub fn pre_roll_count(&self) -> usize {
        self.pre_roll
    }

    /// Frames from the onset onward.
    pub fn live_frame_count(&self) -> usize {
        self.frames.len() - self.pre_roll
    }

    /// Stream time of the onset frame.
    pub fn speech_started_at(&self) -> Duration {
        self.speech_started_at
    }

    /// Stream time of the first retained sample (pre-roll included).
    pub fn start(&self) -> Duration {
        self.frames.first().map_or(self.speech_started_at, |f| f.timestamp())
    }

    /// Stream time just past the last sample.
    pub fn end(&self) -> Duration {
        self.frames.last().map_or(self.speech_started_at, |f| f.end_timestamp())
    }

    /// Total audio carried, pre-roll included.
    pub fn duration(&self) -> Duration {
        self.frames.iter().map(|f| f.duration()).sum()
    }

    pub fn peak_confidence(&self) -> f32 {
        self.peak_confidence
    }

    /// Wake word that armed this segment.
    pub fn keyword(&self) -> Option<&str> {
        self.keyword.as_deref()
    }

    pub fn speaker(&self) -> Option<&SpeakerMatch> {
        self.speaker.as_ref()
    }

    /// Wall-clock time the segment (or snapshot) was emitted.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Contiguous PCM payload.
    pub fn pcm(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frames.iter().map(|f| f.payload().len()).sum());
        for frame in &self.frames {
            buf.extend_from_slice(frame.payload());
        }
        buf.freeze()
    }

    /// 16-bit WAV rendering, the input most transcription services accept.
    pub fn to_wav(&self) -> VoiceResult<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut out = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut out), spec)?;
            for frame in &self.frames {
                for sample in frame.to_i16() {
                    writer.write_sample(sample)?;
                }
            }
            writer.finalize()?;
        }
        Ok(out)
    }
}

/// Segment under construction, owned by the detector
#[derive(Debug)]
pub(crate) struct UtteranceBuffer {
    id: Uuid,
    format: AudioFormat,
    frames: Vec<AudioFrame>,
    pre_roll: usize,
    speech_started_at: Duration,
    peak_confidence: f32,
    keyword: Option<String>,
}

impl UtteranceBuffer {
    pub(crate) fn open(
        onset: &AudioFrame,
        pre_roll: impl IntoIterator<Item = AudioFrame>,
        keyword: Option<String>,
    ) -> Self {
        let frames: Vec<AudioFrame> = pre_roll.into_iter().collect();
        Self {
            id: Uuid::new_v4(),
            format: onset.format(),
            pre_roll: frames.len(),
            frames,
            speech_started_at: onset.timestamp(),
            peak_confidence: 0.0,
            keyword,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn push(&mut self, frame: AudioFrame, confidence: f32) {
        self.peak_confidence = self.peak_confidence.max(confidence);
        self.frames.push(frame);
    }

    pub(crate) fn live_frames(&self) -> usize {
        self.frames.len() - self.pre_roll
    }

    pub(crate) fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    /// Copy of the segment so far; frame payloads are shared, not copied.
    pub(crate) fn snapshot(&self) -> Utterance {
        Utterance {
            id: self.id,
            format: self.format,
            frames: self.frames.clone(),
            pre_roll: self.pre_roll,
            speech_started_at: self.speech_started_at,
            peak_confidence: self.peak_confidence,
            keyword: self.keyword.clone(),
            speaker: None,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn finish(self, speaker: Option<SpeakerMatch>) -> Utterance {
        Utterance {
            id: self.id,
            format: self.format,
            frames: self.frames,
            pre_roll: self.pre_roll,
            speech_started_at: self.speech_started_at,
            peak_confidence: self.peak_confidence,
            keyword: self.keyword,
            speaker,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64, level: i16) -> AudioFrame {
        let format = AudioFormat::pcm16_mono(16_000);
        AudioFrame::from_i16(&[level; 320], format, format.duration_of(320 * seq as usize), seq).unwrap()
    }

    #[test]
    fn test_snapshot_does_not_disturb_buffer() {
        let mut buffer = UtteranceBuffer::open(&frame(2, 100), vec![frame(0, 0), frame(1, 0)], None);
        buffer.push(frame(2, 100), 0.9);
        let partial = buffer.snapshot();
        buffer.push(frame(3, 100), 0.6);

        assert_eq!(partial.frame_count(), 3);
        assert_eq!(partial.live_frame_count(), 1);
        assert_eq!(buffer.live_frames(), 2);

        let done = buffer.finish(None);
        assert_eq!(done.id(), partial.id());
        assert_eq!(done.pre_roll_count(), 2);
        assert_eq!(done.speech_started_at(), Duration::from_millis(40));
        assert_eq!(done.start(), Duration::ZERO);
        assert_eq!(done.end(), Duration::from_millis(80));
        assert_eq!(done.peak_confidence(), 0.9);
    }

    #[test]
    fn test_wav_export() {
        let mut buffer = UtteranceBuffer::open(&frame(0, 5), Vec::new(), Some("jarvis".into()));
        buffer.push(frame(0, 5), 1.0);
        let utterance = buffer.finish(None);
        assert_eq!(utterance.keyword(), Some("jarvis"));
        assert_eq!(utterance.pcm().len(), 640);

        let wav = utterance.to_wav().unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 320);
    }

    #[test]
    fn test_forced_reasons() {
        assert!(!CloseReason::HoldOffExpired.is_forced());
        assert!(CloseReason::Ceiling.is_forced());
        assert!(CloseReason::Disconnected.is_forced());
    }
}
