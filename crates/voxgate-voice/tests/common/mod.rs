//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::time::Duration;
use voxgate_voice::{AudioFormat, AudioFrame, Classification, FrameClock, VoiceResult};

pub const FRAME_SAMPLES: usize = 480; // 30ms at 16kHz
pub const LOUD: i16 = 12_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn mono16k() -> AudioFormat {
    AudioFormat::pcm16_mono(16_000)
}

/// One frame per pattern entry: `true` is loud, `false` is digital silence.
pub fn frames_from_pattern(pattern: &[bool]) -> Vec<AudioFrame> {
    let format = mono16k();
    let mut clock = FrameClock::new(format);
    pattern
        .iter()
        .map(|&speech| {
            let (timestamp, sequence) = clock.advance(FRAME_SAMPLES);
            let value = if speech { LOUD } else { 0 };
            AudioFrame::from_i16(&[value; FRAME_SAMPLES], format, timestamp, sequence).unwrap()
        })
        .collect()
}

/// `silent` quiet frames, `speech` loud frames, then `tail` quiet frames.
pub fn pattern(silent: usize, speech: usize, tail: usize) -> Vec<bool> {
    let mut pattern = vec![false; silent];
    pattern.extend(std::iter::repeat(true).take(speech));
    pattern.extend(std::iter::repeat(false).take(tail));
    pattern
}

/// Deterministic classifier: speech whenever the frame is louder than `rms`.
pub fn loudness_vad(rms: f32) -> impl FnMut(&AudioFrame) -> VoiceResult<Classification> + Send + 'static {
    move |frame: &AudioFrame| {
        Ok(if frame.rms() > rms {
            Classification::speech(1.0)
        } else {
            Classification::non_speech(0.0)
        })
    }
}

/// Constant-valued chunk for playback tests.
pub fn chunk(value: i16, samples: usize) -> AudioFrame {
    AudioFrame::from_i16(&vec![value; samples], mono16k(), Duration::ZERO, 0).unwrap()
}
