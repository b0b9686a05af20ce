//! Immutable audio frames
//!
//! An [`AudioFrame`] is a construction-only value: a reference-counted PCM
//! payload plus the format and stream position it was captured at. Every
//! derived view (slices, re-timed copies, converted samples) produces a new
//! value, so frames can be handed to any number of pipeline stages without
//! copying or locking.

use crate::error::{VoiceError, VoiceResult};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sample layout of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Samples per second per channel
    pub sample_rate: u32,

    /// Interleaved channel count
    pub channels: u16,

    /// Bytes per sample: 1 (unsigned 8-bit), 2 (signed 16-bit LE) or 4 (signed 32-bit LE)
    pub sample_width: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16, sample_width: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_width,
        }
    }

    /// Signed 16-bit mono, the format every in-tree classifier expects.
    pub const fn pcm16_mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1, 2)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.sample_rate == 0 {
            return Err(VoiceError::InvalidFrame("sample rate must be non-zero".into()));
        }
        if self.channels == 0 {
            return Err(VoiceError::InvalidFrame("channel count must be non-zero".into()));
        }
        if !matches!(self.sample_width, 1 | 2 | 4) {
            return Err(VoiceError::InvalidFrame(format!(
                "unsupported sample width {} (expected 1, 2 or 4 bytes)",
                self.sample_width
            )));
        }
        Ok(())
    }

    /// Bytes occupied by one sample across all channels.
    pub const fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.sample_width as usize
    }

    /// Per-channel sample count covering `duration` (truncated).
    pub fn samples_in(&self, duration: Duration) -> usize {
        (self.sample_rate as u128 * duration.as_micros() / 1_000_000) as usize
    }

    pub fn duration_of(&self, samples: usize) -> Duration {
        Duration::from_nanos((samples as u128 * 1_000_000_000 / self.sample_rate.max(1) as u128) as u64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16_mono(16_000)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}bit",
            self.sample_rate,
            self.channels,
            self.sample_width * 8
        )
    }
}

/// One chunk of PCM audio with its stream position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    payload: Bytes,
    format: AudioFormat,
    timestamp: Duration,
    sequence: u64,
}

impl AudioFrame {
    /// Build a frame, checking the payload holds a whole number of samples.
    ///
    /// `timestamp` is the monotonic stream offset of the first sample.
    pub fn new(
        payload: impl Into<Bytes>,
        format: AudioFormat,
        timestamp: Duration,
        sequence: u64,
    ) -> VoiceResult<Self> {
        format.validate()?;
        let payload = payload.into();
        if payload.len() % format.bytes_per_frame() != 0 {
            return Err(VoiceError::InvalidFrame(format!(
                "payload of {} bytes is not a multiple of {} bytes per sample frame ({})",
                payload.len(),
                format.bytes_per_frame(),
                format
            )));
        }
        Ok(Self {
            payload,
            format,
            timestamp,
            sequence,
        })
    }

    /// `samples` per-channel samples of digital silence.
    pub fn silence(
        format: AudioFormat,
        samples: usize,
        timestamp: Duration,
        sequence: u64,
    ) -> VoiceResult<Self> {
        format.validate()?;
        // unsigned 8-bit PCM is centred on 0x80
        let fill = if format.sample_width == 1 { 0x80 } else { 0 };
        let payload = vec![fill; samples * format.bytes_per_frame()];
        Self::new(payload, format, timestamp, sequence)
    }

    /// Build a 16-bit frame from interleaved samples.
    pub fn from_i16(
        samples: &[i16],
        format: AudioFormat,
        timestamp: Duration,
        sequence: u64,
    ) -> VoiceResult<Self> {
        if format.sample_width != 2 {
            return Err(VoiceError::InvalidFrame(format!(
                "from_i16 needs a 16-bit format, got {format}"
            )));
        }
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for sample in samples {
            buf.put_i16_le(*sample);
        }
        Self::new(buf.freeze(), format, timestamp, sequence)
    }

    /// Build a frame from interleaved normalized samples, encoding to `format`'s width.
    pub fn from_f32(
        samples: &[f32],
        format: AudioFormat,
        timestamp: Duration,
        sequence: u64,
    ) -> VoiceResult<Self> {
        format.validate()?;
        Self::new(
            encode_samples(samples, format.sample_width),
            format,
            timestamp,
            sequence,
        )
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Per-channel sample count.
    pub fn sample_count(&self) -> usize {
        self.payload.len() / self.format.bytes_per_frame()
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.sample_count())
    }

    /// Stream offset just past the last sample.
    pub fn end_timestamp(&self) -> Duration {
        self.timestamp + self.duration()
    }

    /// Interleaved samples normalized to [-1.0, 1.0).
    pub fn to_f32(&self) -> Vec<f32> {
        decode_samples(&self.payload, self.format.sample_width)
    }

    /// Interleaved samples as signed 16-bit values, converting other widths.
    pub fn to_i16(&self) -> Vec<i16> {
        if self.format.sample_width == 2 {
            return self
                .payload
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
        }
        self.to_f32()
            .into_iter()
            .map(|s| (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect()
    }

    /// Root-mean-square level over all channels, in [0.0, 1.0].
    pub fn rms(&self) -> f32 {
        let samples = self.to_f32();
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    /// Same audio at a different stream position.
    pub fn with_timing(&self, timestamp: Duration, sequence: u64) -> Self {
        Self {
            payload: self.payload.clone(),
            format: self.format,
            timestamp,
            sequence,
        }
    }

    /// Zero-copy slices of at most `max_samples` per-channel samples each.
    ///
    /// Slices share the parent's sequence number; their timestamps advance
    /// with the audio they cover.
    pub fn split(&self, max_samples: usize) -> Vec<AudioFrame> {
        let total = self.sample_count();
        if max_samples == 0 || total <= max_samples {
            return vec![self.clone()];
        }
        let bpf = self.format.bytes_per_frame();
        let mut slices = Vec::with_capacity(total.div_ceil(max_samples));
        let mut start = 0;
        while start < total {
            let end = (start + max_samples).min(total);
            slices.push(Self {
                payload: self.payload.slice(start * bpf..end * bpf),
                format: self.format,
                timestamp: self.timestamp + self.format.duration_of(start),
                sequence: self.sequence,
            });
            start = end;
        }
        slices
    }
}

/// Assigns contiguous timestamps and sequence numbers to generated frames.
#[derive(Debug, Clone)]
pub struct FrameClock {
    format: AudioFormat,
    samples: u64,
    sequence: u64,
}

impl FrameClock {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            samples: 0,
            sequence: 0,
        }
    }

    /// Position for the next frame of `samples` samples, advancing the clock.
    pub fn advance(&mut self, samples: usize) -> (Duration, u64) {
        let stamp = (
            self.format.duration_of(self.samples as usize),
            self.sequence,
        );
        self.samples += samples as u64;
        self.sequence += 1;
        stamp
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

/// Decode little-endian integer PCM into normalized floats.
pub(crate) fn decode_samples(payload: &[u8], sample_width: u16) -> Vec<f32> {
    match sample_width {
        1 => payload.iter().map(|b| (*b as f32 - 128.0) / 128.0).collect(),
        2 => payload
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect(),
        4 => payload
            .chunks_exact(4)
            .map(|b| (i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 / 2_147_483_648.0) as f32)
            .collect(),
        _ => Vec::new(),
    }
}

/// Encode normalized floats as little-endian integer PCM.
pub(crate) fn encode_samples(samples: &[f32], sample_width: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * sample_width as usize);
    for &s in samples {
        match sample_width {
            1 => buf.put_u8((s * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8),
            2 => buf.put_i16_le((s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16),
            _ => buf.put_i32_le(
                (s as f64 * 2_147_483_648.0)
                    .round()
                    .clamp(i32::MIN as f64, i32::MAX as f64) as i32,
            ),
        }
    }
    buf.freeze()
}
