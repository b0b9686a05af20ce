//! Format adaptation between a transport and the local pipeline
//!
//! Audio is downmixed to mono, resampled when the rates differ, cut into
//! fixed-size frames and upmixed to the target channel count. Frames come
//! out stamped with a continuous clock of their own, whatever the input
//! timing was.

use crate::error::{VoiceError, VoiceResult};
use crate::frame::{decode_samples, AudioFormat, AudioFrame, FrameClock};
use rubato::{FftFixedIn, Resampler};
use std::time::Duration;
use tracing::debug;

pub struct FrameAdapter {
    input: AudioFormat,
    output: AudioFormat,
    frame_samples: usize,
    resampler: Option<FftFixedIn<f32>>,
    pending_in: Vec<f32>,
    pending_out: Vec<f32>,
    clock: FrameClock,
}

impl FrameAdapter {
    /// `input_chunk` is the duration of the input frames the adapter is fed;
    /// it sizes the resampler's input block.
    pub fn new(
        input: AudioFormat,
        input_chunk: Duration,
        output: AudioFormat,
        frame_duration: Duration,
    ) -> VoiceResult<Self> {
        input.validate()?;
        output.validate()?;
        let frame_samples = output.samples_in(frame_duration);
        if frame_samples == 0 {
            return Err(VoiceError::Config(format!(
                "frame duration {frame_duration:?} holds no samples at {output}"
            )));
        }

        let resampler = if input.sample_rate == output.sample_rate {
            None
        } else {
            let chunk = input.samples_in(input_chunk).max(1);
            let resampler = FftFixedIn::<f32>::new(
                input.sample_rate as usize,
                output.sample_rate as usize,
                chunk,
                2,
                1,
            )
            .map_err(|e| VoiceError::Resample(format!("resampler init failed: {e}")))?;
            debug!(from = input.sample_rate, to = output.sample_rate, chunk, "resampler ready");
            Some(resampler)
        };

        Ok(Self {
            input,
            output,
            frame_samples,
            resampler,
            pending_in: Vec::new(),
            pending_out: Vec::new(),
            clock: FrameClock::new(output),
        })
    }

    pub fn input_format(&self) -> AudioFormat {
        self.input
    }

    pub fn output_format(&self) -> AudioFormat {
        self.output
    }

    /// Per-channel samples in each produced frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Feed one input frame; returns every output frame now complete.
    pub fn push(&mut self, frame: &AudioFrame) -> VoiceResult<Vec<AudioFrame>> {
        if frame.format() != self.input {
            return Err(VoiceError::InvalidFrame(format!(
                "adapter expects {}, got {}",
                self.input,
                frame.format()
            )));
        }
        let mono = downmix(
            &decode_samples(frame.payload(), self.input.sample_width),
            self.input.channels,
        );

        match self.resampler.as_mut() {
            None => self.pending_out.extend_from_slice(&mono),
            Some(resampler) => {
                self.pending_in.extend_from_slice(&mono);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.pending_in.len() < needed {
                        break;
                    }
                    let block: Vec<f32> = self.pending_in.drain(..needed).collect();
                    let mut out = resampler
                        .process(&[block], None)
                        .map_err(|e| VoiceError::Resample(e.to_string()))?;
                    if let Some(channel) = out.pop() {
                        self.pending_out.extend(channel);
                    }
                }
            }
        }

        let mut frames = Vec::new();
        while self.pending_out.len() >= self.frame_samples {
            let mono: Vec<f32> = self.pending_out.drain(..self.frame_samples).collect();
            let samples = upmix(&mono, self.output.channels);
            let (timestamp, sequence) = self.clock.advance(self.frame_samples);
            frames.push(AudioFrame::from_f32(&samples, self.output, timestamp, sequence)?);
        }
        Ok(frames)
    }

    /// Drop partially assembled audio, e.g. after a barge-in.
    pub fn discard_pending(&mut self) {
        self.pending_in.clear();
        self.pending_out.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn upmix(mono: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return mono.to_vec();
    }
    mono.iter()
        .flat_map(|s| std::iter::repeat(*s).take(channels as usize))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize, format: AudioFormat) -> AudioFrame {
        let samples: Vec<i16> = (0..len as i16).map(|i| i * 3 - 500).collect();
        AudioFrame::from_i16(&samples, format, Duration::ZERO, 0).unwrap()
    }

    #[test]
    fn test_same_format_rechunks_bit_exactly() {
        let format = AudioFormat::pcm16_mono(16_000);
        let mut adapter =
            FrameAdapter::new(format, Duration::from_millis(10), format, Duration::from_millis(20)).unwrap();

        let input = ramp(160, format);
        assert!(adapter.push(&input).unwrap().is_empty());
        let out = adapter.push(&input).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sample_count(), 320);
        let mut expected = input.to_i16();
        expected.extend(input.to_i16());
        assert_eq!(out[0].to_i16(), expected);
    }

    #[test]
    fn test_resamples_and_stamps_continuously() {
        let transport = AudioFormat::pcm16_mono(48_000);
        let local = AudioFormat::pcm16_mono(16_000);
        let mut adapter =
            FrameAdapter::new(transport, Duration::from_millis(20), local, Duration::from_millis(20)).unwrap();

        let mut frames = Vec::new();
        for _ in 0..10 {
            let packet = AudioFrame::silence(transport, 960, Duration::ZERO, 0).unwrap();
            frames.extend(adapter.push(&packet).unwrap());
        }
        // the FFT resampler holds back some latency; most of 200ms comes through
        assert!(frames.len() >= 8, "only {} frames", frames.len());
        assert!(frames.iter().all(|f| f.sample_count() == 320 && f.format() == local));
        assert_eq!(frames[1].timestamp(), Duration::from_millis(20));
        assert_eq!(frames[1].sequence(), 1);
    }

    #[test]
    fn test_channel_conversion() {
        let stereo = AudioFormat::new(8_000, 2, 2);
        let mono = AudioFormat::pcm16_mono(8_000);
        let mut down = FrameAdapter::new(stereo, Duration::from_millis(10), mono, Duration::from_millis(10)).unwrap();
        let samples: Vec<i16> = (0..80).flat_map(|_| [1000i16, 3000]).collect();
        let frame = AudioFrame::from_i16(&samples, stereo, Duration::ZERO, 0).unwrap();
        let out = down.push(&frame).unwrap();
        assert!(out[0].to_i16().iter().all(|s| *s == 2000));

        let mut up = FrameAdapter::new(mono, Duration::from_millis(10), stereo, Duration::from_millis(10)).unwrap();
        let out = up.push(&out[0]).unwrap();
        assert_eq!(out[0].format(), stereo);
        assert_eq!(out[0].sample_count(), 80);
    }

    #[test]
    fn test_rejects_foreign_format() {
        let format = AudioFormat::pcm16_mono(16_000);
        let mut adapter =
            FrameAdapter::new(format, Duration::from_millis(20), format, Duration::from_millis(20)).unwrap();
        let other = AudioFrame::silence(AudioFormat::pcm16_mono(8_000), 160, Duration::ZERO, 0).unwrap();
        assert!(matches!(adapter.push(&other), Err(VoiceError::InvalidFrame(_))));
    }
}
