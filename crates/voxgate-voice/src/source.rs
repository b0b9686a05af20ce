//! Frame sources
//!
//! Anything that yields [`AudioFrame`]s in stream order: a programmatic buffer,
//! a push-fed virtual microphone, a device capture stream (see `device`), or
//! the inbound side of a network peer (see `bridge`).

use crate::error::{VoiceError, VoiceResult};
use crate::frame::{AudioFormat, AudioFrame, FrameClock};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Pull interface over a stream of fixed-format frames
pub trait FrameSource {
    /// Format of every frame this source yields.
    fn format(&self) -> AudioFormat;

    /// Next frame in stream order.
    ///
    /// Returns `Ok(None)` once the stream has ended and
    /// [`VoiceError::Timeout`] when nothing arrived within `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> VoiceResult<Option<AudioFrame>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn format(&self) -> AudioFormat {
        (**self).format()
    }

    fn read_frame(&mut self, timeout: Duration) -> VoiceResult<Option<AudioFrame>> {
        (**self).read_frame(timeout)
    }
}

/// Source over frames that are already in memory
#[derive(Debug, Clone)]
pub struct BufferSource {
    format: AudioFormat,
    frames: VecDeque<AudioFrame>,
}

impl BufferSource {
    pub fn from_frames(format: AudioFormat, frames: impl IntoIterator<Item = AudioFrame>) -> Self {
        Self {
            format,
            frames: frames.into_iter().collect(),
        }
    }

    /// Slice a contiguous PCM buffer into frames of `frame_samples` samples.
    ///
    /// A trailing partial frame is kept rather than dropped.
    pub fn from_pcm(
        pcm: impl Into<Bytes>,
        format: AudioFormat,
        frame_samples: usize,
    ) -> VoiceResult<Self> {
        if frame_samples == 0 {
            return Err(VoiceError::Config("frame size must be non-zero".into()));
        }
        let whole = AudioFrame::new(pcm, format, Duration::ZERO, 0)?;
        let mut clock = FrameClock::new(format);
        let frames = whole
            .split(frame_samples)
            .into_iter()
            .map(|slice| {
                let (timestamp, sequence) = clock.advance(slice.sample_count());
                slice.with_timing(timestamp, sequence)
            })
            .collect();
        Ok(Self { format, frames })
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for BufferSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_frame(&mut self, _timeout: Duration) -> VoiceResult<Option<AudioFrame>> {
        Ok(self.frames.pop_front())
    }
}

/// Source fed through a bounded channel
///
/// Ends (`Ok(None)`) once every sender has been dropped and the channel drained.
#[derive(Debug)]
pub struct ChannelSource {
    format: AudioFormat,
    rx: Receiver<AudioFrame>,
}

impl ChannelSource {
    pub fn new(format: AudioFormat, rx: Receiver<AudioFrame>) -> Self {
        Self { format, rx }
    }

    /// Frames waiting to be read.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
}

impl FrameSource for ChannelSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_frame(&mut self, timeout: Duration) -> VoiceResult<Option<AudioFrame>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Err(VoiceError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

/// Push-fed microphone for programmatic or remote audio
///
/// `push_*` blocks for at most the configured timeout when the consumer falls
/// behind, so a slow detector slows the producer instead of losing audio.
pub struct VirtualMicrophone {
    format: AudioFormat,
    tx: Sender<AudioFrame>,
    push_timeout: Duration,
    clock: Mutex<FrameClock>,
}

impl VirtualMicrophone {
    /// Create the microphone and the source that reads from it.
    pub fn new(format: AudioFormat, capacity: usize, push_timeout: Duration) -> (Self, ChannelSource) {
        let (tx, rx) = bounded(capacity.max(1));
        let mic = Self {
            format,
            tx,
            push_timeout,
            clock: Mutex::new(FrameClock::new(format)),
        };
        (mic, ChannelSource::new(format, rx))
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Push raw PCM in the microphone's format, stamping it with the running clock.
    pub fn push_pcm(&self, pcm: impl Into<Bytes>) -> VoiceResult<()> {
        let pcm = pcm.into();
        let samples = pcm.len() / self.format.bytes_per_frame();
        // held across the send so concurrent pushers stay in clock order
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = clock.clone();
        let (timestamp, sequence) = next.advance(samples);
        let frame = AudioFrame::new(pcm, self.format, timestamp, sequence)?;
        self.push_frame(frame)?;
        *clock = next;
        Ok(())
    }

    /// Push a frame as-is.
    pub fn push_frame(&self, frame: AudioFrame) -> VoiceResult<()> {
        if frame.format() != self.format {
            return Err(VoiceError::InvalidFrame(format!(
                "microphone expects {}, got {}",
                self.format,
                frame.format()
            )));
        }
        match self.tx.send_timeout(frame, self.push_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                debug!(backlog = self.tx.len(), "virtual microphone push timed out");
                Err(VoiceError::Timeout(self.push_timeout))
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(VoiceError::ChannelSend("microphone reader dropped".into()))
            }
        }
    }

    /// End the stream; the reader sees end-of-stream after draining.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_source_slices_pcm() {
        let format = AudioFormat::pcm16_mono(16_000);
        let pcm = vec![0u8; 2 * 1000];
        let mut source = BufferSource::from_pcm(pcm, format, 320).unwrap();
        assert_eq!(source.remaining(), 4);

        let wait = Duration::from_millis(1);
        let first = source.read_frame(wait).unwrap().unwrap();
        let second = source.read_frame(wait).unwrap().unwrap();
        assert_eq!(first.sequence(), 0);
        assert_eq!(second.timestamp(), Duration::from_millis(20));
        source.read_frame(wait).unwrap();
        let last = source.read_frame(wait).unwrap().unwrap();
        assert_eq!(last.sample_count(), 40);
        assert!(source.read_frame(wait).unwrap().is_none());
    }

    #[test]
    fn test_virtual_microphone_backpressure() {
        let format = AudioFormat::pcm16_mono(16_000);
        let (mic, mut source) = VirtualMicrophone::new(format, 1, Duration::from_millis(5));

        mic.push_pcm(vec![0u8; 640]).unwrap();
        let blocked = mic.push_pcm(vec![0u8; 640]);
        assert!(matches!(blocked, Err(VoiceError::Timeout(_))));

        let frame = source.read_frame(Duration::from_millis(5)).unwrap().unwrap();
        assert_eq!(frame.sample_count(), 320);
        mic.push_pcm(vec![0u8; 640]).unwrap();
        let next = source.read_frame(Duration::from_millis(5)).unwrap().unwrap();
        // the rejected push did not consume a sequence number
        assert_eq!(next.sequence(), 1);
        assert_eq!(next.timestamp(), Duration::from_millis(20));

        mic.close();
        assert!(source.read_frame(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn test_channel_source_times_out() {
        let format = AudioFormat::pcm16_mono(16_000);
        let (_mic, mut source) = VirtualMicrophone::new(format, 4, Duration::from_millis(5));
        let result = source.read_frame(Duration::from_millis(2));
        assert!(matches!(result, Err(VoiceError::Timeout(_))));
    }
}
