//! Audio capture and playback on real hardware (CPAL and Rodio)
//!
//! Neither handle is `Send` on every platform: keep [`DeviceCapture`] on the
//! thread that opened it, and open [`DevicePlayback`] through
//! [`QueuedPlayer::spawn`](crate::output::QueuedPlayer::spawn) so it lives on
//! the playback thread.

use crate::error::{VoiceError, VoiceResult};
use crate::frame::{AudioFormat, AudioFrame, FrameClock};
use crate::sink::AudioSink;
use crate::source::ChannelSource;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use crossbeam_channel::{bounded, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Duration of each captured frame (default: 30ms)
    pub frame_duration: Duration,

    /// Captured frames buffered ahead of the reader (default: 128)
    pub capture_capacity: usize,

    /// Sounds queued in the output device before `write` waits (default: 4)
    pub playback_queue: usize,

    /// Longest `write` waits for the device to drain (default: 2s)
    pub write_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_duration: Duration::from_millis(30),
            capture_capacity: 128,
            playback_queue: 4,
            write_timeout: Duration::from_secs(2),
        }
    }
}

impl DeviceConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, 2)
    }
}

/// Live microphone stream; audio stops when dropped
pub struct DeviceCapture {
    _stream: Stream,
    overruns: Arc<AtomicU64>,
}

impl DeviceCapture {
    /// Open the default input device, delivering frames to the returned source.
    ///
    /// The capture callback cannot block, so frames the reader has not
    /// caught up with are dropped and counted in [`overruns`](Self::overruns).
    pub fn open(config: &DeviceConfig) -> VoiceResult<(Self, ChannelSource)> {
        let format = config.format();
        format.validate()?;
        info!("🎤 Initializing audio capture ({})", format);

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
        info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let frame_len = format.samples_in(config.frame_duration).max(1) * config.channels as usize;
        let (tx, rx) = bounded(config.capture_capacity.max(1));
        let overruns = Arc::new(AtomicU64::new(0));
        let dropped = Arc::clone(&overruns);
        let mut clock = FrameClock::new(format);
        let mut pending: Vec<f32> = Vec::with_capacity(frame_len);

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample);
                    if pending.len() < frame_len {
                        continue;
                    }
                    let (timestamp, sequence) = clock.advance(frame_len / format.channels as usize);
                    match AudioFrame::from_f32(&pending, format, timestamp, sequence) {
                        Ok(frame) => match tx.try_send(frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(TrySendError::Disconnected(_)) => {}
                        },
                        Err(e) => warn!("Dropping captured frame: {}", e),
                    }
                    pending.clear();
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        info!("✅ Audio capture started");

        Ok((
            Self {
                _stream: stream,
                overruns,
            },
            ChannelSource::new(format, rx),
        ))
    }

    /// Frames dropped because the reader fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|device| device.name().ok()).collect())
    }
}

/// Default output device as an [`AudioSink`]
pub struct DevicePlayback {
    format: AudioFormat,
    _stream: rodio::OutputStream,
    handle: rodio::OutputStreamHandle,
    sink: rodio::Sink,
    playback_queue: usize,
    write_timeout: Duration,
}

impl DevicePlayback {
    pub fn open(config: &DeviceConfig) -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback");
        let (stream, handle) = rodio::OutputStream::try_default()?;
        let sink = rodio::Sink::try_new(&handle)?;
        info!("✅ Audio playback initialized");
        Ok(Self {
            format: config.format(),
            _stream: stream,
            handle,
            sink,
            playback_queue: config.playback_queue.max(1),
            write_timeout: config.write_timeout,
        })
    }
}

impl AudioSink for DevicePlayback {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, frame: &AudioFrame) -> VoiceResult<()> {
        if frame.format() != self.format {
            return Err(VoiceError::SinkWrite(format!(
                "device plays {}, got {}",
                self.format,
                frame.format()
            )));
        }
        let deadline = Instant::now() + self.write_timeout;
        while self.sink.len() >= self.playback_queue {
            if Instant::now() >= deadline {
                return Err(VoiceError::Timeout(self.write_timeout));
            }
            thread::sleep(Duration::from_millis(5));
        }
        let buffer = rodio::buffer::SamplesBuffer::new(self.format.channels, self.format.sample_rate, frame.to_i16());
        self.sink.append(buffer);
        Ok(())
    }

    fn interrupt(&mut self) {
        self.sink.stop();
        match rodio::Sink::try_new(&self.handle) {
            Ok(sink) => self.sink = sink,
            Err(e) => warn!("Could not reopen output after stop: {}", e),
        }
        info!("⏹️ Audio playback stopped");
    }

    fn flush(&mut self) -> VoiceResult<()> {
        self.sink.sleep_until_end();
        Ok(())
    }
}
