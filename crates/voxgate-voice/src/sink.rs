//! Audio sink port and an in-memory sink

use crate::error::{VoiceError, VoiceResult};
use crate::frame::{AudioFormat, AudioFrame};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered output of audio frames
///
/// Implementations are driven by exactly one thread at a time; they do not
/// need to be `Sync`, and the queued output engine opens them on its own
/// consumer thread so they do not need to be `Send` either.
pub trait AudioSink {
    /// Format frames are expected in.
    fn format(&self) -> AudioFormat;

    /// Render one frame. Returning only once the frame is accepted by the
    /// underlying output is what paces the caller.
    fn write(&mut self, frame: &AudioFrame) -> VoiceResult<()>;

    /// Drop any audio accepted but not yet audible. Called on barge-in.
    fn interrupt(&mut self) {}

    /// Wait until accepted audio has been rendered.
    fn flush(&mut self) -> VoiceResult<()> {
        Ok(())
    }
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
    fn format(&self) -> AudioFormat {
        (**self).format()
    }

    fn write(&mut self, frame: &AudioFrame) -> VoiceResult<()> {
        (**self).write(frame)
    }

    fn interrupt(&mut self) {
        (**self).interrupt()
    }

    fn flush(&mut self) -> VoiceResult<()> {
        (**self).flush()
    }
}

/// Shared view of everything a [`MemorySink`] has rendered
#[derive(Debug, Clone, Default)]
pub struct Recording {
    frames: Arc<Mutex<Vec<AudioFrame>>>,
    interrupts: Arc<AtomicUsize>,
}

impl Recording {
    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rendered audio as one sample sequence.
    pub fn samples(&self) -> Vec<i16> {
        self.frames().iter().flat_map(|f| f.to_i16()).collect()
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn push(&self, frame: AudioFrame) -> usize {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        frames.push(frame);
        frames.len()
    }
}

type Observer = Box<dyn FnMut(&AudioFrame, usize) + Send>;
type FailurePredicate = Box<dyn FnMut(&AudioFrame) -> bool + Send>;

/// Virtual player that records instead of rendering
///
/// Optionally paced at real time, and with hooks for observing writes or
/// injecting write failures.
pub struct MemorySink {
    format: AudioFormat,
    recording: Recording,
    realtime: bool,
    observer: Option<Observer>,
    fail_when: Option<FailurePredicate>,
}

impl MemorySink {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            recording: Recording::default(),
            realtime: false,
            observer: None,
            fail_when: None,
        }
    }

    /// Handle for inspecting rendered audio from another thread.
    pub fn recording(&self) -> Recording {
        self.recording.clone()
    }

    /// Sleep for each frame's duration on write, like a device would.
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Called after each recorded frame with the total recorded so far.
    pub fn on_write(mut self, observer: impl FnMut(&AudioFrame, usize) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Fail (without recording) every write for which `predicate` holds.
    pub fn fail_when(mut self, predicate: impl FnMut(&AudioFrame) -> bool + Send + 'static) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }
}

impl AudioSink for MemorySink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, frame: &AudioFrame) -> VoiceResult<()> {
        if let Some(predicate) = self.fail_when.as_mut() {
            if predicate(frame) {
                return Err(VoiceError::SinkWrite(format!(
                    "injected failure at frame {}",
                    frame.sequence()
                )));
            }
        }
        let total = self.recording.push(frame.clone());
        if let Some(observer) = self.observer.as_mut() {
            observer(frame, total);
        }
        if self.realtime {
            std::thread::sleep(frame.duration().min(Duration::from_millis(200)));
        }
        Ok(())
    }

    fn interrupt(&mut self) {
        self.recording.interrupts.fetch_add(1, Ordering::SeqCst);
    }
}
