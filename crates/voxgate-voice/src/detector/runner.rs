//! Driving a detector from a frame source
//!
//! Two ways to run the same loop: lazily, as an iterator pulled by the
//! caller ([`SpeechEvents`]), or on a dedicated thread pushing into an event
//! channel ([`spawn_detector`]).

use super::{CloseReason, SpeechDetector, SpeechEvent};
use crate::error::{VoiceError, VoiceResult};
use crate::events::EventSender;
use crate::source::FrameSource;
use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Outcome of pulling one frame through the detector
pub(crate) enum Pumped {
    Events(Vec<SpeechEvent>),
    /// Nothing arrived within the poll interval
    Waiting,
    /// The stream is over; `last` is the force-closed segment, if one was open
    Finished {
        last: Option<SpeechEvent>,
        error: Option<VoiceError>,
    },
}

impl SpeechDetector {
    pub(crate) fn pump<S: FrameSource + ?Sized>(&mut self, source: &mut S, poll: Duration) -> Pumped {
        match source.read_frame(poll) {
            Ok(Some(frame)) => match self.process_frame(frame) {
                Ok(events) => Pumped::Events(events),
                Err(e) => Pumped::Finished {
                    last: self.force_close(CloseReason::Aborted),
                    error: Some(e),
                },
            },
            Ok(None) => {
                info!(frames = self.frames_processed(), "frame source ended");
                Pumped::Finished {
                    last: self.force_close(CloseReason::EndOfStream),
                    error: None,
                }
            }
            Err(VoiceError::Timeout(_)) => Pumped::Waiting,
            Err(VoiceError::PeerDisconnected(peer)) => {
                info!(peer = %peer, "🔌 Peer disconnected, closing open segment");
                Pumped::Finished {
                    last: self.force_close(CloseReason::Disconnected),
                    error: None,
                }
            }
            Err(e) => {
                error!(error = %e, "frame source failed");
                Pumped::Finished {
                    last: self.force_close(CloseReason::Aborted),
                    error: Some(e),
                }
            }
        }
    }

    /// Lazily detect over `source`, yielding events as frames are pulled.
    ///
    /// The iterator ends after the source ends (or its peer disconnects); a
    /// fatal error is yielded once, after the force-closed segment.
    pub fn events<'a, S: FrameSource + ?Sized>(&'a mut self, source: &'a mut S) -> SpeechEvents<'a, S> {
        SpeechEvents {
            detector: self,
            source,
            poll: Duration::from_millis(100),
            pending: VecDeque::new(),
            error: None,
            done: false,
        }
    }
}

/// Iterator returned by [`SpeechDetector::events`]
pub struct SpeechEvents<'a, S: ?Sized> {
    detector: &'a mut SpeechDetector,
    source: &'a mut S,
    poll: Duration,
    pending: VecDeque<SpeechEvent>,
    error: Option<VoiceError>,
    done: bool,
}

impl<S: ?Sized> SpeechEvents<'_, S> {
    /// How long each read waits before polling again (default: 100ms).
    pub fn poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

impl<S: FrameSource + ?Sized> Iterator for SpeechEvents<'_, S> {
    type Item = VoiceResult<SpeechEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if let Some(e) = self.error.take() {
                return Some(Err(e));
            }
            if self.done {
                return None;
            }
            match self.detector.pump(&mut *self.source, self.poll) {
                Pumped::Events(events) => self.pending.extend(events),
                Pumped::Waiting => {}
                Pumped::Finished { last, error } => {
                    self.pending.extend(last);
                    self.error = error;
                    self.done = true;
                }
            }
        }
    }
}

/// Handle to a detector running on its own thread
pub struct DetectorHandle {
    stop: CancellationToken,
    thread: Option<JoinHandle<VoiceResult<()>>>,
}

impl DetectorHandle {
    /// Ask the loop to close any open segment and exit.
    ///
    /// Also releases a send blocked on a listener that stopped reading.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the loop to exit; returns the fatal error that ended it, if any.
    pub fn join(mut self) -> VoiceResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| VoiceError::AudioStream("detector thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run a detector on a dedicated thread, delivering events to `events`.
///
/// The detector is built on that thread, so classifiers that are not `Send`
/// are fine. `poll` bounds how long a read may wait before the stop request
/// is checked again.
pub fn spawn_detector<F, S>(
    build: F,
    mut source: S,
    events: EventSender<SpeechEvent>,
    poll: Duration,
) -> VoiceResult<DetectorHandle>
where
    F: FnOnce() -> VoiceResult<SpeechDetector> + Send + 'static,
    S: FrameSource + Send + 'static,
{
    let stop = CancellationToken::new();
    let stop_flag = stop.clone();

    let thread = thread::Builder::new()
        .name("voxgate-detector".into())
        .spawn(move || -> VoiceResult<()> {
            let mut detector = build()?;
            info!(format = %source.format(), "🎧 Detector loop started");
            loop {
                if stop_flag.is_cancelled() {
                    if let Some(event) = detector.force_close(CloseReason::EndOfStream) {
                        events.emit(event);
                    }
                    info!("detector loop stopped");
                    return Ok(());
                }
                match detector.pump(&mut source, poll) {
                    Pumped::Events(batch) => {
                        for event in batch {
                            events.emit_unless(event, &stop_flag);
                        }
                    }
                    Pumped::Waiting => {}
                    Pumped::Finished { last, error } => {
                        if let Some(event) = last {
                            events.emit(event);
                        }
                        return match error {
                            Some(e) => {
                                error!(error = %e, "detector loop halted");
                                Err(e)
                            }
                            None => Ok(()),
                        };
                    }
                }
            }
        })?;

    Ok(DetectorHandle {
        stop,
        thread: Some(thread),
    })
}
