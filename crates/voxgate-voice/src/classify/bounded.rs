//! Time-bounded classifier calls
//!
//! A hung backend must not freeze the detector. Each wrapper here owns the
//! real backend on a worker thread and waits at most `timeout` for each
//! answer; a late answer is discarded and the call is reported as
//! [`VoiceError::ClassifierTimeout`], which the detector treats as transient
//! for activity and wake-word checks and as "speaker unknown" at segment
//! close.

use super::{Classification, KeywordDetection, VoiceActivityClassifier, WakeWordClassifier};
use crate::error::{VoiceError, VoiceResult};
use crate::frame::AudioFrame;
use crate::speaker::{SpeakerIdentifier, SpeakerMatch};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

enum Request<I> {
    Call(u64, I),
    Reset,
}

/// One backend on its own thread, answering one call at a time
struct DeadlineWorker<I, O> {
    requests: Sender<Request<I>>,
    replies: Receiver<(u64, VoiceResult<O>)>,
    timeout: Duration,
    next_id: u64,
    kind: &'static str,
}

impl<I: Send + 'static, O: Send + 'static> DeadlineWorker<I, O> {
    /// The backend never leaves the worker thread, so it does not need to be
    /// `Send`; only its constructor does.
    fn spawn<T, B>(
        kind: &'static str,
        build: B,
        call: fn(&mut T, I) -> VoiceResult<O>,
        reset: fn(&mut T),
        timeout: Duration,
    ) -> VoiceResult<Self>
    where
        T: 'static,
        B: FnOnce() -> VoiceResult<T> + Send + 'static,
    {
        let (request_tx, request_rx) = bounded::<Request<I>>(1);
        // unbounded so a late answer never blocks the worker; the caller
        // skips answers whose id does not match
        let (reply_tx, reply_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded::<VoiceResult<()>>(1);

        thread::Builder::new()
            .name(format!("voxgate-{kind}"))
            .spawn(move || {
                let mut backend = match build() {
                    Ok(backend) => {
                        let _ = ready_tx.send(Ok(()));
                        backend
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                for request in request_rx {
                    match request {
                        Request::Call(id, input) => {
                            let result = call(&mut backend, input);
                            if reply_tx.send((id, result)).is_err() {
                                break;
                            }
                        }
                        Request::Reset => reset(&mut backend),
                    }
                }
                debug!(kind, "backend worker exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                requests: request_tx,
                replies: reply_rx,
                timeout,
                next_id: 0,
                kind,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::ClassifierFatal(format!(
                "{kind} worker exited during construction"
            ))),
        }
    }

    fn call(&mut self, input: I) -> VoiceResult<O> {
        let id = self.next_id;
        self.next_id += 1;

        match self.requests.try_send(Request::Call(id, input)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // worker still stuck on an earlier call
                return Err(VoiceError::ClassifierTimeout(self.timeout));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(VoiceError::ClassifierFatal(format!("{} worker is gone", self.kind)));
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok((reply_id, result)) if reply_id == id => return result,
                Ok((stale, _)) => debug!(kind = self.kind, stale, "discarding late answer"),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(kind = self.kind, timeout_ms = self.timeout.as_millis() as u64, "backend call timed out");
                    return Err(VoiceError::ClassifierTimeout(self.timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(VoiceError::ClassifierFatal(format!("{} worker is gone", self.kind)));
                }
            }
        }
    }

    fn reset(&mut self) {
        let _ = self.requests.try_send(Request::Reset);
    }
}

/// Runs a voice-activity classifier on its own thread with a per-call deadline
pub struct BoundedClassifier {
    worker: DeadlineWorker<AudioFrame, Classification>,
}

impl BoundedClassifier {
    /// Build the classifier on a fresh worker thread.
    pub fn spawn<C, F>(build: F, timeout: Duration) -> VoiceResult<Self>
    where
        C: VoiceActivityClassifier + 'static,
        F: FnOnce() -> VoiceResult<C> + Send + 'static,
    {
        let worker = DeadlineWorker::spawn(
            "classifier",
            build,
            |c: &mut C, frame: AudioFrame| c.classify(&frame),
            |c: &mut C| c.reset(),
            timeout,
        )?;
        Ok(Self { worker })
    }

    pub fn timeout(&self) -> Duration {
        self.worker.timeout
    }
}

impl VoiceActivityClassifier for BoundedClassifier {
    fn classify(&mut self, frame: &AudioFrame) -> VoiceResult<Classification> {
        self.worker.call(frame.clone())
    }

    fn reset(&mut self) {
        self.worker.reset();
    }
}

/// Runs a wake-word classifier on its own thread with a per-call deadline
pub struct BoundedWakeWord {
    worker: DeadlineWorker<AudioFrame, KeywordDetection>,
}

impl BoundedWakeWord {
    pub fn spawn<W, F>(build: F, timeout: Duration) -> VoiceResult<Self>
    where
        W: WakeWordClassifier + 'static,
        F: FnOnce() -> VoiceResult<W> + Send + 'static,
    {
        let worker = DeadlineWorker::spawn(
            "wake-word",
            build,
            |w: &mut W, frame: AudioFrame| w.detect(&frame),
            |w: &mut W| w.reset(),
            timeout,
        )?;
        Ok(Self { worker })
    }
}

impl WakeWordClassifier for BoundedWakeWord {
    fn detect(&mut self, frame: &AudioFrame) -> VoiceResult<KeywordDetection> {
        self.worker.call(frame.clone())
    }

    fn reset(&mut self) {
        self.worker.reset();
    }
}

/// Runs a speaker identifier on its own thread with a per-call deadline
///
/// Frames are cheap to clone (shared payloads), so a whole utterance is
/// handed over per call.
pub struct BoundedSpeakerIdentifier {
    worker: DeadlineWorker<Vec<AudioFrame>, Option<SpeakerMatch>>,
}

impl BoundedSpeakerIdentifier {
    pub fn spawn<S, F>(build: F, timeout: Duration) -> VoiceResult<Self>
    where
        S: SpeakerIdentifier + 'static,
        F: FnOnce() -> VoiceResult<S> + Send + 'static,
    {
        let worker = DeadlineWorker::spawn(
            "speaker-id",
            build,
            |s: &mut S, frames: Vec<AudioFrame>| s.identify(&frames),
            |s: &mut S| s.reset(),
            timeout,
        )?;
        Ok(Self { worker })
    }
}

impl SpeakerIdentifier for BoundedSpeakerIdentifier {
    fn identify(&mut self, frames: &[AudioFrame]) -> VoiceResult<Option<SpeakerMatch>> {
        self.worker.call(frames.to_vec())
    }

    fn reset(&mut self) {
        self.worker.reset();
    }
}
