//! Queued playback with barge-in
//!
//! Producers hand audio to a single consumer thread through one bounded FIFO.
//! Each chunk carries its request's cancellation token; the consumer writes
//! chunks to the sink in render-unit slices and checks the token before every
//! slice, so a cancel lands within one render unit even mid-chunk.
//!
//! A request leaves the engine's bookkeeping once the consumer has seen its
//! end, or as soon as it is cancelled before its producer finished it. Later
//! chunks for a retired request are dropped and finishing it is a no-op.

use crate::error::{VoiceError, VoiceResult};
use crate::events::EventSender;
use crate::frame::{AudioFormat, AudioFrame};
use crate::sink::AudioSink;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Monotonically increasing playback request id (starts at 1)
pub type RequestId = u64;

/// Which requests a cancel applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    Request(RequestId),
    All,
}

/// Lifecycle notices, delivered in rendering order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// First audio of the request reached the sink
    Started { request: RequestId },
    /// Every chunk was rendered
    Completed { request: RequestId },
    /// The request was cancelled before it finished rendering
    Cancelled { request: RequestId },
    /// The sink rejected a write; the rest of the request was dropped
    Failed { request: RequestId, error: String },
}

/// Configuration for the output engine
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Chunks the queue holds before `enqueue` waits (default: 256)
    pub queue_capacity: usize,

    /// Slice written to the sink per call; cancellation granularity (default: 20ms)
    pub render_unit: Duration,

    /// Longest `enqueue` waits for queue space (default: 2s)
    pub enqueue_timeout: Duration,

    /// How often an idle consumer checks for shutdown (default: 50ms)
    pub idle_poll: Duration,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            render_unit: Duration::from_millis(20),
            enqueue_timeout: Duration::from_secs(2),
            idle_poll: Duration::from_millis(50),
        }
    }
}

enum QueueItem {
    Chunk {
        request: RequestId,
        token: CancellationToken,
        frame: AudioFrame,
    },
    End {
        request: RequestId,
        token: CancellationToken,
    },
}

struct RequestEntry {
    token: CancellationToken,
    finished: bool,
}

struct Shared {
    requests: Mutex<HashMap<RequestId, RequestEntry>>,
    next_id: AtomicU64,
    // request currently being written to the sink, 0 when idle
    rendering: AtomicU64,
    shutdown: CancellationToken,
}

/// Cloneable producer-side handle to a [`QueuedPlayer`]
#[derive(Clone)]
pub struct PlaybackControl {
    shared: Arc<Shared>,
    tx: Sender<QueueItem>,
    enqueue_timeout: Duration,
}

impl PlaybackControl {
    /// Open a new request.
    pub fn begin_request(&self) -> RequestId {
        self.register(CancellationToken::new())
    }

    /// Open a request that is also cancelled when `parent` is, e.g. a peer's token.
    pub fn begin_request_bound(&self, parent: &CancellationToken) -> RequestId {
        self.register(parent.child_token())
    }

    fn register(&self, token: CancellationToken) -> RequestId {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock_requests().insert(
            id,
            RequestEntry {
                token,
                finished: false,
            },
        );
        debug!(request = id, "playback request opened");
        id
    }

    /// Append a chunk to `request`.
    ///
    /// Waits at most the configured enqueue timeout for queue space. Chunks
    /// for a request that has already been cancelled are dropped silently.
    pub fn enqueue(&self, chunk: AudioFrame, request: RequestId) -> VoiceResult<()> {
        let token = {
            let requests = self.lock_requests();
            match requests.get(&request) {
                Some(entry) if entry.finished => {
                    return Err(VoiceError::Playback(format!(
                        "request {request} is already finished"
                    )))
                }
                Some(entry) => entry.token.clone(),
                None if self.is_retired(request) => {
                    trace!(request, "dropping chunk for retired request");
                    return Ok(());
                }
                None => return Err(VoiceError::Playback(format!("unknown request {request}"))),
            }
        };
        if token.is_cancelled() {
            trace!(request, "dropping chunk for cancelled request");
            return Ok(());
        }
        self.send(QueueItem::Chunk {
            request,
            token,
            frame: chunk,
        })
    }

    /// Mark `request` complete; its notice follows its last chunk.
    ///
    /// If the end marker cannot be queued the request is cancelled and
    /// retired, so it is never left half-tracked.
    pub fn finish(&self, request: RequestId) -> VoiceResult<()> {
        let token = {
            let mut requests = self.lock_requests();
            let Some(entry) = requests.get_mut(&request) else {
                if self.is_retired(request) {
                    return Ok(());
                }
                return Err(VoiceError::Playback(format!("unknown request {request}")));
            };
            if entry.finished {
                return Err(VoiceError::Playback(format!(
                    "request {request} is already finished"
                )));
            }
            entry.finished = true;
            entry.token.clone()
        };
        let result = self.send(QueueItem::End {
            request,
            token: token.clone(),
        });
        if result.is_err() {
            token.cancel();
            self.lock_requests().remove(&request);
            warn!(request, "end of request could not be queued, request retired");
        }
        result
    }

    /// Give up on a request part-way: cancel it and retire it.
    pub fn abort(&self, request: RequestId) {
        self.cancel(CancelTarget::Request(request));
        if let Err(e) = self.finish(request) {
            debug!(request, error = %e, "aborted request could not be finished");
        }
    }

    /// Enqueue a whole request at once.
    pub fn play(&self, chunks: impl IntoIterator<Item = AudioFrame>) -> VoiceResult<RequestId> {
        let request = self.begin_request();
        for chunk in chunks {
            if let Err(e) = self.enqueue(chunk, request) {
                self.abort(request);
                return Err(e);
            }
        }
        self.finish(request)?;
        Ok(request)
    }

    /// Cancel one request or all of them; returns how many were newly cancelled.
    ///
    /// A request its producer has not finished yet is retired right away and
    /// its `Cancelled` notice queued behind its chunks.
    pub fn cancel(&self, target: CancelTarget) -> usize {
        let mut requests = self.lock_requests();
        let ids: Vec<RequestId> = match target {
            CancelTarget::Request(id) => vec![id],
            CancelTarget::All => requests.keys().copied().collect(),
        };

        let mut cancelled = 0;
        for id in ids {
            let Some(entry) = requests.get(&id) else {
                continue;
            };
            if entry.token.is_cancelled() {
                continue;
            }
            entry.token.cancel();
            cancelled += 1;
            if entry.finished {
                continue;
            }
            let end = QueueItem::End {
                request: id,
                token: entry.token.clone(),
            };
            match self.tx.try_send(end) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {
                    requests.remove(&id);
                }
                // queue full: the producer's own finish delivers the end later
                Err(TrySendError::Full(_)) => {}
            }
        }
        if cancelled > 0 {
            debug!(?target, cancelled, "playback cancelled");
        }
        cancelled
    }

    /// Requests still tracked by the engine.
    pub fn open_requests(&self) -> usize {
        self.lock_requests().len()
    }

    fn is_retired(&self, request: RequestId) -> bool {
        request != 0 && request < self.shared.next_id.load(Ordering::SeqCst)
    }

    /// Cancel everything queued or playing. The engine stays usable.
    pub fn stop(&self) {
        let cancelled = self.cancel(CancelTarget::All);
        info!(requests = cancelled, "🔇 Playback stopped");
    }

    /// True while a chunk is being written to the sink.
    pub fn is_playing(&self) -> bool {
        self.shared.rendering.load(Ordering::SeqCst) != 0
    }

    /// True while anything is playing or queued.
    pub fn is_busy(&self) -> bool {
        self.is_playing() || !self.tx.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.tx.len()
    }

    /// True once `request` is cancelled or no longer tracked.
    pub fn is_cancelled(&self, request: RequestId) -> bool {
        self.lock_requests()
            .get(&request)
            .map_or(true, |entry| entry.token.is_cancelled())
    }

    fn send(&self, item: QueueItem) -> VoiceResult<()> {
        match self.tx.send_timeout(item, self.enqueue_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(queued = self.tx.len(), "playback queue full");
                Err(VoiceError::Timeout(self.enqueue_timeout))
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(VoiceError::Playback("output engine has shut down".into()))
            }
        }
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, RequestEntry>> {
        self.shared.requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single-consumer ordered playback engine
pub struct QueuedPlayer {
    control: PlaybackControl,
    format: AudioFormat,
    worker: Option<JoinHandle<()>>,
    stream_request: Option<RequestId>,
}

impl QueuedPlayer {
    /// Start the engine, opening the sink on the consumer thread.
    pub fn spawn<S, F>(
        open: F,
        config: OutputConfig,
        notices: Option<EventSender<PlaybackEvent>>,
    ) -> VoiceResult<Self>
    where
        S: AudioSink + 'static,
        F: FnOnce() -> VoiceResult<S> + Send + 'static,
    {
        let (tx, rx) = bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            requests: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            rendering: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        let (ready_tx, ready_rx) = bounded::<VoiceResult<AudioFormat>>(1);

        let consumer = Consumer {
            rx,
            shared: Arc::clone(&shared),
            notices,
            render_unit: config.render_unit,
            idle_poll: config.idle_poll,
            started: HashSet::new(),
            failed: HashSet::new(),
        };
        let worker = thread::Builder::new()
            .name("voxgate-playback".into())
            .spawn(move || match open() {
                Ok(sink) => {
                    let _ = ready_tx.send(Ok(sink.format()));
                    consumer.run(sink);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let format = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("playback thread exited while opening the sink".into()))??;
        info!(format = %format, "🔊 Playback engine started");

        Ok(Self {
            control: PlaybackControl {
                shared,
                tx,
                enqueue_timeout: config.enqueue_timeout,
            },
            format,
            worker: Some(worker),
            stream_request: None,
        })
    }

    /// Start the engine over an already-open sink.
    pub fn new<S>(sink: S, config: OutputConfig, notices: Option<EventSender<PlaybackEvent>>) -> VoiceResult<Self>
    where
        S: AudioSink + Send + 'static,
    {
        Self::spawn(move || Ok(sink), config, notices)
    }

    /// Handle for producers on other threads.
    pub fn control(&self) -> PlaybackControl {
        self.control.clone()
    }

    pub fn begin_request(&self) -> RequestId {
        self.control.begin_request()
    }

    pub fn begin_request_bound(&self, parent: &CancellationToken) -> RequestId {
        self.control.begin_request_bound(parent)
    }

    pub fn enqueue(&self, chunk: AudioFrame, request: RequestId) -> VoiceResult<()> {
        self.control.enqueue(chunk, request)
    }

    pub fn finish(&self, request: RequestId) -> VoiceResult<()> {
        self.control.finish(request)
    }

    pub fn play(&self, chunks: impl IntoIterator<Item = AudioFrame>) -> VoiceResult<RequestId> {
        self.control.play(chunks)
    }

    pub fn cancel(&self, target: CancelTarget) -> usize {
        self.control.cancel(target)
    }

    pub fn stop(&self) {
        self.control.stop()
    }

    pub fn is_playing(&self) -> bool {
        self.control.is_playing()
    }

    pub fn is_busy(&self) -> bool {
        self.control.is_busy()
    }

    pub fn queue_len(&self) -> usize {
        self.control.queue_len()
    }

    /// Cancel everything and stop the consumer thread.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.control.cancel(CancelTarget::All);
        self.control.shared.shutdown.cancel();
        if worker.join().is_err() {
            warn!("playback thread panicked");
        }
        info!("playback engine shut down");
    }
}

impl Drop for QueuedPlayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writing through the engine queues into an implicit stream request, which
/// is replaced whenever it has been cancelled (e.g. by barge-in).
impl AudioSink for QueuedPlayer {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&mut self, frame: &AudioFrame) -> VoiceResult<()> {
        let request = match self.stream_request {
            Some(id) if !self.control.is_cancelled(id) => id,
            stale => {
                if let Some(old) = stale {
                    if let Err(e) = self.control.finish(old) {
                        debug!(request = old, error = %e, "stale stream request not finished");
                    }
                }
                let id = self.control.begin_request();
                self.stream_request = Some(id);
                id
            }
        };
        self.control.enqueue(frame.clone(), request)
    }

    fn interrupt(&mut self) {
        if let Some(id) = self.stream_request {
            self.control.cancel(CancelTarget::Request(id));
        }
    }

    fn flush(&mut self) -> VoiceResult<()> {
        match self.stream_request.take() {
            Some(id) => self.control.finish(id),
            None => Ok(()),
        }
    }
}

struct Consumer {
    rx: Receiver<QueueItem>,
    shared: Arc<Shared>,
    notices: Option<EventSender<PlaybackEvent>>,
    render_unit: Duration,
    idle_poll: Duration,
    started: HashSet<RequestId>,
    failed: HashSet<RequestId>,
}

impl Consumer {
    fn run<S: AudioSink>(mut self, mut sink: S) {
        let unit_samples = sink.format().samples_in(self.render_unit).max(1);
        debug!(unit_samples, "playback consumer running");

        loop {
            if self.shared.shutdown.is_cancelled() {
                break;
            }
            let item = match self.rx.recv_timeout(self.idle_poll) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            match item {
                QueueItem::Chunk { request, token, frame } => {
                    self.render(&mut sink, request, &token, &frame, unit_samples)
                }
                QueueItem::End { request, token } => self.complete(request, &token),
            }
        }

        if let Err(e) = sink.flush() {
            warn!(error = %e, "sink flush failed during shutdown");
        }
        debug!("playback consumer exiting");
    }

    fn render<S: AudioSink>(
        &mut self,
        sink: &mut S,
        request: RequestId,
        token: &CancellationToken,
        frame: &AudioFrame,
        unit_samples: usize,
    ) {
        if token.is_cancelled() {
            trace!(request, "skipping cancelled chunk");
            return;
        }
        if self.started.insert(request) {
            debug!(request, "▶️ Playback started");
            self.notify(PlaybackEvent::Started { request });
        }

        self.shared.rendering.store(request, Ordering::SeqCst);
        for unit in frame.split(unit_samples) {
            if token.is_cancelled() || self.shared.shutdown.is_cancelled() {
                debug!(request, "chunk truncated by cancel");
                sink.interrupt();
                break;
            }
            if let Err(e) = sink.write(&unit) {
                warn!(request, error = %e, "sink write failed, aborting request");
                token.cancel();
                sink.interrupt();
                self.failed.insert(request);
                self.notify(PlaybackEvent::Failed {
                    request,
                    error: e.to_string(),
                });
                break;
            }
        }
        self.shared.rendering.store(0, Ordering::SeqCst);
    }

    fn complete(&mut self, request: RequestId, token: &CancellationToken) {
        self.shared
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request);
        self.started.remove(&request);

        if self.failed.remove(&request) {
            return;
        }
        if token.is_cancelled() {
            debug!(request, "playback request cancelled");
            self.notify(PlaybackEvent::Cancelled { request });
        } else {
            debug!(request, "✅ Playback request complete");
            self.notify(PlaybackEvent::Completed { request });
        }
    }

    fn notify(&self, event: PlaybackEvent) {
        if let Some(notices) = &self.notices {
            notices.emit_unless(event, &self.shared.shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, OverflowPolicy};
    use crate::sink::MemorySink;

    fn chunk(value: i16, samples: usize) -> AudioFrame {
        AudioFrame::from_i16(&vec![value; samples], AudioFormat::pcm16_mono(16_000), Duration::ZERO, 0).unwrap()
    }

    #[test]
    fn test_unknown_and_finished_requests_are_rejected() {
        let sink = MemorySink::new(AudioFormat::pcm16_mono(16_000)).realtime();
        let player = QueuedPlayer::new(sink, OutputConfig::default(), None).unwrap();
        assert!(player.enqueue(chunk(1, 10), 42).is_err());
        assert!(player.finish(42).is_err());

        // keep the consumer busy so the second request is still tracked
        player.play([chunk(1, 16_000)]).unwrap();
        let id = player.begin_request();
        player.finish(id).unwrap();
        assert!(player.finish(id).is_err());
        assert!(player.enqueue(chunk(1, 10), id).is_err());
    }

    #[test]
    fn test_cancelled_unfinished_request_is_retired() {
        let (tx, rx) = event_channel(8, OverflowPolicy::Block);
        let player = QueuedPlayer::new(MemorySink::new(AudioFormat::pcm16_mono(16_000)), OutputConfig::default(), Some(tx)).unwrap();

        let id = player.begin_request();
        assert_eq!(player.cancel(CancelTarget::Request(id)), 1);
        assert_eq!(player.control().open_requests(), 0);

        // the producer never finishes it, the notice still arrives
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Cancelled { request: id });
        player.enqueue(chunk(1, 320), id).unwrap();
        player.finish(id).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_end_marker_timeout_retires_request() {
        let sink = MemorySink::new(AudioFormat::pcm16_mono(16_000)).realtime();
        let (tx, rx) = event_channel(8, OverflowPolicy::Block);
        let config = OutputConfig {
            queue_capacity: 1,
            enqueue_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let player = QueuedPlayer::new(sink, config, Some(tx)).unwrap();

        // one second of audio occupies the consumer, its end marker fills the queue
        let busy = player.play([chunk(1, 16_000)]).unwrap();
        let stuck = player.begin_request();
        assert!(matches!(player.finish(stuck), Err(VoiceError::Timeout(_))));
        assert!(player.control().is_cancelled(stuck));
        player.finish(stuck).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Started { request: busy });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Completed { request: busy });
        assert_eq!(player.control().open_requests(), 0);
    }

    #[test]
    fn test_chunks_are_sliced_into_render_units() {
        let sink = MemorySink::new(AudioFormat::pcm16_mono(16_000));
        let recording = sink.recording();
        let (tx, rx) = event_channel(8, OverflowPolicy::Block);
        let player = QueuedPlayer::new(sink, OutputConfig::default(), Some(tx)).unwrap();

        // 50ms chunk → 20 + 20 + 10 ms units
        let id = player.play([chunk(3, 800)]).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Started { request: id });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Completed { request: id });

        let units: Vec<_> = recording.frames().iter().map(|f| f.sample_count()).collect();
        assert_eq!(units, vec![320, 320, 160]);
    }

    #[test]
    fn test_sink_failure_only_aborts_current_request() {
        let sink = MemorySink::new(AudioFormat::pcm16_mono(16_000))
            .fail_when(|frame| frame.to_i16()[0] == 2);
        let recording = sink.recording();
        let (tx, rx) = event_channel(8, OverflowPolicy::Block);
        let player = QueuedPlayer::new(sink, OutputConfig::default(), Some(tx)).unwrap();

        let bad = player.play([chunk(1, 320), chunk(2, 320), chunk(2, 320)]).unwrap();
        let good = player.play([chunk(4, 320)]).unwrap();

        let notices: Vec<_> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()).collect();
        assert_eq!(notices[0], PlaybackEvent::Started { request: bad });
        assert!(matches!(&notices[1], PlaybackEvent::Failed { request, .. } if *request == bad));
        assert_eq!(notices[2], PlaybackEvent::Started { request: good });
        assert_eq!(notices[3], PlaybackEvent::Completed { request: good });

        let firsts: Vec<_> = recording.frames().iter().map(|f| f.to_i16()[0]).collect();
        assert_eq!(firsts, vec![1, 4]);
    }

    #[test]
    fn test_stop_cancels_queued_requests() {
        let sink = MemorySink::new(AudioFormat::pcm16_mono(16_000)).realtime();
        let (tx, rx) = event_channel(16, OverflowPolicy::Block);
        let player = QueuedPlayer::new(sink, OutputConfig::default(), Some(tx)).unwrap();

        let long: Vec<_> = (0..50).map(|_| chunk(1, 320)).collect();
        let first = player.play(long).unwrap();
        let second = player.play([chunk(2, 320)]).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Started { request: first });

        player.stop();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Cancelled { request: first });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Cancelled { request: second });

        // still usable afterwards
        let third = player.play([chunk(3, 320)]).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Started { request: third });
    }

    #[test]
    fn test_writing_through_the_player_as_a_sink() {
        let sink = MemorySink::new(AudioFormat::pcm16_mono(16_000));
        let recording = sink.recording();
        let mut player = QueuedPlayer::new(sink, OutputConfig::default(), None).unwrap();

        player.write(&chunk(1, 320)).unwrap();
        player.interrupt();
        player.write(&chunk(2, 320)).unwrap();
        player.flush().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while recording.samples().last() != Some(&2) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(recording.samples().last(), Some(&2));
        assert_eq!(player.queue_len(), 0);
    }
}
