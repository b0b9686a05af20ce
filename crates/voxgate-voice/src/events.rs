//! Bounded, ordered event delivery
//!
//! Producers (the detector thread, the playback consumer) never call
//! listeners directly; they push into a bounded channel whose overflow
//! behaviour is chosen up front. A blocked send is bounded by a deadline and
//! can be abandoned by the producer's own cancellation, so a listener that
//! stops reading never wedges a producer thread.

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest a blocked send waits for the listener by default.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

// how often a cancellable send rechecks its token
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// What a producer does when the listener falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for space, up to the sender's block timeout; a slow listener slows
    /// the producer, a stalled one loses events (counted).
    #[default]
    Block,

    /// Discard the oldest queued event to make room, counting the loss.
    DropOldest,
}

/// Producer half of an event channel
pub struct EventSender<T> {
    tx: Sender<T>,
    // held only for DropOldest, to evict from the producer side
    evict: Option<Receiver<T>>,
    policy: OverflowPolicy,
    block_timeout: Duration,
    dropped: Arc<AtomicU64>,
    stalled: Arc<AtomicBool>,
    listener_gone: Arc<AtomicBool>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            evict: self.evict.clone(),
            policy: self.policy,
            block_timeout: self.block_timeout,
            dropped: Arc::clone(&self.dropped),
            stalled: Arc::clone(&self.stalled),
            listener_gone: Arc::clone(&self.listener_gone),
        }
    }
}

/// Create a bounded event channel.
///
/// With [`OverflowPolicy::DropOldest`] the sender keeps a receiver handle of
/// its own, so a listener that goes away is not detected; events simply
/// keep rotating through the buffer.
pub fn event_channel<T>(capacity: usize, policy: OverflowPolicy) -> (EventSender<T>, Receiver<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    let evict = match policy {
        OverflowPolicy::Block => None,
        OverflowPolicy::DropOldest => Some(rx.clone()),
    };
    let sender = EventSender {
        tx,
        evict,
        policy,
        block_timeout: DEFAULT_BLOCK_TIMEOUT,
        dropped: Arc::new(AtomicU64::new(0)),
        stalled: Arc::new(AtomicBool::new(false)),
        listener_gone: Arc::new(AtomicBool::new(false)),
    };
    (sender, rx)
}

impl<T> EventSender<T> {
    /// Longest a [`OverflowPolicy::Block`] send waits before dropping the event.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Deliver `event`; returns `false` once the listener has gone away.
    pub fn emit(&self, event: T) -> bool {
        self.deliver(event, None)
    }

    /// Like [`emit`](Self::emit), but a blocked send is abandoned as soon as
    /// `cancel` fires.
    pub fn emit_unless(&self, event: T, cancel: &CancellationToken) -> bool {
        self.deliver(event, Some(cancel))
    }

    fn deliver(&self, event: T, cancel: Option<&CancellationToken>) -> bool {
        if self.listener_gone.load(Ordering::Relaxed) {
            return false;
        }
        match (&self.policy, &self.evict) {
            (OverflowPolicy::DropOldest, Some(evict)) => {
                let mut event = event;
                loop {
                    match self.tx.try_send(event) {
                        Ok(()) => return true,
                        Err(TrySendError::Full(back)) => {
                            if evict.try_recv().is_ok() {
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            event = back;
                        }
                        Err(TrySendError::Disconnected(_)) => return self.mark_gone(),
                    }
                }
            }
            _ => self.send_blocking(event, cancel),
        }
    }

    fn send_blocking(&self, mut event: T, cancel: Option<&CancellationToken>) -> bool {
        let deadline = Instant::now() + self.block_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.stalled.swap(true, Ordering::Relaxed) {
                    warn!(timeout = ?self.block_timeout, "event listener stalled, dropping events");
                }
                return true;
            }
            let wait = match cancel {
                Some(_) => remaining.min(CANCEL_POLL),
                None => remaining,
            };
            match self.tx.send_timeout(event, wait) {
                Ok(()) => {
                    self.stalled.store(false, Ordering::Relaxed);
                    return true;
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    if cancel.is_some_and(|c| c.is_cancelled()) {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("producer cancelled while the listener was full, event dropped");
                        return true;
                    }
                    event = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return self.mark_gone(),
            }
        }
    }

    /// Events discarded: evicted under [`OverflowPolicy::DropOldest`], or
    /// abandoned by a blocked send.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn is_listener_gone(&self) -> bool {
        self.listener_gone.load(Ordering::Relaxed)
    }

    fn mark_gone(&self) -> bool {
        // logged once; later events are discarded without retry
        if !self.listener_gone.swap(true, Ordering::Relaxed) {
            warn!("event listener dropped, discarding further events");
        }
        false
    }
}
