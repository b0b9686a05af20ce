//! Sequence-ordered jitter buffer
//!
//! Packets carry 16-bit wrapping sequence numbers; they are unwrapped to a
//! 64-bit extended sequence relative to the highest one seen so far, so a
//! stream can run indefinitely. One packet leaves per emit tick. A missing
//! packet is waited for until either the buffered span fills the reorder
//! window or `max_wait_ticks` ticks pass, then it is written off as lost.
//! Anything arriving for a sequence already passed is late and dropped.
//!
//! The buffered span never exceeds the reorder window: a sender running
//! ahead of the emit tick flushes the oldest audio rather than piling up
//! latency.

use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::trace;

// unwrapped sequences start one wrap in so a reordered first packet never underflows
const FIRST_CYCLE: u64 = 1 << 16;

/// What happened to a pushed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Already buffered
    Duplicate,
    /// Its slot was already emitted or skipped
    Late,
}

/// Running counters; never reset while the buffer lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub received: u64,
    pub late_packets: u64,
    pub duplicates: u64,
    /// Sequences skipped without ever arriving
    pub lost: u64,
    /// Ticks that had nothing to emit
    pub underruns: u64,
    /// Buffered packets flushed to keep the span within the reorder window
    pub overflowed: u64,
}

#[derive(Debug)]
pub struct JitterBuffer {
    reorder_window: usize,
    max_wait_ticks: u32,
    packets: BTreeMap<u64, Bytes>,
    next: Option<u64>,
    highest: Option<u64>,
    waited: u32,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(reorder_window: usize, max_wait_ticks: u32) -> Self {
        Self {
            reorder_window: reorder_window.max(1),
            max_wait_ticks,
            packets: BTreeMap::new(),
            next: None,
            highest: None,
            waited: 0,
            stats: JitterStats::default(),
        }
    }

    fn extend(&self, sequence: u16) -> u64 {
        match self.highest {
            None => FIRST_CYCLE + sequence as u64,
            Some(reference) => {
                let delta = sequence.wrapping_sub(reference as u16) as i16;
                (reference as i64 + delta as i64) as u64
            }
        }
    }

    pub fn push(&mut self, sequence: u16, payload: Bytes) -> PushOutcome {
        let extended = self.extend(sequence);
        self.highest = Some(self.highest.map_or(extended, |h| h.max(extended)));
        self.stats.received += 1;

        if self.next.is_some_and(|next| extended < next) {
            self.stats.late_packets += 1;
            trace!(sequence, "late packet dropped");
            return PushOutcome::Late;
        }
        if self.packets.contains_key(&extended) {
            self.stats.duplicates += 1;
            return PushOutcome::Duplicate;
        }
        self.packets.insert(extended, payload);
        self.enforce_window();
        PushOutcome::Accepted
    }

    fn enforce_window(&mut self) {
        let (Some(highest), Some(base)) = (self.highest, self.next.or_else(|| self.packets.keys().next().copied())) else {
            return;
        };
        let window = self.reorder_window as u64;
        if highest < base + window {
            return;
        }
        let new_base = highest + 1 - window;
        let kept = self.packets.split_off(&new_base);
        let flushed = std::mem::replace(&mut self.packets, kept).len() as u64;
        self.stats.overflowed += flushed;
        self.stats.lost += (new_base - base) - flushed;
        self.next = Some(new_base);
        self.waited = 0;
        trace!(flushed, "jitter buffer over its window, oldest audio flushed");
    }

    /// Payload for this tick, or `None` on underrun.
    pub fn pop(&mut self) -> Option<Bytes> {
        let next = match self.next {
            Some(next) => next,
            None => match self.packets.keys().next() {
                Some(&first) => first,
                None => {
                    self.stats.underruns += 1;
                    return None;
                }
            },
        };

        if let Some(payload) = self.packets.remove(&next) {
            self.next = Some(next + 1);
            self.waited = 0;
            return Some(payload);
        }

        let (Some(&first), Some(&last)) = (self.packets.keys().next(), self.packets.keys().next_back()) else {
            self.next = Some(next);
            self.stats.underruns += 1;
            return None;
        };

        self.waited += 1;
        let span = last - next + 1;
        if span >= self.reorder_window as u64 || self.waited > self.max_wait_ticks {
            let skipped = first - next;
            self.stats.lost += skipped;
            trace!(skipped, "jitter gap written off");
            self.waited = 0;
            self.next = Some(first + 1);
            return self.packets.remove(&first);
        }

        self.next = Some(next);
        self.stats.underruns += 1;
        None
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    /// Forget buffered packets and sequence state; counters are kept.
    pub fn clear(&mut self) {
        self.packets.clear();
        self.next = None;
        self.highest = None;
        self.waited = 0;
    }
}
