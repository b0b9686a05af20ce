//! Network audio bridge
//!
//! Presents one remote real-time audio peer as a [`FrameSource`] (inbound)
//! and an [`AudioSink`] (outbound).
//!
//! ```text
//!  network ──packets──► receive_packet ─► JitterBuffer
//!                                              │ one packet per tick (silence on underrun)
//!                                              ▼
//!                                   FrameAdapter (transport → local)
//!                                              │ bounded channel
//!                                              ▼
//!                                        BridgeSource ─► detector
//!
//!  playback ─► BridgeSink ─► FrameAdapter (local → transport)
//!                                              │ bounded packet buffer
//!                                              ▼
//!                                 packetizer tick ─► PacketTransport
//! ```
//!
//! Both directions run on their own threads driven by a fixed tick of one
//! transport packet duration. Closing the peer cancels its token, which
//! cascades to every playback request bound to it, and ends the inbound
//! source so an open segment is force-closed as disconnected.

mod adapter;
mod hub;
mod jitter;
mod signaling;

pub use adapter::FrameAdapter;
pub use hub::{BridgeHub, OnPeer, SessionNegotiator};
pub use jitter::{JitterBuffer, JitterStats, PushOutcome};
pub use signaling::{PeerId, PeerPhase, SignalMessage};

use crate::error::{VoiceError, VoiceResult};
use crate::frame::{AudioFormat, AudioFrame};
use crate::sink::AudioSink;
use crate::source::FrameSource;
use bytes::Bytes;
use crossbeam_channel::{
    bounded, select, tick, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// One transport packet: wrapping sequence number plus PCM in the transport format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub sequence: u16,
    pub payload: Bytes,
}

/// Outbound network port, implemented by the embedding application
pub trait PacketTransport: Send + Sync {
    fn send_packet(&self, peer: &PeerId, packet: AudioPacket) -> VoiceResult<()>;
}

impl<F> PacketTransport for F
where
    F: Fn(&PeerId, AudioPacket) -> VoiceResult<()> + Send + Sync,
{
    fn send_packet(&self, peer: &PeerId, packet: AudioPacket) -> VoiceResult<()> {
        self(peer, packet)
    }
}

/// Configuration for one peer bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// PCM format of packet payloads (default: 48kHz mono 16-bit)
    pub transport_format: AudioFormat,

    /// Audio carried per packet; also the tick of both worker loops (default: 20ms)
    pub packet_duration: Duration,

    /// Format of frames handed to and accepted from the pipeline (default: 16kHz mono 16-bit)
    pub local_format: AudioFormat,

    /// Duration of frames produced for the pipeline (default: 20ms)
    pub frame_duration: Duration,

    /// Buffered span, in packets, after which a missing packet is skipped (default: 5)
    pub reorder_window: usize,

    /// Emit ticks a missing packet is waited for (default: 2)
    pub max_wait_ticks: u32,

    /// Frames buffered between the bridge and its reader (default: 64)
    pub inbound_capacity: usize,

    /// Packets buffered ahead of the packetizer (default: 16)
    pub outbound_capacity: usize,

    /// Longest a sink write waits for outbound space (default: 1s)
    pub write_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport_format: AudioFormat::pcm16_mono(48_000),
            packet_duration: Duration::from_millis(20),
            local_format: AudioFormat::pcm16_mono(16_000),
            frame_duration: Duration::from_millis(20),
            reorder_window: 5,
            max_wait_ticks: 2,
            inbound_capacity: 64,
            outbound_capacity: 16,
            write_timeout: Duration::from_secs(1),
        }
    }
}

/// Counters across both directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub jitter: JitterStats,
    /// Inbound frames dropped because the reader fell behind
    pub inbound_overruns: u64,
    pub packets_sent: u64,
    /// Outbound ticks with nothing queued, sent as silence
    pub silence_packets: u64,
}

/// Bridge state for one connected peer
pub struct PeerBridge {
    peer: PeerId,
    config: BridgeConfig,
    phase: watch::Sender<PeerPhase>,
    token: CancellationToken,
    jitter: Mutex<JitterBuffer>,
    inbound: Mutex<FrameAdapter>,
    outbound: Mutex<FrameAdapter>,
    frames_tx: Mutex<Option<Sender<AudioFrame>>>,
    frames_rx: Mutex<Option<Receiver<AudioFrame>>>,
    packets_tx: Sender<Bytes>,
    packets_rx: Receiver<Bytes>,
    shutdown: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    next_sequence: AtomicU16,
    inbound_overruns: AtomicU64,
    packets_sent: AtomicU64,
    silence_packets: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PeerBridge {
    /// New bridge in the `Negotiating` phase.
    pub fn new(peer: PeerId, config: BridgeConfig) -> VoiceResult<Self> {
        let inbound = FrameAdapter::new(
            config.transport_format,
            config.packet_duration,
            config.local_format,
            config.frame_duration,
        )?;
        let outbound = FrameAdapter::new(
            config.local_format,
            config.frame_duration,
            config.transport_format,
            config.packet_duration,
        )?;
        let (frames_tx, frames_rx) = bounded(config.inbound_capacity.max(1));
        let (packets_tx, packets_rx) = bounded(config.outbound_capacity.max(1));
        let (phase, _) = watch::channel(PeerPhase::Negotiating);

        debug!(peer = %peer, transport = %config.transport_format, local = %config.local_format, "peer bridge created");
        Ok(Self {
            jitter: Mutex::new(JitterBuffer::new(config.reorder_window, config.max_wait_ticks)),
            inbound: Mutex::new(inbound),
            outbound: Mutex::new(outbound),
            frames_tx: Mutex::new(Some(frames_tx)),
            frames_rx: Mutex::new(Some(frames_rx)),
            packets_tx,
            packets_rx,
            shutdown: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            next_sequence: AtomicU16::new(0),
            inbound_overruns: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            silence_packets: AtomicU64::new(0),
            token: CancellationToken::new(),
            phase,
            peer,
            config,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn phase(&self) -> PeerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<PeerPhase> {
        self.phase.subscribe()
    }

    /// Resolves once the phase has reached `target` (or moved past it).
    pub async fn wait_for_phase(&self, target: PeerPhase) -> VoiceResult<PeerPhase> {
        let mut rx = self.phase.subscribe();
        let phase = rx
            .wait_for(|phase| *phase >= target)
            .await
            .map_err(|_| VoiceError::ChannelReceive("phase channel closed".into()))?;
        Ok(*phase)
    }

    /// Token cancelled when the peer goes away; parent of peer-bound playback.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            jitter: lock(&self.jitter).stats(),
            inbound_overruns: self.inbound_overruns.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            silence_packets: self.silence_packets.load(Ordering::Relaxed),
        }
    }

    /// Negotiation finished; audio may flow.
    pub fn connect(&self) -> VoiceResult<()> {
        let mut result = Ok(());
        self.phase.send_if_modified(|phase| match *phase {
            PeerPhase::Negotiating => {
                *phase = PeerPhase::Connected;
                true
            }
            PeerPhase::Connected => false,
            PeerPhase::Closed => {
                result = Err(VoiceError::PeerDisconnected(self.peer.clone()));
                false
            }
        });
        if result.is_ok() {
            info!(peer = %self.peer, "🔗 Peer connected");
        }
        result
    }

    /// Tear the peer down. Idempotent.
    pub fn close(&self) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == PeerPhase::Closed {
                false
            } else {
                *phase = PeerPhase::Closed;
                true
            }
        });
        if !changed {
            return;
        }
        self.token.cancel();
        lock(&self.frames_tx).take();
        lock(&self.shutdown).take();
        while self.packets_rx.try_recv().is_ok() {}
        let stats = self.stats();
        info!(
            peer = %self.peer,
            late = stats.jitter.late_packets,
            lost = stats.jitter.lost,
            flushed = stats.jitter.overflowed,
            overruns = stats.inbound_overruns,
            sent = stats.packets_sent,
            "🔌 Peer closed"
        );
    }

    /// Wait for the worker threads to exit after [`close`](Self::close).
    pub fn join(&self) {
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!(peer = %self.peer, "bridge worker panicked");
            }
        }
    }

    /// Hand one received packet to the jitter buffer.
    ///
    /// Ignored (returns `None`) unless the peer is connected.
    pub fn receive_packet(&self, packet: AudioPacket) -> Option<PushOutcome> {
        if self.phase() != PeerPhase::Connected {
            trace!(peer = %self.peer, sequence = packet.sequence, "packet ignored outside connected phase");
            return None;
        }
        let outcome = lock(&self.jitter).push(packet.sequence, packet.payload);
        if outcome == PushOutcome::Late {
            debug!(peer = %self.peer, sequence = packet.sequence, "late packet dropped");
        }
        Some(outcome)
    }

    /// One inbound emit tick: release a packet (or silence) toward the reader.
    ///
    /// Returns the number of local frames delivered.
    pub fn tick_inbound(&self) -> VoiceResult<usize> {
        if self.phase() != PeerPhase::Connected {
            return Ok(0);
        }
        let format = self.config.transport_format;
        let packet_samples = format.samples_in(self.config.packet_duration);
        let packet = match lock(&self.jitter).pop() {
            Some(payload) => match AudioFrame::new(payload, format, Duration::ZERO, 0) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "malformed packet replaced with silence");
                    AudioFrame::silence(format, packet_samples, Duration::ZERO, 0)?
                }
            },
            None => AudioFrame::silence(format, packet_samples, Duration::ZERO, 0)?,
        };

        let frames = lock(&self.inbound).push(&packet)?;
        let tx = lock(&self.frames_tx);
        let Some(tx) = tx.as_ref() else {
            return Ok(0);
        };
        let mut delivered = 0;
        for frame in frames {
            match tx.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let overruns = self.inbound_overruns.fetch_add(1, Ordering::Relaxed) + 1;
                    if overruns.is_power_of_two() {
                        warn!(peer = %self.peer, overruns, "inbound reader falling behind, dropping frames");
                    }
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        Ok(delivered)
    }

    /// One outbound packetizer tick: the next queued packet, or silence.
    ///
    /// Returns `None` unless the peer is connected.
    pub fn tick_outbound(&self) -> Option<AudioPacket> {
        if self.phase() != PeerPhase::Connected {
            return None;
        }
        let payload = match self.packets_rx.try_recv() {
            Ok(payload) => payload,
            Err(_) => {
                self.silence_packets.fetch_add(1, Ordering::Relaxed);
                let format = self.config.transport_format;
                let samples = format.samples_in(self.config.packet_duration);
                AudioFrame::silence(format, samples, Duration::ZERO, 0)
                    .map(|frame| frame.payload().clone())
                    .unwrap_or_default()
            }
        };
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Some(AudioPacket { sequence, payload })
    }

    /// Packets waiting for the packetizer.
    pub fn outbound_backlog(&self) -> usize {
        self.packets_rx.len()
    }

    /// Reader side of the inbound path. Available once.
    pub fn take_source(self: &Arc<Self>) -> Option<BridgeSource> {
        let rx = lock(&self.frames_rx).take()?;
        Some(BridgeSource {
            peer: self.peer.clone(),
            format: self.config.local_format,
            rx,
            closed: self.token.clone(),
        })
    }

    /// Writer side of the outbound path.
    pub fn sink(self: &Arc<Self>) -> BridgeSink {
        BridgeSink {
            bridge: Arc::clone(self),
        }
    }

    /// Start the inbound emit loop and the outbound packetizer. Idempotent.
    pub fn start(self: &Arc<Self>, transport: Arc<dyn PacketTransport>) -> VoiceResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        *lock(&self.shutdown) = Some(shutdown_tx);
        let period = self.config.packet_duration;

        let bridge = Arc::clone(self);
        let stop = shutdown_rx.clone();
        let inbound = thread::Builder::new()
            .name(format!("voxgate-bridge-in-{}", self.peer))
            .spawn(move || {
                let ticker = tick(period);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let Err(e) = bridge.tick_inbound() {
                                warn!(peer = %bridge.peer, error = %e, "inbound tick failed");
                            }
                        }
                        recv(stop) -> _ => break,
                    }
                }
                debug!(peer = %bridge.peer, "inbound loop exited");
            })?;

        let bridge = Arc::clone(self);
        let stop = shutdown_rx;
        let outbound = thread::Builder::new()
            .name(format!("voxgate-bridge-out-{}", self.peer))
            .spawn(move || {
                let ticker = tick(period);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let Some(packet) = bridge.tick_outbound() {
                                if let Err(e) = transport.send_packet(&bridge.peer, packet) {
                                    warn!(peer = %bridge.peer, error = %e, "packet send failed");
                                }
                            }
                        }
                        recv(stop) -> _ => break,
                    }
                }
                debug!(peer = %bridge.peer, "packetizer exited");
            })?;

        lock(&self.workers).extend([inbound, outbound]);
        info!(peer = %self.peer, tick = ?period, "bridge workers started");
        Ok(())
    }

    /// Feed packets from an async network task until the channel closes or the peer does.
    ///
    /// Returns the number of packets handed to the jitter buffer.
    pub async fn pump_inbound(&self, mut packets: mpsc::Receiver<AudioPacket>) -> u64 {
        let mut accepted = 0;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                packet = packets.recv() => match packet {
                    Some(packet) => {
                        if self.receive_packet(packet) == Some(PushOutcome::Accepted) {
                            accepted += 1;
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(peer = %self.peer, accepted, "inbound pump finished");
        accepted
    }

    fn write_local(&self, frame: &AudioFrame) -> VoiceResult<()> {
        match self.phase() {
            PeerPhase::Negotiating => return Err(VoiceError::PeerNotConnected(self.peer.clone())),
            PeerPhase::Closed => return Err(VoiceError::PeerDisconnected(self.peer.clone())),
            PeerPhase::Connected => {}
        }
        let packets = lock(&self.outbound).push(frame)?;
        for packet in packets {
            match self.packets_tx.send_timeout(packet.payload().clone(), self.config.write_timeout) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    return Err(VoiceError::Timeout(self.config.write_timeout))
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(VoiceError::PeerDisconnected(self.peer.clone()))
                }
            }
            if self.token.is_cancelled() {
                return Err(VoiceError::PeerDisconnected(self.peer.clone()));
            }
        }
        Ok(())
    }

    fn discard_outbound(&self) {
        lock(&self.outbound).discard_pending();
        let mut dropped = 0;
        while self.packets_rx.try_recv().is_ok() {
            dropped += 1;
        }
        debug!(peer = %self.peer, dropped, "outbound audio discarded");
    }
}

/// Inbound frames of one peer
///
/// Reports [`VoiceError::PeerDisconnected`] on the first read after the peer
/// closes; frames still buffered at that point are discarded.
pub struct BridgeSource {
    peer: PeerId,
    format: AudioFormat,
    rx: Receiver<AudioFrame>,
    closed: CancellationToken,
}

impl BridgeSource {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }
}

impl FrameSource for BridgeSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_frame(&mut self, timeout: Duration) -> VoiceResult<Option<AudioFrame>> {
        if self.closed.is_cancelled() {
            return Err(VoiceError::PeerDisconnected(self.peer.clone()));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Err(VoiceError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(VoiceError::PeerDisconnected(self.peer.clone())),
        }
    }
}

/// Outbound audio to one peer, paced by the packetizer
pub struct BridgeSink {
    bridge: Arc<PeerBridge>,
}

impl BridgeSink {
    pub fn peer_id(&self) -> &PeerId {
        &self.bridge.peer
    }
}

impl AudioSink for BridgeSink {
    fn format(&self) -> AudioFormat {
        self.bridge.config.local_format
    }

    fn write(&mut self, frame: &AudioFrame) -> VoiceResult<()> {
        self.bridge.write_local(frame)
    }

    fn interrupt(&mut self) {
        self.bridge.discard_outbound();
    }
}
