//! Routing signaling to per-peer bridges

use super::{BridgeConfig, PacketTransport, PeerBridge, PeerId, PeerPhase, SignalMessage};
use crate::error::VoiceResult;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Session negotiation port (SDP / ICE handling), implemented by the application
pub trait SessionNegotiator: Send + Sync {
    /// Produce the SDP answer for a peer's offer.
    fn answer_offer(&self, peer: &PeerId, sdp: &str) -> VoiceResult<String>;

    fn apply_answer(&self, peer: &PeerId, sdp: &str) -> VoiceResult<()>;

    fn add_ice_candidate(&self, peer: &PeerId, candidate: &str) -> VoiceResult<()>;
}

/// Called once per peer, right after its bridge starts
pub type OnPeer = Arc<dyn Fn(Arc<PeerBridge>) + Send + Sync>;

/// Owns one [`PeerBridge`] per remote peer
pub struct BridgeHub {
    config: BridgeConfig,
    negotiator: Arc<dyn SessionNegotiator>,
    transport: Arc<dyn PacketTransport>,
    peers: DashMap<PeerId, Arc<PeerBridge>>,
    on_peer: Option<OnPeer>,
}

impl BridgeHub {
    pub fn new(
        config: BridgeConfig,
        negotiator: Arc<dyn SessionNegotiator>,
        transport: Arc<dyn PacketTransport>,
    ) -> Self {
        Self {
            config,
            negotiator,
            transport,
            peers: DashMap::new(),
            on_peer: None,
        }
    }

    /// Register the callback that wires a freshly connected peer into the pipeline.
    pub fn with_on_peer(mut self, on_peer: impl Fn(Arc<PeerBridge>) + Send + Sync + 'static) -> Self {
        self.on_peer = Some(Arc::new(on_peer));
        self
    }

    /// Handle one signaling message received from `from`.
    ///
    /// Returns the reply to send back, if the message calls for one.
    pub fn handle_signal(&self, from: &PeerId, message: SignalMessage) -> VoiceResult<Option<SignalMessage>> {
        debug!(peer = %from, kind = message.kind(), "signal received");
        match message {
            SignalMessage::Offer { sdp } => {
                self.ensure_peer(from)?;
                let answer = self.negotiator.answer_offer(from, &sdp)?;
                Ok(Some(SignalMessage::Answer { sdp: answer }))
            }
            SignalMessage::Answer { sdp } => {
                self.negotiator.apply_answer(from, &sdp)?;
                Ok(None)
            }
            SignalMessage::IceCandidate { candidate } => {
                self.negotiator.add_ice_candidate(from, &candidate)?;
                Ok(None)
            }
            SignalMessage::PeerConnected { peer_id } => {
                let bridge = self.ensure_peer(&peer_id)?;
                let first_connect = bridge.phase() == PeerPhase::Negotiating;
                bridge.connect()?;
                bridge.start(Arc::clone(&self.transport))?;
                if first_connect {
                    if let Some(on_peer) = &self.on_peer {
                        on_peer(Arc::clone(&bridge));
                    }
                }
                Ok(None)
            }
            SignalMessage::PeerClosed { peer_id } => {
                self.close_peer(&peer_id);
                Ok(None)
            }
        }
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<PeerBridge>> {
        self.peers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Close and forget one peer; returns whether it was known.
    pub fn close_peer(&self, id: &PeerId) -> bool {
        match self.peers.remove(id) {
            Some((_, bridge)) => {
                bridge.close();
                bridge.join();
                true
            }
            None => {
                debug!(peer = %id, "close for unknown peer ignored");
                false
            }
        }
    }

    pub fn close_all(&self) {
        let ids = self.peer_ids();
        let count = ids.len();
        for id in ids {
            self.close_peer(&id);
        }
        info!(peers = count, "all peers closed");
    }

    fn ensure_peer(&self, id: &PeerId) -> VoiceResult<Arc<PeerBridge>> {
        if let Some(bridge) = self.peer(id) {
            return Ok(bridge);
        }
        let bridge = Arc::new(PeerBridge::new(id.clone(), self.config.clone())?);
        let bridge = Arc::clone(self.peers.entry(id.clone()).or_insert(bridge).value());
        info!(peer = %id, peers = self.peers.len(), "📞 Peer negotiating");
        Ok(bridge)
    }
}

impl Drop for BridgeHub {
    fn drop(&mut self) {
        for entry in self.peers.iter() {
            entry.value().close();
        }
    }
}
