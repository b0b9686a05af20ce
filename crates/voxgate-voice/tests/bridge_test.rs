//! Network peer bridging: reordering, disconnects, and peer-bound playback

mod common;

use bytes::Bytes;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;
use voxgate_voice::bridge::{JitterBuffer, PushOutcome};
use voxgate_voice::{
    event_channel, spawn_detector, AudioFormat, AudioFrame, AudioPacket, AudioSink, BridgeConfig,
    CloseReason, DetectorConfig, MemorySink, OutputConfig, OverflowPolicy, PeerBridge, PeerId,
    PeerPhase, PlaybackEvent, QueuedPlayer, SpeechDetector, SpeechEvent, VoiceError,
};

fn loud_packet(sequence: u16) -> AudioPacket {
    let format = AudioFormat::pcm16_mono(48_000);
    let frame = AudioFrame::from_i16(&[LOUD; 960], format, Duration::ZERO, 0).unwrap();
    AudioPacket {
        sequence,
        payload: frame.payload().clone(),
    }
}

fn connected_peer(name: &str) -> Arc<PeerBridge> {
    let bridge = Arc::new(PeerBridge::new(PeerId::from(name), BridgeConfig::default()).unwrap());
    assert_ok!(bridge.connect());
    bridge
}

#[test]
fn test_jitter_buffer_restores_order() {
    let mut jitter = JitterBuffer::new(5, 2);
    for sequence in [1u16, 2, 4, 3, 5] {
        assert_eq!(jitter.push(sequence, Bytes::from(vec![sequence as u8])), PushOutcome::Accepted);
    }
    let order: Vec<u8> = std::iter::from_fn(|| jitter.pop()).map(|payload| payload[0]).collect();
    assert_eq!(order, vec![1, 2, 3, 4, 5]);

    // its slot is gone
    assert_eq!(jitter.push(3, Bytes::from_static(&[3])), PushOutcome::Late);
    let stats = jitter.stats();
    assert_eq!(stats.late_packets, 1);
    assert_eq!(stats.lost, 0);
}

#[test]
fn test_packets_outside_connected_phase_are_ignored() {
    let bridge = PeerBridge::new(PeerId::from("dave"), BridgeConfig::default()).unwrap();
    assert_eq!(bridge.receive_packet(loud_packet(0)), None);
    assert!(bridge.tick_outbound().is_none());

    bridge.connect().unwrap();
    assert_eq!(bridge.receive_packet(loud_packet(0)), Some(PushOutcome::Accepted));

    bridge.close();
    assert!(matches!(bridge.connect(), Err(VoiceError::PeerDisconnected(_))));
    assert_eq!(bridge.receive_packet(loud_packet(1)), None);
}

#[test]
fn test_disconnect_mid_utterance_closes_segment() {
    init_tracing();
    let bridge = connected_peer("carol");
    let source = bridge.take_source().unwrap();
    assert!(bridge.take_source().is_none());

    for sequence in 0..10 {
        bridge.receive_packet(loud_packet(sequence));
        bridge.tick_inbound().unwrap();
    }

    let (tx, rx) = event_channel(64, OverflowPolicy::Block);
    let handle = spawn_detector(
        || {
            SpeechDetector::builder(loudness_vad(0.05))
                .config(DetectorConfig::default())
                .build()
        },
        source,
        tx,
        Duration::from_millis(20),
    )
    .unwrap();

    let started = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(started, SpeechEvent::SpeechStarted { .. }));

    // the peer hangs up while the user is still talking
    bridge.close();
    let events: Vec<_> = rx.iter().collect();
    handle.join().unwrap();

    match events.last() {
        Some(SpeechEvent::SpeechEnded { segment, reason }) => {
            assert_eq!(*reason, CloseReason::Disconnected);
            assert!(segment.live_frame_count() > 0);
            assert_eq!(segment.format(), AudioFormat::pcm16_mono(16_000));
        }
        other => panic!("expected a closed segment, got {other:?}"),
    }
}

#[test]
fn test_inbound_underrun_feeds_silence() {
    let bridge = connected_peer("erin");
    let mut source = bridge.take_source().unwrap();

    assert_eq!(bridge.tick_inbound().unwrap(), 1);
    let frame = voxgate_voice::FrameSource::read_frame(&mut source, Duration::from_millis(10))
        .unwrap()
        .unwrap();
    assert_eq!(frame.sample_count(), 320);
    assert_eq!(frame.rms(), 0.0);
    assert_eq!(bridge.stats().jitter.underruns, 1);
}

#[test]
fn test_outbound_packets_and_silence() {
    let bridge = connected_peer("frank");
    let mut sink = bridge.sink();
    let frame = AudioFrame::from_i16(&[LOUD; 320], mono16k(), Duration::ZERO, 0).unwrap();
    sink.write(&frame).unwrap();
    assert_eq!(bridge.outbound_backlog(), 1);

    let first = bridge.tick_outbound().unwrap();
    assert_eq!(first.sequence, 0);
    assert_eq!(first.payload.len(), 960 * 2);

    let second = bridge.tick_outbound().unwrap();
    assert_eq!(second.sequence, 1);
    assert!(second.payload.iter().all(|b| *b == 0));
    assert_eq!(bridge.stats().silence_packets, 1);

    sink.write(&frame).unwrap();
    sink.interrupt();
    assert_eq!(bridge.outbound_backlog(), 0);

    bridge.close();
    assert!(matches!(sink.write(&frame), Err(VoiceError::PeerDisconnected(_))));
}

#[test]
fn test_peer_close_cancels_bound_playback() {
    init_tracing();
    let bridge = connected_peer("grace");
    let (tx, rx) = event_channel(16, OverflowPolicy::Block);
    let player = QueuedPlayer::new(MemorySink::new(mono16k()).realtime(), OutputConfig::default(), Some(tx)).unwrap();

    let bound = player.begin_request_bound(&bridge.cancel_token());
    for _ in 0..20 {
        player.enqueue(chunk(1, 320), bound).unwrap();
    }
    player.finish(bound).unwrap();
    let free = player.play([chunk(2, 320)]).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Started { request: bound });
    bridge.close();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Cancelled { request: bound });
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Started { request: free });
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Completed { request: free });
}

#[test]
fn test_started_bridge_sends_on_its_own() {
    init_tracing();
    let bridge = connected_peer("heidi");
    let (sent_tx, sent_rx) = crossbeam_channel::unbounded();
    let transport = Arc::new(move |_: &PeerId, packet: AudioPacket| -> voxgate_voice::VoiceResult<()> {
        let _ = sent_tx.send(packet.sequence);
        Ok(())
    });
    bridge.start(transport).unwrap();

    let sequences: Vec<u16> = (0..3)
        .map(|_| sent_rx.recv_timeout(Duration::from_secs(1)).unwrap())
        .collect();
    assert_eq!(sequences, vec![0, 1, 2]);

    bridge.close();
    bridge.join();
    assert_eq!(bridge.phase(), PeerPhase::Closed);
}

#[tokio::test]
async fn test_pump_inbound_feeds_jitter_buffer() {
    let bridge = connected_peer("ivan");
    let (tx, rx) = mpsc::channel(8);
    for sequence in [0u16, 2, 1, 1] {
        tx.send(loud_packet(sequence)).await.unwrap();
    }
    drop(tx);

    let accepted = bridge.pump_inbound(rx).await;
    assert_eq!(accepted, 3);
    assert_eq!(bridge.stats().jitter.duplicates, 1);
}

#[tokio::test]
async fn test_pump_inbound_stops_when_peer_closes() {
    let bridge = connected_peer("judy");
    let (tx, rx) = mpsc::channel::<AudioPacket>(8);

    let (accepted, _) = tokio::join!(bridge.pump_inbound(rx), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.close();
    });
    assert_eq!(accepted, 0);
    drop(tx);
}

#[tokio::test]
async fn test_wait_for_phase() {
    let bridge = Arc::new(PeerBridge::new(PeerId::from("ken"), BridgeConfig::default()).unwrap());
    let waiter = Arc::clone(&bridge);
    let waiting = tokio::spawn(async move { waiter.wait_for_phase(PeerPhase::Connected).await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    bridge.connect().unwrap();
    let phase = timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
    assert_eq!(assert_ok!(phase), PeerPhase::Connected);

    // already past the target
    bridge.close();
    let phase = bridge.wait_for_phase(PeerPhase::Connected).await.unwrap();
    assert_eq!(phase, PeerPhase::Closed);
}
