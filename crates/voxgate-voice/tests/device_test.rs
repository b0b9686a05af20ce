//! Hardware capture and playback
//!
//! Note: These tests require audio devices and may not work in CI environments.
#![cfg(feature = "device")]

mod common;

use common::*;
use std::time::Duration;
use voxgate_voice::{
    DeviceCapture, DeviceConfig, DevicePlayback, DetectorConfig, OutputConfig, PlaceholderSynthesizer,
    PlaybackEvent, QueuedPlayer, SpeechDetector, SpeechEvent, SpeechSynthesizer, event_channel,
    OverflowPolicy,
};

#[test]
#[ignore] // Requires audio hardware and manual speech
fn test_speech_detection_from_microphone() {
    init_tracing();

    println!("\n🎤 Speech Detection Test");
    println!("========================");
    println!("Please speak into your microphone within 10 seconds...\n");

    let config = DeviceConfig::default();
    let (capture, mut source) = DeviceCapture::open(&config).expect("Failed to open microphone");
    let mut detector = SpeechDetector::builder(loudness_vad(0.02))
        .config(DetectorConfig::default())
        .build()
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut saw_start = false;
    for event in detector.events(&mut source).poll_interval(Duration::from_millis(50)) {
        match event.expect("detector failed") {
            SpeechEvent::SpeechStarted { .. } => {
                println!("✅ Speech detected!");
                saw_start = true;
            }
            SpeechEvent::SpeechEnded { segment, reason } => {
                println!("✅ Segment closed ({reason}), {:.1}s", segment.duration().as_secs_f32());
                break;
            }
            _ => {}
        }
        if std::time::Instant::now() > deadline {
            break;
        }
    }
    println!("Dropped frames: {}", capture.overruns());
    assert!(saw_start, "no speech detected");
}

#[test]
#[ignore] // Requires audio hardware
fn test_playback_on_default_device() {
    init_tracing();

    let config = DeviceConfig::default();
    let (tx, rx) = event_channel(8, OverflowPolicy::Block);
    let player = QueuedPlayer::spawn(move || DevicePlayback::open(&config), OutputConfig::default(), Some(tx))
        .expect("Failed to open output device");

    let frames = PlaceholderSynthesizer::default().synthesize("beep").unwrap();
    let id = player.play(frames).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), PlaybackEvent::Started { request: id });
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), PlaybackEvent::Completed { request: id });
}
