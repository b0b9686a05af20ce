//! Segment boundary properties of the speech detector, driven end to end
//! through frame sources.

mod common;

use common::*;
use std::time::Duration;
use voxgate_voice::{
    event_channel, spawn_detector, BufferSource, CloseReason, DetectorConfig, OverflowPolicy,
    SpeechDetector, SpeechEvent, VirtualMicrophone, VoiceError, VoiceResult,
};

fn detect(config: DetectorConfig, pattern: &[bool]) -> Vec<SpeechEvent> {
    let mut detector = SpeechDetector::builder(loudness_vad(0.05))
        .config(config)
        .build()
        .unwrap();
    let mut source = BufferSource::from_frames(mono16k(), frames_from_pattern(pattern));
    detector
        .events(&mut source)
        .collect::<VoiceResult<Vec<_>>>()
        .unwrap()
}

fn starts(events: &[SpeechEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SpeechEvent::SpeechStarted { .. }))
        .count()
}

fn ends(events: &[SpeechEvent]) -> Vec<CloseReason> {
    events
        .iter()
        .filter_map(|e| match e {
            SpeechEvent::SpeechEnded { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect()
}

#[test]
fn test_silence_produces_no_segments() {
    init_tracing();
    let events = detect(DetectorConfig::default(), &[false; 200]);
    assert!(events.is_empty());
}

#[test]
fn test_one_utterance_with_partials() {
    init_tracing();
    let config = DetectorConfig {
        hold_off_frames: 10,
        partial_interval_frames: Some(8),
        pre_roll_frames: 10,
        ..Default::default()
    };
    let events = detect(config, &pattern(5, 40, 30));

    assert_eq!(starts(&events), 1);
    assert_eq!(ends(&events), vec![CloseReason::HoldOffExpired]);
    assert!(matches!(events.first(), Some(SpeechEvent::SpeechStarted { .. })));

    let Some(SpeechEvent::SpeechEnded { segment, .. }) = events.last() else {
        panic!("last event should close the segment");
    };
    // 40 speech frames plus the 10 tolerated silent ones; the pre-roll only
    // holds the 5 frames that came before the onset
    assert_eq!(segment.live_frame_count(), 50);
    assert_eq!(segment.pre_roll_count(), 5);
    assert_eq!(segment.speech_started_at(), Duration::from_millis(150));

    let partials: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SpeechEvent::PartialSpeechEnded { segment } => Some(segment.live_frame_count()),
            _ => None,
        })
        .collect();
    assert_eq!(partials, vec![8, 16, 24, 32, 40, 48]);
    assert_eq!(partials.len(), segment.live_frame_count() / 8);

    // every event belongs to the one segment
    assert!(events.iter().all(|e| e.segment_id() == Some(segment.id())));
}

#[test]
fn test_short_gap_does_not_split() {
    init_tracing();
    let config = DetectorConfig {
        hold_off_frames: 3,
        pre_roll_frames: 0,
        ..Default::default()
    };
    let mut pattern = pattern(0, 10, 0);
    pattern.push(false);
    pattern.extend([true; 10]);
    pattern.extend([false; 20]);

    let events = detect(config, &pattern);
    assert_eq!(starts(&events), 1);
    assert_eq!(ends(&events), vec![CloseReason::HoldOffExpired]);
}

#[test]
fn test_gap_longer_than_hold_off_splits() {
    init_tracing();
    let config = DetectorConfig {
        hold_off_frames: 3,
        pre_roll_frames: 0,
        ..Default::default()
    };
    let mut pattern = pattern(0, 10, 4);
    pattern.extend([true; 10]);
    pattern.extend([false; 20]);

    let events = detect(config, &pattern);
    assert_eq!(starts(&events), 2);
    assert_eq!(ends(&events), vec![CloseReason::HoldOffExpired, CloseReason::HoldOffExpired]);
}

#[test]
fn test_ceiling_closes_and_speech_reopens() {
    init_tracing();
    let config = DetectorConfig {
        hold_off_frames: 3,
        max_segment_frames: 10,
        pre_roll_frames: 0,
        ..Default::default()
    };
    let events = detect(config, &pattern(0, 25, 10));

    assert_eq!(starts(&events), 3);
    assert_eq!(
        ends(&events),
        vec![CloseReason::Ceiling, CloseReason::Ceiling, CloseReason::HoldOffExpired]
    );
    let lengths: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            SpeechEvent::SpeechEnded { segment, .. } => Some(segment.live_frame_count()),
            _ => None,
        })
        .collect();
    assert_eq!(lengths, vec![10, 10, 8]);
}

#[test]
fn test_end_of_stream_closes_open_segment() {
    init_tracing();
    let events = detect(DetectorConfig::default(), &pattern(2, 6, 0));
    assert_eq!(starts(&events), 1);
    assert_eq!(ends(&events), vec![CloseReason::EndOfStream]);
    assert!(CloseReason::EndOfStream.is_forced());
}

#[test]
fn test_fatal_classifier_aborts_segment_then_reports_error() {
    init_tracing();
    let mut seen = 0;
    let flaky = move |_: &voxgate_voice::AudioFrame| -> VoiceResult<voxgate_voice::Classification> {
        seen += 1;
        if seen <= 5 {
            Ok(voxgate_voice::Classification::speech(1.0))
        } else {
            Err(VoiceError::ClassifierTransient("backend hiccup".into()))
        }
    };
    let mut detector = SpeechDetector::builder(flaky)
        .config(DetectorConfig {
            max_consecutive_failures: 3,
            ..Default::default()
        })
        .build()
        .unwrap();
    let mut source = BufferSource::from_frames(mono16k(), frames_from_pattern(&[true; 20]));
    let results: Vec<_> = detector.events(&mut source).collect();

    assert_eq!(results.len(), 3);
    assert!(matches!(results[0], Ok(SpeechEvent::SpeechStarted { .. })));
    assert!(matches!(
        results[1],
        Ok(SpeechEvent::SpeechEnded {
            reason: CloseReason::Aborted,
            ..
        })
    ));
    assert!(matches!(results[2], Err(VoiceError::ClassifierFatal(_))));
}

#[test]
fn test_spawned_detector_over_virtual_microphone() {
    init_tracing();
    let (mic, source) = VirtualMicrophone::new(mono16k(), 16, Duration::from_secs(1));
    let (tx, rx) = event_channel(64, OverflowPolicy::Block);
    let handle = spawn_detector(
        || {
            SpeechDetector::builder(loudness_vad(0.05))
                .config(DetectorConfig {
                    hold_off_frames: 5,
                    ..Default::default()
                })
                .build()
        },
        source,
        tx,
        Duration::from_millis(20),
    )
    .unwrap();

    for frame in frames_from_pattern(&pattern(3, 12, 10)) {
        mic.push_pcm(frame.payload().clone()).unwrap();
    }
    drop(mic);

    let events: Vec<_> = rx.iter().collect();
    handle.join().unwrap();

    assert_eq!(starts(&events), 1);
    assert_eq!(ends(&events), vec![CloseReason::HoldOffExpired]);
    match &events[0] {
        SpeechEvent::SpeechStarted { timestamp, .. } => {
            assert_eq!(*timestamp, Duration::from_millis(90));
        }
        other => panic!("unexpected first event {other:?}"),
    }
}
