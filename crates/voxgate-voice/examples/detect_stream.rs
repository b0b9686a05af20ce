//! Detect speech in a synthetic stream and answer each segment.
//!
//! The stream is silence, a tone standing in for a spoken question, then
//! silence again. Each closed segment is transcribed (placeholder) and
//! answered through the queued player, rendered into memory. A single
//! enrolled profile stands in for speaker identification.
//!
//! Tune with the usual configuration, e.g.
//! `VOXGATE__DETECTOR__HOLD_OFF_MS=300 cargo run --example detect_stream`.

use anyhow::Context;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voxgate_voice::{
    speak, vad_registry, AudioFormat, AudioFrame, BufferSource, DetectorBackends, MemorySink,
    PlaceholderSynthesizer, PlaceholderTranscriber, PlaybackEvent, QueuedPlayer, SpeakerProfileStore,
    SpeechEvent, SpeechSynthesizer, Transcriber, VoiceConfig, VoiceResult,
};

const FRAME: Duration = Duration::from_millis(30);

/// Toy embedding: loudness and its complement
fn loudness_embedding(frame: &AudioFrame) -> VoiceResult<Option<Vec<f32>>> {
    let level = frame.rms().min(1.0);
    Ok((level > 0.0).then(|| vec![level, 1.0 - level]))
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = VoiceConfig::load().context("loading voice configuration")?;
    let format = AudioFormat::pcm16_mono(16_000);
    let synthesizer = PlaceholderSynthesizer::default();

    // 0.5s silence, ~1.2s "speech", 1s silence
    let mut pcm = BytesMut::new();
    let lead = AudioFrame::silence(format, format.samples_in(Duration::from_millis(500)), Duration::ZERO, 0)?;
    pcm.extend_from_slice(lead.payload());
    for frame in synthesizer.synthesize("what is the weather like")? {
        pcm.extend_from_slice(frame.payload());
    }
    let tail = AudioFrame::silence(format, format.samples_in(Duration::from_secs(1)), Duration::ZERO, 0)?;
    pcm.extend_from_slice(tail.payload());
    let mut source = BufferSource::from_pcm(pcm.freeze(), format, format.samples_in(FRAME))?;

    let store = SpeakerProfileStore::new();
    store.enroll("caller", vec![0.3, 0.7])?;
    let identifier = config.detector.speaker_identifier(store, loudness_embedding);
    let backends = DetectorBackends::default().speaker(move || Ok(identifier));
    let mut detector = config
        .detector
        .build_detector(Arc::new(vad_registry()), FRAME, backends)?;

    let sink = MemorySink::new(format);
    let recording = sink.recording();
    let (notices, notice_rx) = config.events.channel::<PlaybackEvent>();
    let player = QueuedPlayer::new(sink, config.output.to_output_config(), Some(notices))?;
    let transcriber = PlaceholderTranscriber::new();

    for event in detector.events(&mut source) {
        match event? {
            SpeechEvent::SpeechStarted { timestamp, .. } => {
                info!("🎤 speech at {:.2}s", timestamp.as_secs_f32());
            }
            SpeechEvent::SpeechEnded { segment, reason } => {
                let text = transcriber.transcribe(&segment, None)?;
                let speaker = segment.speaker().map_or("unknown", |found| found.name.as_str());
                info!(
                    "🎯 {:.2}s - {:.2}s ({}) {}: {}",
                    segment.start().as_secs_f32(),
                    segment.end().as_secs_f32(),
                    reason,
                    speaker,
                    text
                );
                let request = speak(&player.control(), &synthesizer, "I heard you", None)?;
                info!("🔊 reply queued as request {}", request);
            }
            _ => {}
        }
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while player.is_busy() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    for notice in notice_rx.try_iter() {
        info!("📣 {:?}", notice);
    }
    info!(
        "rendered {:.2}s of reply audio",
        format.duration_of(recording.samples().len()).as_secs_f32()
    );
    Ok(())
}
