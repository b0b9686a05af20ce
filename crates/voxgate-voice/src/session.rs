//! **Voice session**: detector events → transcription → reply → synthesis → playback.
//!
//! When the user starts speaking while a reply is still queued or playing,
//! playback is stopped immediately (barge-in) and the session goes back to
//! listening.

use crate::detector::{SpeechEvent, Utterance};
use crate::error::VoiceResult;
use crate::output::{PlaybackControl, RequestId};
use crate::stt::Transcriber;
use crate::tts::SpeechSynthesizer;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Called when user speech interrupts playback (e.g. to print "[stopped to listen]").
pub type OnInterruption = Option<Arc<dyn Fn() + Send + Sync>>;

/// Text recognised for one segment
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub segment: Uuid,
    pub text: String,
    /// Name of the identified speaker, if attribution is configured
    pub speaker: Option<String>,
    /// `false` for a transcription of a partial report
    pub is_final: bool,
}

/// Behaviour switches for [`run_voice_loop`]
#[derive(Clone)]
pub struct SessionOptions {
    /// Stop playback as soon as speech starts (default: true)
    pub barge_in: bool,
    /// Also transcribe partial reports (default: false)
    pub transcribe_partials: bool,
    /// Bind replies to this token, e.g. a network peer's, so they die with it
    pub playback_parent: Option<CancellationToken>,
    /// Ends the loop when cancelled
    pub shutdown: CancellationToken,
    pub on_interruption: OnInterruption,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            barge_in: true,
            transcribe_partials: false,
            playback_parent: None,
            shutdown: CancellationToken::new(),
            on_interruption: None,
        }
    }
}

/// Counters reported when the loop ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub segments: u64,
    pub transcripts: u64,
    pub replies: u64,
    pub interruptions: u64,
    pub failures: u64,
}

/// Run the conversation loop until the event channel closes or `options.shutdown` fires.
///
/// - `on_transcript`: receives every transcript; for final ones, the returned
///   text (if any, and not blank) is synthesized and played as the reply.
///
/// Transcription and synthesis failures are logged and skipped; the loop
/// keeps listening.
pub fn run_voice_loop<F>(
    events: &Receiver<SpeechEvent>,
    playback: &PlaybackControl,
    transcriber: &dyn Transcriber,
    synthesizer: &dyn SpeechSynthesizer,
    mut on_transcript: F,
    options: SessionOptions,
) -> VoiceResult<SessionStats>
where
    F: FnMut(&Transcript) -> Option<String>,
{
    let mut stats = SessionStats::default();
    // latest partial transcript of the open segment, offered as context
    let mut heard_so_far = String::new();
    info!(barge_in = options.barge_in, "🗣️ Voice session started");

    loop {
        if options.shutdown.is_cancelled() {
            break;
        }
        let event = match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            SpeechEvent::MetaData { key, value } => {
                debug!(%key, %value, "detector metadata");
            }
            SpeechEvent::SpeechStarted { segment, .. } => {
                stats.segments += 1;
                heard_so_far.clear();
                if options.barge_in && playback.is_busy() {
                    playback.stop();
                    stats.interruptions += 1;
                    info!(segment = %segment, "Interruption detected: transitioning to listening");
                    if let Some(ref cb) = options.on_interruption {
                        cb();
                    }
                }
            }
            SpeechEvent::PartialSpeechEnded { segment } => {
                if !options.transcribe_partials {
                    continue;
                }
                let Some(transcript) = transcribe(transcriber, &segment, &heard_so_far, false, &mut stats) else {
                    continue;
                };
                heard_so_far = transcript.text.clone();
                on_transcript(&transcript);
            }
            SpeechEvent::SpeechEnded { segment, reason } => {
                debug!(segment = %segment.id(), %reason, "segment closed");
                let context = std::mem::take(&mut heard_so_far);
                let Some(transcript) = transcribe(transcriber, &segment, &context, true, &mut stats) else {
                    continue;
                };
                info!(segment = %transcript.segment, text = %transcript.text, "Utterance");
                let Some(reply) = on_transcript(&transcript) else {
                    continue;
                };
                if reply.trim().is_empty() {
                    continue;
                }
                match speak(playback, synthesizer, &reply, options.playback_parent.as_ref()) {
                    Ok(request) => {
                        stats.replies += 1;
                        debug!(request, "reply queued");
                    }
                    Err(e) => {
                        stats.failures += 1;
                        warn!(error = %e, "TTS/playback failed");
                    }
                }
            }
        }
    }

    info!(
        segments = stats.segments,
        replies = stats.replies,
        interruptions = stats.interruptions,
        "voice session ended"
    );
    Ok(stats)
}

fn transcribe(
    transcriber: &dyn Transcriber,
    segment: &Utterance,
    context: &str,
    is_final: bool,
    stats: &mut SessionStats,
) -> Option<Transcript> {
    let prompt = (!context.is_empty()).then_some(context);
    let text = match transcriber.transcribe(segment, prompt) {
        Ok(text) => text,
        Err(e) => {
            stats.failures += 1;
            warn!(segment = %segment.id(), error = %e, "STT failed");
            return None;
        }
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    stats.transcripts += 1;
    Some(Transcript {
        segment: segment.id(),
        text: text.to_string(),
        speaker: segment.speaker().map(|s| s.name.clone()),
        is_final,
    })
}

/// Synthesize `text` and queue it as one playback request.
pub fn speak(
    playback: &PlaybackControl,
    synthesizer: &dyn SpeechSynthesizer,
    text: &str,
    parent: Option<&CancellationToken>,
) -> VoiceResult<RequestId> {
    let frames = synthesizer.synthesize(text)?;
    let request = match parent {
        Some(parent) => playback.begin_request_bound(parent),
        None => playback.begin_request(),
    };
    for frame in frames {
        if let Err(e) = playback.enqueue(frame, request) {
            playback.abort(request);
            return Err(e);
        }
    }
    playback.finish(request)?;
    Ok(request)
}
