//! # Voxgate Voice - Speech Boundaries, Queued Playback, Network Peers
//!
//! This crate finds where speech starts and stops in a live audio stream,
//! plays queued audio with per-request cancellation, and bridges remote
//! peers' packetized audio into the same frame pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Voice Pipeline                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  FrameSource │→ │ VAD / wake / │→ │   Speech Detector    │   │
//! │  │ mic · buffer │  │   speaker    │  │ (hold-off, ceiling)  │   │
//! │  │  · peer in   │  │ classifiers  │  └──────────┬───────────┘   │
//! │  └──────────────┘  └──────────────┘             ↓ SpeechEvent   │
//! │         ↑                              ┌──────────────────┐     │
//! │  ┌──────────────┐                      │   Voice Session   │     │
//! │  │  PeerBridge  │                      │ (STT → reply →    │     │
//! │  │ jitter·rate  │                      │  TTS, barge-in)   │     │
//! │  └──────────────┘                      └────────┬─────────┘     │
//! │         ↑                                       ↓               │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  BridgeHub   │  │  AudioSink   │← │    Queued Player     │   │
//! │  │ (signaling)  │  │ dev · peer   │  │ (cancel per request) │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod classify;
pub mod config;
pub mod detector;
#[cfg(feature = "device")]
pub mod device;
pub mod error;
pub mod events;
pub mod frame;
pub mod output;
pub mod registry;
pub mod session;
pub mod sink;
pub mod source;
pub mod speaker;
pub mod stt;
pub mod tts;

pub use bridge::{
    AudioPacket, BridgeConfig, BridgeHub, BridgeSink, BridgeSource, BridgeStats, PacketTransport,
    PeerBridge, PeerId, PeerPhase, SessionNegotiator, SignalMessage,
};
pub use classify::{
    ActivityLabel, BoundedClassifier, BoundedSpeakerIdentifier, BoundedWakeWord, Classification,
    EnergyClassifier, KeywordDetection, VoiceActivityClassifier, WakeWordClassifier,
    WebRtcClassifier,
};
pub use config::{DetectorBackends, VoiceConfig};
pub use detector::{
    spawn_detector, CloseReason, DetectorConfig, DetectorHandle, DetectorState, SpeechDetector,
    SpeechEvent, Utterance,
};
#[cfg(feature = "device")]
pub use device::{DeviceCapture, DeviceConfig, DevicePlayback};
pub use error::{VoiceError, VoiceResult};
pub use events::{event_channel, EventSender, OverflowPolicy};
pub use frame::{AudioFormat, AudioFrame, FrameClock};
pub use output::{CancelTarget, OutputConfig, PlaybackControl, PlaybackEvent, QueuedPlayer, RequestId};
pub use registry::{vad_registry, BackendRegistry};
pub use session::{run_voice_loop, speak, OnInterruption, SessionOptions, SessionStats, Transcript};
pub use sink::{AudioSink, MemorySink, Recording};
pub use source::{BufferSource, ChannelSource, FrameSource, VirtualMicrophone};
pub use speaker::{EnrolledSpeakerIdentifier, SpeakerIdentifier, SpeakerMatch, SpeakerProfileStore};
pub use stt::{transcriber_registry, PlaceholderTranscriber, Transcriber};
pub use tts::{synthesizer_registry, PlaceholderSynthesizer, SpeechSynthesizer};
