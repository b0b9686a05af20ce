//! Layered configuration
//!
//! Settings come from an optional file (path in `VOXGATE_CONFIG`, default
//! `config/voxgate.{toml,json,...}`) overlaid with `VOXGATE__*` environment
//! variables, e.g. `VOXGATE__DETECTOR__HOLD_OFF_MS=300`. Every field has a
//! default, so an empty environment yields a working configuration.

use crate::bridge::{BridgeConfig, BridgeHub, PacketTransport, SessionNegotiator};
use crate::classify::{
    BoundedClassifier, BoundedSpeakerIdentifier, BoundedWakeWord, Classification, KeywordDetection,
    VoiceActivityClassifier, WakeWordClassifier,
};
use crate::detector::{DetectorConfig, SpeechDetector};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{event_channel, EventSender, OverflowPolicy, DEFAULT_BLOCK_TIMEOUT};
use crate::frame::{AudioFormat, AudioFrame};
use crate::output::OutputConfig;
use crate::registry::BackendRegistry;
use crate::speaker::{
    EmbeddingExtractor, EnrolledSpeakerIdentifier, SpeakerIdentifier, SpeakerMatch, SpeakerProfileStore,
};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration for a voice pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub events: EventSettings,
}

impl VoiceConfig {
    /// Load from file and environment. Precedence: env > `VOXGATE_CONFIG` file > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("VOXGATE_CONFIG").unwrap_or_else(|_| "config/voxgate".to_string());
        Self::load_from(&config_path)
    }

    /// Load with an explicit file path (extension optional); a missing file is not an error.
    pub fn load_from(config_path: &str) -> VoiceResult<Self> {
        let path = Path::new(config_path);
        let file = if path.extension().is_some() {
            config::File::from(path).required(false)
        } else {
            config::File::with_name(config_path).required(false)
        };

        let built = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("VOXGATE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: VoiceConfig = built.try_deserialize()?;
        config.validate()?;
        info!(
            vad = %config.detector.vad_engine,
            hold_off_ms = config.detector.hold_off_ms,
            max_segment_ms = config.detector.max_segment_ms,
            "⚙️ Voice configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        self.detector.validate()?;
        self.output.validate()?;
        self.bridge.validate()?;
        self.events.validate()
    }
}

/// Speech detector settings, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Registered voice-activity backend id
    pub vad_engine: String,
    /// Backend-specific options, passed through to its constructor
    pub vad_options: Value,
    pub activity_threshold: f32,
    pub hold_off_ms: u64,
    pub partial_interval_ms: Option<u64>,
    pub max_segment_ms: u64,
    pub pre_roll_ms: u64,
    /// Require a wake word before each armed period; needs a wake-word
    /// backend in [`DetectorBackends`]
    pub wake_word_gating: bool,
    pub rearm_after_ms: Option<u64>,
    pub max_consecutive_failures: u32,
    /// Per-call deadline for every detector backend; unset runs them inline
    pub classifier_timeout_ms: Option<u64>,
    /// Applied by [`DetectorSettings::speaker_identifier`]
    pub speaker_min_confidence: f32,
}

/// Builds a wake-word backend, on a worker thread when calls are bounded
pub type WakeWordFactory = Box<dyn FnOnce() -> VoiceResult<Box<dyn WakeWordClassifier>> + Send>;

/// Builds a speaker identifier, on a worker thread when calls are bounded
pub type SpeakerFactory = Box<dyn FnOnce() -> VoiceResult<Box<dyn SpeakerIdentifier>> + Send>;

/// Boxed backend handed to a deadline worker, forwarding resets
struct Boxed<T: ?Sized>(Box<T>);

impl VoiceActivityClassifier for Boxed<dyn VoiceActivityClassifier> {
    fn classify(&mut self, frame: &AudioFrame) -> VoiceResult<Classification> {
        self.0.classify(frame)
    }

    fn reset(&mut self) {
        self.0.reset();
    }
}

impl WakeWordClassifier for Boxed<dyn WakeWordClassifier> {
    fn detect(&mut self, frame: &AudioFrame) -> VoiceResult<KeywordDetection> {
        self.0.detect(frame)
    }

    fn reset(&mut self) {
        self.0.reset();
    }
}

impl SpeakerIdentifier for Boxed<dyn SpeakerIdentifier> {
    fn identify(&mut self, frames: &[AudioFrame]) -> VoiceResult<Option<SpeakerMatch>> {
        self.0.identify(frames)
    }

    fn reset(&mut self) {
        self.0.reset();
    }
}

/// Detector backends that configuration cannot name on its own
#[derive(Default)]
pub struct DetectorBackends {
    pub wake_word: Option<WakeWordFactory>,
    pub speaker: Option<SpeakerFactory>,
}

impl DetectorBackends {
    pub fn wake_word<W, F>(mut self, build: F) -> Self
    where
        W: WakeWordClassifier + 'static,
        F: FnOnce() -> VoiceResult<W> + Send + 'static,
    {
        self.wake_word = Some(Box::new(move || {
            let wake: Box<dyn WakeWordClassifier> = Box::new(build()?);
            Ok(wake)
        }));
        self
    }

    pub fn speaker<S, F>(mut self, build: F) -> Self
    where
        S: SpeakerIdentifier + 'static,
        F: FnOnce() -> VoiceResult<S> + Send + 'static,
    {
        self.speaker = Some(Box::new(move || {
            let speaker: Box<dyn SpeakerIdentifier> = Box::new(build()?);
            Ok(speaker)
        }));
        self
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            vad_engine: "energy".to_string(),
            vad_options: Value::Null,
            activity_threshold: 0.5,
            hold_off_ms: 500,
            partial_interval_ms: None,
            max_segment_ms: 10_000,
            pre_roll_ms: 200,
            wake_word_gating: false,
            rearm_after_ms: None,
            max_consecutive_failures: 5,
            classifier_timeout_ms: None,
            speaker_min_confidence: crate::speaker::DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl DetectorSettings {
    pub fn validate(&self) -> VoiceResult<()> {
        if !(0.0..=1.0).contains(&self.activity_threshold) {
            return Err(VoiceError::Config(format!(
                "detector.activity_threshold must be within [0, 1], got {}",
                self.activity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.speaker_min_confidence) {
            return Err(VoiceError::Config(format!(
                "detector.speaker_min_confidence must be within [0, 1], got {}",
                self.speaker_min_confidence
            )));
        }
        if self.max_segment_ms == 0 {
            return Err(VoiceError::Config("detector.max_segment_ms must be non-zero".into()));
        }
        if self.partial_interval_ms == Some(0) {
            return Err(VoiceError::Config("detector.partial_interval_ms must be non-zero".into()));
        }
        if self.max_consecutive_failures == 0 {
            return Err(VoiceError::Config(
                "detector.max_consecutive_failures must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Convert millisecond settings into frame counts for frames of `frame_duration`.
    ///
    /// Windows round up, so a 500ms hold-off over 30ms frames tolerates 17 frames.
    pub fn to_detector_config(&self, frame_duration: Duration) -> VoiceResult<DetectorConfig> {
        let frame_us = frame_duration.as_micros();
        if frame_us == 0 {
            return Err(VoiceError::Config("frame duration must be non-zero".into()));
        }
        let frames = |ms: u64| -> usize { ((ms as u128 * 1_000).div_ceil(frame_us)) as usize };

        let config = DetectorConfig {
            activity_threshold: self.activity_threshold,
            hold_off_frames: frames(self.hold_off_ms),
            partial_interval_frames: self.partial_interval_ms.map(|ms| frames(ms).max(1)),
            max_segment_frames: frames(self.max_segment_ms).max(1),
            pre_roll_frames: frames(self.pre_roll_ms),
            rearm_after_frames: self.rearm_after_ms.map(|ms| frames(ms).max(1)),
            max_consecutive_failures: self.max_consecutive_failures,
        };
        debug!(?config, ?frame_duration, "detector settings converted to frames");
        config.validate()?;
        Ok(config)
    }

    /// Construct the configured voice-activity backend.
    ///
    /// With `classifier_timeout_ms` set the backend is built and run on its
    /// own thread behind a [`BoundedClassifier`].
    pub fn build_classifier(
        &self,
        registry: Arc<BackendRegistry<dyn VoiceActivityClassifier>>,
    ) -> VoiceResult<Box<dyn VoiceActivityClassifier>> {
        match self.classifier_timeout_ms {
            None => registry.create(&self.vad_engine, &self.vad_options),
            Some(ms) => {
                let engine = self.vad_engine.clone();
                let options = self.vad_options.clone();
                let bounded = BoundedClassifier::spawn(
                    move || {
                        registry.create(&engine, &options).map(Boxed)
                    },
                    Duration::from_millis(ms),
                )?;
                Ok(Box::new(bounded))
            }
        }
    }

    /// Build a detector from these settings for frames of `frame_duration`.
    ///
    /// With `wake_word_gating` on, `backends` must carry a wake-word backend.
    /// With `classifier_timeout_ms` set, every backend runs behind a deadline.
    pub fn build_detector(
        &self,
        registry: Arc<BackendRegistry<dyn VoiceActivityClassifier>>,
        frame_duration: Duration,
        backends: DetectorBackends,
    ) -> VoiceResult<SpeechDetector> {
        let config = self.to_detector_config(frame_duration)?;
        let vad = self.build_classifier(registry)?;
        let mut builder = SpeechDetector::builder_boxed(vad).config(config);

        match (self.wake_word_gating, backends.wake_word) {
            (true, Some(build)) => builder = builder.wake_word_boxed(self.build_wake_word(build)?),
            (true, None) => {
                return Err(VoiceError::Config(
                    "detector.wake_word_gating is on but no wake-word backend was supplied".into(),
                ))
            }
            (false, Some(_)) => debug!("wake-word backend supplied with gating off, not attached"),
            (false, None) => {}
        }
        if let Some(build) = backends.speaker {
            builder = builder.speaker_identifier_boxed(self.build_speaker(build)?);
        }
        builder.build()
    }

    /// Identifier over enrolled profiles, reporting matches of at least
    /// `speaker_min_confidence`.
    pub fn speaker_identifier<E: EmbeddingExtractor>(
        &self,
        store: SpeakerProfileStore,
        extractor: E,
    ) -> EnrolledSpeakerIdentifier<E> {
        EnrolledSpeakerIdentifier::new(store, extractor).with_min_confidence(self.speaker_min_confidence)
    }

    fn build_wake_word(&self, build: WakeWordFactory) -> VoiceResult<Box<dyn WakeWordClassifier>> {
        match self.classifier_timeout_ms {
            None => build(),
            Some(ms) => {
                let bounded = BoundedWakeWord::spawn(
                    move || build().map(Boxed),
                    Duration::from_millis(ms),
                )?;
                Ok(Box::new(bounded))
            }
        }
    }

    fn build_speaker(&self, build: SpeakerFactory) -> VoiceResult<Box<dyn SpeakerIdentifier>> {
        match self.classifier_timeout_ms {
            None => build(),
            Some(ms) => {
                let bounded = BoundedSpeakerIdentifier::spawn(
                    move || build().map(Boxed),
                    Duration::from_millis(ms),
                )?;
                Ok(Box::new(bounded))
            }
        }
    }
}

/// Playback engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub queue_capacity: usize,
    pub render_unit_ms: u64,
    pub enqueue_timeout_ms: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        let defaults = OutputConfig::default();
        Self {
            queue_capacity: defaults.queue_capacity,
            render_unit_ms: defaults.render_unit.as_millis() as u64,
            enqueue_timeout_ms: defaults.enqueue_timeout.as_millis() as u64,
        }
    }
}

impl OutputSettings {
    pub fn validate(&self) -> VoiceResult<()> {
        if self.queue_capacity == 0 {
            return Err(VoiceError::Config("output.queue_capacity must be non-zero".into()));
        }
        if self.render_unit_ms == 0 {
            return Err(VoiceError::Config("output.render_unit_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn to_output_config(&self) -> OutputConfig {
        OutputConfig {
            queue_capacity: self.queue_capacity,
            render_unit: Duration::from_millis(self.render_unit_ms),
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            ..OutputConfig::default()
        }
    }
}

/// Network bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub transport_sample_rate: u32,
    pub transport_channels: u16,
    pub packet_ms: u64,
    pub local_sample_rate: u32,
    pub frame_ms: u64,
    pub reorder_window: usize,
    pub max_wait_ticks: u32,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub write_timeout_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let defaults = BridgeConfig::default();
        Self {
            transport_sample_rate: defaults.transport_format.sample_rate,
            transport_channels: defaults.transport_format.channels,
            packet_ms: defaults.packet_duration.as_millis() as u64,
            local_sample_rate: defaults.local_format.sample_rate,
            frame_ms: defaults.frame_duration.as_millis() as u64,
            reorder_window: defaults.reorder_window,
            max_wait_ticks: defaults.max_wait_ticks,
            inbound_capacity: defaults.inbound_capacity,
            outbound_capacity: defaults.outbound_capacity,
            write_timeout_ms: defaults.write_timeout.as_millis() as u64,
        }
    }
}

impl BridgeSettings {
    pub fn validate(&self) -> VoiceResult<()> {
        if self.packet_ms == 0 || self.frame_ms == 0 {
            return Err(VoiceError::Config("bridge.packet_ms and bridge.frame_ms must be non-zero".into()));
        }
        if self.reorder_window == 0 {
            return Err(VoiceError::Config("bridge.reorder_window must be non-zero".into()));
        }
        if self.inbound_capacity == 0 || self.outbound_capacity == 0 {
            return Err(VoiceError::Config("bridge capacities must be non-zero".into()));
        }
        self.to_bridge_config().transport_format.validate()?;
        Ok(())
    }

    /// Peer hub whose bridges use these settings.
    pub fn build_hub(
        &self,
        negotiator: Arc<dyn SessionNegotiator>,
        transport: Arc<dyn PacketTransport>,
    ) -> VoiceResult<BridgeHub> {
        self.validate()?;
        Ok(BridgeHub::new(self.to_bridge_config(), negotiator, transport))
    }

    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            transport_format: AudioFormat::new(self.transport_sample_rate, self.transport_channels, 2),
            packet_duration: Duration::from_millis(self.packet_ms),
            local_format: AudioFormat::pcm16_mono(self.local_sample_rate),
            frame_duration: Duration::from_millis(self.frame_ms),
            reorder_window: self.reorder_window,
            max_wait_ticks: self.max_wait_ticks,
            inbound_capacity: self.inbound_capacity,
            outbound_capacity: self.outbound_capacity,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

/// Event channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Longest a blocked send waits for a stalled listener
    pub block_timeout_ms: u64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: 256,
            overflow: OverflowPolicy::Block,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT.as_millis() as u64,
        }
    }
}

impl EventSettings {
    pub fn validate(&self) -> VoiceResult<()> {
        if self.capacity == 0 {
            return Err(VoiceError::Config("events.capacity must be non-zero".into()));
        }
        if self.block_timeout_ms == 0 {
            return Err(VoiceError::Config("events.block_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Event channel with these settings.
    pub fn channel<T>(&self) -> (EventSender<T>, Receiver<T>) {
        let (tx, rx) = event_channel(self.capacity, self.overflow);
        (tx.with_block_timeout(Duration::from_millis(self.block_timeout_ms)), rx)
    }
}
