//! Backend registry
//!
//! Maps a string id (as found in configuration) to a constructor for a
//! backend trait object. Nothing registers itself: the application builds a
//! registry at startup, starting from [`vad_registry`] if it wants the
//! in-tree classifiers, and adds its own backends explicitly.

use crate::classify::{
    EnergyClassifier, EnergyConfig, VoiceActivityClassifier, WebRtcClassifier, WebRtcConfig,
};
use crate::error::{VoiceError, VoiceResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Constructor for one backend; receives backend-specific options.
pub type Constructor<T> = Box<dyn Fn(&Value) -> VoiceResult<Box<T>> + Send + Sync>;

/// String id → constructor for one kind of backend
pub struct BackendRegistry<T: ?Sized> {
    kind: &'static str,
    constructors: BTreeMap<String, Constructor<T>>,
}

impl<T: ?Sized> BackendRegistry<T> {
    /// Empty registry; `kind` names the backend family in errors and logs.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            constructors: BTreeMap::new(),
        }
    }

    /// Register (or replace) a constructor under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&Value) -> VoiceResult<Box<T>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            warn!(kind = self.kind, backend = %name, "replacing registered backend");
        } else {
            debug!(kind = self.kind, backend = %name, "registered backend");
        }
        self.constructors.insert(name, Box::new(constructor));
        self
    }

    pub fn unregister(&mut self, name: &str) -> VoiceResult<()> {
        self.constructors
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| self.unknown(name))
    }

    /// Construct the backend registered under `name`.
    pub fn create(&self, name: &str, options: &Value) -> VoiceResult<Box<T>> {
        let constructor = self.constructors.get(name).ok_or_else(|| self.unknown(name))?;
        constructor(options)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered ids in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    fn unknown(&self, name: &str) -> VoiceError {
        VoiceError::UnknownBackend {
            kind: self.kind,
            name: name.to_string(),
        }
    }
}

/// Deserialize backend options, treating `null` as "all defaults".
pub fn parse_options<C: DeserializeOwned + Default>(options: &Value) -> VoiceResult<C> {
    if options.is_null() {
        return Ok(C::default());
    }
    Ok(serde_json::from_value(options.clone())?)
}

/// Registry preloaded with the in-tree voice-activity classifiers
/// (`"energy"` and `"webrtc"`).
pub fn vad_registry() -> BackendRegistry<dyn VoiceActivityClassifier> {
    let mut registry: BackendRegistry<dyn VoiceActivityClassifier> =
        BackendRegistry::new("voice-activity");
    registry
        .register("energy", |options| {
            let config: EnergyConfig = parse_options(options)?;
            Ok(Box::new(EnergyClassifier::new(config)?) as Box<dyn VoiceActivityClassifier>)
        })
        .register("webrtc", |options| {
            let config: WebRtcConfig = parse_options(options)?;
            Ok(Box::new(WebRtcClassifier::new(config)?) as Box<dyn VoiceActivityClassifier>)
        });
    registry
}
