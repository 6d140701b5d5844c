//! Capture configuration: tunable VAD settings, capture policy, persisted
//! overrides and process-level settings

use crate::practice::PronunciationService;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Store key holding the learner's local overrides
pub const AUDIO_SETTINGS_KEY: &str = "audioSettings";

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_SETTINGS_FILE: &str = "recitea-settings.json";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid audio settings: {0}")]
    Invalid(String),
}

/// Voice-activity settings
///
/// Field names on the wire match the scoring service's
/// `get_audio_settings` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Volume (0-100) under which audio counts as silence
    #[serde(rename = "silenceThreshold")]
    pub silence_threshold: u8,
    /// Continuous silence needed before auto-stop
    #[serde(rename = "silenceDuration")]
    pub silence_duration_ms: u64,
    /// Warm-up during which silence is ignored
    #[serde(rename = "minRecordingTime")]
    pub min_recording_ms: u64,
    /// Hard ceiling on a single recording
    #[serde(rename = "maxRecordingTime")]
    pub max_recording_ms: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            silence_threshold: 15,
            silence_duration_ms: 1000,
            min_recording_ms: 500,
            max_recording_ms: 8000,
        }
    }
}

impl AudioSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.silence_threshold > 100 {
            return Err(ConfigError::Invalid(format!(
                "silence threshold {} is above 100",
                self.silence_threshold
            )));
        }
        if self.silence_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "silence duration must be positive".to_string(),
            ));
        }
        if self.min_recording_ms >= self.max_recording_ms {
            return Err(ConfigError::Invalid(format!(
                "minimum recording time {} ms is not below maximum {} ms",
                self.min_recording_ms, self.max_recording_ms
            )));
        }
        Ok(())
    }

    /// Overlay local overrides on these (remote or default) settings
    pub fn merged_with(self, overrides: &SettingsOverrides) -> Self {
        Self {
            silence_threshold: overrides.silence_threshold.unwrap_or(self.silence_threshold),
            silence_duration_ms: overrides
                .silence_duration_ms
                .unwrap_or(self.silence_duration_ms),
            min_recording_ms: overrides.min_recording_ms.unwrap_or(self.min_recording_ms),
            max_recording_ms: overrides.max_recording_ms.unwrap_or(self.max_recording_ms),
        }
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    pub fn min_recording(&self) -> Duration {
        Duration::from_millis(self.min_recording_ms)
    }

    pub fn max_recording(&self) -> Duration {
        Duration::from_millis(self.max_recording_ms)
    }
}

/// Partial settings persisted locally; missing fields keep the base value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettingsOverrides {
    #[serde(rename = "silenceThreshold", default, skip_serializing_if = "Option::is_none")]
    pub silence_threshold: Option<u8>,
    #[serde(rename = "silenceDuration", default, skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u64>,
    #[serde(rename = "minRecordingTime", default, skip_serializing_if = "Option::is_none")]
    pub min_recording_ms: Option<u64>,
    #[serde(rename = "maxRecordingTime", default, skip_serializing_if = "Option::is_none")]
    pub max_recording_ms: Option<u64>,
}

impl From<AudioSettings> for SettingsOverrides {
    fn from(s: AudioSettings) -> Self {
        Self {
            silence_threshold: Some(s.silence_threshold),
            silence_duration_ms: Some(s.silence_duration_ms),
            min_recording_ms: Some(s.min_recording_ms),
            max_recording_ms: Some(s.max_recording_ms),
        }
    }
}

/// Timing and size policy of the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapturePolicy {
    /// A stop is never honoured earlier than this after recording started
    pub stop_guard_ms: u64,
    /// Minimum gap between a finished session and the next request
    pub cooldown_ms: u64,
    /// Smaller clips are reported as insufficient audio
    pub min_clip_bytes: usize,
    /// VAD sampling period (about one display frame)
    pub tick_interval_ms: u64,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            stop_guard_ms: 500,
            cooldown_ms: 1000,
            min_clip_bytes: 1000,
            tick_interval_ms: 16,
        }
    }
}

impl CapturePolicy {
    pub fn stop_guard(&self) -> Duration {
        Duration::from_millis(self.stop_guard_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// Key-value persistence for learner preferences
#[cfg_attr(test, mockall::automock)]
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Settings kept in memory only
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Settings persisted as one JSON object on disk
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing or unreadable file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(entries) => {
                        tracing::info!("Settings loaded from {}", path.display());
                        entries
                    }
                    Err(e) => {
                        tracing::warn!("Invalid settings file, starting empty: {}", e);
                        serde_json::Map::new()
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read settings file: {}", e);
                    serde_json::Map::new()
                }
            }
        } else {
            serde_json::Map::new()
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries)
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let json = {
            let mut entries = lock(&self.entries);
            entries.insert(key.to_string(), serde_json::Value::String(value.to_string()));
            serde_json::to_string_pretty(&*entries)?
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, json)?;
        tracing::debug!("Settings saved to {}", self.path.display());
        Ok(())
    }
}

/// Read the learner's overrides; a corrupt entry is ignored
pub fn load_overrides(store: &dyn SettingsStore) -> SettingsOverrides {
    match store.get(AUDIO_SETTINGS_KEY) {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(overrides) => overrides,
            Err(e) => {
                tracing::warn!("Ignoring invalid stored audio settings: {}", e);
                SettingsOverrides::default()
            }
        },
        None => SettingsOverrides::default(),
    }
}

/// Persist `settings` as the learner's overrides
pub fn save_audio_settings(
    store: &dyn SettingsStore,
    settings: &AudioSettings,
) -> Result<(), ConfigError> {
    settings.validate()?;
    let json = serde_json::to_string(&SettingsOverrides::from(*settings))?;
    store.set(AUDIO_SETTINGS_KEY, &json)?;
    tracing::info!("Audio settings saved: {:?}", settings);
    Ok(())
}

/// Resolve the settings for the next session: remote defaults (or the
/// built-in ones when the service is unreachable) overlaid with local
/// overrides
pub async fn load_audio_settings<S>(service: &S, store: &dyn SettingsStore) -> AudioSettings
where
    S: PronunciationService + ?Sized,
{
    let base = match service.get_audio_settings().await {
        Ok(remote) if remote.validate().is_ok() => remote,
        Ok(remote) => {
            tracing::warn!("Remote audio settings invalid, using defaults: {:?}", remote);
            AudioSettings::default()
        }
        Err(e) => {
            tracing::warn!("Remote audio settings unavailable, using defaults: {}", e);
            AudioSettings::default()
        }
    };

    let merged = base.merged_with(&load_overrides(store));
    match merged.validate() {
        Ok(()) => merged,
        Err(e) => {
            tracing::warn!("Local audio settings rejected: {}", e);
            base
        }
    }
}

/// Process-level settings, resolved from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Base URL of the scoring/TTS service
    pub api_base_url: String,
    /// Input device to capture from, platform default when unset
    pub device_id: Option<String>,
    /// User agent used to derive platform quirks
    pub user_agent: Option<String>,
    pub settings_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            device_id: None,
            user_agent: None,
            settings_path: PathBuf::from(DEFAULT_SETTINGS_FILE),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            api_base_url: non_empty("RECITEA_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base_url),
            device_id: non_empty("RECITEA_DEVICE"),
            user_agent: non_empty("RECITEA_USER_AGENT"),
            settings_path: non_empty("RECITEA_SETTINGS")
                .map(PathBuf::from)
                .unwrap_or(defaults.settings_path),
        }
    }
}
