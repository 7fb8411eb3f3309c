//! Configuration management for the pairing tool.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default provider API base URL.
pub const DEFAULT_PROVIDER_URL: &str = "http://localhost:8080";

/// Default base URL the provider posts channel events back to.
pub const DEFAULT_CALLBACK_BASE_URL: &str = "http://localhost:8000";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Provider events a channel subscribes to when its callback is registered.
pub const DEFAULT_EVENT_TYPES: &[&str] = &[
    "QRCODE_UPDATED",
    "MESSAGES_UPSERT",
    "MESSAGES_UPDATE",
    "SEND_MESSAGE",
    "CONNECTION_UPDATE",
];

/// Timing and retry knobs for the pairing state machine.
///
/// Delays are expressed in abstract time units; `time_unit_ms` fixes the
/// length of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSettings {
    /// Length of one time unit in milliseconds.
    pub time_unit_ms: u64,
    /// Session creation attempts before giving up.
    pub max_create_attempts: u32,
    /// Units to wait before the first status poll.
    pub initial_poll_delay_units: u64,
    /// Units between consecutive status polls.
    pub poll_interval_units: u64,
    /// Status polls allowed before the pairing window expires.
    pub max_poll_attempts: u32,
    /// Units without progress after which an active session is considered stale.
    pub stale_after_units: u64,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            time_unit_ms: 1000,
            max_create_attempts: 2,
            initial_poll_delay_units: 5,
            poll_interval_units: 10,
            max_poll_attempts: 30,
            stale_after_units: 600,
        }
    }
}

impl PairingSettings {
    /// Length of one time unit.
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }

    /// Convert a unit count into wall-clock time.
    pub fn units(&self, count: u64) -> Duration {
        Duration::from_millis(self.time_unit_ms.saturating_mul(count))
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Provider API base URL.
    #[serde(default = "default_provider_url")]
    pub provider_url: String,
    /// Provider API key, sent as a bearer credential.
    #[serde(default)]
    pub provider_api_key: Option<String>,
    /// Public base URL the provider delivers channel events to.
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Events subscribed when registering a channel callback.
    #[serde(default = "default_event_types")]
    pub event_types: Vec<String>,
    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Pairing timing and retry policy.
    #[serde(default)]
    pub pairing: PairingSettings,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_provider_url() -> String {
    DEFAULT_PROVIDER_URL.to_string()
}

fn default_callback_base_url() -> String {
    DEFAULT_CALLBACK_BASE_URL.to_string()
}

fn default_event_types() -> Vec<String> {
    DEFAULT_EVENT_TYPES.iter().map(|s| s.to_string()).collect()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            provider_url: default_provider_url(),
            provider_api_key: None,
            callback_base_url: default_callback_base_url(),
            event_types: default_event_types(),
            request_timeout_secs: default_request_timeout_secs(),
            pairing: PairingSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from `<base>/config.json`, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| CoreError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        let path = paths.config_file();
        std::fs::write(&path, content).map_err(|source| CoreError::ConfigFile { path, source })
    }

    /// Override fields from environment variables.
    ///
    /// `lookup` resolves a variable name; blank values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).and_then(non_empty);

        if let Some(level) = read("PAIRING_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(url) = read("PAIRING_PROVIDER_URL") {
            self.provider_url = url;
        }
        if let Some(key) = read("PAIRING_PROVIDER_API_KEY") {
            self.provider_api_key = Some(key);
        }
        if let Some(url) = read("PAIRING_CALLBACK_BASE_URL") {
            self.callback_base_url = url;
        }
    }

    /// Reject settings the pairing flow cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        self.provider_url()?;
        self.callback_base_url()?;

        let pairing = &self.pairing;
        if pairing.time_unit_ms == 0 {
            return Err(CoreError::invalid("pairing.time_unit_ms", "must be > 0"));
        }
        if pairing.max_create_attempts == 0 {
            return Err(CoreError::invalid("pairing.max_create_attempts", "must be > 0"));
        }
        if pairing.max_poll_attempts == 0 {
            return Err(CoreError::invalid("pairing.max_poll_attempts", "must be > 0"));
        }
        if pairing.stale_after_units == 0 {
            return Err(CoreError::invalid("pairing.stale_after_units", "must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(CoreError::invalid("request_timeout_secs", "must be > 0"));
        }
        Ok(())
    }

    /// Get the provider URL as a parsed URL.
    pub fn provider_url(&self) -> CoreResult<Url> {
        Url::parse(&self.provider_url).map_err(|source| CoreError::InvalidUrl {
            setting: "provider_url",
            source,
        })
    }

    /// Get the callback base URL as a parsed URL.
    pub fn callback_base_url(&self) -> CoreResult<Url> {
        Url::parse(&self.callback_base_url).map_err(|source| CoreError::InvalidUrl {
            setting: "callback_base_url",
            source,
        })
    }

    /// Per-request HTTP timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Copy of this config with the API key masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.provider_api_key.is_some() {
            copy.provider_api_key = Some("********".to_string());
        }
        copy
    }
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
