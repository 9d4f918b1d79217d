//! Configuration management
//!
//! Settings live in `settings.json` in the data directory:
//! ```json
//! {
//!   "poolIntervalSecs": 5,
//!   "durableTimeoutMs": 2000,
//!   "logLevel": "info",
//!   "logging": false,
//!   "eventLog": true,
//!   "database": "funds.duckdb"
//! }
//! ```
//! Fields this crate does not manage are kept when saving. A few values can
//! be overridden from the environment (`POOL_INTERVAL`, `DURABLE_TIMEOUT_MS`,
//! `DEBUG`, `LOGGING`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::domain::result::Error;

const DEFAULT_POOL_INTERVAL_SECS: u64 = 5;
const DEFAULT_DURABLE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_DATABASE: &str = "funds.duckdb";

/// Raw settings.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pool_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    durable_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logging: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_log: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    database: Option<String>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

/// Diagnostics settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Base level for the tracing filter
    pub level: String,
    /// Mirror of the `LOGGING` flag: verbose per-request diagnostics
    pub enabled: bool,
    /// Persist subsystem events to `logs.duckdb`
    pub event_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            enabled: false,
            event_log: true,
        }
    }
}

impl LoggingConfig {
    /// Filter directive for the tracing subscriber
    pub fn effective_level(&self) -> String {
        if self.enabled && self.level == DEFAULT_LOG_LEVEL {
            "debug".to_string()
        } else {
            self.level.clone()
        }
    }
}

/// Funds ledger configuration (simplified view of settings)
#[derive(Debug, Clone)]
pub struct Config {
    pub pool_interval: Duration,
    pub durable_timeout: Duration,
    pub logging: LoggingConfig,
    /// Database file name, relative to the data directory
    pub database: String,
    // Keep the raw settings for preservation when saving
    _raw_settings: SettingsFile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_interval: Duration::from_secs(DEFAULT_POOL_INTERVAL_SECS),
            durable_timeout: Duration::from_millis(DEFAULT_DURABLE_TIMEOUT_MS),
            logging: LoggingConfig::default(),
            database: DEFAULT_DATABASE.to_string(),
            _raw_settings: SettingsFile::default(),
        }
    }
}

impl Config {
    /// Load config from the data directory, then apply env overrides
    pub fn load(data_dir: &Path) -> Result<Self> {
        Self::load_with_env(data_dir, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`] with an explicit environment lookup
    pub fn load_with_env(data_dir: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let settings_path = data_dir.join("settings.json");

        let raw: SettingsFile = if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::config(format!("Invalid {}: {}", settings_path.display(), e)))?
        } else {
            SettingsFile::default()
        };

        let pool_interval_secs = match env("POOL_INTERVAL") {
            Some(value) => parse_number("POOL_INTERVAL", &value)?,
            None => raw.pool_interval_secs.unwrap_or(DEFAULT_POOL_INTERVAL_SECS),
        };
        if pool_interval_secs == 0 {
            return Err(Error::config("POOL_INTERVAL must be at least 1 second").into());
        }

        let durable_timeout_ms = match env("DURABLE_TIMEOUT_MS") {
            Some(value) => parse_number("DURABLE_TIMEOUT_MS", &value)?,
            None => raw.durable_timeout_ms.unwrap_or(DEFAULT_DURABLE_TIMEOUT_MS),
        };
        if durable_timeout_ms == 0 {
            return Err(Error::config("DURABLE_TIMEOUT_MS must be at least 1 millisecond").into());
        }

        let debug = env("DEBUG").and_then(|v| parse_flag(&v)).unwrap_or(false);
        let level = if debug {
            "debug".to_string()
        } else {
            raw.log_level
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
        };

        let enabled = env("LOGGING")
            .and_then(|v| parse_flag(&v))
            .unwrap_or_else(|| raw.logging.unwrap_or(false));

        Ok(Self {
            pool_interval: Duration::from_secs(pool_interval_secs),
            durable_timeout: Duration::from_millis(durable_timeout_ms),
            logging: LoggingConfig {
                level,
                enabled,
                event_log: raw.event_log.unwrap_or(true),
            },
            database: raw
                .database
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            _raw_settings: raw,
        })
    }

    /// Save config to the data directory
    /// Preserves other settings this crate doesn't manage
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        let settings_path = data_dir.join("settings.json");

        let mut settings = self._raw_settings.clone();
        settings.pool_interval_secs = Some(self.pool_interval.as_secs());
        settings.durable_timeout_ms = Some(self.durable_timeout.as_millis() as u64);
        settings.log_level = Some(self.logging.level.clone());
        settings.logging = Some(self.logging.enabled);
        settings.event_log = Some(self.logging.event_log);
        settings.database = Some(self.database.clone());

        let content = serde_json::to_string_pretty(&settings)?;
        std::fs::write(&settings_path, content)?;
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_number(key: &str, value: &str) -> std::result::Result<u64, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{} must be a non-negative integer, got {:?}", key, value)))
}
