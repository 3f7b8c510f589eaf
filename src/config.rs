//! Service configuration.
//!
//! Loaded from an optional TOML file (a missing file yields
//! `Config::default()`), then overridden by `FEEDSYNC_*` environment
//! variables. Unknown file keys are accepted but logged as warnings.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::refresh::RefreshSettings;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
}

// ============================================================================
// Configuration
// ============================================================================

/// All fields use `#[serde(default)]` so any subset of keys can be given.
///
/// Debug output masks `metrics_token`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file, or `:memory:`
    pub database_path: String,
    /// Listen address for `serve`
    pub bind_addr: String,

    pub freshness_window_secs: u64,
    pub lock_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Feeds refreshed in parallel within one batch
    pub batch_concurrency: usize,
    pub max_entries_per_fetch: usize,
    pub max_feed_bytes: usize,

    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,

    /// Parallel queue consumers in `serve`
    pub queue_workers: usize,
    pub queue_capacity: usize,
    pub max_deliveries: u32,
    pub redelivery_delay_secs: u64,
    /// Periodic stale-feed publication. 0 = off.
    pub schedule_interval_minutes: u64,

    /// Callback receiving refresh notifications
    pub notify_url: Option<String>,
    /// Metrics service endpoint. Unset = zero metrics.
    pub metrics_url: Option<String>,
    pub metrics_token: Option<String>,

    /// Permit feed URLs on localhost and private networks
    pub allow_private_networks: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "feedsync.db".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
            freshness_window_secs: 4 * 3600,
            lock_ttl_secs: 300,
            fetch_timeout_secs: 30,
            batch_concurrency: 15,
            max_entries_per_fetch: 10,
            max_feed_bytes: 10 * 1024 * 1024,
            cache_ttl_secs: 300,
            cache_capacity: 1024,
            queue_workers: 2,
            queue_capacity: 256,
            max_deliveries: 5,
            redelivery_delay_secs: 5,
            schedule_interval_minutes: 0,
            notify_url: None,
            metrics_url: None,
            metrics_token: None,
            allow_private_networks: false,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("bind_addr", &self.bind_addr)
            .field("freshness_window_secs", &self.freshness_window_secs)
            .field("lock_ttl_secs", &self.lock_ttl_secs)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("batch_concurrency", &self.batch_concurrency)
            .field("max_entries_per_fetch", &self.max_entries_per_fetch)
            .field("max_feed_bytes", &self.max_feed_bytes)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("cache_capacity", &self.cache_capacity)
            .field("queue_workers", &self.queue_workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("max_deliveries", &self.max_deliveries)
            .field("redelivery_delay_secs", &self.redelivery_delay_secs)
            .field("schedule_interval_minutes", &self.schedule_interval_minutes)
            .field("notify_url", &self.notify_url)
            .field("metrics_url", &self.metrics_url)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("allow_private_networks", &self.allow_private_networks)
            .finish()
    }
}

const KNOWN_KEYS: &[&str] = &[
    "database_path",
    "bind_addr",
    "freshness_window_secs",
    "lock_ttl_secs",
    "fetch_timeout_secs",
    "batch_concurrency",
    "max_entries_per_fetch",
    "max_feed_bytes",
    "cache_ttl_secs",
    "cache_capacity",
    "queue_workers",
    "queue_capacity",
    "max_deliveries",
    "redelivery_delay_secs",
    "schedule_interval_minutes",
    "notify_url",
    "metrics_url",
    "metrics_token",
    "allow_private_networks",
];

const ENV_PREFIX: &str = "FEEDSYNC_";

const MAX_SCHEDULE_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), database = %config.database_path, "Loaded configuration");
        Ok(config)
    }

    /// [`Config::load`] followed by overrides from the process environment.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Apply `FEEDSYNC_<KEY>` overrides, e.g. `FEEDSYNC_BIND_ADDR`.
    /// Variables without the prefix or naming no known key are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            if self.set(&key, &value)? {
                tracing::debug!(key = %key, "Config overridden from environment");
            }
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        fn num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        fn optional(value: &str) -> Option<String> {
            Some(value.trim().to_string()).filter(|v| !v.is_empty())
        }

        match key {
            "database_path" => self.database_path = value.to_string(),
            "bind_addr" => self.bind_addr = value.to_string(),
            "freshness_window_secs" => self.freshness_window_secs = num(key, value)?,
            "lock_ttl_secs" => self.lock_ttl_secs = num(key, value)?,
            "fetch_timeout_secs" => self.fetch_timeout_secs = num(key, value)?,
            "batch_concurrency" => self.batch_concurrency = num(key, value)?,
            "max_entries_per_fetch" => self.max_entries_per_fetch = num(key, value)?,
            "max_feed_bytes" => self.max_feed_bytes = num(key, value)?,
            "cache_ttl_secs" => self.cache_ttl_secs = num(key, value)?,
            "cache_capacity" => self.cache_capacity = num(key, value)?,
            "queue_workers" => self.queue_workers = num(key, value)?,
            "queue_capacity" => self.queue_capacity = num(key, value)?,
            "max_deliveries" => self.max_deliveries = num(key, value)?,
            "redelivery_delay_secs" => self.redelivery_delay_secs = num(key, value)?,
            "schedule_interval_minutes" => self.schedule_interval_minutes = num(key, value)?,
            "notify_url" => self.notify_url = optional(value),
            "metrics_url" => self.metrics_url = optional(value),
            "metrics_token" => self.metrics_token = optional(value),
            "allow_private_networks" => {
                self.allow_private_networks = match value.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        return Err(ConfigError::InvalidEnv {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            freshness_window: Duration::from_secs(self.freshness_window_secs),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs.max(1)),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            concurrency: self.batch_concurrency.max(1),
            max_entries: self.max_entries_per_fetch.max(1),
            max_bytes: self.max_feed_bytes,
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_secs(self.redelivery_delay_secs)
    }

    /// `None` when periodic scheduling is off. Capped at one year so the
    /// scheduler's tick deadline stays representable.
    pub fn schedule_interval(&self) -> Option<Duration> {
        (self.schedule_interval_minutes > 0).then(|| {
            Duration::from_secs(self.schedule_interval_minutes.saturating_mul(60))
                .min(MAX_SCHEDULE_INTERVAL)
        })
    }

    pub fn metrics_token(&self) -> Option<SecretString> {
        self.metrics_token.clone().map(SecretString::from)
    }
}

// ============================================================================
// Tests
// ============================================================================
