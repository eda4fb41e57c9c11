//! Service configuration.
//!
//! Loaded from a TOML file where every field has a default, then overridden
//! from environment variables. The variable names are the ones the existing
//! deployment already sets (`BYBIT_BASE`, `KEEP_1M`, ...).

use crate::data::retry::RetryPolicy;
use crate::data::MAX_LIMIT;
use crate::domain::{normalize_symbol, Interval};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {name}: '{value}'")]
    Env { name: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub symbols: Vec<String>,
    pub upstream: UpstreamConfig,
    pub keep: KeepConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
}

/// Upstream kline API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Product category (`linear`, `inverse`, `spot`).
    pub category: String,
    /// Rows per call; the exchange allows at most 1000.
    pub per_call_cap: usize,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl UpstreamConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bybit.com".into(),
            category: "linear".into(),
            per_call_cap: MAX_LIMIT,
            timeout_secs: 15,
            max_attempts: 5,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 15_000,
        }
    }
}

/// Window capacity per interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepConfig {
    pub minute: usize,
    pub day: usize,
}

impl KeepConfig {
    pub fn for_interval(&self, interval: Interval) -> usize {
        match interval {
            Interval::Minute => self.minute,
            Interval::Day => self.day,
        }
    }

    pub fn set(&mut self, interval: Interval, keep: usize) {
        match interval {
            Interval::Minute => self.minute = keep,
            Interval::Day => self.day = keep,
        }
    }
}

impl Default for KeepConfig {
    fn default() -> Self {
        Self {
            minute: 300,
            day: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local; snapshots vanish on exit.
    Memory,
    /// JSON documents under `dir`, replaced atomically.
    File,
    /// Redis server shared with the API readers.
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub dir: PathBuf,
    /// zlib + base64 snapshot payloads.
    pub compress: bool,
    pub redis: RedisConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            dir: PathBuf::from("kline-store"),
            compress: false,
            redis: RedisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub connect_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Delay after a minute boundary before the minute job fires.
    pub minute_skew_ms: u64,
    /// Delay after the UTC day boundary before the day job fires.
    pub day_skew_ms: u64,
    /// At startup, skip the day resync when this close to the day job.
    pub startup_guard_secs: u64,
    pub use_lock: bool,
    pub lock_ttl_secs: u64,
}

impl ScheduleConfig {
    pub fn skew_ms(&self, interval: Interval) -> u64 {
        match interval {
            Interval::Minute => self.minute_skew_ms,
            Interval::Day => self.day_skew_ms,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            minute_skew_ms: 1_500,
            day_skew_ms: 2_000,
            startup_guard_secs: 120,
            use_lock: true,
            lock_ttl_secs: 300,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            upstream: UpstreamConfig::default(),
            keep: KeepConfig::default(),
            storage: StorageConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl Config {
    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_with<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("BYBIT_BASE") {
            self.upstream.base_url = v;
        }
        if let Some(v) = get("CATEGORY") {
            self.upstream.category = v;
        }
        if let Some(v) = get("LIMIT_PER_CALL") {
            self.upstream.per_call_cap = parse_env("LIMIT_PER_CALL", &v)?;
        }
        if let Some(v) = get("SKEW_MS_1M") {
            self.schedule.minute_skew_ms = parse_env("SKEW_MS_1M", &v)?;
        }
        if let Some(v) = get("SKEW_MS_1D") {
            self.schedule.day_skew_ms = parse_env("SKEW_MS_1D", &v)?;
        }
        // KEEP is the fallback for both intervals
        if let Some(v) = get("KEEP") {
            let keep = parse_env("KEEP", &v)?;
            self.keep = KeepConfig {
                minute: keep,
                day: keep,
            };
        }
        if let Some(v) = get("KEEP_1M") {
            self.keep.minute = parse_env("KEEP_1M", &v)?;
        }
        if let Some(v) = get("KEEP_1D") {
            self.keep.day = parse_env("KEEP_1D", &v)?;
        }
        if let Some(v) = get("COMPRESS_JSON") {
            self.storage.compress = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = get("KLINECACHE_STORE_DIR") {
            self.storage.dir = PathBuf::from(v);
        }
        if let Some(v) = get("KLINECACHE_BACKEND") {
            self.storage.backend = match v.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "file" => StorageBackend::File,
                "redis" => StorageBackend::Redis,
                _ => {
                    return Err(ConfigError::Env {
                        name: "KLINECACHE_BACKEND",
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = get("REDIS_HOST") {
            self.storage.redis.host = v;
        }
        if let Some(v) = get("REDIS_PORT") {
            self.storage.redis.port = parse_env("REDIS_PORT", &v)?;
        }
        if let Some(v) = get("REDIS_PASSWORD") {
            self.storage.redis.password = Some(v);
        }
        if let Some(v) = get("SYMBOLS") {
            self.symbols = v.split(',').map(str::to_string).collect();
        }
        Ok(())
    }

    /// Normalize symbols and reject settings the service cannot run with.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        // first occurrence wins, order kept
        let mut seen = BTreeSet::new();
        let symbols: Vec<String> = self
            .symbols
            .iter()
            .map(|s| normalize_symbol(s))
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
        if symbols.is_empty() {
            return Err(ConfigError::Invalid("symbol list is empty".into()));
        }
        self.symbols = symbols;

        for interval in Interval::ALL {
            if self.keep.for_interval(interval) == 0 {
                return Err(ConfigError::Invalid(format!("keep for {interval} must be at least 1")));
            }
        }
        if !(1..=MAX_LIMIT).contains(&self.upstream.per_call_cap) {
            return Err(ConfigError::Invalid(format!(
                "per_call_cap must be within 1..={MAX_LIMIT}, got {}",
                self.upstream.per_call_cap
            )));
        }
        if self.upstream.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// File, then environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env {
        name,
        value: value.to_string(),
    })
}
