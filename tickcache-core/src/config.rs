//! Settings file and environment secrets.
//!
//! Settings live in a TOML file where every field has a default, so an empty
//! file (or no file) is a valid configuration. Secrets are never read from the
//! file: clients pull them from the environment when they are constructed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const STORE_PATH_ENV: &str = "TICKCACHE_STORE";
pub const POLYGON_API_KEY: &str = "POLYGON_API_KEY";
pub const TDA_API_KEY: &str = "TDA_API_KEY";
pub const TDA_TOKEN_PATH: &str = "TDA_TOKEN_PATH";
pub const TDA_ACCOUNT_ID: &str = "TDA_ACCOUNT_ID";
pub const TDA_REDIRECT_URI: &str = "TDA_REDIRECT_URI";

/// Most symbols one realtime stream may subscribe.
pub const MAX_REALTIME_SYMBOLS: usize = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing secret: environment variable {0} is not set")]
    MissingSecret(&'static str),

    #[error("read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse settings: {0}")]
    Parse(String),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Admission limits for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub interval_secs: f64,
    pub max_in_flight: u32,
    pub retries: u32,
}

impl RateLimit {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub tda: RateLimit,
    pub polygon: RateLimit,
    pub finviz: RateLimit,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            tda: RateLimit {
                interval_secs: 1.0,
                max_in_flight: 2,
                retries: 3,
            },
            polygon: RateLimit {
                interval_secs: 12.0,
                max_in_flight: 1,
                retries: 3,
            },
            finviz: RateLimit {
                interval_secs: 1.0,
                max_in_flight: 4,
                retries: 2,
            },
        }
    }
}

/// Sleep before retry `i` is `i^2 * unit`, never more than `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub unit_ms: u64,
    pub cap_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            unit_ms: 1_000,
            cap_ms: 30_000,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = u64::from(attempt)
            .saturating_mul(u64::from(attempt))
            .saturating_mul(self.unit_ms)
            .min(self.cap_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseSettings {
    /// Explicit symbols. When empty, the universe is the top `top_n` by volume.
    pub symbols: Vec<String>,
    pub top_n: usize,
}

impl Default for UniverseSettings {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            top_n: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub symbols: Vec<String>,
    pub realtime: bool,
    pub buffer_size: u64,
    pub flush_interval_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            realtime: true,
            buffer_size: 100_000_000,
            flush_interval_secs: 60,
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store_path: PathBuf,
    pub worker_budget: usize,
    pub rate_limits: RateLimits,
    pub backoff: Backoff,
    pub universe: UniverseSettings,
    pub stream: StreamSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/tickcache.db"),
            worker_budget: 8,
            rate_limits: RateLimits::default(),
            backoff: Backoff::default(),
            universe: UniverseSettings::default(),
            stream: StreamSettings::default(),
        }
    }
}

impl Settings {
    /// Load from `path` (missing file means defaults), then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&content)?
            }
            _ => Self::default(),
        };
        if let Ok(store) = std::env::var(STORE_PATH_ENV) {
            if !store.is_empty() {
                settings.store_path = PathBuf::from(store);
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_budget == 0 {
            return Err(ConfigError::Invalid("worker_budget must be at least 1".into()));
        }
        for (name, limit) in [
            ("tda", &self.rate_limits.tda),
            ("polygon", &self.rate_limits.polygon),
            ("finviz", &self.rate_limits.finviz),
        ] {
            if limit.max_in_flight == 0 || limit.retries == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limits.{name}: max_in_flight and retries must be positive"
                )));
            }
        }
        if self.stream.realtime && self.stream.symbols.len() > MAX_REALTIME_SYMBOLS {
            return Err(ConfigError::Invalid(format!(
                "stream.symbols: at most {MAX_REALTIME_SYMBOLS} realtime symbols, got {}",
                self.stream.symbols.len()
            )));
        }
        Ok(())
    }
}

/// Read a secret from the environment.
pub fn require_secret(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingSecret(name)),
    }
}
