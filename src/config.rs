//! Runtime configuration: backoff schedule and poll limits.
//!
//! Loaded from JSON (`RuntimeConfig::from_json`) or from `DISK_FLOWS_*`
//! environment variables (`RuntimeConfig::from_env`). Every field has a
//! default, so partial documents are accepted.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const ENV_BACKOFF_INITIAL_MS: &str = "DISK_FLOWS_BACKOFF_INITIAL_MS";
pub const ENV_BACKOFF_MULTIPLIER: &str = "DISK_FLOWS_BACKOFF_MULTIPLIER";
pub const ENV_BACKOFF_MAX_MS: &str = "DISK_FLOWS_BACKOFF_MAX_MS";
pub const ENV_POLL_MAX_ATTEMPTS: &str = "DISK_FLOWS_POLL_MAX_ATTEMPTS";
pub const ENV_POLL_MAX_DURATION_MS: &str = "DISK_FLOWS_POLL_MAX_DURATION_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),
    #[error("invalid poll limits: {0}")]
    InvalidPoll(String),
}

/// Shape of the wait schedule between polls: starts at `initial_ms`, grows by
/// `multiplier` per step and holds at `max_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub multiplier: u32,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            multiplier: 2,
            max_ms: 8_000,
        }
    }
}

/// Limits on a single poll loop. `None` disables a limit; with both disabled a
/// loop only ends on convergence or cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub max_attempts: Option<u32>,
    pub max_duration_ms: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            max_duration_ms: Some(600_000),
        }
    }
}

impl PollConfig {
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            max_duration_ms: None,
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backoff: BackoffConfig,
    pub poll: PollConfig,
}

impl RuntimeConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(doc: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `DISK_FLOWS_*` variables present in the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with a caller-supplied variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = RuntimeConfig::default();
        if let Some(v) = parse_var(&lookup, ENV_BACKOFF_INITIAL_MS)? {
            config.backoff.initial_ms = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_BACKOFF_MULTIPLIER)? {
            config.backoff.multiplier = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_BACKOFF_MAX_MS)? {
            config.backoff.max_ms = v;
        }
        if let Some(v) = parse_limit(&lookup, ENV_POLL_MAX_ATTEMPTS)? {
            config.poll.max_attempts = v;
        }
        if let Some(v) = parse_limit(&lookup, ENV_POLL_MAX_DURATION_MS)? {
            config.poll.max_duration_ms = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.backoff;
        if b.initial_ms == 0 {
            return Err(ConfigError::InvalidBackoff("initial_ms must be positive".into()));
        }
        if b.multiplier == 0 {
            return Err(ConfigError::InvalidBackoff("multiplier must be at least 1".into()));
        }
        if b.max_ms < b.initial_ms {
            return Err(ConfigError::InvalidBackoff(format!(
                "max_ms ({}) is below initial_ms ({})",
                b.max_ms, b.initial_ms
            )));
        }
        // The first fetch always happens.
        if self.poll.max_attempts == Some(0) {
            return Err(ConfigError::InvalidPoll("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
    }
}

// "none" clears a limit; a number sets it.
fn parse_limit<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Option<T>>, ConfigError> {
    match lookup(key) {
        Some(raw) if raw.trim().eq_ignore_ascii_case("none") => Ok(Some(None)),
        Some(_) => Ok(parse_var(lookup, key)?.map(Some)),
        None => Ok(None),
    }
}
