//! Queue tuning knobs.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const ENV_BATCH_SIZE: &str = "INGESTQ_BATCH_SIZE";
pub const ENV_STALE_THRESHOLD_SECS: &str = "INGESTQ_STALE_THRESHOLD_SECS";
pub const ENV_HEARTBEAT_INTERVAL_SECS: &str = "INGESTQ_HEARTBEAT_INTERVAL_SECS";
pub const ENV_MAX_ATTEMPTS: &str = "INGESTQ_MAX_ATTEMPTS";
pub const ENV_DEFAULT_PRIORITY: &str = "INGESTQ_DEFAULT_PRIORITY";
pub const ENV_WORKER_NAME: &str = "INGESTQ_WORKER_NAME";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("missing required setting {0}")]
    Missing(String),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Jobs claimed per tick.
    pub batch_size: usize,
    /// Heartbeat age after which a processing job counts as abandoned.
    pub stale_threshold: Duration,
    /// How often a running job renews its heartbeat.
    pub heartbeat_interval: Duration,
    /// `max_attempts` for jobs enqueued without one.
    pub default_max_attempts: u32,
    /// `priority` for jobs enqueued without one.
    pub default_priority: i32,
    /// Name for logging.
    pub worker_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            stale_threshold: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(60),
            default_max_attempts: 3,
            default_priority: 0,
            worker_name: "ingestq-worker".to_string(),
        }
    }
}

impl QueueConfig {
    /// Defaults overlaid with whatever `INGESTQ_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading from an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<usize, _>(&lookup, ENV_BATCH_SIZE)? {
            config.batch_size = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, ENV_STALE_THRESHOLD_SECS)? {
            config.stale_threshold = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, ENV_HEARTBEAT_INTERVAL_SECS)? {
            config.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, ENV_MAX_ATTEMPTS)? {
            config.default_max_attempts = v;
        }
        if let Some(v) = parse_var::<i32, _>(&lookup, ENV_DEFAULT_PRIORITY)? {
            config.default_priority = v;
        }
        if let Some(v) = lookup(ENV_WORKER_NAME).filter(|v| !v.trim().is_empty()) {
            config.worker_name = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn with_default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Reject settings that would break the queue's guarantees.
    ///
    /// A heartbeat interval at or above the stale threshold would let healthy
    /// jobs be recovered out from under their worker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid(ENV_BATCH_SIZE, "must be at least 1"));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::invalid(ENV_MAX_ATTEMPTS, "must be at least 1"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid(
                ENV_HEARTBEAT_INTERVAL_SECS,
                "must be greater than zero",
            ));
        }
        if self.heartbeat_interval >= self.stale_threshold {
            return Err(ConfigError::invalid(
                ENV_HEARTBEAT_INTERVAL_SECS,
                format!(
                    "heartbeat interval ({}s) must be shorter than the stale threshold ({}s)",
                    self.heartbeat_interval.as_secs(),
                    self.stale_threshold.as_secs()
                ),
            ));
        }
        Ok(())
    }
}

/// Parse an optional variable; empty values count as unset.
pub fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
        _ => Ok(None),
    }
}
