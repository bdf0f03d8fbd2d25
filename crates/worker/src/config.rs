//! Worker process settings.

use std::time::Duration;

use ingestq_infra::jobs::config::parse_var;
use ingestq_infra::jobs::{ConfigError, QueueConfig};
use ingestq_observability::LogFormat;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_TICK_INTERVAL_SECS: &str = "INGESTQ_TICK_INTERVAL_SECS";
pub const ENV_DB_MAX_CONNECTIONS: &str = "INGESTQ_DB_MAX_CONNECTIONS";
pub const ENV_INGEST_ENDPOINT: &str = "INGESTQ_INGEST_ENDPOINT";
pub const ENV_LOG_FORMAT: &str = "INGESTQ_LOG_FORMAT";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub tick_interval: Duration,
    /// Base URL of the ingestion service handlers forward to.
    pub ingest_endpoint: String,
    pub log_format: LogFormat,
    pub queue: QueueConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::Missing(key.to_string()))
        };

        let database_url = required(ENV_DATABASE_URL)?;
        let ingest_endpoint = required(ENV_INGEST_ENDPOINT)?;
        if !(ingest_endpoint.starts_with("http://") || ingest_endpoint.starts_with("https://")) {
            return Err(ConfigError::invalid(ENV_INGEST_ENDPOINT, "must be an http(s) URL"));
        }

        let tick_interval = parse_var::<u64, _>(&lookup, ENV_TICK_INTERVAL_SECS)?.unwrap_or(30);
        if tick_interval == 0 {
            return Err(ConfigError::invalid(ENV_TICK_INTERVAL_SECS, "must be at least 1"));
        }
        let max_connections = parse_var::<u32, _>(&lookup, ENV_DB_MAX_CONNECTIONS)?.unwrap_or(10);
        if max_connections == 0 {
            return Err(ConfigError::invalid(ENV_DB_MAX_CONNECTIONS, "must be at least 1"));
        }
        let log_format = parse_var::<LogFormat, _>(&lookup, ENV_LOG_FORMAT)?.unwrap_or_default();

        Ok(Self {
            database_url,
            max_connections,
            tick_interval: Duration::from_secs(tick_interval),
            ingest_endpoint: ingest_endpoint.trim_end_matches('/').to_string(),
            log_format,
            queue: QueueConfig::from_lookup(&lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const BASE: [(&str, &str); 2] = [
        (ENV_DATABASE_URL, "postgres://localhost/ingest"),
        (ENV_INGEST_ENDPOINT, "http://ingest.internal:8080/"),
    ];

    #[test]
    fn defaults_with_required_settings() {
        let config = WorkerConfig::from_lookup(lookup(&BASE)).unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(30));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.ingest_endpoint, "http://ingest.internal:8080");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn missing_database_url() {
        let err = WorkerConfig::from_lookup(lookup(&BASE[1..])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(ENV_DATABASE_URL.to_string()));
    }

    #[test]
    fn overrides_and_queue_settings() {
        let mut vars = BASE.to_vec();
        vars.extend([
            (ENV_TICK_INTERVAL_SECS, "5"),
            (ENV_LOG_FORMAT, "pretty"),
            ("INGESTQ_BATCH_SIZE", "12"),
        ]);
        let config = WorkerConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.queue.batch_size, 12);
    }

    #[test]
    fn rejects_bad_values() {
        let mut vars = BASE.to_vec();
        vars.push((ENV_TICK_INTERVAL_SECS, "0"));
        assert!(WorkerConfig::from_lookup(lookup(&vars)).is_err());

        let mut vars = BASE.to_vec();
        vars.push((ENV_LOG_FORMAT, "xml"));
        assert!(matches!(
            WorkerConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::Invalid { key, .. }) if key == ENV_LOG_FORMAT
        ));
    }
}
