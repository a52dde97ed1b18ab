use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use logwarden_pipeline::{IngestOptions, RetryPolicy};

/// Default pool size.
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
/// Default records per persistence batch.
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;
const DEFAULT_REPORT_DIR: &str = "reports";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} must be a valid {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Application configuration loaded from environment variables.
///
/// Command-line flags override individual fields after loading.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL connection string. Only required when a database is used.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub batch_size: usize,
    pub store_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub store_retry_attempts: u32,
    pub max_line_bytes: usize,
    pub report_dir: PathBuf,
}

impl AppConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default     |
    /// |----------------------------------|-------------|
    /// | `DATABASE_URL`                   | --          |
    /// | `DB_MAX_CONNECTIONS`             | `10`        |
    /// | `LOGWARDEN_BATCH_SIZE`           | `500`       |
    /// | `LOGWARDEN_STORE_TIMEOUT_SECS`   | `30`        |
    /// | `LOGWARDEN_READ_TIMEOUT_SECS`    | `30`        |
    /// | `LOGWARDEN_QUERY_TIMEOUT_SECS`   | `60`        |
    /// | `LOGWARDEN_STORE_RETRY_ATTEMPTS` | `3`         |
    /// | `LOGWARDEN_MAX_LINE_BYTES`       | `65536`     |
    /// | `LOGWARDEN_REPORT_DIR`           | `reports`   |
    ///
    /// Sizes and timeouts must be positive.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: get("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            db_max_connections: parse_positive(&get, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            batch_size: parse_positive(&get, "LOGWARDEN_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            store_timeout_secs: parse_positive(&get, "LOGWARDEN_STORE_TIMEOUT_SECS", DEFAULT_STORE_TIMEOUT_SECS)?,
            read_timeout_secs: parse_positive(&get, "LOGWARDEN_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT_SECS)?,
            query_timeout_secs: parse_positive(&get, "LOGWARDEN_QUERY_TIMEOUT_SECS", DEFAULT_QUERY_TIMEOUT_SECS)?,
            store_retry_attempts: parse_positive(
                &get,
                "LOGWARDEN_STORE_RETRY_ATTEMPTS",
                DEFAULT_STORE_RETRY_ATTEMPTS,
            )?,
            max_line_bytes: parse_positive(&get, "LOGWARDEN_MAX_LINE_BYTES", DEFAULT_MAX_LINE_BYTES)?,
            report_dir: get("LOGWARDEN_REPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_DIR)),
        })
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            batch_size: self.batch_size,
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            store_timeout: self.store_timeout(),
            retry: RetryPolicy {
                max_attempts: self.store_retry_attempts,
                ..RetryPolicy::default()
            },
            max_line_bytes: self.max_line_bytes,
            ..IngestOptions::default()
        }
    }
}

/// Parse an unsigned count or duration, rejecting zero.
fn parse_positive<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
{
    let Some(value) = get(var) else {
        return Ok(default);
    };
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed != T::default() => Ok(parsed),
        _ => Err(ConfigError::Invalid {
            var,
            value,
            expected: "positive integer",
        }),
    }
}
