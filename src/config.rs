//! Configuration for Shelf Sync
//!
//! Values come from the process environment (a `.env` file is loaded first
//! by [`crate::init_logging`]). Anything unset falls back to [`SyncConfig::default`].

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ENV_DB_PATH: &str = "SHELF_SYNC_DB_PATH";
pub const ENV_API_URL: &str = "SHELF_SYNC_API_URL";
pub const ENV_API_TOKEN: &str = "SHELF_SYNC_API_TOKEN";
pub const ENV_TIMEOUT_SECS: &str = "SHELF_SYNC_TIMEOUT_SECS";
pub const ENV_MAX_RETRIES: &str = "SHELF_SYNC_MAX_RETRIES";
pub const ENV_RETENTION_DAYS: &str = "SHELF_SYNC_RETENTION_DAYS";
pub const ENV_FRESH_MINUTES: &str = "SHELF_SYNC_FRESH_MINUTES";
pub const ENV_STALE_HOURS: &str = "SHELF_SYNC_STALE_HOURS";

const DEFAULT_API_URL: &str = "http://localhost:3000/api";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETENTION_DAYS: i64 = 7;
const DEFAULT_FRESH_MINUTES: i64 = 60;
const DEFAULT_STALE_HOURS: i64 = 24;

const MAX_RETENTION_DAYS: i64 = 36_500;
const MAX_FRESH_MINUTES: i64 = 525_600;
const MAX_STALE_HOURS: i64 = 87_600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Could not determine a data directory")]
    NoDataDir,
}

/// Sync settings shared by the store, the gateway and the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// SQLite database file
    pub db_path: PathBuf,

    /// Base URL of the backend REST API
    pub api_base_url: String,

    /// Bearer token sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    /// HTTP request timeout
    pub request_timeout_secs: u64,

    /// Retry budget for actions enqueued without an explicit one
    pub default_max_retries: u32,

    /// Completed/failed audit records older than this are compacted
    pub completed_retention_days: i64,

    /// Data younger than this is reported as fresh
    pub fresh_threshold_minutes: i64,

    /// Data older than this is reported as expired
    pub stale_threshold_hours: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path().unwrap_or_else(|_| PathBuf::from("shelf-sync.db")),
            api_base_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            completed_retention_days: DEFAULT_RETENTION_DAYS,
            fresh_threshold_minutes: DEFAULT_FRESH_MINUTES,
            stale_threshold_hours: DEFAULT_STALE_HOURS,
        }
    }
}

impl SyncConfig {
    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(url) = lookup(ENV_API_URL) {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        config.api_token = lookup(ENV_API_TOKEN).filter(|t| !t.is_empty());

        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            config.request_timeout_secs = parse(ENV_TIMEOUT_SECS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            let retries: u32 = parse(ENV_MAX_RETRIES, &raw)?;
            if retries == 0 {
                return Err(ConfigError::InvalidValue { key: ENV_MAX_RETRIES, value: raw });
            }
            config.default_max_retries = retries;
        }
        if let Some(raw) = lookup(ENV_RETENTION_DAYS) {
            config.completed_retention_days =
                parse_in_range(ENV_RETENTION_DAYS, &raw, 0, MAX_RETENTION_DAYS)?;
        }
        if let Some(raw) = lookup(ENV_FRESH_MINUTES) {
            config.fresh_threshold_minutes =
                parse_in_range(ENV_FRESH_MINUTES, &raw, 1, MAX_FRESH_MINUTES)?;
        }
        if let Some(raw) = lookup(ENV_STALE_HOURS) {
            config.stale_threshold_hours =
                parse_in_range(ENV_STALE_HOURS, &raw, 1, MAX_STALE_HOURS)?;
        }

        log::debug!("Loaded sync config: {:?}", config);
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value: raw.to_string() })
}

/// Parse an integer and reject values outside `min..=max`
fn parse_in_range(key: &'static str, raw: &str, min: i64, max: i64) -> Result<i64, ConfigError> {
    let value: i64 = parse(key, raw)?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::InvalidValue { key, value: raw.to_string() });
    }
    Ok(value)
}

/// Platform data directory, e.g. `~/.local/share/shelf-sync/shelf-sync.db`
pub fn default_db_path() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("com", "shelf", "shelf-sync")
        .map(|dirs| dirs.data_dir().join("shelf-sync.db"))
        .ok_or(ConfigError::NoDataDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let config = SyncConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.default_max_retries, 5);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.api_base_url, DEFAULT_API_URL);
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_overrides_from_env() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            (ENV_DB_PATH, "/tmp/books.db"),
            (ENV_API_URL, "https://books.example.com/api/"),
            (ENV_API_TOKEN, "secret"),
            (ENV_MAX_RETRIES, "2"),
            (ENV_RETENTION_DAYS, "30"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/books.db"));
        assert_eq!(config.api_base_url, "https://books.example.com/api");
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.default_max_retries, 2);
        assert_eq!(config.completed_retention_days, 30);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = SyncConfig::from_lookup(lookup_from(&[(ENV_TIMEOUT_SECS, "soon")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key: ENV_TIMEOUT_SECS, .. })));

        let result = SyncConfig::from_lookup(lookup_from(&[(ENV_MAX_RETRIES, "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key: ENV_MAX_RETRIES, .. })));
    }

    #[test]
    fn test_duration_values_out_of_range_rejected() {
        let huge = i64::MAX.to_string();

        let result = SyncConfig::from_lookup(lookup_from(&[(ENV_RETENTION_DAYS, huge.as_str())]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key: ENV_RETENTION_DAYS, .. })));

        let result = SyncConfig::from_lookup(lookup_from(&[(ENV_RETENTION_DAYS, "-1")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key: ENV_RETENTION_DAYS, .. })));

        let result = SyncConfig::from_lookup(lookup_from(&[(ENV_FRESH_MINUTES, "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key: ENV_FRESH_MINUTES, .. })));

        let result = SyncConfig::from_lookup(lookup_from(&[(ENV_STALE_HOURS, huge.as_str())]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { key: ENV_STALE_HOURS, .. })));

        // Bounds themselves are accepted
        let config = SyncConfig::from_lookup(lookup_from(&[
            (ENV_RETENTION_DAYS, "0"),
            (ENV_STALE_HOURS, "87600"),
        ]))
        .unwrap();
        assert_eq!(config.completed_retention_days, 0);
        assert_eq!(config.stale_threshold_hours, 87_600);
    }
}
