//! Configuration file parser for ~/.config/rss-aggregator/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as a warning, since they are
//! usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::sync::{RetryPolicy, SyncSettings};

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

    /// A value parsed but is outside its allowed range.
    #[error("Invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. Defaults to `rss.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Upper bound for a single feed request, body included.
    pub request_timeout_secs: u64,

    /// Responses larger than this are rejected.
    pub max_body_bytes: usize,

    /// `User-Agent` header sent with every feed request.
    pub user_agent: String,

    /// Retries after the first failed fetch attempt (retryable errors only).
    pub max_retries: u32,

    /// First backoff delay; doubles on each retry.
    pub retry_base_delay_ms: u64,

    /// Feeds refreshed in parallel during batch refreshes.
    pub max_concurrent: usize,

    /// Age after which another process's sync claim is treated as abandoned.
    pub claim_ttl_secs: u64,

    /// How often the scheduler looks for due feeds.
    pub scheduler_interval_secs: u64,

    /// Permit feeds on localhost and private networks. Off by default (SSRF).
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            request_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: format!("rss-aggregator/{}", env!("CARGO_PKG_VERSION")),
            max_retries: 3,
            retry_base_delay_ms: 2000,
            max_concurrent: 10,
            claim_ttl_secs: 300,
            scheduler_interval_secs: 60,
            allow_private_hosts: false,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 10] = [
        "database_path",
        "request_timeout_secs",
        "max_body_bytes",
        "user_agent",
        "max_retries",
        "retry_base_delay_ms",
        "max_concurrent",
        "claim_ttl_secs",
        "scheduler_interval_secs",
        "allow_private_hosts",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Zero timeout or concurrency → `Err(ConfigError::Invalid)`
    /// - Claim TTL not above the worst-case fetch time → `Err(ConfigError::Invalid)`
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
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text. Used by [`Config::load`].
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        tracing::info!(
            timeout_secs = config.request_timeout_secs,
            max_concurrent = config.max_concurrent,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                key: "max_concurrent",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.scheduler_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "scheduler_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }

        // A claim that expires mid-sync lets another process sync the same feed
        let longest_fetch = self.sync_settings().max_fetch_duration();
        if Duration::from_secs(self.claim_ttl_secs) <= longest_fetch {
            return Err(ConfigError::Invalid {
                key: "claim_ttl_secs",
                reason: format!(
                    "must exceed the longest possible fetch ({}s with request_timeout_secs, \
                     max_retries and retry_base_delay_ms as configured)",
                    longest_fetch.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// Resolve the database path, defaulting to `rss.db` inside `config_dir`.
    pub fn database_path_in(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("rss.db"))
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    /// Engine settings derived from this configuration.
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_body_bytes: self.max_body_bytes,
            user_agent: self.user_agent.clone(),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
            },
            max_concurrent: self.max_concurrent,
            claim_ttl: Duration::from_secs(self.claim_ttl_secs),
            allow_private_hosts: self.allow_private_hosts,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_concurrent, 10);
        assert!(!config.allow_private_hosts);
        assert!(config.user_agent.starts_with("rss-aggregator/"));
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/rss_aggregator_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_empty_file_returns_default() {
        let dir = std::env::temp_dir().join("rss_aggregator_config_test_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            request_timeout_secs = 5
            allow_private_hosts = true
            "#,
        )
        .unwrap();
        assert_eq!(config.request_timeout_secs, 5);
        assert!(config.allow_private_hosts);
        assert_eq!(config.max_concurrent, 10);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = Config::from_toml_str("theme = \"dark\"\nmax_retries = 1\n").unwrap();
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let err = Config::from_toml_str("request_timeout_secs = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_wrong_type_is_error() {
        let err = Config::from_toml_str("max_retries = \"three\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = Config::from_toml_str("request_timeout_secs = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "request_timeout_secs",
                ..
            }
        ));
    }

    #[test]
    fn test_claim_ttl_must_outlive_fetch() {
        // 2 attempts * 60s + 1s backoff = 121s
        let err = Config::from_toml_str(
            "request_timeout_secs = 60\nmax_retries = 1\nretry_base_delay_ms = 1000\nclaim_ttl_secs = 121",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "claim_ttl_secs",
                ..
            }
        ));

        let config = Config::from_toml_str(
            "request_timeout_secs = 60\nmax_retries = 1\nretry_base_delay_ms = 1000\nclaim_ttl_secs = 122",
        )
        .unwrap();
        assert_eq!(config.claim_ttl_secs, 122);

        // Defaults are consistent
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_database_path_default_and_override() {
        let dir = Path::new("/var/lib/rss");
        assert_eq!(
            Config::default().database_path_in(dir),
            PathBuf::from("/var/lib/rss/rss.db")
        );

        let config = Config::from_toml_str("database_path = \"/data/feeds.db\"").unwrap();
        assert_eq!(config.database_path_in(dir), PathBuf::from("/data/feeds.db"));
    }

    #[test]
    fn test_sync_settings_mapping() {
        let config =
            Config::from_toml_str("retry_base_delay_ms = 250\nclaim_ttl_secs = 600").unwrap();
        let settings = config.sync_settings();
        assert_eq!(settings.retry.base_delay, Duration::from_millis(250));
        assert_eq!(settings.claim_ttl, Duration::from_secs(600));
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
    }
}
