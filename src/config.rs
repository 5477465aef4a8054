//! Engine configuration from an optional TOML file.
//!
//! A missing or empty file yields `Config::default()`. Unknown keys are
//! accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::feed::{FetchSettings, RetrieveSettings};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but is out of range
    #[error("Invalid config value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be given.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file
    pub database_path: String,

    /// User-Agent sent with every feed request
    pub user_agent: String,

    pub fetch_timeout_secs: u64,

    /// Feed documents larger than this are rejected
    pub max_feed_bytes: usize,

    /// Retries for 429, 5xx and truncated responses
    pub max_retries: u32,

    pub retry_base_delay_ms: u64,

    /// Entries considered per fetch
    pub max_items_per_fetch: usize,

    /// Entries published longer ago than this are not imported
    pub import_window_days: u64,

    /// Refresh interval given to sources created without one
    pub default_refresh_interval_secs: i64,

    /// Overdue sources are spread over this many seconds
    pub stagger_window_secs: u64,

    /// Parallel fetches during a refresh-all
    pub refresh_concurrency: usize,

    /// 0 disables the background pruning loop
    pub prune_interval_hours: u64,

    pub retention_days: u64,

    /// Items deleted per pruning run
    pub prune_batch_size: usize,

    pub excerpt_chars: usize,

    /// Allow feed URLs on localhost and private networks
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "feedmill.db".to_string(),
            user_agent: concat!("feedmill/", env!("CARGO_PKG_VERSION")).to_string(),
            fetch_timeout_secs: 30,
            max_feed_bytes: 10 * 1024 * 1024,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            max_items_per_fetch: 50,
            import_window_days: 7,
            default_refresh_interval_secs: 3600,
            stagger_window_secs: 60,
            refresh_concurrency: 10,
            prune_interval_hours: 24,
            retention_days: 30,
            prune_batch_size: 100,
            excerpt_chars: 300,
            allow_private_hosts: false,
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "database_path",
    "user_agent",
    "fetch_timeout_secs",
    "max_feed_bytes",
    "max_retries",
    "retry_base_delay_ms",
    "max_items_per_fetch",
    "import_window_days",
    "default_refresh_interval_secs",
    "stagger_window_secs",
    "refresh_concurrency",
    "prune_interval_hours",
    "retention_days",
    "prune_batch_size",
    "excerpt_chars",
    "allow_private_hosts",
];

const SECS_PER_DAY: u64 = 24 * 60 * 60;

impl Config {
    /// Maximum config file size (1 MB)
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
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
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), database = %config.database_path, "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate TOML text. Blank text yields the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            }
        }

        if self.database_path.trim().is_empty() {
            return Err(invalid("database_path", "must not be empty"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(invalid("fetch_timeout_secs", "must be at least 1"));
        }
        if self.max_feed_bytes == 0 {
            return Err(invalid("max_feed_bytes", "must be at least 1"));
        }
        if self.default_refresh_interval_secs <= 0 {
            return Err(invalid("default_refresh_interval_secs", "must be positive"));
        }
        if self.refresh_concurrency == 0 {
            return Err(invalid("refresh_concurrency", "must be at least 1"));
        }
        if self.prune_batch_size == 0 {
            return Err(invalid("prune_batch_size", "must be at least 1"));
        }
        if self.excerpt_chars == 0 {
            return Err(invalid("excerpt_chars", "must be at least 1"));
        }
        Ok(())
    }

    pub fn retrieve_settings(&self) -> RetrieveSettings {
        RetrieveSettings {
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_bytes: self.max_feed_bytes,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            max_items: self.max_items_per_fetch,
            import_window: Duration::from_secs(self.import_window_days.saturating_mul(SECS_PER_DAY)),
            excerpt_chars: self.excerpt_chars,
        }
    }

    pub fn stagger_window(&self) -> Duration {
        Duration::from_secs(self.stagger_window_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(SECS_PER_DAY))
    }

    /// `None` when background pruning is disabled
    pub fn prune_interval(&self) -> Option<Duration> {
        (self.prune_interval_hours > 0)
            .then(|| Duration::from_secs(self.prune_interval_hours.saturating_mul(60 * 60)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_config(name: &str, content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("feedmill_config_test_{}", name));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.max_feed_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_items_per_fetch, 50);
        assert_eq!(config.import_window_days, 7);
        assert_eq!(config.stagger_window_secs, 60);
        assert_eq!(config.refresh_concurrency, 10);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.prune_batch_size, 100);
        assert_eq!(config.excerpt_chars, 300);
        assert!(!config.allow_private_hosts);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedmill_test_nonexistent_config.toml");
        assert_eq!(Config::load(path).unwrap(), Config::default());
    }

    #[test]
    fn test_empty_file_returns_default() {
        let path = temp_config("empty", "  \n");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let path = temp_config(
            "partial",
            "database_path = \"/var/lib/feedmill/feeds.db\"\nretention_days = 14\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.database_path, "/var/lib/feedmill/feeds.db");
        assert_eq!(config.retention_days, 14);
        assert_eq!(config.prune_batch_size, 100);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::from_toml_str("theme = \"dark\"\nmax_retries = 5\n").unwrap();
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        assert!(matches!(
            Config::from_toml_str("max_retries = \"three\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_toml_str("this is not toml"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        match Config::from_toml_str("refresh_concurrency = 0") {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "refresh_concurrency"),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_oversize_file_rejected() {
        let path = temp_config("oversize", &"# padding\n".repeat(120_000));
        assert!(matches!(Config::load(&path), Err(ConfigError::TooLarge(_))));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::from_toml_str(
            "fetch_timeout_secs = 5\nretry_base_delay_ms = 10\nimport_window_days = 2\nprune_interval_hours = 0\n",
        )
        .unwrap();

        let retrieve = config.retrieve_settings();
        assert_eq!(retrieve.timeout, Duration::from_secs(5));
        assert_eq!(retrieve.retry_base_delay, Duration::from_millis(10));
        assert_eq!(
            config.fetch_settings().import_window,
            Duration::from_secs(2 * 24 * 60 * 60)
        );
        assert_eq!(config.prune_interval(), None);
        assert_eq!(config.retention(), Duration::from_secs(30 * 24 * 60 * 60));
    }
}
