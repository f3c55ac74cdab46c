//! Run configuration.
//!
//! Stored as TOML, by default at `<config_dir>/mass-relay/config.toml`
//! (`~/.config/mass-relay/config.toml` on Linux):
//!
//! ```toml
//! remote_url = "https://ingest.example.com/api/files"
//! token = "..."
//! max_concurrent_uploads = 8
//! log_level = "info"
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 1000
//! backoff_multiplier = 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::retry::RetryPolicy;
use crate::{RelayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Upload endpoint. May be empty when only simulating.
    #[serde(default)]
    pub remote_url: String,

    /// Bearer token sent with every upload.
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Verbosity of the run log file (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub retry: RetrySettings,

    /// Run-wide deadline. Unset means no deadline.
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    /// How long in-flight uploads may keep running once the run is cancelled.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Per-request timeout for the HTTP client.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// CSV prefix table used to attach an identifier to each file.
    #[serde(default)]
    pub id_table: Option<PathBuf>,

    /// Query parameter carrying the looked-up identifier.
    #[serde(default = "default_id_param")]
    pub id_param: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_log_level() -> String {
    "info".into()
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_id_param() -> String {
    "id".into()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> u32 {
    2
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            token: String::new(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            log_level: default_log_level(),
            retry: RetrySettings::default(),
            deadline_secs: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            request_timeout_secs: None,
            id_table: None,
            id_param: default_id_param(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RelayError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| RelayError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(RelayError::InvalidConfig(
                "max_concurrent_uploads must be at least 1".into(),
            ));
        }
        if self.retry.backoff_multiplier == 0 {
            return Err(RelayError::InvalidConfig(
                "retry.backoff_multiplier must be at least 1".into(),
            ));
        }
        if self.id_param.is_empty() {
            return Err(RelayError::InvalidConfig("id_param must not be empty".into()));
        }
        self.log_filter()?;
        if !self.remote_url.is_empty() {
            self.endpoint()?;
        }
        Ok(())
    }

    /// The parsed upload endpoint. Fails when unset or malformed.
    pub fn endpoint(&self) -> Result<Url> {
        if self.remote_url.is_empty() {
            return Err(RelayError::InvalidConfig("remote_url is not set".into()));
        }
        let url = Url::parse(&self.remote_url)
            .map_err(|e| RelayError::InvalidConfig(format!("remote_url: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(RelayError::InvalidConfig(format!(
                "remote_url: unsupported scheme '{other}'"
            ))),
        }
    }

    pub fn log_filter(&self) -> Result<LevelFilter> {
        self.log_level
            .parse::<LevelFilter>()
            .map_err(|_| RelayError::InvalidConfig(format!("unknown log_level '{}'", self.log_level)))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_millis(self.retry.initial_delay_ms),
            self.retry.backoff_multiplier,
        )
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Returns the platform-specific default configuration path.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mass-relay")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_uploads, 4);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
            remote_url = "https://ingest.example.com/files"
            token = "secret"
            max_concurrent_uploads = 8
            log_level = "debug"
            deadline_secs = 3600
            id_table = "ids.csv"

            [retry]
            max_retries = 5
            initial_delay_ms = 250
            backoff_multiplier = 3
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.endpoint().unwrap().host_str(), Some("ingest.example.com"));
        assert_eq!(config.log_filter().unwrap(), LevelFilter::DEBUG);
        assert_eq!(config.deadline(), Some(Duration::from_secs(3600)));
        assert_eq!(config.id_table.as_deref(), Some(Path::new("ids.csv")));

        let policy = config.retry_policy();
        assert_eq!(policy.max_retries(), 5);
        assert_eq!(policy.delay_before_retry(2), Duration::from_millis(750));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config: Config = toml::from_str("max_concurrent_uploads = 0").unwrap();
        assert!(matches!(config.validate(), Err(RelayError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_bad_url_and_level() {
        let config: Config = toml::from_str("remote_url = \"ftp://x\"").unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("log_level = \"loud\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_path_on_parse_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_concurrent_uploads = \"many\"").unwrap();

        match Config::load(&path) {
            Err(RelayError::Config { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(config.remote_url.is_empty());
    }
}
