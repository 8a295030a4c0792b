//! Application configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then
//! `GSLB_WATCH__<SECTION>__<KEY>` environment variables, then CLI overrides.

use crate::client::HttpClientConfig;
use crate::resilience::health::DEFAULT_FAILURE_THRESHOLD;
use crate::resilience::{MonitorConfig, RetryConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "GSLB_WATCH";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub monitor: MonitorSettings,
    pub polling: PollingConfig,
    pub logging: LoggingConfig,
}

/// Gateway the dashboard talks to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the API gateway; `/health` and the feed paths hang off it
    pub base_url: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let http = HttpClientConfig::default();
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            user_agent: http.user_agent,
            connect_timeout_secs: http.connect_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub check_interval_secs: u64,
    pub initial_delay_secs: u64,
    pub probe_timeout_secs: u64,
    pub failure_threshold: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let monitor = MonitorConfig::default();
        Self {
            check_interval_secs: monitor.check_interval.as_secs(),
            initial_delay_secs: monitor.initial_delay.as_secs(),
            probe_timeout_secs: monitor.probe_timeout.as_secs(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Serializable form of [`RetryConfig`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryProfile {
    pub timeout_ms: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for RetryProfile {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryProfile {
    fn from(config: &RetryConfig) -> Self {
        Self {
            timeout_ms: millis(config.timeout),
            base_delay_ms: millis(config.base_delay),
            max_delay_ms: millis(config.max_delay),
            max_attempts: config.max_attempts,
            jitter: config.jitter,
        }
    }
}

impl From<&RetryProfile> for RetryConfig {
    fn from(profile: &RetryProfile) -> Self {
        Self {
            timeout: Duration::from_millis(profile.timeout_ms),
            base_delay: Duration::from_millis(profile.base_delay_ms),
            max_delay: Duration::from_millis(profile.max_delay_ms),
            max_attempts: profile.max_attempts,
            jitter: profile.jitter,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// How a successful fetch is folded into the data already held
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeMode {
    /// The response replaces the held data
    #[default]
    Replace,
    /// Array items whose `id` is not yet held are put in front, keeping newest first
    PrependById,
}

/// One periodically polled dashboard feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    /// Path (and query) relative to the gateway base URL
    pub path: String,
    /// Path used once the feed holds data; `path` is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_path: Option<String>,
    #[serde(default)]
    pub merge: MergeMode,
    #[serde(default = "default_feed_interval")]
    pub interval_secs: u64,
    #[serde(default = "initial_load_profile")]
    pub initial_retry: RetryProfile,
    #[serde(default = "polling_profile")]
    pub poll_retry: RetryProfile,
}

impl FeedConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            poll_path: None,
            merge: MergeMode::Replace,
            interval_secs: default_feed_interval(),
            initial_retry: initial_load_profile(),
            poll_retry: polling_profile(),
        }
    }

    /// Poll `poll_path` after the first successful load, folding results in with `merge`
    #[must_use]
    pub fn with_polling(mut self, poll_path: impl Into<String>, merge: MergeMode) -> Self {
        self.poll_path = Some(poll_path.into());
        self.merge = merge;
        self
    }

    #[must_use]
    pub fn poll_path(&self) -> &str {
        self.poll_path.as_deref().unwrap_or(&self.path)
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

const fn default_feed_interval() -> u64 {
    10
}

fn initial_load_profile() -> RetryProfile {
    RetryProfile::from(&RetryConfig::initial_load())
}

fn polling_profile() -> RetryProfile {
    RetryProfile::from(&RetryConfig::polling())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub feeds: Vec<FeedConfig>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            feeds: vec![
                FeedConfig::new("accidents", "/api/accidents/latest?limit=100")
                    .with_polling("/api/accidents/latest?limit=1", MergeMode::PrependById),
                FeedConfig::new("stats", "/api/accidents/stats"),
                FeedConfig::new("road-summary", "/api/road/summary"),
                FeedConfig::new("tollgate", "/api/tollgate/traffic"),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Command line overrides, applied after every other source
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl Config {
    /// Load from an optional TOML file plus the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_overrides(path, &ConfigOverrides::default())
    }

    /// Like [`Config::load`], applying CLI overrides before validation
    pub fn load_with_overrides(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(base_url) = &overrides.base_url {
            self.api.base_url.clone_from(base_url);
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level.clone_from(level);
        }
        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let base = self.base_url()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::invalid(
                "api.base_url",
                format!("unsupported scheme '{}'", base.scheme()),
            ));
        }

        if self.monitor.check_interval_secs == 0 {
            return Err(Error::invalid(
                "monitor.check_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.monitor.probe_timeout_secs == 0 {
            return Err(Error::invalid(
                "monitor.probe_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.monitor.failure_threshold == 0 {
            return Err(Error::invalid(
                "monitor.failure_threshold",
                "must be at least 1",
            ));
        }

        if self.polling.feeds.is_empty() {
            return Err(Error::invalid("polling.feeds", "at least one feed is required"));
        }
        for feed in &self.polling.feeds {
            if feed.name.trim().is_empty() {
                return Err(Error::invalid("polling.feeds.name", "must not be empty"));
            }
            if feed.interval_secs == 0 {
                return Err(Error::invalid(
                    format!("polling.feeds.{}.interval_secs", feed.name),
                    "must be greater than zero",
                ));
            }
            if feed.poll_path.as_deref().is_some_and(|p| p.trim().is_empty()) {
                return Err(Error::invalid(
                    format!("polling.feeds.{}.poll_path", feed.name),
                    "must not be empty",
                ));
            }
            RetryConfig::from(&feed.initial_retry).validate()?;
            RetryConfig::from(&feed.poll_retry).validate()?;
        }

        Ok(())
    }

    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.api.base_url).map_err(|e| {
            Error::invalid("api.base_url", format!("'{}': {e}", self.api.base_url))
        })
    }

    #[must_use]
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            connect_timeout: Duration::from_secs(self.api.connect_timeout_secs),
            user_agent: self.api.user_agent.clone(),
            ..HttpClientConfig::default()
        }
    }

    #[must_use]
    pub const fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            check_interval: Duration::from_secs(self.monitor.check_interval_secs),
            initial_delay: Duration::from_secs(self.monitor.initial_delay_secs),
            probe_timeout: Duration::from_secs(self.monitor.probe_timeout_secs),
        }
    }

    /// Render the effective configuration
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::invalid("config", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_monitor_and_retry_presets() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let monitor = config.monitor_config();
        assert_eq!(monitor.check_interval, Duration::from_secs(5));
        assert_eq!(monitor.initial_delay, Duration::from_secs(5));
        assert_eq!(monitor.probe_timeout, Duration::from_secs(3));
        assert_eq!(config.monitor.failure_threshold, 2);

        assert_eq!(config.polling.feeds.len(), 4);
        let feed = &config.polling.feeds[0];
        assert_eq!(RetryConfig::from(&feed.initial_retry), RetryConfig::initial_load());
        assert_eq!(RetryConfig::from(&feed.poll_retry), RetryConfig::polling());
        assert_eq!(feed.interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_accidents_feed_polls_incrementally() {
        let config = Config::default();
        let accidents = &config.polling.feeds[0];
        assert_eq!(accidents.path, "/api/accidents/latest?limit=100");
        assert_eq!(accidents.poll_path(), "/api/accidents/latest?limit=1");
        assert_eq!(accidents.merge, MergeMode::PrependById);

        let stats = &config.polling.feeds[1];
        assert_eq!(stats.poll_path(), stats.path);
        assert_eq!(stats.merge, MergeMode::Replace);

        let mut config = Config::default();
        config.polling.feeds[0].poll_path = Some(" ".to_string());
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.api.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));

        let mut config = Config::default();
        config.api.base_url = "ftp://gateway.local".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));

        let mut config = Config::default();
        config.monitor.failure_threshold = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));

        let mut config = Config::default();
        config.polling.feeds.clear();
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));

        let mut config = Config::default();
        config.polling.feeds[1].poll_retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));

        let mut config = Config::default();
        config.polling.feeds[2].initial_retry.base_delay_ms = 60_000;
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = Config::default();
        config.apply_overrides(&ConfigOverrides {
            base_url: Some("https://traffic.example.com".to_string()),
            log_level: Some("debug".to_string()),
            log_format: Some(LogFormat::Json),
        });

        assert_eq!(config.api.base_url, "https://traffic.example.com");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_toml_rendering_parses_back() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
