//! Typed configuration surface: TOML file + environment variable overlay.
//!
//! Mirrors the teacher's `app_config` split between a file-shaped struct and
//! a validation pass, but leans on `serde` + the `toml` crate for parsing
//! instead of a hand-rolled line parser, since the config tree here has
//! nested groups that a `key = value` scanner can't represent cleanly.
//! Environment variables (prefix `RECONCILER_`) are applied after the file
//! load and win on conflict, per spec.md §6.

use std::env;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Top-level config, deserialized from TOML and then overlaid with
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub webhook: WebhookConfig,
    pub monitoring: MonitoringConfig,
    pub trackers: TrackerConfig,
    pub logging: LoggingConfig,
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            webhook: WebhookConfig::default(),
            monitoring: MonitoringConfig::default(),
            trackers: TrackerConfig::default(),
            logging: LoggingConfig::default(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub url: String,
    pub api_key: String,
    pub timeout_s: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { url: String::new(), api_key: String::new(), timeout_s: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Shared secret. `None` means "not configured" — the endpoint still
    /// serves (spec.md §4.5) but a warning is logged once at startup, and
    /// one is auto-generated so the process has *some* secret in memory.
    pub secret: Option<String>,
    pub import_check_delay_s: u64,
    pub rate_limit_per_min: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 7878,
            secret: None,
            import_check_delay_s: 600,
            rate_limit_per_min: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub interval_s: u64,
    pub force_import_threshold: i64,
    /// Minimum count of `downloadFailed`/`importFailed` history events
    /// within the last 24h required before a `remove_public` decision is
    /// actually executed, in addition to the score gap. Guards against
    /// blocklisting a release on one noisy score sample. Zero disables the
    /// gate (every `remove_public` decision executes immediately).
    pub remove_public_failures: u32,
    /// Whether an unknown-class removal candidate is conservatively kept
    /// rather than removed (spec.md's chosen default; see [`crate::analyzer::Thresholds`]).
    pub protect_private_ratio: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_s: 60,
            force_import_threshold: 10,
            remove_public_failures: 0,
            protect_private_ratio: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub private: Vec<String>,
    pub public: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Human }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Human,
}

/// Fatal at startup: a missing required field or a file that failed to
/// parse.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, #[source] source: toml::de::Error },
    #[error("missing required config value: {0}")]
    MissingRequired(&'static str),
}

impl Config {
    /// Loads `path` as TOML, overlays `RECONCILER_*` environment variables,
    /// and validates required fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        let mut config: Self = toml::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;
        config.apply_env_overlay();
        config.validate()?;
        Ok(config)
    }

    /// Applies `RECONCILER_*` environment variable overrides, if present.
    /// Called automatically by [`Config::load`]; exposed separately so
    /// tests can build a base [`Config`] in code and overlay on it directly.
    pub fn apply_env_overlay(&mut self) {
        if let Ok(value) = env::var("RECONCILER_MANAGER_URL") {
            self.manager.url = value;
        }
        if let Ok(value) = env::var("RECONCILER_MANAGER_API_KEY") {
            self.manager.api_key = value;
        }
        if let Ok(value) = env::var("RECONCILER_MANAGER_TIMEOUT_S")
            && let Ok(parsed) = value.parse()
        {
            self.manager.timeout_s = parsed;
        }
        if let Ok(value) = env::var("RECONCILER_WEBHOOK_SECRET") {
            self.webhook.secret = Some(value);
        }
        if let Ok(value) = env::var("RECONCILER_WEBHOOK_PORT")
            && let Ok(parsed) = value.parse()
        {
            self.webhook.port = parsed;
        }
        if let Ok(value) = env::var("RECONCILER_DRY_RUN")
            && let Ok(parsed) = value.parse()
        {
            self.dry_run = parsed;
        }
    }

    /// Validates required fields: manager URL and API key (spec.md §6).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manager.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("manager.url"));
        }
        if self.manager.api_key.trim().is_empty() {
            return Err(ConfigError::MissingRequired("manager.api_key"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = Config::default();
        assert_eq!(config.manager.timeout_s, 30);
        assert_eq!(config.webhook.rate_limit_per_min, 30);
        assert_eq!(config.webhook.import_check_delay_s, 600);
        assert_eq!(config.monitoring.interval_s, 60);
        assert_eq!(config.monitoring.force_import_threshold, 10);
        assert!(config.monitoring.protect_private_ratio);
    }

    #[test]
    fn validate_rejects_missing_manager_url() {
        let mut config = Config::default();
        config.manager.api_key = "key".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired("manager.url"))));
    }

    #[test]
    fn validate_rejects_missing_api_key() {
        let mut config = Config::default();
        config.manager.url = "http://localhost:8989".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired("manager.api_key"))));
    }

    #[test]
    fn validate_passes_with_required_fields() {
        let mut config = Config::default();
        config.manager.url = "http://localhost:8989".to_string();
        config.manager.api_key = "key".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_full_toml_document() {
        let toml_str = r#"
            dry_run = true

            [manager]
            url = "http://sonarr.local:8989"
            api_key = "abc123"
            timeout_s = 10

            [webhook]
            enabled = true
            host = "127.0.0.1"
            port = 9000
            secret = "shh"
            import_check_delay_s = 120
            rate_limit_per_min = 60

            [monitoring]
            interval_s = 30
            force_import_threshold = 15
            remove_public_failures = 2
            protect_private_ratio = true

            [trackers]
            private = ["BeyondHD"]
            public = ["nyaa", "AnimeTosho"]

            [logging]
            level = "debug"
            format = "json"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.dry_run);
        assert_eq!(config.manager.url, "http://sonarr.local:8989");
        assert_eq!(config.webhook.port, 9000);
        assert_eq!(config.webhook.secret.as_deref(), Some("shh"));
        assert_eq!(config.monitoring.remove_public_failures, 2);
        assert_eq!(config.trackers.public, vec!["nyaa", "AnimeTosho"]);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn env_overlay_wins_over_file_value() {
        let mut config = Config::default();
        config.manager.url = "http://file-value:8989".to_string();
        unsafe {
            env::set_var("RECONCILER_MANAGER_URL", "http://env-value:8989");
        }
        config.apply_env_overlay();
        unsafe {
            env::remove_var("RECONCILER_MANAGER_URL");
        }
        assert_eq!(config.manager.url, "http://env-value:8989");
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.manager.timeout_s, 30);
        assert_eq!(config.webhook.port, 7878);
    }
}
