//! Configuration loading: TOML file with environment variable overrides.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SWAYIDLE_BINARY: &str = "swayidle";
pub const DEFAULT_IOREG_BINARY: &str = "ioreg";

/// Notification types delivered through the permission pathway and therefore
/// never posted as plain notifications.
pub const DEFAULT_IGNORED_NOTIFICATION_TYPES: &[&str] = &["permission_prompt"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub idle_timeout: u64,
    pub request_timeout: u64,
    pub ignored_notification_types: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_SECS,
            ignored_notification_types: DEFAULT_IGNORED_NOTIFICATION_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub bot_token: String,
    pub app_token: String,
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwayidleConfig {
    pub binary: String,
}

impl Default for SwayidleConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_SWAYIDLE_BINARY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MacIdleConfig {
    pub binary: String,
}

impl Default for MacIdleConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_IOREG_BINARY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub slack: SlackConfig,
    pub swayidle: SwayidleConfig,
    pub mac: MacIdleConfig,
}

impl Config {
    /// Load configuration. An explicitly given path must exist; the default
    /// path is optional so a fully env-configured daemon can run without a
    /// file.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit_path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path(), false),
        };

        let mut config = if path.is_file() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("invalid config file {}", path.display()))?
        } else if required {
            anyhow::bail!("config file not found: {}", path.display());
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables override every file field.
    fn apply_env_overrides(&mut self) {
        if let Some(token) = env_nonempty("PERMITD_SLACK_BOT_TOKEN") {
            self.slack.bot_token = token;
        }
        if let Some(token) = env_nonempty("PERMITD_SLACK_APP_TOKEN") {
            self.slack.app_token = token;
        }
        if let Some(channel) = env_nonempty("PERMITD_SLACK_CHANNEL") {
            self.slack.channel = channel;
        }
        if let Some(path) = env_nonempty("PERMITD_SOCKET_PATH") {
            self.daemon.socket_path = PathBuf::from(path);
        }
        if let Some(raw) = env_nonempty("PERMITD_IDLE_TIMEOUT") {
            match raw.parse() {
                Ok(secs) => self.daemon.idle_timeout = secs,
                Err(err) => warn!(value = %raw, "Invalid PERMITD_IDLE_TIMEOUT: {}", err),
            }
        }
        if let Some(raw) = env_nonempty("PERMITD_REQUEST_TIMEOUT") {
            match raw.parse() {
                Ok(secs) => self.daemon.request_timeout = secs,
                Err(err) => warn!(value = %raw, "Invalid PERMITD_REQUEST_TIMEOUT: {}", err),
            }
        }
        if let Some(raw) = env_nonempty("PERMITD_IGNORED_NOTIFICATION_TYPES") {
            self.daemon.ignored_notification_types = raw
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect();
        }
        if let Some(binary) = env_nonempty("PERMITD_SWAYIDLE_BINARY") {
            self.swayidle.binary = binary;
        }
        if let Some(binary) = env_nonempty("PERMITD_IOREG_BINARY") {
            self.mac.binary = binary;
        }
    }

    /// Validate configuration, returning all problems rather than the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.slack.bot_token.is_empty() {
            errors.push("slack.bot_token is required".to_string());
        } else if !self.slack.bot_token.starts_with("xoxb-") {
            errors.push("slack.bot_token should start with 'xoxb-'".to_string());
        }
        if self.slack.app_token.is_empty() {
            errors.push("slack.app_token is required".to_string());
        } else if !self.slack.app_token.starts_with("xapp-") {
            errors.push("slack.app_token should start with 'xapp-'".to_string());
        }
        if self.slack.channel.is_empty() {
            errors.push("slack.channel is required".to_string());
        }
        if self.daemon.idle_timeout < 1 {
            errors.push("daemon.idle_timeout must be at least 1 second".to_string());
        }
        if self.daemon.request_timeout < 1 {
            errors.push("daemon.request_timeout must be at least 1 second".to_string());
        }
        errors
    }

    pub fn ignored_notification_types(&self) -> HashSet<String> {
        self.daemon
            .ignored_notification_types
            .iter()
            .cloned()
            .collect()
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("permitd")
        .join("config.toml")
}

/// Platform default for the IPC endpoint: the per-user runtime directory
/// where available, a well-known temp path otherwise, and a named pipe on
/// Windows.
pub fn default_socket_path() -> PathBuf {
    #[cfg(windows)]
    {
        PathBuf::from(r"\\.\pipe\permitd")
    }
    #[cfg(not(windows))]
    {
        dirs::runtime_dir()
            .map(|dir| dir.join("permitd.sock"))
            .unwrap_or_else(|| PathBuf::from("/tmp/permitd.sock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_toml() -> &'static str {
        r#"
            [daemon]
            socket_path = "/tmp/test-permitd.sock"
            idle_timeout = 90

            [slack]
            bot_token = "xoxb-test"
            app_token = "xapp-test"
            channel = "C012345"

            [swayidle]
            binary = "/usr/bin/swayidle"
        "#
    }

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(valid_toml()).expect("parse config");
        assert_eq!(config.daemon.socket_path, PathBuf::from("/tmp/test-permitd.sock"));
        assert_eq!(config.daemon.idle_timeout, 90);
        assert_eq!(config.daemon.request_timeout, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(config.slack.channel, "C012345");
        assert_eq!(config.swayidle.binary, "/usr/bin/swayidle");
        assert_eq!(config.mac.binary, DEFAULT_IOREG_BINARY);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: Config = toml::from_str("").expect("parse empty config");
        assert_eq!(config.daemon.idle_timeout, DEFAULT_IDLE_TIMEOUT_SECS);
        assert_eq!(
            config.daemon.ignored_notification_types,
            vec!["permission_prompt".to_string()]
        );
    }

    #[test]
    fn validation_reports_all_problems() {
        let config = Config::default();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("bot_token")));
        assert!(errors.iter().any(|e| e.contains("app_token")));
        assert!(errors.iter().any(|e| e.contains("channel")));
    }

    #[test]
    fn validation_checks_token_prefixes() {
        let config: Config = toml::from_str(
            r#"
            [slack]
            bot_token = "wrong"
            app_token = "also-wrong"
            channel = "C1"
        "#,
        )
        .expect("parse config");
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("xoxb-")));
        assert!(errors.iter().any(|e| e.contains("xapp-")));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            idle_timeout = 0
            request_timeout = 0

            [slack]
            bot_token = "xoxb-x"
            app_token = "xapp-x"
            channel = "C1"
        "#,
        )
        .expect("parse config");
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn explicit_missing_config_path_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/permitd.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, valid_toml()).expect("write config");
        let config = Config::load(Some(&path)).expect("load config");
        assert_eq!(config.daemon.idle_timeout, 90);
    }
}
