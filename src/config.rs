// ABOUTME: Application configuration for the shellbox CLI
// Loads terminal defaults from ~/.shellbox/config.toml, falling back to
// built-in values when the file is absent.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::terminal::{
    SessionOptions, DEFAULT_HISTORY_LIMIT, DEFAULT_NO_CHANGE_TIMEOUT, DEFAULT_POLL_INTERVAL,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Terminal session defaults
    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Where JSONL logs are written; defaults to ~/.shellbox/logs
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Seconds of unchanged output before a command without an explicit
    /// timeout is handed back to the caller
    #[serde(default = "default_no_change_timeout_secs")]
    pub no_change_timeout_secs: u64,

    /// Milliseconds between pane captures while a command runs
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Scrollback depth configured on the pane
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Identity to run sessions as; `su <user> -` when it differs from the
    /// current user
    #[serde(default)]
    pub username: Option<String>,

    /// Address-space cap for the shell and its children, in MiB
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            no_change_timeout_secs: default_no_change_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            history_limit: default_history_limit(),
            username: None,
            max_memory_mb: None,
        }
    }
}

impl TerminalConfig {
    /// Translate file-level knobs into session construction options.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            username: self.username.clone(),
            max_memory_mb: self.max_memory_mb,
            no_change_timeout: Some(Duration::from_secs(self.no_change_timeout_secs)),
            poll_interval: Some(Duration::from_millis(self.poll_interval_ms)),
            history_limit: Some(self.history_limit),
        }
    }
}

fn default_no_change_timeout_secs() -> u64 {
    DEFAULT_NO_CHANGE_TIMEOUT.as_secs()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_history_limit() -> u32 {
    DEFAULT_HISTORY_LIMIT
}

impl AppConfig {
    /// Path to the config file, ~/.shellbox/config.toml
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".shellbox").join("config.toml"))
    }

    /// Load the config file, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    /// Write the config back out, creating the directory if needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Directory JSONL logs are written to.
    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".shellbox")
                .join("logs")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_terminal_constants() {
        let config = TerminalConfig::default();
        assert_eq!(config.no_change_timeout_secs, 30);
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.history_limit, 10_000);
        assert!(config.username.is_none());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: AppConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(config.terminal.no_change_timeout_secs, 30);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: AppConfig = toml::from_str(
            "[terminal]\nno_change_timeout_secs = 5\nusername = \"worker\"\n",
        )
        .expect("partial config parses");
        assert_eq!(config.terminal.no_change_timeout_secs, 5);
        assert_eq!(config.terminal.username.as_deref(), Some("worker"));
        assert_eq!(config.terminal.poll_interval_ms, 500);
    }

    #[test]
    fn test_session_options_conversion() {
        let mut config = TerminalConfig::default();
        config.no_change_timeout_secs = 7;
        config.max_memory_mb = Some(512);
        let options = config.session_options();
        assert_eq!(options.no_change_timeout, Some(Duration::from_secs(7)));
        assert_eq!(options.max_memory_mb, Some(512));
        assert_eq!(options.history_limit, Some(10_000));
    }

    #[test]
    fn test_config_round_trip() {
        let config = AppConfig::default();
        let serialized = toml::to_string_pretty(&config).expect("serializes");
        let back: AppConfig = toml::from_str(&serialized).expect("round trips");
        assert_eq!(
            back.terminal.no_change_timeout_secs,
            config.terminal.no_change_timeout_secs
        );
    }
}
