//! Configuration management for ptyhost.
//!
//! Settings are read from `~/.ptyhost/config.toml`. Every key is optional;
//! missing keys fall back to the defaults shown below.
//!
//! ```toml
//! # tracing filter used when PTYHOST_LOG is not set
//! log_level = "info"
//!
//! # append logs to this file instead of stderr (optional)
//! log_file = "C:\\Users\\me\\.ptyhost\\ptyhost.log"
//!
//! [terminal]
//! cols = 120
//! rows = 30
//!
//! [timing]
//! exit_poll_ms = 50
//! read_wait_ms = 50
//! drain_grace_ms = 500
//! cancel_grace_ms = 2000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::pty::{PtySize, DEFAULT_COLS, DEFAULT_ROWS};
use crate::error::ConfigError;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tracing filter directive
    pub log_level: String,
    /// Log file path; logs go to stderr when unset
    pub log_file: Option<PathBuf>,
    /// Initial terminal dimensions
    pub terminal: TerminalConfig,
    /// Poll and grace intervals
    pub timing: TimingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            terminal: TerminalConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl TerminalConfig {
    pub fn size(&self) -> PtySize {
        PtySize::new(self.cols, self.rows).clamped()
    }
}

/// Timing configuration, all values in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between process exit checks
    pub exit_poll_ms: u64,
    /// Longest single wait for output before re-checking cancellation
    pub read_wait_ms: u64,
    /// How long output may keep draining after the process exited
    pub drain_grace_ms: u64,
    /// How long the pump and exit watcher get to unwind after a kill
    pub cancel_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            exit_poll_ms: 50,
            read_wait_ms: 50,
            drain_grace_ms: 500,
            cancel_grace_ms: 2000,
        }
    }
}

impl TimingConfig {
    pub fn exit_poll(&self) -> Duration {
        Duration::from_millis(self.exit_poll_ms.max(1))
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms.max(1))
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load() -> Self {
        if let Some(path) = Self::get_config_path() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!("Ignoring config {}: {}", path.display(), e),
                }
            }
        }
        Self::default()
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to an explicit file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(ConfigError::Write)
    }

    /// Get config file path
    pub fn get_config_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".ptyhost").join("config.toml"))
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.terminal.size(), PtySize::new(120, 30));
        assert_eq!(config.timing.exit_poll(), Duration::from_millis(50));
        assert_eq!(config.timing.cancel_grace(), Duration::from_secs(2));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[terminal]\ncols = 200\n\n[timing]\nread_wait_ms = 10\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.terminal.cols, 200);
        assert_eq!(config.terminal.rows, 30);
        assert_eq!(config.timing.read_wait_ms, 10);
        assert_eq!(config.timing.drain_grace_ms, 500);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "terminal = 5").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.log_level = "debug".to_string();
        config.terminal.rows = 50;
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let timing = TimingConfig {
            exit_poll_ms: 0,
            read_wait_ms: 0,
            ..TimingConfig::default()
        };
        assert_eq!(timing.exit_poll(), Duration::from_millis(1));
        assert_eq!(timing.read_wait(), Duration::from_millis(1));
    }
}
