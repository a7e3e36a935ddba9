// Configuration management for the exdevice CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/exdevice/config.json
// - Linux: ~/.config/exdevice/config.json
// - Windows: %APPDATA%\exdevice\config.json

use anyhow::{Context, Result};
use exdevice_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-session engine limits and timeouts
    pub engine: EngineConfig,

    /// How long `scan` listens for advertisements, in seconds
    pub scan_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            scan_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("exdevice");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, or write and return the defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .engine
                .validate()
                .context("Invalid engine settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The result is validated but not saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "scan_timeout_secs" => {
                self.scan_timeout_secs = value.parse().context("Invalid number")?;
            }
            "response_timeout_ms" => {
                self.engine.response_timeout_ms = value.parse().context("Invalid number")?;
            }
            "write_timeout_ms" => {
                self.engine.write_timeout_ms = value.parse().context("Invalid number")?;
            }
            "max_pending_tasks" => {
                self.engine.max_pending_tasks = value.parse().context("Invalid number")?;
            }
            "max_buffered_bytes" => {
                self.engine.max_buffered_bytes = value.parse().context("Invalid number")?;
            }
            "event_capacity" => {
                self.engine.event_capacity = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.engine.validate()?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("scan_timeout_secs".to_string(), self.scan_timeout_secs.to_string()),
            ("response_timeout_ms".to_string(), self.engine.response_timeout_ms.to_string()),
            ("write_timeout_ms".to_string(), self.engine.write_timeout_ms.to_string()),
            ("max_pending_tasks".to_string(), self.engine.max_pending_tasks.to_string()),
            ("max_buffered_bytes".to_string(), self.engine.max_buffered_bytes.to_string()),
            ("event_capacity".to_string(), self.engine.event_capacity.to_string()),
        ]
    }
}
