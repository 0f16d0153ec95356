// Configuration management for the StatusBeacon CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/statusbeacon/config.json
// - Linux: ~/.config/statusbeacon/config.json
// - Windows: %APPDATA%\statusbeacon\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use statusbeacon_core::ExchangeSettings;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Exchange settings shared by both roles
    pub settings: ExchangeSettings,

    /// Local topic values, by topic name
    pub topics: BTreeMap<String, String>,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("statusbeacon");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, or create it
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, writing defaults if the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .settings
                .validate()
                .context("Config file holds invalid settings")?;
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

    /// Set a config value. The resulting settings must validate.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut settings = self.settings.clone();
        match key {
            "service_name" => settings.service_name = value.to_string(),
            "local_peer_id" => settings.local_peer_id = value.to_string(),
            "peer_info" => settings.peer_info = value.to_string(),
            "passphrase" => {
                settings.passphrase = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "scan_duration_ms" => {
                settings.scan_duration_ms = value.parse().context("Invalid number")?;
            }
            "idle_duration_ms" => {
                settings.idle_duration_ms = value.parse().context("Invalid number")?;
            }
            "write_retry_attempts" => {
                settings.write_retry.max_attempts = value.parse().context("Invalid number")?;
            }
            "write_retry_delay_ms" => {
                settings.write_retry.delay_ms = value.parse().context("Invalid number")?;
            }
            "transfer_unit" => {
                settings.transfer_unit = value.parse().context("Invalid transfer unit")?;
            }
            "scan_retry_delay_ms" => {
                settings.scan_retry_delay_ms = value.parse().context("Invalid number")?;
            }
            "transient_scan_error_code" => {
                settings.transient_scan_error_code = value.parse().context("Invalid error code")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        let s = &self.settings;
        match key {
            "service_name" => Some(s.service_name.clone()),
            "local_peer_id" => Some(s.local_peer_id.clone()),
            "peer_info" => Some(s.peer_info.clone()),
            "passphrase" => s.passphrase.as_ref().map(|_| "(set)".to_string()),
            "scan_duration_ms" => Some(s.scan_duration_ms.to_string()),
            "idle_duration_ms" => Some(s.idle_duration_ms.to_string()),
            "write_retry_attempts" => Some(s.write_retry.max_attempts.to_string()),
            "write_retry_delay_ms" => Some(s.write_retry.delay_ms.to_string()),
            "transfer_unit" => Some(s.transfer_unit.to_string()),
            "scan_retry_delay_ms" => Some(s.scan_retry_delay_ms.to_string()),
            "transient_scan_error_code" => Some(s.transient_scan_error_code.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        const KEYS: [&str; 11] = [
            "service_name",
            "local_peer_id",
            "peer_info",
            "passphrase",
            "scan_duration_ms",
            "idle_duration_ms",
            "write_retry_attempts",
            "write_retry_delay_ms",
            "transfer_unit",
            "scan_retry_delay_ms",
            "transient_scan_error_code",
        ];
        KEYS.iter()
            .map(|key| {
                (
                    key.to_string(),
                    self.get(key).unwrap_or_else(|| "(none)".to_string()),
                )
            })
            .collect()
    }

    /// Set a local topic value
    pub fn set_topic(&mut self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() {
            anyhow::bail!("Topic name must not be empty");
        }
        if value.contains(':') {
            anyhow::bail!("Topic value must not contain ':'");
        }
        self.topics.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn remove_topic(&mut self, name: &str) -> bool {
        self.topics.remove(name).is_some()
    }
}
