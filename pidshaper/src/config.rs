// Configuration save/restore functionality

use crate::process::TargetMode;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = "pidshaper";
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_HOTKEY: &str = "f2";

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Shaping rate as typed by the user, in `unit`
    #[serde(default = "default_speed")]
    pub speed: String,

    /// "KB/s" or "MB/s"
    #[serde(default = "default_unit")]
    pub unit: String,

    /// Key that toggles throttling for the current target
    #[serde(default = "default_hotkey")]
    pub hotkey: String,

    #[serde(default)]
    pub target_mode: TargetMode,

    #[serde(default)]
    pub fixed_target: Option<i32>,

    #[serde(default)]
    pub preferred_divert_backend: Option<String>,

    #[serde(default)]
    pub preferred_socket_mapper: Option<String>,

    /// How long a socket table read is reused for attribution (0 = every packet)
    #[serde(default = "default_connection_cache_ms")]
    pub connection_cache_ms: u64,
}

fn default_speed() -> String {
    "10".to_string()
}

fn default_unit() -> String {
    "KB/s".to_string()
}

fn default_hotkey() -> String {
    DEFAULT_HOTKEY.to_string()
}

fn default_connection_cache_ms() -> u64 {
    250
}

impl Default for Config {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            unit: default_unit(),
            hotkey: default_hotkey(),
            target_mode: TargetMode::default(),
            fixed_target: None,
            preferred_divert_backend: None,
            preferred_socket_mapper: None,
            connection_cache_ms: default_connection_cache_ms(),
        }
    }
}

impl Config {
    /// Get the config file path, creating its directory
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine the user config directory"))?
            .join(CONFIG_DIR);

        fs::create_dir_all(&config_dir).context(format!(
            "Failed to create config directory: {:?}",
            config_dir
        ))?;

        Ok(config_dir.join(CONFIG_FILE))
    }

    /// Load configuration from disk. A missing or unreadable file yields defaults.
    pub fn load() -> Self {
        match Self::config_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                log::warn!("{:#}, using default configuration", e);
                Config::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            log::debug!("Config file not found, using defaults");
            return Config::default();
        }

        let parsed = fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))
            .and_then(|contents| {
                serde_json::from_str::<Config>(&contents).context("Failed to parse config file")
            });

        match parsed {
            Ok(config) => {
                log::info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) => {
                log::warn!("{:#}, using default configuration", e);
                Config::default()
            }
        }
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents).context(format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// The configured rate in bytes per second
    pub fn rate_bytes_per_sec(&self) -> Result<u64> {
        let speed: f64 = self
            .speed
            .trim()
            .parse()
            .map_err(|_| anyhow!("Speed must be a number, got {:?}", self.speed))?;
        if !speed.is_finite() || speed <= 0.0 {
            return Err(anyhow!("Speed must be greater than zero, got {}", self.speed));
        }

        let multiplier = match self.unit.trim().to_uppercase().as_str() {
            "B/S" => 1.0,
            "KB/S" => 1024.0,
            "MB/S" => 1024.0 * 1024.0,
            other => return Err(anyhow!("Unknown speed unit: {}", other)),
        };

        let bytes = (speed * multiplier).round();
        if bytes < 1.0 {
            return Err(anyhow!("Speed {} {} rounds to zero bytes", self.speed, self.unit));
        }
        Ok(bytes as u64)
    }

    /// Store a rate, choosing MB/s only when it is a whole number of megabytes
    pub fn set_rate_bytes_per_sec(&mut self, bytes_per_sec: u64) {
        const MB: u64 = 1024 * 1024;
        if bytes_per_sec >= MB && bytes_per_sec % MB == 0 {
            self.speed = (bytes_per_sec / MB).to_string();
            self.unit = "MB/s".to_string();
        } else {
            let kb = bytes_per_sec as f64 / 1024.0;
            self.speed = format!("{}", (kb * 100.0).round() / 100.0);
            self.unit = "KB/s".to_string();
        }
    }

    /// Trimmed, lowercased hotkey; an empty one falls back to the default
    pub fn hotkey(&self) -> String {
        let hotkey = self.hotkey.trim().to_lowercase();
        if hotkey.is_empty() {
            log::warn!("Empty hotkey in config, using {}", DEFAULT_HOTKEY);
            return DEFAULT_HOTKEY.to_string();
        }
        hotkey
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pidshaper-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.rate_bytes_per_sec().unwrap(), 10 * 1024);
        assert_eq!(config.hotkey(), "f2");
        assert_eq!(config.target_mode, TargetMode::Fixed);
        assert_eq!(config.connection_cache_ms, 250);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"speed": "2", "unit": "MB/s"}"#).unwrap();
        assert_eq!(config.rate_bytes_per_sec().unwrap(), 2 * 1024 * 1024);
        assert_eq!(config.hotkey, "f2");
        assert_eq!(config.fixed_target, None);
    }

    #[test]
    fn test_invalid_speed_rejected() {
        for speed in ["abc", "0", "-5", "NaN", "inf", ""] {
            let config = Config {
                speed: speed.to_string(),
                ..Config::default()
            };
            assert!(config.rate_bytes_per_sec().is_err(), "accepted {:?}", speed);
        }
    }

    #[test]
    fn test_hotkey_normalized() {
        let mut config = Config {
            hotkey: "  F5 ".to_string(),
            ..Config::default()
        };
        assert_eq!(config.hotkey(), "f5");
        config.hotkey = "   ".to_string();
        assert_eq!(config.hotkey(), "f2");
    }

    #[test]
    fn test_set_rate_round_trips() {
        let mut config = Config::default();
        for rate in [2048, 1536, 3 * 1024 * 1024, 20 * 1024] {
            config.set_rate_bytes_per_sec(rate);
            assert_eq!(config.rate_bytes_per_sec().unwrap(), rate);
        }
    }

    #[test]
    fn test_save_and_load() {
        let path = scratch_path("roundtrip.json");
        let config = Config {
            target_mode: TargetMode::Focus,
            fixed_target: Some(1234),
            preferred_divert_backend: Some("nfqueue".to_string()),
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path), config);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let path = scratch_path("corrupt.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }
}
