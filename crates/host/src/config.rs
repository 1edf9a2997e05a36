//! Host configuration management

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    /// Default tracing level when RUST_LOG is not set
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Timeout applied to every native transfer call
    #[serde(default = "UsbSettings::default_timeout_millis")]
    pub timeout_millis: u32,
    /// Background topology scan interval (0 = disabled)
    #[serde(default = "UsbSettings::default_scan_interval_millis")]
    pub scan_interval_millis: u32,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            timeout_millis: Self::default_timeout_millis(),
            scan_interval_millis: Self::default_scan_interval_millis(),
        }
    }
}

impl UsbSettings {
    fn default_timeout_millis() -> u32 {
        5000
    }

    fn default_scan_interval_millis() -> u32 {
        500
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| Error::Config("no configuration file found".to_string()))?
        };

        let content = fs::read_to_string(&config_path)?;
        let config: HostConfig = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-host").join("host.toml")
        } else {
            PathBuf::from(".config/usb-host/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(Error::Config(format!(
                "invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.usb.timeout_millis == 0 {
            return Err(Error::Config(
                "timeout_millis must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.usb.timeout_millis))
    }

    /// Background scan interval, `None` when background scanning is disabled
    pub fn scan_interval(&self) -> Option<Duration> {
        match self.usb.scan_interval_millis {
            0 => None,
            millis => Some(Duration::from_millis(u64::from(millis))),
        }
    }
}

/// Load a configuration file, expanding a leading `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}
