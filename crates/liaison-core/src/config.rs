//! Configuration resolution for the liaison broker.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/liaison/settings.json)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete liaison configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub popups: PopupConfig,
}

/// Broker runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// WebSocket listening port.
    pub port: u16,
    /// Identified sessions beyond this count are rejected.
    pub max_clients: usize,
    /// Liveness sweep period; sessions idle past three of these are probed.
    pub heartbeat_interval_secs: u64,
    /// Capacity of the broker event broadcast channel.
    pub event_capacity: usize,
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            max_clients: 64,
            heartbeat_interval_secs: 30,
            event_capacity: 256,
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Popup workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopupConfig {
    /// Hard timeout applied when a popup's options carry none (milliseconds).
    /// Zero disables the implicit timeout.
    pub default_timeout_ms: u64,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 120_000, // 2 minutes
        }
    }
}

impl PopupConfig {
    pub const fn default_timeout(&self) -> Option<Duration> {
        if self.default_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.default_timeout_ms))
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `config_path` replaces the global file and must exist;
/// the global file is skipped silently when absent.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(path) = config_path {
        let explicit = load_config_file(path)?;
        merge_config(&mut config, explicit);
    } else if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".liaison").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/liaison/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("liaison").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.broker = overlay.broker;
    base.popups = overlay.popups;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("LIAISON_PORT") {
        if let Ok(n) = val.parse() {
            config.broker.port = n;
        }
    }
    if let Ok(val) = std::env::var("LIAISON_MAX_CLIENTS") {
        if let Ok(n) = val.parse() {
            config.broker.max_clients = n;
        }
    }
    if let Ok(val) = std::env::var("LIAISON_HEARTBEAT_SECS") {
        if let Ok(n) = val.parse() {
            config.broker.heartbeat_interval_secs = n;
        }
    }
    if let Ok(val) = std::env::var("LIAISON_POPUP_TIMEOUT_MS") {
        if let Ok(n) = val.parse() {
            config.popups.default_timeout_ms = n;
        }
    }
    if let Ok(val) = std::env::var("LIAISON_LOG_LEVEL") {
        config.broker.log_level = val;
    }
}
