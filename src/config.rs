//! Application configuration with baked-in defaults and JSON persistence
//!
//! Unknown files produce defaults, partial files merge over defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::DEFAULT_CAPACITY;
use crate::diff::DiffConfig;
use crate::gateway::GatewayConfig;

/// One configured CAN bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEntry {
    pub name: String,
    /// Interface channel, e.g. "can0" or a serial device path.
    pub channel: String,
    pub baudrate: u32,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_theme() -> String {
    "system".to_string()
}

fn default_buses() -> Vec<BusEntry> {
    vec![BusEntry { name: "CAN1".to_string(), channel: "can0".to_string(), baudrate: 500_000 }]
}

fn default_listen_only() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    DEFAULT_CAPACITY
}

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_buses")]
    pub can_buses: Vec<BusEntry>,
    #[serde(default = "default_listen_only")]
    pub listen_only: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            theme: default_theme(),
            can_buses: default_buses(),
            listen_only: default_listen_only(),
            queue_capacity: default_queue_capacity(),
            diff: DiffConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file. A missing file yields defaults; a corrupt file
    /// logs and yields defaults rather than failing startup.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => {
                    info!(path = %path.display(), "config loaded");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable config, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).expect("config serializes");
        std::fs::write(path.as_ref(), json)
    }
}
