//! Node configuration.
//!
//! Static identity and tunables loaded once at startup from a TOML file under
//! the platform config directory (`MOTIONLINK_CONFIG` overrides the path).
//! A missing file is written with defaults so the node always starts; the
//! remotely reconcilable settings live in `device.rs`, not here.

use std::fs;
use std::path::PathBuf;

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::buffer;

pub const FIRMWARE_VERSION: &str = "2.1.0";

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct NodeConfig {
    pub hub: HubConfig,
    #[serde(default)]
    pub node: NodeTunables,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

/// Broker endpoint and device identity.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HubConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub device_id: String,
    /// Base64 shared access key, used only to derive short-lived tokens.
    pub device_key_b64: String,
    #[serde(default = "default_ttl")]
    pub token_ttl_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct NodeTunables {
    pub tick_interval_ms: u64,
    pub buffer_capacity: usize,
    /// Sensor warm-up after boot; the signal is ignored until it elapses.
    pub warmup_ms: u64,
}

impl Default for NodeTunables {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
            buffer_capacity: buffer::DEFAULT_CAPACITY,
            warmup_ms: 10_000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HardwareConfig {
    pub pir_pin: u8,
    pub led_pin: u8,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            pir_pin: 13,
            led_pin: 2,
        }
    }
}

fn default_port() -> u16 {
    8883
}

fn default_ttl() -> u64 {
    3_600
}

impl NodeConfig {
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MOTIONLINK_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("motionlink")
            .join("config.toml")
    }

    /// Loads the configuration, writing a template file on first run.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            Self::write_default(&path)?;
            return Err(eyre!(
                "no configuration found; wrote a template to {}, fill in the hub section",
                path.display()
            ));
        }
        let raw = fs::read_to_string(&path)?;
        let config: NodeConfig = toml::from_str(&raw)?;
        info!(path = %path.display(), host = %config.hub.host, "configuration loaded");
        Ok(config)
    }

    fn write_default(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let template = NodeConfig {
            hub: HubConfig {
                host: "your-hub.azure-devices.net".to_string(),
                port: default_port(),
                device_id: "your-device-id".to_string(),
                device_key_b64: "base64-device-key".to_string(),
                token_ttl_secs: default_ttl(),
            },
            node: NodeTunables::default(),
            hardware: HardwareConfig::default(),
        };
        fs::write(path, toml::to_string_pretty(&template)?)?;
        Ok(())
    }
}
