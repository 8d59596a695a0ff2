//! Device-wide state and the seams to the host platform.
//!
//! Everything the core mutates lives in one owned [`DeviceContext`] that the
//! runtime passes by reference into each component call, with no ambient
//! globals.
//! Everything the core merely *uses* (time, LED, persisted storage, restart,
//! system introspection) is a trait defined here, so the control logic stays
//! testable with hand-rolled mocks and the hardware bindings stay in one
//! place (`hw.rs` and `main.rs`).

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::buffer::MessageBuffer;

pub const COOLDOWN_MIN_MS: u64 = 1_000;
pub const COOLDOWN_MAX_MS: u64 = 60_000;

pub const DEFAULT_DETECTION_ENABLED: bool = true;
pub const DEFAULT_COOLDOWN_MS: u64 = 5_000;

/// Remotely reconcilable device configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub detection_enabled: bool,
    /// Minimum spacing between accepted detections, always in
    /// `[COOLDOWN_MIN_MS, COOLDOWN_MAX_MS]`.
    pub cooldown_ms: u64,
    pub firmware_version: String,
}

impl DeviceConfig {
    pub fn cooldown_in_range(value: u64) -> bool {
        (COOLDOWN_MIN_MS..=COOLDOWN_MAX_MS).contains(&value)
    }
}

/// The slice of [`DeviceConfig`] that survives a power cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub detection_enabled: bool,
    pub cooldown_ms: u64,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            detection_enabled: DEFAULT_DETECTION_ENABLED,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
        }
    }
}

/// Monotonic counters, reset only by a power cycle. Never persisted.
#[derive(Debug, Clone)]
pub struct DeviceMetrics {
    pub detection_count: u64,
    pub buffered_messages: u64,
    pub sent_from_buffer: u64,
    pub failed_publish: u64,
    pub link_reconnects: u64,
    pub session_reconnects: u64,
    pub boot_time: DateTime<Utc>,
}

impl DeviceMetrics {
    pub fn at_boot(boot_time: DateTime<Utc>) -> Self {
        Self {
            detection_count: 0,
            buffered_messages: 0,
            sent_from_buffer: 0,
            failed_publish: 0,
            link_reconnects: 0,
            session_reconnects: 0,
            boot_time,
        }
    }
}

/// All mutable device state, single-writer from the tick loop.
pub struct DeviceContext {
    pub config: DeviceConfig,
    pub metrics: DeviceMetrics,
    pub buffer: MessageBuffer,
}

/// Time source. `epoch_seconds` stays `None` until wall-clock time is known
/// to be synchronized; tokens must not be signed before then.
pub trait Clock {
    fn monotonic_ms(&self) -> u64;
    fn epoch_seconds(&self) -> Option<u64>;
}

/// Status LED. Acknowledgment patterns mirror the remote enable/disable
/// commands: one long flash when enabling, three short flashes when disabling.
pub trait Indicator {
    fn motion(&mut self, active: bool);
    fn ack_enabled(&mut self);
    fn ack_disabled(&mut self);
    /// Advances any in-flight flash pattern; called once per tick so the
    /// patterns never block the loop.
    fn service(&mut self, _now_ms: u64) {}
}

/// Snapshot of host vitals included in every reported-state document.
pub trait SystemProbe {
    fn rssi_dbm(&self) -> i32;
    fn free_heap_bytes(&self) -> u64;
    fn cpu_freq_mhz(&self) -> u32;
}

/// Clean restart of the node, the only intentional terminal action.
pub trait Restart {
    fn restart(&mut self) -> !;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("state serialization: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Persistence seam for [`PersistedConfig`]; written on every reconciled
/// change, read once at startup.
pub trait ConfigStore {
    fn load(&mut self) -> Result<Option<PersistedConfig>, StoreError>;
    fn save(&mut self, config: &PersistedConfig) -> Result<(), StoreError>;
}

/// TOML state file under the platform state directory.
pub struct TomlConfigStore {
    path: PathBuf,
}

impl TomlConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default location: `<state dir>/motionlink/device.toml`.
    pub fn default_path() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("motionlink")
            .join("device.toml")
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&mut self) -> Result<Option<PersistedConfig>, StoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no persisted device state");
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let config: PersistedConfig = toml::from_str(&raw)?;
        info!(path = %self.path.display(), "loaded persisted device state");
        Ok(Some(config))
    }

    fn save(&mut self, config: &PersistedConfig) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, toml::to_string_pretty(config)?)?;
        debug!(path = %self.path.display(), "persisted device state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_range_bounds_are_inclusive() {
        assert!(DeviceConfig::cooldown_in_range(1_000));
        assert!(DeviceConfig::cooldown_in_range(60_000));
        assert!(!DeviceConfig::cooldown_in_range(999));
        assert!(!DeviceConfig::cooldown_in_range(60_001));
    }

    #[test]
    fn persisted_defaults_match_first_boot() {
        let d = PersistedConfig::default();
        assert!(d.detection_enabled);
        assert_eq!(d.cooldown_ms, 5_000);
    }

    #[test]
    fn store_round_trips_through_the_state_file() {
        let dir = std::env::temp_dir().join("motionlink-store-test");
        let _ = fs::remove_dir_all(&dir);
        let mut store = TomlConfigStore::new(dir.join("device.toml"));

        assert!(store.load().unwrap().is_none());

        let state = PersistedConfig {
            detection_enabled: false,
            cooldown_ms: 12_000,
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));

        let _ = fs::remove_dir_all(&dir);
    }
}
