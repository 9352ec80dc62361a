//! Watch configuration — all tunable intervals and thresholds as
//! operator-settable TOML values.
//!
//! Every struct implements `Default` with values matching the constants in
//! [`defaults`](super::defaults), ensuring zero-change behavior when no
//! config file is present.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;
use crate::types::Sensitivity;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for a device or observer deployment.
///
/// Load with `WatchConfig::load()` which searches:
/// 1. `$BEACON_CONFIG` env var
/// 2. `./beacon_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WatchConfig {
    /// Device identity (id/name/location/platform)
    #[serde(default)]
    pub device: DeviceConfig,

    /// Onboard detection sensitivity (device layer)
    #[serde(default)]
    pub sensitivity: SensitivityConfig,

    /// Observer-side sensitivity (aggregation layer)
    #[serde(default)]
    pub observer_sensitivity: SensitivityConfig,

    /// Heartbeat / publish / timeout intervals
    #[serde(default)]
    pub intervals: IntervalConfig,

    /// Ghost-entry cleanup thresholds
    #[serde(default)]
    pub reaper: ReaperConfig,
}

/// Device identity block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Opaque device id; generated (uuid v4) when empty
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default)]
    pub location: String,
    /// "web" | "mobile" | "desktop"
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_device_name() -> String {
    "unnamed-device".to_string()
}

fn default_platform() -> String {
    "mobile".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: default_device_name(),
            location: String::new(),
            platform: default_platform(),
        }
    }
}

/// Sensitivity block — clamped into valid ranges on conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivityConfig {
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_label")]
    pub label: String,
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_threshold() -> f64 {
    0.3
}

fn default_label() -> String {
    "default".to_string()
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            multiplier: default_multiplier(),
            threshold: default_threshold(),
            label: default_label(),
        }
    }
}

impl SensitivityConfig {
    /// Convert to a clamped [`Sensitivity`].
    pub fn to_sensitivity(&self) -> Sensitivity {
        Sensitivity::new(self.multiplier, self.threshold, self.label.clone())
    }
}

/// Interval tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "d_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "d_heartbeat_bg")]
    pub background_heartbeat_secs: u64,
    #[serde(default = "d_sweep")]
    pub reaper_sweep_secs: u64,
    #[serde(default = "d_health")]
    pub health_check_secs: u64,
    #[serde(default = "d_timeout")]
    pub remote_timeout_secs: u64,
    #[serde(default = "d_backoff")]
    pub reregister_backoff_base_secs: u64,
    #[serde(default = "d_attempts")]
    pub reregister_max_attempts: u32,
}

fn d_heartbeat() -> u64 {
    defaults::HEARTBEAT_INTERVAL_SECS
}
fn d_heartbeat_bg() -> u64 {
    defaults::HEARTBEAT_BACKGROUND_INTERVAL_SECS
}
fn d_sweep() -> u64 {
    defaults::REAPER_SWEEP_INTERVAL_SECS
}
fn d_health() -> u64 {
    defaults::HEALTH_CHECK_INTERVAL_SECS
}
fn d_timeout() -> u64 {
    defaults::REMOTE_TIMEOUT_SECS
}
fn d_backoff() -> u64 {
    defaults::REREGISTER_BACKOFF_BASE_SECS
}
fn d_attempts() -> u32 {
    defaults::REREGISTER_MAX_ATTEMPTS
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: d_heartbeat(),
            background_heartbeat_secs: d_heartbeat_bg(),
            reaper_sweep_secs: d_sweep(),
            health_check_secs: d_health(),
            remote_timeout_secs: d_timeout(),
            reregister_backoff_base_secs: d_backoff(),
            reregister_max_attempts: d_attempts(),
        }
    }
}

/// Reaper thresholds (hours).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "d_offline")]
    pub offline_threshold_hours: u64,
    #[serde(default = "d_web_age")]
    pub web_update_age_hours: u64,
    #[serde(default = "d_web_grace")]
    pub web_grace_hours: u64,
    #[serde(default = "d_mobile_age")]
    pub mobile_update_age_hours: u64,
    #[serde(default = "d_mobile_grace")]
    pub mobile_grace_hours: u64,
    #[serde(default = "d_obs_offline")]
    pub observer_offline_hours: u64,
    #[serde(default = "d_retention")]
    pub alert_retention_hours: u64,
}

fn d_offline() -> u64 {
    defaults::REAPER_OFFLINE_THRESHOLD_HOURS
}
fn d_web_age() -> u64 {
    defaults::REAPER_WEB_UPDATE_AGE_HOURS
}
fn d_web_grace() -> u64 {
    defaults::REAPER_WEB_GRACE_HOURS
}
fn d_mobile_age() -> u64 {
    defaults::REAPER_MOBILE_UPDATE_AGE_HOURS
}
fn d_mobile_grace() -> u64 {
    defaults::REAPER_MOBILE_GRACE_HOURS
}
fn d_obs_offline() -> u64 {
    defaults::REAPER_OBSERVER_OFFLINE_HOURS
}
fn d_retention() -> u64 {
    defaults::REAPER_ALERT_RETENTION_HOURS
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            offline_threshold_hours: d_offline(),
            web_update_age_hours: d_web_age(),
            web_grace_hours: d_web_grace(),
            mobile_update_age_hours: d_mobile_age(),
            mobile_grace_hours: d_mobile_grace(),
            observer_offline_hours: d_obs_offline(),
            alert_retention_hours: d_retention(),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl WatchConfig {
    /// Load configuration using the standard search order:
    /// 1. `$BEACON_CONFIG` environment variable
    /// 2. `./beacon_config.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("BEACON_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), device = %config.device.name, "Loaded config from BEACON_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from BEACON_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "BEACON_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("beacon_config.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(device = %config.device.name, "Loaded config from ./beacon_config.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./beacon_config.toml, using defaults");
                }
            }
        }

        info!("No beacon_config.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}
