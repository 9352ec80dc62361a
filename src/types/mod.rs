//! Core record types shared between devices, observers and the reaper.
//!
//! Every struct that crosses the shared-store boundary serializes with
//! camelCase field names (`online`, `waiting`, `lastUpdate`, ...) — that
//! naming is the wire contract with existing deployments and must not drift.

use serde::{Deserialize, Serialize};

// ============================================================================
// Platform
// ============================================================================

/// Deployment platform of a device session.
///
/// Drives the reaper's grace periods: a browser tab is expected to run for
/// 8+ hours without a restart, so web sessions get generous staleness
/// thresholds; mobile sessions are short-lived and get tight ones.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Web,
    #[default]
    Mobile,
    Desktop,
}

impl Platform {
    /// Get short code for logging
    pub fn short_code(&self) -> &'static str {
        match self {
            Platform::Web => "WEB",
            Platform::Mobile => "MOB",
            Platform::Desktop => "DSK",
        }
    }

    /// Parse from string (for CLI/config)
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "web" | "browser" => Some(Platform::Web),
            "mobile" | "ios" | "android" => Some(Platform::Mobile),
            "desktop" | "macos" | "linux" | "windows" => Some(Platform::Desktop),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Web => write!(f, "Web"),
            Platform::Mobile => write!(f, "Mobile"),
            Platform::Desktop => write!(f, "Desktop"),
        }
    }
}

// ============================================================================
// Sensitivity
// ============================================================================

/// Multiplier bounds for [`Sensitivity`].
pub const MULTIPLIER_RANGE: (f64, f64) = (0.1, 3.0);

/// Threshold bounds for [`Sensitivity`].
pub const THRESHOLD_RANGE: (f64, f64) = (0.05, 0.8);

/// Detection sensitivity settings.
///
/// Held twice, independently: once on the device (drives the onboard
/// `waiting` decision) and once on each observer (drives its own `detected`
/// recomputation from published intensity). The two layers can disagree —
/// that divergence is inherited behavior and deliberately kept addressable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sensitivity {
    /// Gain applied to the raw intensity before thresholding
    pub multiplier: f64,
    /// Waiting-decision threshold on amplified intensity
    pub threshold: f64,
    /// Human-readable preset label ("low", "default", "high", ...)
    pub label: String,
}

impl Sensitivity {
    /// Create a sensitivity, clamping both values into their valid ranges.
    pub fn new(multiplier: f64, threshold: f64, label: impl Into<String>) -> Self {
        Self {
            multiplier: multiplier.clamp(MULTIPLIER_RANGE.0, MULTIPLIER_RANGE.1),
            threshold: threshold.clamp(THRESHOLD_RANGE.0, THRESHOLD_RANGE.1),
            label: label.into(),
        }
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self::new(1.0, 0.3, "default")
    }
}

// ============================================================================
// Device records
// ============================================================================

/// Capability/info block written once at registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub platform: Platform,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub app_version: String,
}

/// Mutable status block, refreshed by throttled publishes and heartbeats.
///
/// Owned exclusively by the device that created it (single-writer
/// invariant). `last_update` and `disconnected_at` are server-assigned
/// epoch milliseconds; `online == false` implies `disconnected_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub online: bool,
    pub monitoring: bool,
    pub waiting: bool,
    pub intensity: f64,
    pub confidence: f64,
    #[serde(default)]
    pub battery_level: f64,
    #[serde(default)]
    pub is_background: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<i64>,
}

/// Full device record as stored under `devices/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub info: DeviceInfo,
    /// Server timestamp of registration — anchor for the reaper's grace rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<i64>,
    #[serde(default)]
    pub status: DeviceStatus,
}

// ============================================================================
// Observer records
// ============================================================================

/// Record for a monitoring/observer process, stored under `observers/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObserverRecord {
    pub id: String,
    pub online: bool,
    #[serde(default)]
    pub is_background: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<i64>,
}

// ============================================================================
// Alerts
// ============================================================================

/// Append-only alert created by a device transitioning into waiting state.
///
/// Never mutated after creation; removed only by the reaper once past the
/// retention window (or immediately if malformed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub device_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub acknowledged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitivity_clamps_out_of_range_values() {
        let s = Sensitivity::new(99.0, 0.001, "hot");
        assert!((s.multiplier - 3.0).abs() < f64::EPSILON);
        assert!((s.threshold - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn device_status_serializes_camel_case() {
        let status = DeviceStatus {
            online: true,
            monitoring: true,
            waiting: false,
            intensity: 0.4,
            confidence: 0.9,
            battery_level: 0.8,
            is_background: false,
            last_update: Some(1_700_000_000_000),
            disconnected_at: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["lastUpdate"], 1_700_000_000_000_i64);
        assert_eq!(json["batteryLevel"], 0.8);
        assert!(json.get("disconnectedAt").is_none());
    }

    #[test]
    fn platform_parses_loose_names() {
        assert_eq!(Platform::from_str_loose("Browser"), Some(Platform::Web));
        assert_eq!(Platform::from_str_loose("android"), Some(Platform::Mobile));
        assert_eq!(Platform::from_str_loose("toaster"), None);
    }
}
