//! System-wide default constants.
//!
//! Centralises magic numbers that would otherwise scatter across the
//! codebase. Grouped by subsystem for easy discovery.

// ============================================================================
// Detection Engine
// ============================================================================

/// Sample every Nth pixel in both axes when scoring a frame.
pub const PIXEL_STRIDE: usize = 4;

/// Capacity of the recent-readings ring buffer (for confidence).
pub const READING_HISTORY_SIZE: usize = 10;

/// Samples accumulated into the running mean before the baseline freezes.
pub const CALIBRATION_SAMPLES: usize = 30;

/// Consecutive agreeing samples required to flip the waiting state.
pub const HYSTERESIS_SAMPLES: u32 = 3;

/// Readings considered by the confidence consistency term.
pub const CONFIDENCE_WINDOW: usize = 3;

/// Weight of the consistency (inverse-variance) term in confidence.
pub const CONFIDENCE_CONSISTENCY_WEIGHT: f64 = 0.7;

/// Weight of the significance (distance-from-baseline) term in confidence.
pub const CONFIDENCE_SIGNIFICANCE_WEIGHT: f64 = 0.3;

/// Scale applied to the reading standard deviation in the consistency term.
///
/// `consistency = 1 − SCALE·σ`, clamped to [0, 1]. A steady signal (σ = 0)
/// gives full consistency; σ = 0.2 zeroes it.
pub const CONFIDENCE_STD_SCALE: f64 = 5.0;

// ============================================================================
// Publish Throttle
// ============================================================================

/// Intensity delta that always forces a publish (fraction of full scale).
pub const PUBLISH_INTENSITY_DELTA: f64 = 0.05;

/// Publish interval while a customer is waiting (ms).
pub const PUBLISH_INTERVAL_WAITING_MS: u64 = 500;

/// Publish interval while backgrounded and idle (ms). 30 000 = 30 s.
pub const PUBLISH_INTERVAL_BACKGROUND_MS: u64 = 30_000;

/// Publish interval in the foreground-idle case (ms).
pub const PUBLISH_INTERVAL_IDLE_MS: u64 = 1_000;

/// Session age after which long-session damping kicks in (secs). 1 800 = 30 min.
pub const LONG_SESSION_AGE_SECS: u64 = 1_800;

/// Publish count after which long-session damping kicks in.
pub const LONG_SESSION_PUBLISH_COUNT: u64 = 1_000;

/// Interval multiplier applied once a session qualifies as long-running.
pub const LONG_SESSION_DAMPING: f64 = 1.2;

/// UI refresh cadence in the foreground (ms) — independent of publishes.
pub const UI_REFRESH_FOREGROUND_MS: u64 = 100;

/// UI refresh cadence in the background (ms). 5 000 = 5 s.
pub const UI_REFRESH_BACKGROUND_MS: u64 = 5_000;

// ============================================================================
// Presence & Heartbeat
// ============================================================================

/// Observer heartbeat interval under active monitoring (secs).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Lower-frequency heartbeat interval while backgrounded (secs).
pub const HEARTBEAT_BACKGROUND_INTERVAL_SECS: u64 = 60;

/// Maximum reregistration attempts before surfacing a recoverable error.
pub const REREGISTER_MAX_ATTEMPTS: u32 = 3;

/// Backoff base between reregistration attempts (secs).
///
/// Attempt `n` sleeps `n * REREGISTER_BACKOFF_BASE_SECS` seconds.
pub const REREGISTER_BACKOFF_BASE_SECS: u64 = 2;

/// Timeout applied to every remote store read/write (secs).
pub const REMOTE_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// Reaper
// ============================================================================

/// Interval between reaper sweeps (secs). 3 600 = 1 hour.
pub const REAPER_SWEEP_INTERVAL_SECS: u64 = 3_600;

/// Offline-duration threshold before an offline device is reaped (hours).
pub const REAPER_OFFLINE_THRESHOLD_HOURS: u64 = 1;

/// Update-age threshold for web (long-lived) sessions (hours).
pub const REAPER_WEB_UPDATE_AGE_HOURS: u64 = 24;

/// Registration grace period for web sessions (hours).
pub const REAPER_WEB_GRACE_HOURS: u64 = 6;

/// Update-age threshold for mobile/desktop sessions (hours).
pub const REAPER_MOBILE_UPDATE_AGE_HOURS: u64 = 12;

/// Registration grace period for mobile/desktop sessions (hours).
pub const REAPER_MOBILE_GRACE_HOURS: u64 = 1;

/// Offline-duration threshold before an offline observer is reaped (hours).
pub const REAPER_OBSERVER_OFFLINE_HOURS: u64 = 1;

/// Alert retention window (hours). 48 = 2 days.
pub const REAPER_ALERT_RETENTION_HOURS: u64 = 48;

// ============================================================================
// Health Monitor
// ============================================================================

/// Interval between health check cycles (secs).
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Silence window after which the detection loop counts as stale (secs).
pub const DETECTION_STALENESS_SECS: u64 = 30;
