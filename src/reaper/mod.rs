//! Reaper — periodic ghost-entry cleanup with platform-aware grace
//! periods.
//!
//! Devices and observers that vanish without deregistering (and whose
//! dead-man's switch never fired) leave ghost records behind. Each sweep
//! removes stale device/observer/alert entries and compacts emptied
//! category nodes. A naive fixed threshold would reap devices mid-session,
//! so staleness thresholds depend on the record's platform: a browser tab
//! expected to run 8+ hours gets ~24 h / 6 h, a mobile session ~12 h / 1 h.
//!
//! Cleanup is idempotent: any record's processing error is
//! skip-and-continue, and a failed sweep is simply retried wholesale on
//! the next tick.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{
    REAPER_ALERT_RETENTION_HOURS, REAPER_MOBILE_GRACE_HOURS, REAPER_MOBILE_UPDATE_AGE_HOURS,
    REAPER_OBSERVER_OFFLINE_HOURS, REAPER_OFFLINE_THRESHOLD_HOURS, REAPER_SWEEP_INTERVAL_SECS,
    REAPER_WEB_GRACE_HOURS, REAPER_WEB_UPDATE_AGE_HOURS, REMOTE_TIMEOUT_SECS,
};
use crate::store::{paths, SharedStore, StoreError};
use crate::types::{AlertRecord, DeviceRecord, ObserverRecord, Platform};

const MILLIS_PER_HOUR: i64 = 3_600_000;

// ============================================================================
// Policy
// ============================================================================

/// Staleness thresholds (all epoch-millisecond durations).
#[derive(Debug, Clone)]
pub struct ReaperPolicy {
    /// How long an explicitly-offline device may linger
    pub offline_threshold_ms: i64,
    /// Update-age threshold for web sessions
    pub web_update_age_ms: i64,
    /// Registration grace for web sessions with no status at all
    pub web_grace_ms: i64,
    /// Update-age threshold for mobile/desktop sessions
    pub mobile_update_age_ms: i64,
    /// Registration grace for mobile/desktop sessions
    pub mobile_grace_ms: i64,
    /// How long an offline/silent observer may linger
    pub observer_offline_ms: i64,
    /// Alert retention window
    pub alert_retention_ms: i64,
}

impl Default for ReaperPolicy {
    fn default() -> Self {
        Self {
            offline_threshold_ms: REAPER_OFFLINE_THRESHOLD_HOURS as i64 * MILLIS_PER_HOUR,
            web_update_age_ms: REAPER_WEB_UPDATE_AGE_HOURS as i64 * MILLIS_PER_HOUR,
            web_grace_ms: REAPER_WEB_GRACE_HOURS as i64 * MILLIS_PER_HOUR,
            mobile_update_age_ms: REAPER_MOBILE_UPDATE_AGE_HOURS as i64 * MILLIS_PER_HOUR,
            mobile_grace_ms: REAPER_MOBILE_GRACE_HOURS as i64 * MILLIS_PER_HOUR,
            observer_offline_ms: REAPER_OBSERVER_OFFLINE_HOURS as i64 * MILLIS_PER_HOUR,
            alert_retention_ms: REAPER_ALERT_RETENTION_HOURS as i64 * MILLIS_PER_HOUR,
        }
    }
}

impl ReaperPolicy {
    /// Build from the operator config block.
    pub fn from_config(config: &crate::config::ReaperConfig) -> Self {
        Self {
            offline_threshold_ms: config.offline_threshold_hours as i64 * MILLIS_PER_HOUR,
            web_update_age_ms: config.web_update_age_hours as i64 * MILLIS_PER_HOUR,
            web_grace_ms: config.web_grace_hours as i64 * MILLIS_PER_HOUR,
            mobile_update_age_ms: config.mobile_update_age_hours as i64 * MILLIS_PER_HOUR,
            mobile_grace_ms: config.mobile_grace_hours as i64 * MILLIS_PER_HOUR,
            observer_offline_ms: config.observer_offline_hours as i64 * MILLIS_PER_HOUR,
            alert_retention_ms: config.alert_retention_hours as i64 * MILLIS_PER_HOUR,
        }
    }

    fn update_age_ms(&self, platform: Platform) -> i64 {
        match platform {
            Platform::Web => self.web_update_age_ms,
            Platform::Mobile | Platform::Desktop => self.mobile_update_age_ms,
        }
    }

    fn grace_ms(&self, platform: Platform) -> i64 {
        match platform {
            Platform::Web => self.web_grace_ms,
            Platform::Mobile | Platform::Desktop => self.mobile_grace_ms,
        }
    }
}

// ============================================================================
// Decision rules (pure — unit-tested at the boundaries)
// ============================================================================

/// Why a record was removed (for logging/stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    OfflineTooLong,
    UpdateTooOld,
    NeverReported,
    PastRetention,
    Malformed,
}

/// Device rule. Boundary is strict: `age > threshold` reaps, `age ==
/// threshold` retains.
pub fn device_reap_reason(
    device: &DeviceRecord,
    now_ms: i64,
    policy: &ReaperPolicy,
) -> Option<ReapReason> {
    let status = &device.status;
    let platform = device.info.platform;

    if !status.online {
        if let Some(disconnected_at) = status.disconnected_at {
            if now_ms - disconnected_at > policy.offline_threshold_ms {
                return Some(ReapReason::OfflineTooLong);
            }
        }
    }

    if let Some(last_update) = status.last_update {
        if now_ms - last_update > policy.update_age_ms(platform) {
            return Some(ReapReason::UpdateTooOld);
        }
    } else if status.disconnected_at.is_none() {
        // Registered but never produced a status update nor a disconnect
        // marker — reap once past the registration grace period.
        match device.registered_at {
            Some(registered_at) if now_ms - registered_at > policy.grace_ms(platform) => {
                return Some(ReapReason::NeverReported);
            }
            None => return Some(ReapReason::Malformed),
            _ => {}
        }
    }

    None
}

/// Observer rule — same shape as the device rule against `lastSeen`.
pub fn observer_reap_reason(
    observer: &ObserverRecord,
    now_ms: i64,
    policy: &ReaperPolicy,
) -> Option<ReapReason> {
    if !observer.online {
        if let Some(disconnected_at) = observer.disconnected_at {
            if now_ms - disconnected_at > policy.observer_offline_ms {
                return Some(ReapReason::OfflineTooLong);
            }
        }
    }

    if let Some(last_seen) = observer.last_seen {
        if now_ms - last_seen > policy.observer_offline_ms {
            return Some(ReapReason::UpdateTooOld);
        }
    } else if observer.disconnected_at.is_none() {
        match observer.registered_at {
            Some(registered_at) if now_ms - registered_at > policy.observer_offline_ms => {
                return Some(ReapReason::NeverReported);
            }
            None => return Some(ReapReason::Malformed),
            _ => {}
        }
    }

    None
}

/// Alert rule: past retention, or malformed (missing timestamp).
pub fn alert_reap_reason(
    alert: &AlertRecord,
    now_ms: i64,
    policy: &ReaperPolicy,
) -> Option<ReapReason> {
    match alert.timestamp {
        None => Some(ReapReason::Malformed),
        Some(ts) if now_ms - ts > policy.alert_retention_ms => Some(ReapReason::PastRetention),
        Some(_) => None,
    }
}

// ============================================================================
// Reaper
// ============================================================================

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Counts removed in a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub devices_removed: usize,
    pub observers_removed: usize,
    pub alerts_removed: usize,
    pub skipped_errors: usize,
}

/// Statistics accumulated across sweeps, exposed for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ReaperStats {
    pub sweeps_completed: u64,
    pub sweeps_failed: u64,
    pub devices_removed: u64,
    pub observers_removed: u64,
    pub alerts_removed: u64,
    pub last_run_ms: Option<i64>,
}

/// Periodic ghost-entry cleaner. One instance per deployment, passed by
/// handle to whatever task runs it — never a process-global.
pub struct Reaper {
    store: Arc<dyn SharedStore>,
    policy: ReaperPolicy,
    remote_timeout: Duration,
    stats: ReaperStats,
}

impl Reaper {
    pub fn new(store: Arc<dyn SharedStore>, policy: ReaperPolicy) -> Self {
        Self {
            store,
            policy,
            remote_timeout: Duration::from_secs(REMOTE_TIMEOUT_SECS),
            stats: ReaperStats::default(),
        }
    }

    /// Apply the remote-call timeout to a store future. A stalled network
    /// call must not wedge the sweep loop permanently.
    async fn remote<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.remote_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.remote_timeout)),
        }
    }

    /// Accumulated diagnostics.
    pub fn stats(&self) -> &ReaperStats {
        &self.stats
    }

    /// Run one sweep against the store at server time `now_ms`.
    pub async fn sweep(&mut self, now_ms: i64) -> Result<SweepOutcome, ReaperError> {
        let mut outcome = SweepOutcome::default();

        let (removed, skipped) = self
            .sweep_category::<DeviceRecord, _>(paths::DEVICES, now_ms, device_reap_reason)
            .await?;
        outcome.devices_removed = removed;
        outcome.skipped_errors += skipped;

        let (removed, skipped) = self
            .sweep_category::<ObserverRecord, _>(paths::OBSERVERS, now_ms, observer_reap_reason)
            .await?;
        outcome.observers_removed = removed;
        outcome.skipped_errors += skipped;

        let (removed, skipped) = self
            .sweep_category::<AlertRecord, _>(paths::ALERTS, now_ms, alert_reap_reason)
            .await?;
        outcome.alerts_removed = removed;
        outcome.skipped_errors += skipped;

        self.stats.sweeps_completed += 1;
        self.stats.devices_removed += outcome.devices_removed as u64;
        self.stats.observers_removed += outcome.observers_removed as u64;
        self.stats.alerts_removed += outcome.alerts_removed as u64;
        self.stats.last_run_ms = Some(now_ms);

        info!(
            devices = outcome.devices_removed,
            observers = outcome.observers_removed,
            alerts = outcome.alerts_removed,
            skipped = outcome.skipped_errors,
            "Reaper sweep complete"
        );
        Ok(outcome)
    }

    /// Sweep one top-level category, deleting matching entries and
    /// compacting the category node if the sweep emptied it.
    ///
    /// Returns `(removed, skipped_errors)`.
    async fn sweep_category<T, F>(
        &self,
        category: &str,
        now_ms: i64,
        rule: F,
    ) -> Result<(usize, usize), ReaperError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(&T, i64, &ReaperPolicy) -> Option<ReapReason>,
    {
        let Some(Value::Object(entries)) = self.remote(self.store.get(category)).await? else {
            return Ok((0, 0));
        };

        let total = entries.len();
        let mut removed = 0usize;
        let mut skipped = 0usize;
        for (key, value) in entries {
            let decision = match serde_json::from_value::<T>(value) {
                Ok(record) => rule(&record, now_ms, &self.policy),
                Err(e) => {
                    // Undecodable entry is a ghost by definition
                    debug!(category, key = %key, error = %e, "Removing undecodable entry");
                    Some(ReapReason::Malformed)
                }
            };

            let Some(reason) = decision else { continue };
            let path = format!("{category}/{key}");
            match self.remote(self.store.delete(&path)).await {
                Ok(()) => {
                    debug!(category, key = %key, reason = ?reason, "Reaped stale entry");
                    removed += 1;
                }
                Err(e) => {
                    // Skip-and-continue: the next sweep retries this entry
                    warn!(category, key = %key, error = %e, "Failed to reap entry — skipping");
                    skipped += 1;
                }
            }
        }

        if removed > 0 && removed == total {
            // Structural compaction of the emptied category node
            if let Err(e) = self.remote(self.store.delete(category)).await {
                warn!(category, error = %e, "Failed to compact empty category");
                skipped += 1;
            }
        }

        Ok((removed, skipped))
    }

    /// Record a failed sweep in the stats.
    fn record_failure(&mut self) {
        self.stats.sweeps_failed += 1;
    }
}

/// Run sweeps on a fixed interval until cancellation.
///
/// Pulls the server clock from `now_ms()` each tick; a sweep failure is
/// logged and the loop continues — cleanup is retried wholesale next tick.
pub async fn run_reaper_loop(
    mut reaper: Reaper,
    interval: Duration,
    now_ms: impl Fn() -> i64 + Send,
    cancel: CancellationToken,
) -> Reaper {
    info!(interval_secs = interval.as_secs(), "Reaper started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Reaper stopped");
                return reaper;
            }
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = reaper.sweep(now_ms()).await {
                    reaper.record_failure();
                    warn!(error = %e, "Reaper sweep failed — retrying next tick");
                }
            }
        }
    }
}

/// Default sweep interval from config/defaults.
pub fn default_sweep_interval() -> Duration {
    Duration::from_secs(REAPER_SWEEP_INTERVAL_SECS)
}
