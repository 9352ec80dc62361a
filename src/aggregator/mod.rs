//! Aggregator — folds many devices' published states into one global
//! alert signal with edge-triggered notification.
//!
//! Subscribes to the full device collection as a single changing snapshot.
//! Per snapshot it recomputes every device's `detected` flag under the
//! *observer's own* threshold — independently of the device's onboard
//! threshold (two-layer sensitivity, inherited behavior) — folds those
//! into `global_waiting`, and fires the notification sink only on the
//! false→true transition. Repeated true snapshots while already waiting do
//! not re-notify; at-least-once delivery deduplicated by edge detection is
//! the contract.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{paths, SharedStore};
use crate::types::{DeviceRecord, Sensitivity};

// ============================================================================
// Notification sink
// ============================================================================

/// Delivery transport seam (push delivery itself is out of scope).
///
/// Called at most once per edge; the correlation key lets the transport
/// deduplicate retries downstream.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, body: &str, correlation_key: &str);
}

// ============================================================================
// Aggregator
// ============================================================================

/// Per-device evaluation under the observer threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSignal {
    pub record: DeviceRecord,
    /// `intensity >= observer threshold` — observer-layer decision
    pub detected: bool,
    /// Device qualifies for the global fold (`online && monitoring && detected`)
    pub qualifying: bool,
}

/// Fan-in of all device records into one edge-triggered global signal.
pub struct Aggregator {
    sensitivity: Arc<ArcSwap<Sensitivity>>,
    sink: Arc<dyn NotificationSink>,
    devices: HashMap<String, DeviceSignal>,
    global_waiting: bool,
    /// Previous qualifying state per device, for the per-device edge path
    device_waiting: HashMap<String, bool>,
    notifications_sent: u64,
}

impl Aggregator {
    pub fn new(sensitivity: Arc<ArcSwap<Sensitivity>>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sensitivity,
            sink,
            devices: HashMap::new(),
            global_waiting: false,
            device_waiting: HashMap::new(),
            notifications_sent: 0,
        }
    }

    /// Current global alert state.
    pub fn global_waiting(&self) -> bool {
        self.global_waiting
    }

    /// Latest evaluated device signals.
    pub fn devices(&self) -> &HashMap<String, DeviceSignal> {
        &self.devices
    }

    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent
    }

    /// Apply a fresh snapshot of the device collection.
    pub fn apply_snapshot(&mut self, snapshot: HashMap<String, DeviceRecord>) {
        self.devices = snapshot
            .into_iter()
            .map(|(id, record)| {
                let signal = self.evaluate(record);
                (id, signal)
            })
            .collect();
        self.fold();
    }

    /// Swap the observer threshold and re-evaluate the held snapshot
    /// immediately — no wait for the next store update.
    pub fn set_sensitivity(&mut self, sensitivity: Sensitivity) {
        info!(
            threshold = sensitivity.threshold,
            label = %sensitivity.label,
            "Observer sensitivity changed — re-evaluating held devices"
        );
        self.sensitivity.store(Arc::new(sensitivity));
        let records: Vec<DeviceRecord> = self
            .devices
            .values()
            .map(|s| s.record.clone())
            .collect();
        self.devices = records
            .into_iter()
            .map(|record| (record.id.clone(), self.evaluate(record)))
            .collect();
        self.fold();
    }

    fn evaluate(&self, record: DeviceRecord) -> DeviceSignal {
        let threshold = self.sensitivity.load().threshold;
        let detected = record.status.intensity >= threshold;
        let qualifying = record.status.online && record.status.monitoring && detected;
        DeviceSignal {
            record,
            detected,
            qualifying,
        }
    }

    /// Recompute the global signal and fire edge-triggered notifications.
    fn fold(&mut self) {
        // Per-device edges first — an independent notification path keyed
        // by device/location.
        for (id, signal) in &self.devices {
            let was = self.device_waiting.get(id).copied().unwrap_or(false);
            if signal.qualifying && !was {
                let location = if signal.record.location.is_empty() {
                    signal.record.name.clone()
                } else {
                    signal.record.location.clone()
                };
                self.sink.notify(
                    "Customer waiting",
                    &format!("Blue light detected at {location}"),
                    &format!("device:{id}"),
                );
                self.notifications_sent += 1;
            }
            self.device_waiting.insert(id.clone(), signal.qualifying);
        }
        self.device_waiting
            .retain(|id, _| self.devices.contains_key(id));

        let now_waiting = self.devices.values().any(|s| s.qualifying);
        if now_waiting && !self.global_waiting {
            let count = self.devices.values().filter(|s| s.qualifying).count();
            self.sink.notify(
                "Customer waiting",
                &format!("{count} device(s) report a waiting customer"),
                "global",
            );
            self.notifications_sent += 1;
            debug!(qualifying = count, "Global signal: NotWaiting → Waiting");
        } else if !now_waiting && self.global_waiting {
            debug!("Global signal: Waiting → NotWaiting");
        }
        self.global_waiting = now_waiting;
    }
}

/// Decode a raw `devices` snapshot into typed records.
///
/// Undecodable entries are skipped with a warning — one corrupt record
/// must not blind the observer to the rest of the fleet.
pub fn decode_snapshot(value: Option<&Value>) -> HashMap<String, DeviceRecord> {
    let Some(Value::Object(entries)) = value else {
        return HashMap::new();
    };
    entries
        .iter()
        .filter_map(|(id, raw)| {
            match serde_json::from_value::<DeviceRecord>(raw.clone()) {
                Ok(record) => Some((id.clone(), record)),
                Err(e) => {
                    warn!(device_id = %id, error = %e, "Skipping undecodable device record");
                    None
                }
            }
        })
        .collect()
}

/// Subscribe to the device collection and feed snapshots into the
/// aggregator until cancellation.
pub async fn run_aggregator_loop(
    aggregator: Arc<tokio::sync::Mutex<Aggregator>>,
    store: Arc<dyn SharedStore>,
    cancel: CancellationToken,
) {
    let mut rx = match store.watch(paths::DEVICES).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(error = %e, "Could not subscribe to device collection");
            return;
        }
    };
    info!("Aggregator started");

    // Evaluate whatever is already there before waiting for changes.
    {
        let snapshot = decode_snapshot(rx.borrow_and_update().as_ref());
        aggregator.lock().await.apply_snapshot(snapshot);
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Aggregator stopped");
                return;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    warn!("Device collection stream closed");
                    return;
                }
                let snapshot = decode_snapshot(rx.borrow_and_update().as_ref());
                aggregator.lock().await.apply_snapshot(snapshot);
            }
        }
    }
}
