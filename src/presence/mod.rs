//! Presence Publisher — owns one device's (or observer's) record in the
//! shared store.
//!
//! Registers identity, arms the dead-man's switch, sends heartbeats, and
//! re-registers with bounded backoff when connectivity returns. The
//! publisher is the *only* writer of its record (single-writer invariant),
//! so no cross-process coordination is needed for remote state.
//!
//! State machine:
//! `Unregistered → Registering → Active → (Disconnected → Reconnecting →
//! Active) | Removed`

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{HEARTBEAT_BACKGROUND_INTERVAL_SECS, HEARTBEAT_INTERVAL_SECS};
use crate::detection::Detection;
use crate::store::{paths, server_timestamp, SharedStore, StoreError};
use crate::types::DeviceInfo;

// ============================================================================
// Errors & States
// ============================================================================

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("reregistration failed after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },
}

/// Lifecycle state of a presence publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Unregistered,
    Registering,
    Active,
    Disconnected,
    Reconnecting,
    Removed,
}

impl std::fmt::Display for PresenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceState::Unregistered => write!(f, "UNREGISTERED"),
            PresenceState::Registering => write!(f, "REGISTERING"),
            PresenceState::Active => write!(f, "ACTIVE"),
            PresenceState::Disconnected => write!(f, "DISCONNECTED"),
            PresenceState::Reconnecting => write!(f, "RECONNECTING"),
            PresenceState::Removed => write!(f, "REMOVED"),
        }
    }
}

/// What kind of record this publisher owns.
#[derive(Debug, Clone)]
pub enum PresenceRole {
    Device {
        name: String,
        location: String,
        info: DeviceInfo,
    },
    Observer,
}

/// Tunables, defaulted from `config::defaults`.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub remote_timeout: Duration,
    pub reregister_backoff_base: Duration,
    pub reregister_max_attempts: u32,
    pub heartbeat_interval: Duration,
    pub background_heartbeat_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(crate::config::defaults::REMOTE_TIMEOUT_SECS),
            reregister_backoff_base: Duration::from_secs(
                crate::config::defaults::REREGISTER_BACKOFF_BASE_SECS,
            ),
            reregister_max_attempts: crate::config::defaults::REREGISTER_MAX_ATTEMPTS,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            background_heartbeat_interval: Duration::from_secs(
                HEARTBEAT_BACKGROUND_INTERVAL_SECS,
            ),
        }
    }
}

// ============================================================================
// Presence Publisher
// ============================================================================

/// Single-writer owner of one device/observer record.
pub struct PresencePublisher {
    store: Arc<dyn SharedStore>,
    id: String,
    role: PresenceRole,
    config: PresenceConfig,
    state: PresenceState,
    in_background: bool,
}

impl PresencePublisher {
    pub fn new(
        store: Arc<dyn SharedStore>,
        id: impl Into<String>,
        role: PresenceRole,
        config: PresenceConfig,
    ) -> Self {
        Self {
            store,
            id: id.into(),
            role,
            config,
            state: PresenceState::Unregistered,
            in_background: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn store(&self) -> Arc<dyn SharedStore> {
        Arc::clone(&self.store)
    }

    /// Mark the process backgrounded/foregrounded.
    ///
    /// The flag is tagged onto the next write; the presence loop picks the
    /// matching heartbeat cadence. Foreground resume should additionally
    /// call [`reregister`](Self::reregister) proactively.
    pub fn set_background(&mut self, in_background: bool) {
        self.in_background = in_background;
    }

    /// Heartbeat cadence for the current foreground/background state.
    pub fn heartbeat_interval(&self) -> Duration {
        if self.in_background {
            self.config.background_heartbeat_interval
        } else {
            self.config.heartbeat_interval
        }
    }

    /// Path of the record this publisher owns.
    fn record_path(&self) -> String {
        match self.role {
            PresenceRole::Device { .. } => paths::device(&self.id),
            PresenceRole::Observer => paths::observer(&self.id),
        }
    }

    /// Path receiving status/heartbeat updates and the disconnect write.
    fn status_path(&self) -> String {
        match self.role {
            PresenceRole::Device { .. } => paths::device_status(&self.id),
            PresenceRole::Observer => paths::observer(&self.id),
        }
    }

    /// Write the identity block and arm the dead-man's switch.
    ///
    /// The switch instructs the store to set `online=false,
    /// disconnectedAt=<server ts>` by itself when it observes this writer's
    /// connection drop. It is session-scoped — every reconnect must re-run
    /// this method to re-arm.
    pub async fn register(&mut self) -> Result<(), PresenceError> {
        self.state = PresenceState::Registering;

        let record = match &self.role {
            PresenceRole::Device {
                name,
                location,
                info,
            } => json!({
                "id": self.id,
                "name": name,
                "location": location,
                "info": serde_json::to_value(info).map_err(StoreError::from)?,
                "registeredAt": server_timestamp(),
                "status": {
                    "online": true,
                    "monitoring": true,
                    "waiting": false,
                    "intensity": 0.0,
                    "confidence": 0.0,
                    "isBackground": self.in_background,
                    "lastUpdate": server_timestamp(),
                },
            }),
            PresenceRole::Observer => json!({
                "id": self.id,
                "online": true,
                "isBackground": self.in_background,
                "registeredAt": server_timestamp(),
                "lastSeen": server_timestamp(),
            }),
        };

        let path = self.record_path();
        self.remote(self.store.set(&path, record)).await?;
        self.arm_dead_mans_switch().await?;

        self.state = PresenceState::Active;
        info!(id = %self.id, path = %path, "Registered and armed disconnect write");
        Ok(())
    }

    async fn arm_dead_mans_switch(&self) -> Result<(), PresenceError> {
        let mut partial = Map::new();
        partial.insert("online".to_string(), Value::from(false));
        partial.insert("disconnectedAt".to_string(), server_timestamp());
        self.remote(
            self.store
                .on_disconnect_update(&self.status_path(), partial),
        )
        .await
    }

    /// Refresh `lastSeen`/`lastUpdate` and `online=true`.
    ///
    /// A missed heartbeat is not fatal — the caller logs it and the record
    /// is caught up on the next connectivity restoration.
    pub async fn heartbeat(&mut self) -> Result<(), PresenceError> {
        let mut partial = Map::new();
        partial.insert("online".to_string(), Value::from(true));
        partial.insert("isBackground".to_string(), Value::from(self.in_background));
        let ts_field = match self.role {
            PresenceRole::Device { .. } => "lastUpdate",
            PresenceRole::Observer => "lastSeen",
        };
        partial.insert(ts_field.to_string(), server_timestamp());
        self.remote(self.store.update(&self.status_path(), partial))
            .await
    }

    /// Publish a throttled detection result into the status block.
    ///
    /// Device role only; observers have no status block to fill.
    pub async fn publish_status(
        &mut self,
        detection: &Detection,
        monitoring: bool,
        battery_level: f64,
    ) -> Result<(), PresenceError> {
        debug_assert!(matches!(self.role, PresenceRole::Device { .. }));

        let mut partial = Map::new();
        partial.insert("online".to_string(), Value::from(true));
        partial.insert("monitoring".to_string(), Value::from(monitoring));
        partial.insert("waiting".to_string(), Value::from(detection.waiting));
        partial.insert(
            "intensity".to_string(),
            Value::from(detection.normalized_intensity),
        );
        partial.insert(
            "confidence".to_string(),
            Value::from(detection.confidence),
        );
        partial.insert("batteryLevel".to_string(), Value::from(battery_level));
        partial.insert("isBackground".to_string(), Value::from(self.in_background));
        partial.insert("lastUpdate".to_string(), server_timestamp());
        self.remote(self.store.update(&self.status_path(), partial))
            .await
    }

    /// Append an alert record for a waiting transition.
    pub async fn push_alert(&self, message: &str) -> Result<(), PresenceError> {
        let alert_id = uuid::Uuid::new_v4().to_string();
        let record = json!({
            "deviceId": self.id,
            "message": message,
            "timestamp": server_timestamp(),
            "acknowledged": false,
        });
        self.remote(self.store.set(&paths::alert(&alert_id), record))
            .await
    }

    /// Recover remote visibility after connectivity loss or foreground
    /// resume.
    ///
    /// Retries `register()` up to the configured attempts with
    /// `attempt * backoff_base` between tries. Exhausting retries surfaces
    /// [`PresenceError::RecoveryExhausted`] — recoverable: local operation
    /// continues, remote visibility may be stale until the next trigger.
    pub async fn reregister(&mut self) -> Result<(), PresenceError> {
        self.state = PresenceState::Reconnecting;
        let max_attempts = self.config.reregister_max_attempts;

        for attempt in 1..=max_attempts {
            if self.reregister_attempt(attempt).await {
                return Ok(());
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.config.reregister_backoff_base * attempt).await;
            }
        }

        self.state = PresenceState::Disconnected;
        Err(PresenceError::RecoveryExhausted {
            attempts: max_attempts,
        })
    }

    /// One recovery attempt; `true` means the record is visible again.
    ///
    /// Skips the remote round-trip entirely while the store reports
    /// disconnected.
    async fn reregister_attempt(&mut self, attempt: u32) -> bool {
        if !*self.store.watch_connected().borrow() {
            debug!(id = %self.id, attempt, "Store not connected, backing off");
            return false;
        }
        match self.register().await {
            Ok(()) => {
                info!(id = %self.id, attempt, "Reregistration succeeded");
                true
            }
            Err(e) => {
                warn!(id = %self.id, attempt, error = %e, "Reregistration attempt failed");
                false
            }
        }
    }

    /// Mark the session disconnected (server will have fired the switch).
    pub fn mark_disconnected(&mut self) {
        if self.state == PresenceState::Active {
            self.state = PresenceState::Disconnected;
        }
    }

    /// Explicitly remove this writer's own record.
    ///
    /// Best-effort: failures are logged and swallowed so local shutdown is
    /// never blocked by a remote write.
    pub async fn deregister(&mut self) {
        // Disarm first; a drop after an explicit removal must not
        // resurrect a partial status node.
        if let Err(e) = self
            .remote(self.store.cancel_disconnect_updates(&self.status_path()))
            .await
        {
            warn!(id = %self.id, error = %e, "Disarm failed — ignoring");
        }
        let path = self.record_path();
        match self.remote(self.store.delete(&path)).await {
            Ok(()) => debug!(id = %self.id, "Deregistered"),
            Err(e) => warn!(id = %self.id, error = %e, "Deregistration failed — ignoring"),
        }
        self.state = PresenceState::Removed;
    }

    /// Apply the remote-call timeout to a store future.
    async fn remote<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, PresenceError> {
        match tokio::time::timeout(self.config.remote_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PresenceError::Timeout(self.config.remote_timeout)),
        }
    }
}

// ============================================================================
// Presence Loop
// ============================================================================

/// Run heartbeats and connectivity-driven recovery until cancellation.
///
/// `recover_rx` lets other components (health monitor, foreground-resume
/// hooks) request an immediate reregistration. Cancellation performs one
/// best-effort deregistration and returns.
pub async fn run_presence_loop(
    publisher: Arc<Mutex<PresencePublisher>>,
    mut recover_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let (id, mut connected_rx) = {
        let guard = publisher.lock().await;
        (guard.id().to_string(), guard.store().watch_connected())
    };
    info!(id = %id, "Presence loop started");

    loop {
        let interval = publisher.lock().await.heartbeat_interval();
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            _ = tokio::time::sleep(interval) => {
                let mut guard = publisher.lock().await;
                if guard.state() == PresenceState::Active {
                    if let Err(e) = guard.heartbeat().await {
                        warn!(id = %id, error = %e, "Heartbeat failed — will catch up on reconnect");
                    }
                }
            }
            changed = connected_rx.changed() => {
                if changed.is_err() {
                    warn!(id = %id, "Connectivity stream closed");
                    break;
                }
                let connected = *connected_rx.borrow_and_update();
                if connected {
                    info!(id = %id, "Connectivity restored — reregistering");
                    recover_with_backoff(&publisher, &id).await;
                } else {
                    publisher.lock().await.mark_disconnected();
                    debug!(id = %id, "Store connection lost");
                }
            }
            Some(()) = recover_rx.recv() => {
                recover_with_backoff(&publisher, &id).await;
            }
        }
    }

    // Best-effort cleanup; never blocks shutdown beyond the remote timeout.
    publisher.lock().await.deregister().await;
    info!(id = %id, "Presence loop stopped");
}

/// Retry/backoff recovery that locks the publisher per attempt only.
///
/// Backoff sleeps run with the mutex released, so status publishes and
/// alert writes on the monitor side never stall behind an outage.
async fn recover_with_backoff(publisher: &Arc<Mutex<PresencePublisher>>, id: &str) {
    let (max_attempts, backoff_base) = {
        let mut guard = publisher.lock().await;
        guard.state = PresenceState::Reconnecting;
        (
            guard.config.reregister_max_attempts,
            guard.config.reregister_backoff_base,
        )
    };

    for attempt in 1..=max_attempts {
        if publisher.lock().await.reregister_attempt(attempt).await {
            return;
        }
        if attempt < max_attempts {
            tokio::time::sleep(backoff_base * attempt).await;
        }
    }

    publisher.lock().await.state = PresenceState::Disconnected;
    warn!(
        id = %id,
        attempts = max_attempts,
        "Recovery exhausted — running with stale remote visibility"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::Platform;

    fn fast_config() -> PresenceConfig {
        PresenceConfig {
            remote_timeout: Duration::from_millis(200),
            reregister_backoff_base: Duration::from_millis(1),
            reregister_max_attempts: 3,
            heartbeat_interval: Duration::from_millis(10),
            background_heartbeat_interval: Duration::from_millis(40),
        }
    }

    fn device_publisher(store: Arc<MemoryStore>) -> PresencePublisher {
        PresencePublisher::new(
            store,
            "dev-1",
            PresenceRole::Device {
                name: "front-desk".to_string(),
                location: "lobby".to_string(),
                info: DeviceInfo {
                    platform: Platform::Mobile,
                    model: "test".to_string(),
                    app_version: "1.0".to_string(),
                },
            },
            fast_config(),
        )
    }

    #[tokio::test]
    async fn register_writes_record_and_becomes_active() {
        let store = Arc::new(MemoryStore::new());
        store.set_now(1_000);
        let mut publisher = device_publisher(Arc::clone(&store));

        publisher.register().await.unwrap();
        assert_eq!(publisher.state(), PresenceState::Active);

        let record = store.get("devices/dev-1").await.unwrap().unwrap();
        assert_eq!(record["name"], "front-desk");
        assert_eq!(record["registeredAt"], 1_000);
        assert_eq!(record["status"]["online"], true);
    }

    #[tokio::test]
    async fn abrupt_disconnect_marks_offline_via_switch() {
        let store = Arc::new(MemoryStore::new());
        store.set_now(1_000);
        let mut publisher = device_publisher(Arc::clone(&store));
        publisher.register().await.unwrap();

        store.set_now(42_000);
        store.simulate_disconnect().await;
        store.reconnect();

        let status = store.get("devices/dev-1/status").await.unwrap().unwrap();
        assert_eq!(status["online"], false);
        assert_eq!(status["disconnectedAt"], 42_000);
    }

    #[tokio::test]
    async fn heartbeat_advances_last_update() {
        let store = Arc::new(MemoryStore::new());
        store.set_now(1_000);
        let mut publisher = device_publisher(Arc::clone(&store));
        publisher.register().await.unwrap();

        store.set_now(16_000);
        publisher.heartbeat().await.unwrap();

        let status = store.get("devices/dev-1/status").await.unwrap().unwrap();
        assert_eq!(status["lastUpdate"], 16_000);
        assert_eq!(status["online"], true);
    }

    #[tokio::test]
    async fn observer_register_uses_last_seen() {
        let store = Arc::new(MemoryStore::new());
        store.set_now(2_000);
        let mut publisher = PresencePublisher::new(
            Arc::clone(&store) as Arc<dyn SharedStore>,
            "obs-1",
            PresenceRole::Observer,
            fast_config(),
        );
        publisher.register().await.unwrap();

        let record = store.get("observers/obs-1").await.unwrap().unwrap();
        assert_eq!(record["online"], true);
        assert_eq!(record["lastSeen"], 2_000);
        assert_eq!(record["registeredAt"], 2_000);
    }

    #[tokio::test]
    async fn reregister_exhausts_and_surfaces_recoverable_error() {
        let store = Arc::new(MemoryStore::new());
        let mut publisher = device_publisher(Arc::clone(&store));
        store.simulate_disconnect().await;

        let err = publisher.reregister().await.unwrap_err();
        assert!(matches!(
            err,
            PresenceError::RecoveryExhausted { attempts: 3 }
        ));
        assert_eq!(publisher.state(), PresenceState::Disconnected);
    }

    #[tokio::test]
    async fn reregister_succeeds_when_connected() {
        let store = Arc::new(MemoryStore::new());
        let mut publisher = device_publisher(Arc::clone(&store));
        publisher.reregister().await.unwrap();
        assert_eq!(publisher.state(), PresenceState::Active);
        assert!(store.get("devices/dev-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deregister_swallows_failures() {
        let store = Arc::new(MemoryStore::new());
        let mut publisher = device_publisher(Arc::clone(&store));
        publisher.register().await.unwrap();

        store.simulate_disconnect().await;
        // Must not error or hang even though the store is unreachable
        publisher.deregister().await;
        assert_eq!(publisher.state(), PresenceState::Removed);
    }

    #[tokio::test]
    async fn deregister_disarms_the_dead_mans_switch() {
        let store = Arc::new(MemoryStore::new());
        let mut publisher = device_publisher(Arc::clone(&store));
        publisher.register().await.unwrap();
        publisher.deregister().await;

        // A later drop must not resurrect a status node for the removed record
        store.simulate_disconnect().await;
        store.reconnect();
        assert!(store.get("devices/dev-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recovery_backoff_leaves_the_publisher_lock_free() {
        let store = Arc::new(MemoryStore::new());
        let mut config = fast_config();
        config.reregister_backoff_base = Duration::from_millis(200);
        let publisher = Arc::new(Mutex::new(PresencePublisher::new(
            Arc::clone(&store) as Arc<dyn SharedStore>,
            "dev-1",
            PresenceRole::Observer,
            config,
        )));
        store.simulate_disconnect().await;

        let cancel = CancellationToken::new();
        let (recover_tx, recover_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_presence_loop(
            Arc::clone(&publisher),
            recover_rx,
            cancel.clone(),
        ));

        recover_tx.send(()).await.unwrap();
        // Land inside the first backoff sleep
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = tokio::time::Instant::now();
        let state = publisher.lock().await.state();
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "publisher lock held across recovery backoff"
        );
        assert_eq!(state, PresenceState::Reconnecting);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn background_switches_heartbeat_cadence() {
        let store = Arc::new(MemoryStore::new());
        let mut publisher = device_publisher(store);
        assert_eq!(publisher.heartbeat_interval(), Duration::from_millis(10));
        publisher.set_background(true);
        assert_eq!(publisher.heartbeat_interval(), Duration::from_millis(40));
    }
}
