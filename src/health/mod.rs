//! Health monitor — periodic check loop with automatic recovery
//!
//! Watches the parts of the device that can silently fail and nudges
//! them back to life:
//! - Registration: device record vanished remotely (reaped or wiped)
//!   while we are still running → trigger re-registration
//! - Connectivity: store reports disconnected → presence loop owns the
//!   recovery, the monitor only surfaces it
//! - Detection liveness: no frame analyzed recently → capture stalled

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::defaults::{
    DETECTION_STALENESS_SECS, HEALTH_CHECK_INTERVAL_SECS, REMOTE_TIMEOUT_SECS,
};
use crate::store::{paths, SharedStore};

/// Component health status
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// Component is operating normally
    Healthy,
    /// Component is running but with reduced capability
    Degraded { reason: String },
    /// Component is not operational
    Unhealthy { reason: String },
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded { reason } => write!(f, "DEGRADED: {}", reason),
            HealthStatus::Unhealthy { reason } => write!(f, "UNHEALTHY: {}", reason),
        }
    }
}

/// Action taken by a health check to heal a component
#[derive(Debug, Clone)]
pub enum HealAction {
    /// Requested re-registration from the presence loop
    ReregistrationRequested,
    /// Recovery is owned by another task; nothing to do here
    DelegatedRecovery { owner: String },
    /// No action was needed
    NoActionNeeded,
    /// Could not self-heal — requires manual intervention
    ManualInterventionRequired { reason: String },
}

impl std::fmt::Display for HealAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealAction::ReregistrationRequested => write!(f, "re-registration requested"),
            HealAction::DelegatedRecovery { owner } => {
                write!(f, "recovery delegated to {}", owner)
            }
            HealAction::NoActionNeeded => write!(f, "no action needed"),
            HealAction::ManualInterventionRequired { reason } => {
                write!(f, "manual intervention required: {}", reason)
            }
        }
    }
}

/// Trait for component health checks
///
/// The monitor calls `check()` every cycle and `heal()` when unhealthy.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name of the component being checked
    fn component_name(&self) -> &str;

    /// Check the component's health
    async fn check(&self) -> HealthStatus;

    /// Attempt to heal the component
    async fn heal(&self) -> HealAction;
}

/// Health status for a single component
#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_checked: Instant,
    pub last_action: Option<HealAction>,
}

/// Aggregated system health
#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub components: Vec<ComponentHealth>,
    /// Overall system status (worst of all components)
    pub overall: HealthStatus,
    /// Number of completed health check cycles
    pub check_cycles: u64,
}

impl SystemHealth {
    fn new() -> Self {
        Self {
            components: Vec::new(),
            overall: HealthStatus::Healthy,
            check_cycles: 0,
        }
    }
}

// ============================================================================
// Checks
// ============================================================================

/// Device record presence check
///
/// A reaper (ours or another observer's) may remove our record while we
/// are still alive, for example after a long clock skew or a missed
/// heartbeat window. Healing asks the presence loop to re-register.
pub struct RegistrationCheck {
    store: Arc<dyn SharedStore>,
    device_id: String,
    recover_tx: mpsc::Sender<()>,
    remote_timeout: Duration,
}

impl RegistrationCheck {
    pub fn new(
        store: Arc<dyn SharedStore>,
        device_id: impl Into<String>,
        recover_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            store,
            device_id: device_id.into(),
            recover_tx,
            remote_timeout: Duration::from_secs(REMOTE_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl HealthCheck for RegistrationCheck {
    fn component_name(&self) -> &str {
        "Registration"
    }

    async fn check(&self) -> HealthStatus {
        // A missing record only means something while connected; offline
        // reads prove nothing.
        if !*self.store.watch_connected().borrow() {
            return HealthStatus::Degraded {
                reason: "Store disconnected — registration state unknown".to_string(),
            };
        }
        // Bounded read: a stalled store call must not wedge the cycle
        let read = tokio::time::timeout(
            self.remote_timeout,
            self.store.get(&paths::device(&self.device_id)),
        )
        .await;
        match read {
            Ok(Ok(Some(_))) => HealthStatus::Healthy,
            Ok(Ok(None)) => HealthStatus::Unhealthy {
                reason: format!("Device record {} missing remotely", self.device_id),
            },
            Ok(Err(e)) => HealthStatus::Degraded {
                reason: format!("Could not read device record: {}", e),
            },
            Err(_) => HealthStatus::Degraded {
                reason: format!(
                    "Device record read timed out after {:?}",
                    self.remote_timeout
                ),
            },
        }
    }

    async fn heal(&self) -> HealAction {
        match self.recover_tx.try_send(()) {
            Ok(()) => HealAction::ReregistrationRequested,
            // A pending request already queued is as good as a new one
            Err(mpsc::error::TrySendError::Full(())) => HealAction::NoActionNeeded,
            Err(mpsc::error::TrySendError::Closed(())) => {
                HealAction::ManualInterventionRequired {
                    reason: "Presence loop is gone — cannot re-register".to_string(),
                }
            }
        }
    }
}

/// Store connectivity check
///
/// Reconnection itself is the transport's job and the presence loop
/// reacts to the connected stream; this check only surfaces the state.
pub struct ConnectivityCheck {
    store: Arc<dyn SharedStore>,
}

impl ConnectivityCheck {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for ConnectivityCheck {
    fn component_name(&self) -> &str {
        "Store Connectivity"
    }

    async fn check(&self) -> HealthStatus {
        if *self.store.watch_connected().borrow() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy {
                reason: "Store disconnected".to_string(),
            }
        }
    }

    async fn heal(&self) -> HealAction {
        warn!("Store disconnected — presence loop handles reconnection");
        HealAction::DelegatedRecovery {
            owner: "presence loop".to_string(),
        }
    }
}

/// Detection liveness check
///
/// The monitor loop stamps this after every analyzed frame; a stale
/// stamp means the capture source stopped delivering.
pub struct DetectionLivenessCheck {
    last_sample: Arc<RwLock<Option<Instant>>>,
    staleness: Duration,
}

impl DetectionLivenessCheck {
    pub fn new(last_sample: Arc<RwLock<Option<Instant>>>) -> Self {
        Self {
            last_sample,
            staleness: Duration::from_secs(DETECTION_STALENESS_SECS),
        }
    }
}

#[async_trait]
impl HealthCheck for DetectionLivenessCheck {
    fn component_name(&self) -> &str {
        "Detection Liveness"
    }

    async fn check(&self) -> HealthStatus {
        // try_read so a held write lock never stalls the health cycle
        match self.last_sample.try_read() {
            Ok(guard) => match *guard {
                Some(last) if last.elapsed() > self.staleness => HealthStatus::Unhealthy {
                    reason: format!("No frame analyzed for {:.0}s", last.elapsed().as_secs_f64()),
                },
                Some(_) => HealthStatus::Healthy,
                None => HealthStatus::Degraded {
                    reason: "No frames analyzed yet".to_string(),
                },
            },
            Err(_) => HealthStatus::Degraded {
                reason: "Could not read sample timestamp (lock contention)".to_string(),
            },
        }
    }

    async fn heal(&self) -> HealAction {
        warn!("Frame source stalled — capture restart is up to the frame source");
        HealAction::ManualInterventionRequired {
            reason: "Frame source stopped delivering".to_string(),
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Runs registered health checks on a fixed cadence and heals what it can
pub struct HealthMonitor {
    checks: Vec<Box<dyn HealthCheck>>,
    interval: Duration,
    /// Current system health state, shared with status reporting
    health: Arc<RwLock<SystemHealth>>,
}

impl HealthMonitor {
    pub fn new(checks: Vec<Box<dyn HealthCheck>>) -> Self {
        Self {
            checks,
            interval: Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS),
            health: Arc::new(RwLock::new(SystemHealth::new())),
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Shared handle to the latest system health snapshot
    pub fn health_handle(&self) -> Arc<RwLock<SystemHealth>> {
        self.health.clone()
    }

    /// Run the health check loop until cancelled (call from tokio::spawn)
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            checks = self.checks.len(),
            interval_secs = self.interval.as_secs(),
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Health monitor stopped");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.run_cycle().await;
                }
            }
        }
    }

    /// Run one health check cycle
    async fn run_cycle(&self) {
        let mut components = Vec::with_capacity(self.checks.len());
        let mut worst = HealthStatus::Healthy;

        for check in &self.checks {
            let status = check.check().await;
            let action = match &status {
                HealthStatus::Unhealthy { .. } => {
                    error!(
                        component = check.component_name(),
                        status = %status,
                        "Component unhealthy — attempting heal"
                    );
                    Some(check.heal().await)
                }
                HealthStatus::Degraded { .. } => {
                    warn!(
                        component = check.component_name(),
                        status = %status,
                        "Component degraded"
                    );
                    None
                }
                HealthStatus::Healthy => {
                    debug!(component = check.component_name(), "Component healthy");
                    None
                }
            };

            if let Some(ref action) = action {
                info!(
                    component = check.component_name(),
                    action = %action,
                    "Heal action taken"
                );
            }

            // Track worst status
            match (&worst, &status) {
                (HealthStatus::Healthy, HealthStatus::Degraded { .. })
                | (HealthStatus::Healthy, HealthStatus::Unhealthy { .. })
                | (HealthStatus::Degraded { .. }, HealthStatus::Unhealthy { .. }) => {
                    worst = status.clone();
                }
                _ => {}
            }

            components.push(ComponentHealth {
                name: check.component_name().to_string(),
                status,
                last_checked: Instant::now(),
                last_action: action,
            });
        }

        let mut health = self.health.write().await;
        health.components = components;
        health.overall = worst;
        health.check_cycles += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{PartialUpdate, SharedStore, StoreError};
    use serde_json::json;
    use tokio::sync::watch;

    struct FixedCheck {
        name: &'static str,
        status: HealthStatus,
    }

    #[async_trait]
    impl HealthCheck for FixedCheck {
        fn component_name(&self) -> &str {
            self.name
        }
        async fn check(&self) -> HealthStatus {
            self.status.clone()
        }
        async fn heal(&self) -> HealAction {
            HealAction::NoActionNeeded
        }
    }

    #[tokio::test]
    async fn overall_is_worst_component_status() {
        let monitor = HealthMonitor::new(vec![
            Box::new(FixedCheck {
                name: "a",
                status: HealthStatus::Healthy,
            }),
            Box::new(FixedCheck {
                name: "b",
                status: HealthStatus::Degraded {
                    reason: "slow".to_string(),
                },
            }),
            Box::new(FixedCheck {
                name: "c",
                status: HealthStatus::Unhealthy {
                    reason: "down".to_string(),
                },
            }),
        ]);
        let handle = monitor.health_handle();
        monitor.run_cycle().await;

        let health = handle.read().await;
        assert_eq!(health.check_cycles, 1);
        assert_eq!(health.components.len(), 3);
        assert!(matches!(health.overall, HealthStatus::Unhealthy { .. }));
    }

    #[tokio::test]
    async fn registration_check_flags_missing_record() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::channel(1);
        let check = RegistrationCheck::new(
            Arc::clone(&store) as Arc<dyn SharedStore>,
            "dev-1",
            tx,
        );

        assert!(matches!(check.check().await, HealthStatus::Unhealthy { .. }));
        assert!(matches!(
            check.heal().await,
            HealAction::ReregistrationRequested
        ));
        assert!(rx.try_recv().is_ok());

        store
            .set(&paths::device("dev-1"), json!({"id": "dev-1"}))
            .await
            .unwrap();
        assert_eq!(check.check().await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn registration_check_degrades_while_disconnected() {
        let store = Arc::new(MemoryStore::new());
        store.simulate_disconnect().await;
        let (tx, _rx) = mpsc::channel(1);
        let check =
            RegistrationCheck::new(Arc::clone(&store) as Arc<dyn SharedStore>, "dev-1", tx);

        assert!(matches!(check.check().await, HealthStatus::Degraded { .. }));
    }

    /// Store whose every remote call hangs forever.
    struct StalledStore;

    #[async_trait]
    impl SharedStore for StalledStore {
        async fn set(&self, _: &str, _: serde_json::Value) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn update(&self, _: &str, _: PartialUpdate) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _: &str) -> Result<Option<serde_json::Value>, StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn on_disconnect_update(&self, _: &str, _: PartialUpdate) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn cancel_disconnect_updates(&self, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn watch(
            &self,
            _: &str,
        ) -> Result<watch::Receiver<Option<serde_json::Value>>, StoreError> {
            std::future::pending().await
        }
        fn watch_connected(&self) -> watch::Receiver<bool> {
            watch::channel(true).1
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registration_check_survives_a_stalled_store() {
        let (tx, _rx) = mpsc::channel(1);
        let check = RegistrationCheck::new(Arc::new(StalledStore), "dev-1", tx);
        assert!(matches!(check.check().await, HealthStatus::Degraded { .. }));
    }

    #[tokio::test]
    async fn repeated_heal_with_queued_request_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::channel(1);
        let check =
            RegistrationCheck::new(Arc::clone(&store) as Arc<dyn SharedStore>, "dev-1", tx);

        assert!(matches!(
            check.heal().await,
            HealAction::ReregistrationRequested
        ));
        // Channel capacity 1 — a second heal finds the request still queued
        assert!(matches!(check.heal().await, HealAction::NoActionNeeded));
    }

    #[tokio::test]
    async fn connectivity_check_tracks_store_state() {
        let store = Arc::new(MemoryStore::new());
        let check = ConnectivityCheck::new(Arc::clone(&store) as Arc<dyn SharedStore>);

        assert_eq!(check.check().await, HealthStatus::Healthy);
        store.simulate_disconnect().await;
        assert!(matches!(check.check().await, HealthStatus::Unhealthy { .. }));
        store.reconnect();
        assert_eq!(check.check().await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn liveness_check_reports_no_frames_then_healthy() {
        let last_sample = Arc::new(RwLock::new(None));
        let check = DetectionLivenessCheck::new(Arc::clone(&last_sample));

        assert!(matches!(check.check().await, HealthStatus::Degraded { .. }));

        *last_sample.write().await = Some(Instant::now());
        assert_eq!(check.check().await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancellation() {
        let monitor = HealthMonitor::new(vec![]).with_interval(Duration::from_millis(5));
        let handle = monitor.health_handle();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(handle.read().await.check_cycles >= 1);
    }
}
