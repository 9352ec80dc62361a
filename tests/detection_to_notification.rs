//! End-to-end pipeline tests over the in-process store.
//!
//! Drives real frames through the detection engine, publishes through the
//! presence layer and asserts on what the observer-side aggregator sees.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use beacon_watch::aggregator::{run_aggregator_loop, Aggregator, NotificationSink};
use beacon_watch::detection::{DetectionEngine, RgbaFrame};
use beacon_watch::monitor::{FrameEvent, FrameSource, MonitorLoop};
use beacon_watch::presence::{PresenceConfig, PresencePublisher, PresenceRole};
use beacon_watch::store::memory::MemoryStore;
use beacon_watch::store::{paths, SharedStore};
use beacon_watch::types::{DeviceInfo, Platform, Sensitivity};

/// Replays a fixed frame script at a small fixed cadence, then signals EOF.
///
/// The inter-frame sleep yields to the runtime so store watchers observe
/// the intermediate snapshots instead of only the final coalesced one.
struct ScriptedCamera {
    frames: std::vec::IntoIter<RgbaFrame>,
}

impl ScriptedCamera {
    fn new(frames: Vec<RgbaFrame>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedCamera {
    async fn next_frame(&mut self) -> FrameEvent {
        match self.frames.next() {
            Some(f) => {
                tokio::time::sleep(Duration::from_millis(1)).await;
                FrameEvent::Frame(f)
            }
            None => FrameEvent::Eof,
        }
    }

    fn source_name(&self) -> &str {
        "scripted-camera"
    }
}

#[derive(Default)]
struct CountingSink {
    total: AtomicU64,
    global: AtomicU64,
}

impl NotificationSink for CountingSink {
    fn notify(&self, _title: &str, _body: &str, correlation_key: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if correlation_key == "global" {
            self.global.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn fast_config() -> PresenceConfig {
    PresenceConfig {
        remote_timeout: Duration::from_secs(1),
        reregister_backoff_base: Duration::from_millis(10),
        reregister_max_attempts: 3,
        heartbeat_interval: Duration::from_millis(100),
        background_heartbeat_interval: Duration::from_millis(200),
    }
}

fn publisher(store: Arc<dyn SharedStore>, id: &str) -> Arc<Mutex<PresencePublisher>> {
    Arc::new(Mutex::new(PresencePublisher::new(
        store,
        id,
        PresenceRole::Device {
            name: format!("cam-{id}"),
            location: "front counter".to_string(),
            info: DeviceInfo {
                platform: Platform::Desktop,
                model: "test".to_string(),
                ..DeviceInfo::default()
            },
        },
        fast_config(),
    )))
}

fn dark() -> RgbaFrame {
    RgbaFrame::solid(16, 16, [12, 12, 16]).unwrap()
}

fn blue() -> RgbaFrame {
    RgbaFrame::solid(16, 16, [20, 40, 245]).unwrap()
}

async fn run_device(store: Arc<dyn SharedStore>, id: &str, frames: Vec<RgbaFrame>) {
    let device = publisher(Arc::clone(&store), id);
    device.lock().await.register().await.unwrap();

    let (ui_tx, _ui_rx) = watch::channel(None);
    let monitor = MonitorLoop::new(
        DetectionEngine::with_sensitivity(Sensitivity::new(1.5, 0.3, "high")),
        device,
        ui_tx,
        Arc::new(AtomicBool::new(false)),
        Arc::new(ArcSwap::from_pointee(1.0)),
        Arc::new(RwLock::new(None)),
    );
    monitor
        .run(Box::new(ScriptedCamera::new(frames)), CancellationToken::new())
        .await;
}

/// Calibration frames, then sustained blue light. The device should flip
/// to waiting, publish, push one alert, and the observer should fire
/// exactly one global notification.
#[tokio::test]
async fn blue_light_reaches_observer_as_one_notification() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());

    let sink = Arc::new(CountingSink::default());
    let sensitivity = Arc::new(ArcSwap::from_pointee(Sensitivity::new(1.0, 0.3, "observer")));
    let aggregator = Arc::new(Mutex::new(Aggregator::new(
        sensitivity,
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
    )));
    let cancel = CancellationToken::new();
    let agg_task = tokio::spawn(run_aggregator_loop(
        Arc::clone(&aggregator),
        Arc::clone(&store),
        cancel.clone(),
    ));
    // Give the aggregator its initial subscription before frames flow
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut frames = vec![dark(); 30];
    frames.extend(vec![blue(); 10]);
    run_device(Arc::clone(&store), "cam-1", frames).await;

    // Aggregator consumes store updates asynchronously
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    agg_task.await.unwrap();

    assert_eq!(sink.global.load(Ordering::Relaxed), 1);

    // The device's own alert record landed too
    let alerts = store.get(paths::ALERTS).await.unwrap().unwrap();
    assert_eq!(alerts.as_object().unwrap().len(), 1);
}

/// Blue light below the observer threshold stays invisible to the
/// observer even though the device publishes elevated intensity.
#[tokio::test]
async fn observer_threshold_filters_weak_signals() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());

    let sink = Arc::new(CountingSink::default());
    // Observer demands near-saturation intensity
    let sensitivity = Arc::new(ArcSwap::from_pointee(Sensitivity::new(1.0, 0.79, "strict")));
    let aggregator = Arc::new(Mutex::new(Aggregator::new(
        sensitivity,
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
    )));
    let cancel = CancellationToken::new();
    let agg_task = tokio::spawn(run_aggregator_loop(
        Arc::clone(&aggregator),
        Arc::clone(&store),
        cancel.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut frames = vec![dark(); 30];
    frames.extend(vec![blue(); 10]);
    run_device(Arc::clone(&store), "cam-1", frames).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    agg_task.await.unwrap();

    assert_eq!(sink.total.load(Ordering::Relaxed), 0);
}

/// A device that never leaves calibration publishes but never alerts.
#[tokio::test]
async fn calibration_only_run_produces_no_alerts() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());

    run_device(Arc::clone(&store), "cam-1", vec![dark(); 10]).await;

    assert!(store.get(paths::ALERTS).await.unwrap().is_none());
}
