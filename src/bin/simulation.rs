//! End-to-end scenario runner against the in-process store.
//!
//! Walks the whole pipeline without hardware or a network: a device
//! calibrates, sees blue light, the observer fires its notification, a
//! second device drops off the network and the dead-man's switch plus
//! reaper clean up after it.
//!
//! ```bash
//! cargo run --release --bin simulation
//! ```

use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use clap::Parser;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

use beacon_watch::aggregator::{run_aggregator_loop, Aggregator, NotificationSink};
use beacon_watch::config::{self, WatchConfig};
use beacon_watch::detection::{DetectionEngine, RgbaFrame};
use beacon_watch::monitor::{FrameEvent, FrameSource, MonitorLoop};
use beacon_watch::presence::{PresenceConfig, PresencePublisher, PresenceRole};
use beacon_watch::reaper::{Reaper, ReaperPolicy};
use beacon_watch::store::memory::MemoryStore;
use beacon_watch::store::{paths, SharedStore};
use beacon_watch::types::{DeviceInfo, Platform, Sensitivity};

#[derive(Parser, Debug)]
#[command(name = "simulation")]
#[command(about = "beacon-watch end-to-end scenario against the in-process store")]
struct CliArgs {
    /// Milliseconds between simulated frames (0 = as fast as possible)
    #[arg(long, default_value = "10")]
    frame_ms: u64,
}

/// Scripted camera: calibration darkness, a blue burst, then darkness again.
struct ScenarioCamera {
    frame_ms: u64,
    emitted: usize,
    rng: rand::rngs::StdRng,
}

impl ScenarioCamera {
    const CALIBRATION_FRAMES: usize = 30;
    const BLUE_FRAMES: usize = 20;
    const COOLDOWN_FRAMES: usize = 10;

    fn new(frame_ms: u64) -> Self {
        use rand::SeedableRng;
        Self {
            frame_ms,
            emitted: 0,
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    fn frame(&mut self, blue: bool) -> RgbaFrame {
        use rand::Rng;
        let (w, h) = (64usize, 48usize);
        let mut data = Vec::with_capacity(w * h * 4);
        for _ in 0..(w * h) {
            let noise: u8 = self.rng.gen_range(8..24);
            if blue {
                data.extend_from_slice(&[noise, noise.saturating_add(10), 235, 255]);
            } else {
                data.extend_from_slice(&[noise, noise, noise.saturating_add(4), 255]);
            }
        }
        // Dimensions are fixed constants; construction cannot fail
        RgbaFrame::new(w, h, data).expect("valid scenario frame")
    }
}

#[async_trait]
impl FrameSource for ScenarioCamera {
    async fn next_frame(&mut self) -> FrameEvent {
        if self.frame_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.frame_ms)).await;
        }
        let total =
            Self::CALIBRATION_FRAMES + Self::BLUE_FRAMES + Self::COOLDOWN_FRAMES;
        if self.emitted >= total {
            return FrameEvent::Eof;
        }
        let blue = (Self::CALIBRATION_FRAMES
            ..Self::CALIBRATION_FRAMES + Self::BLUE_FRAMES)
            .contains(&self.emitted);
        self.emitted += 1;
        FrameEvent::Frame(self.frame(blue))
    }

    fn source_name(&self) -> &str {
        "scenario-camera"
    }
}

/// Counts and logs observer notifications.
#[derive(Default)]
struct CountingSink {
    count: std::sync::atomic::AtomicU64,
}

impl NotificationSink for CountingSink {
    fn notify(&self, title: &str, body: &str, correlation_key: &str) {
        self.count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(title = %title, body = %body, key = %correlation_key, "🔔 NOTIFICATION");
    }
}

fn fast_presence_config() -> PresenceConfig {
    PresenceConfig {
        remote_timeout: Duration::from_secs(1),
        reregister_backoff_base: Duration::from_millis(50),
        reregister_max_attempts: 3,
        heartbeat_interval: Duration::from_millis(200),
        background_heartbeat_interval: Duration::from_millis(500),
    }
}

fn device_publisher(
    store: Arc<dyn SharedStore>,
    id: &str,
    location: &str,
    platform: Platform,
) -> Arc<Mutex<PresencePublisher>> {
    Arc::new(Mutex::new(PresencePublisher::new(
        store,
        id,
        PresenceRole::Device {
            name: format!("sim-{id}"),
            location: location.to_string(),
            info: DeviceInfo {
                platform,
                model: "simulation".to_string(),
                ..DeviceInfo::default()
            },
        },
        fast_presence_config(),
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    config::init(WatchConfig::load());

    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn SharedStore> = Arc::clone(&store) as Arc<dyn SharedStore>;

    info!("━━━ Scenario 1: detection → observer notification ━━━");

    // Observer side: aggregator watching the device collection
    let sink = Arc::new(CountingSink::default());
    let observer_sensitivity = Arc::new(ArcSwap::from_pointee(Sensitivity::new(
        1.0, 0.3, "observer",
    )));
    let aggregator = Arc::new(Mutex::new(Aggregator::new(
        observer_sensitivity,
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
    )));
    let agg_cancel = CancellationToken::new();
    let agg_task = tokio::spawn(run_aggregator_loop(
        Arc::clone(&aggregator),
        Arc::clone(&shared),
        agg_cancel.clone(),
    ));

    // Device side: register and run the scripted camera to exhaustion
    let publisher = device_publisher(
        Arc::clone(&shared),
        "sim-counter",
        "front counter",
        Platform::Desktop,
    );
    publisher.lock().await.register().await?;

    let (ui_tx, _ui_rx) = watch::channel(None);
    let monitor = MonitorLoop::new(
        DetectionEngine::with_sensitivity(Sensitivity::new(1.5, 0.3, "high")),
        publisher,
        ui_tx,
        Arc::new(AtomicBool::new(false)),
        Arc::new(ArcSwap::from_pointee(0.85)),
        Arc::new(RwLock::new(None)),
    );
    let stats = monitor
        .run(
            Box::new(ScenarioCamera::new(args.frame_ms)),
            CancellationToken::new(),
        )
        .await;
    // Let the aggregator drain the final snapshot before reading counters
    tokio::time::sleep(Duration::from_millis(50)).await;

    info!(
        frames = stats.frames_analyzed,
        publishes = stats.publishes,
        alerts = stats.alerts_pushed,
        notifications = sink.count.load(std::sync::atomic::Ordering::Relaxed),
        "Scenario 1 complete"
    );

    info!("━━━ Scenario 2: abrupt disconnect → dead-man's switch → reaper ━━━");

    let ghost = device_publisher(
        Arc::clone(&shared),
        "sim-ghost",
        "back office",
        Platform::Mobile,
    );
    ghost.lock().await.register().await?;
    info!("Ghost device registered");

    // Connection drops without a deregister; the armed on-disconnect write
    // marks the record offline server-side.
    store.simulate_disconnect().await;
    store.reconnect();
    let status = store
        .get(&paths::device_status("sim-ghost"))
        .await?
        .expect("status present");
    info!(online = %status["online"], "Dead-man's switch fired");

    // Jump the server clock past the offline threshold and sweep
    let future = chrono::Utc::now().timestamp_millis()
        + (config::get().reaper.offline_threshold_hours as i64 + 1) * 3_600_000;
    let mut reaper = Reaper::new(
        Arc::clone(&shared),
        ReaperPolicy::from_config(&config::get().reaper),
    );
    let outcome = reaper.sweep(future).await?;
    info!(
        devices_removed = outcome.devices_removed,
        "Reaper swept the ghost"
    );
    assert!(store.get(&paths::device("sim-ghost")).await?.is_none());

    agg_cancel.cancel();
    agg_task.await.ok();

    info!("✓ Simulation complete");
    Ok(())
}
