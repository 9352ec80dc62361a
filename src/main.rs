//! beacon-watch - Blue-Light Presence Detection
//!
//! Turns spare devices into a "customer waiting" sensor network: each
//! device watches its camera feed for blue light, publishes state into a
//! shared realtime store, and observers aggregate the fleet into a single
//! edge-triggered notification signal.
//!
//! # Usage
//!
//! ```bash
//! # Run a device with a synthetic camera feed
//! cargo run --release -- device
//!
//! # Run an observer (aggregation + reaper)
//! cargo run --release -- observer
//! ```
//!
//! # Environment Variables
//!
//! - `BEACON_CONFIG`: Path to a beacon_config.toml (default: ./beacon_config.toml)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::Result;
use arc_swap::ArcSwap;
use clap::Parser;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use beacon_watch::aggregator::{run_aggregator_loop, Aggregator, NotificationSink};
use beacon_watch::config::{self, WatchConfig};
use beacon_watch::detection::{DetectionEngine, RgbaFrame};
use beacon_watch::health::{
    ConnectivityCheck, DetectionLivenessCheck, HealthCheck, HealthMonitor, RegistrationCheck,
};
use beacon_watch::monitor::{FrameEvent, FrameSource, MonitorLoop};
use beacon_watch::presence::{
    run_presence_loop, PresenceConfig, PresencePublisher, PresenceRole,
};
use beacon_watch::reaper::{run_reaper_loop, Reaper, ReaperPolicy};
use beacon_watch::store::memory::MemoryStore;
use beacon_watch::store::SharedStore;
use beacon_watch::types::{DeviceInfo, Platform};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "beacon-watch")]
#[command(about = "Blue-light presence detection over a shared realtime store")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run as a detecting device (camera → detection → publish)
    Device {
        /// Frames per second for the synthetic camera feed
        #[arg(long, default_value = "10")]
        fps: u64,

        /// Seconds of blue light injected into the synthetic feed after
        /// calibration (0 = never)
        #[arg(long, default_value = "0")]
        blue_after: u64,
    },

    /// Run as an observer (aggregation + notifications + reaper)
    Observer {
        /// Observer identifier (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    PresenceLoop,
    MonitorLoop,
    HealthMonitor,
    AggregatorLoop,
    ReaperLoop,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::PresenceLoop => write!(f, "PresenceLoop"),
            TaskName::MonitorLoop => write!(f, "MonitorLoop"),
            TaskName::HealthMonitor => write!(f, "HealthMonitor"),
            TaskName::AggregatorLoop => write!(f, "AggregatorLoop"),
            TaskName::ReaperLoop => write!(f, "ReaperLoop"),
        }
    }
}

// ============================================================================
// Synthetic Frame Source
// ============================================================================

/// Camera stand-in for development runs.
///
/// Emits dim noise frames at a fixed cadence; after `blue_after` it mixes
/// in a strong blue cast so the full detect → alert path can be exercised
/// without hardware.
struct SyntheticSource {
    frame_interval: Duration,
    blue_after: Option<Duration>,
    started: std::time::Instant,
}

impl SyntheticSource {
    fn new(fps: u64, blue_after: u64) -> Self {
        Self {
            frame_interval: Duration::from_millis(1_000 / fps.max(1)),
            blue_after: (blue_after > 0).then(|| Duration::from_secs(blue_after)),
            started: std::time::Instant::now(),
        }
    }
}

#[async_trait::async_trait]
impl FrameSource for SyntheticSource {
    async fn next_frame(&mut self) -> FrameEvent {
        tokio::time::sleep(self.frame_interval).await;

        let blue_on = self
            .blue_after
            .is_some_and(|after| self.started.elapsed() >= after);
        let (w, h) = (64usize, 48usize);
        let mut data = Vec::with_capacity(w * h * 4);
        let mut rng = rand::thread_rng();
        for _ in 0..(w * h) {
            let noise: u8 = rand::Rng::gen_range(&mut rng, 8..24);
            if blue_on {
                data.extend_from_slice(&[noise, noise.saturating_add(10), 230, 255]);
            } else {
                data.extend_from_slice(&[noise, noise, noise.saturating_add(4), 255]);
            }
        }
        match RgbaFrame::new(w, h, data) {
            Ok(frame) => FrameEvent::Frame(frame),
            // Dimensions are fixed above, but a frame source must not panic
            Err(_) => FrameEvent::Eof,
        }
    }

    fn source_name(&self) -> &str {
        "synthetic"
    }
}

// ============================================================================
// Notification Sink
// ============================================================================

/// Logs notifications; real push delivery plugs in behind the same trait.
struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, title: &str, body: &str, correlation_key: &str) {
        info!(title = %title, body = %body, key = %correlation_key, "🔔 NOTIFICATION");
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn presence_config(config: &WatchConfig) -> PresenceConfig {
    PresenceConfig {
        remote_timeout: Duration::from_secs(config.intervals.remote_timeout_secs),
        reregister_backoff_base: Duration::from_secs(
            config.intervals.reregister_backoff_base_secs,
        ),
        reregister_max_attempts: config.intervals.reregister_max_attempts,
        heartbeat_interval: Duration::from_secs(config.intervals.heartbeat_secs),
        background_heartbeat_interval: Duration::from_secs(
            config.intervals.background_heartbeat_secs,
        ),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring...");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("🛑 Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Run device mode: detection pipeline, presence loop and health monitor.
async fn run_device(fps: u64, blue_after: u64, cancel_token: CancellationToken) -> Result<()> {
    let config = config::get();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());

    let device_id = if config.device.id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        config.device.id.clone()
    };
    let platform = Platform::from_str_loose(&config.device.platform).unwrap_or_else(|| {
        warn!(value = %config.device.platform, "Unrecognized platform in config — assuming mobile");
        Platform::default()
    });
    info!(
        id = %device_id,
        name = %config.device.name,
        platform = %platform,
        "🚀 Starting beacon-watch device"
    );

    let publisher = Arc::new(Mutex::new(PresencePublisher::new(
        Arc::clone(&store),
        device_id.clone(),
        PresenceRole::Device {
            name: config.device.name.clone(),
            location: config.device.location.clone(),
            info: DeviceInfo {
                platform,
                model: "synthetic".to_string(),
                ..DeviceInfo::default()
            },
        },
        presence_config(config),
    )));
    publisher.lock().await.register().await?;
    info!("✓ Device registered");

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task 1: presence loop (heartbeats, reconnect recovery)
    let (recover_tx, recover_rx) = mpsc::channel(1);
    let presence = Arc::clone(&publisher);
    let presence_cancel = cancel_token.clone();
    task_set.spawn(async move {
        run_presence_loop(presence, recover_rx, presence_cancel).await;
        Ok(TaskName::PresenceLoop)
    });

    // Task 2: health monitor
    let last_sample = Arc::new(RwLock::new(None));
    let checks: Vec<Box<dyn HealthCheck>> = vec![
        Box::new(RegistrationCheck::new(
            Arc::clone(&store),
            device_id.clone(),
            recover_tx,
        )),
        Box::new(ConnectivityCheck::new(Arc::clone(&store))),
        Box::new(DetectionLivenessCheck::new(Arc::clone(&last_sample))),
    ];
    let health_cancel = cancel_token.clone();
    task_set.spawn(async move {
        HealthMonitor::new(checks).run(health_cancel).await;
        Ok(TaskName::HealthMonitor)
    });

    // Task 3: monitor loop (frames → detection → publish)
    let sensitivity = Arc::new(ArcSwap::from_pointee(
        config.sensitivity.to_sensitivity(),
    ));
    let (ui_tx, _ui_rx) = watch::channel(None);
    let monitor = MonitorLoop::new(
        DetectionEngine::new(sensitivity),
        publisher,
        ui_tx,
        Arc::new(AtomicBool::new(false)),
        Arc::new(ArcSwap::from_pointee(1.0)),
        last_sample,
    );
    let monitor_cancel = cancel_token.clone();
    task_set.spawn(async move {
        let stats = monitor
            .run(Box::new(SyntheticSource::new(fps, blue_after)), monitor_cancel)
            .await;
        info!(
            frames = stats.frames_analyzed,
            publishes = stats.publishes,
            "Monitor loop finished"
        );
        Ok(TaskName::MonitorLoop)
    });

    run_supervisor(&mut task_set, cancel_token).await
}

/// Run observer mode: aggregation, notifications and the reaper.
async fn run_observer(id: Option<String>, cancel_token: CancellationToken) -> Result<()> {
    let config = config::get();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());

    let observer_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(id = %observer_id, "🚀 Starting beacon-watch observer");

    let publisher = Arc::new(Mutex::new(PresencePublisher::new(
        Arc::clone(&store),
        observer_id,
        PresenceRole::Observer,
        presence_config(config),
    )));
    publisher.lock().await.register().await?;
    info!("✓ Observer registered");

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task 1: presence loop
    let (_recover_tx, recover_rx) = mpsc::channel(1);
    let presence_cancel = cancel_token.clone();
    let presence = Arc::clone(&publisher);
    task_set.spawn(async move {
        run_presence_loop(presence, recover_rx, presence_cancel).await;
        Ok(TaskName::PresenceLoop)
    });

    // Task 2: aggregator (fan-in + edge-triggered notifications)
    let sensitivity = Arc::new(ArcSwap::from_pointee(
        config.observer_sensitivity.to_sensitivity(),
    ));
    let aggregator = Arc::new(Mutex::new(Aggregator::new(sensitivity, Arc::new(LogSink))));
    let agg_store = Arc::clone(&store);
    let agg_cancel = cancel_token.clone();
    task_set.spawn(async move {
        run_aggregator_loop(aggregator, agg_store, agg_cancel).await;
        Ok(TaskName::AggregatorLoop)
    });

    // Task 3: reaper (ghost-entry cleanup)
    let reaper = Reaper::new(
        Arc::clone(&store),
        ReaperPolicy::from_config(&config.reaper),
    );
    let sweep_interval = Duration::from_secs(config.intervals.reaper_sweep_secs);
    let reaper_cancel = cancel_token.clone();
    task_set.spawn(async move {
        let reaper = run_reaper_loop(reaper, sweep_interval, now_ms, reaper_cancel).await;
        let stats = reaper.stats();
        info!(
            sweeps = stats.sweeps_completed,
            devices = stats.devices_removed,
            observers = stats.observers_removed,
            alerts = stats.alerts_removed,
            "Reaper finished"
        );
        Ok(TaskName::ReaperLoop)
    });

    run_supervisor(&mut task_set, cancel_token).await
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    config::init(WatchConfig::load());

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    match args.command {
        Command::Device { fps, blue_after } => run_device(fps, blue_after, cancel_token).await?,
        Command::Observer { id } => run_observer(id, cancel_token).await?,
    }

    info!("✓ beacon-watch shutdown complete");
    Ok(())
}
