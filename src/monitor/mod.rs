//! Monitor loop — per-frame pipeline from capture to publication
//!
//! Pulls frames from a [`FrameSource`], runs them through the detection
//! engine, refreshes the local UI channel on its own cadence, and hands
//! throttled results to the presence publisher. Remote failures on the
//! hot path are logged and skipped; one bad frame or one dropped write
//! never stops monitoring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{UI_REFRESH_BACKGROUND_MS, UI_REFRESH_FOREGROUND_MS};
use crate::detection::throttle::PublishThrottle;
use crate::detection::{Detection, DetectionEngine, RgbaFrame};
use crate::presence::PresencePublisher;

// ============================================================================
// Frame source
// ============================================================================

/// One delivery from a capture backend.
#[derive(Debug)]
pub enum FrameEvent {
    Frame(RgbaFrame),
    /// Source is exhausted; the loop shuts down cleanly
    Eof,
}

/// Capture seam. Camera bindings, test fixtures, and the simulation all
/// sit behind this.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for and return the next frame.
    async fn next_frame(&mut self) -> FrameEvent;

    /// Human-readable name for logs.
    fn source_name(&self) -> &str;
}

// ============================================================================
// Monitor loop
// ============================================================================

/// Counters accumulated over one monitoring session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorStats {
    pub frames_analyzed: u64,
    pub frames_failed: u64,
    pub publishes: u64,
    pub publish_failures: u64,
    pub alerts_pushed: u64,
}

/// Drives detection over a frame source until cancellation or EOF.
pub struct MonitorLoop {
    engine: DetectionEngine,
    throttle: PublishThrottle,
    presence: Arc<Mutex<PresencePublisher>>,
    /// Latest detection for the local UI, refreshed on the UI cadence
    ui_tx: watch::Sender<Option<Detection>>,
    /// Foreground/background flag, shared with the presence loop
    in_background: Arc<AtomicBool>,
    /// Battery fraction in [0,1]; mains-powered devices leave it at 1.0
    battery_level: Arc<ArcSwap<f64>>,
    /// Stamped after every analyzed frame, read by the liveness check
    last_sample: Arc<RwLock<Option<Instant>>>,
    last_published: Option<Detection>,
    last_ui_refresh: Option<Instant>,
    stats: MonitorStats,
}

impl MonitorLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: DetectionEngine,
        presence: Arc<Mutex<PresencePublisher>>,
        ui_tx: watch::Sender<Option<Detection>>,
        in_background: Arc<AtomicBool>,
        battery_level: Arc<ArcSwap<f64>>,
        last_sample: Arc<RwLock<Option<Instant>>>,
    ) -> Self {
        Self {
            engine,
            throttle: PublishThrottle::new(Instant::now()),
            presence,
            ui_tx,
            in_background,
            battery_level,
            last_sample,
            last_published: None,
            last_ui_refresh: None,
            stats: MonitorStats::default(),
        }
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Consume frames until the source ends or the token fires.
    ///
    /// On the way out the device is deregistered best-effort; a device
    /// that cannot reach the store still exits promptly and leaves its
    /// record to the dead-man's switch and the reaper.
    pub async fn run(
        mut self,
        mut source: Box<dyn FrameSource>,
        cancel: CancellationToken,
    ) -> MonitorStats {
        info!(source = source.source_name(), "Monitor loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Monitor loop cancelled");
                    break;
                }
                event = source.next_frame() => {
                    match event {
                        FrameEvent::Frame(frame) => self.process_frame(&frame).await,
                        FrameEvent::Eof => {
                            info!(source = source.source_name(), "Frame source exhausted");
                            break;
                        }
                    }
                }
            }
        }

        self.presence.lock().await.deregister().await;
        info!(
            frames = self.stats.frames_analyzed,
            publishes = self.stats.publishes,
            alerts = self.stats.alerts_pushed,
            "Monitor loop finished"
        );
        self.stats
    }

    async fn process_frame(&mut self, frame: &RgbaFrame) {
        let now = Instant::now();
        let previously_waiting = self.engine.waiting();

        let detection = match self.engine.analyze(frame) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Frame analysis failed — skipping frame");
                self.stats.frames_failed += 1;
                return;
            }
        };
        self.stats.frames_analyzed += 1;
        *self.last_sample.write().await = Some(now);

        self.refresh_ui(&detection, now);

        let in_background = self.in_background.load(Ordering::Relaxed);
        if self
            .throttle
            .should_publish(&detection, self.last_published.as_ref(), in_background, now)
        {
            self.publish(&detection, now).await;
        } else {
            debug!(
                intensity = detection.normalized_intensity,
                "Detection suppressed by throttle"
            );
        }

        // Local edge, independent of whether the throttle let the status
        // write through (it always does on a waiting flip).
        if detection.waiting && !previously_waiting {
            let presence = self.presence.lock().await;
            match presence.push_alert("Customer waiting").await {
                Ok(()) => self.stats.alerts_pushed += 1,
                Err(e) => warn!(error = %e, "Could not push alert"),
            }
        }
    }

    /// Keep the UI channel fresh without flooding it. The cadence is
    /// independent of the remote publish throttle.
    fn refresh_ui(&mut self, detection: &Detection, now: Instant) {
        let interval = if self.in_background.load(Ordering::Relaxed) {
            Duration::from_millis(UI_REFRESH_BACKGROUND_MS)
        } else {
            Duration::from_millis(UI_REFRESH_FOREGROUND_MS)
        };
        let due = match self.last_ui_refresh {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= interval,
        };
        if due {
            // Receivers may all be gone (headless run); that is fine
            let _ = self.ui_tx.send(Some(detection.clone()));
            self.last_ui_refresh = Some(now);
        }
    }

    async fn publish(&mut self, detection: &Detection, now: Instant) {
        let battery = **self.battery_level.load();
        let mut presence = self.presence.lock().await;
        match presence.publish_status(detection, true, battery).await {
            Ok(()) => {
                self.throttle.record_publish(now);
                self.last_published = Some(detection.clone());
                self.stats.publishes += 1;
            }
            Err(e) => {
                self.stats.publish_failures += 1;
                warn!(error = %e, "Status publish failed — continuing locally");
            }
        }
    }
}
