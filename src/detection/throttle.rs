//! Publish Throttle — decides when a local detection result is pushed to
//! the shared store.
//!
//! Remote writes are expensive and rate-limited; the local UI refresh
//! cadence is a separate, independent interval so the display stays smooth
//! even while remote publishes are curbed.

use std::time::{Duration, Instant};

use crate::config::defaults::{
    LONG_SESSION_AGE_SECS, LONG_SESSION_DAMPING, LONG_SESSION_PUBLISH_COUNT,
    PUBLISH_INTENSITY_DELTA, PUBLISH_INTERVAL_BACKGROUND_MS, PUBLISH_INTERVAL_IDLE_MS,
    PUBLISH_INTERVAL_WAITING_MS,
};
use crate::detection::Detection;

/// Adaptive remote-publish throttle.
///
/// Rules, in priority order:
/// 1. always publish on a `waiting` flip;
/// 2. always publish on an intensity delta above 5% of full scale;
/// 3. otherwise publish only once the policy interval has elapsed.
///
/// Sessions publishing for over 30 minutes with more than 1000 publishes
/// get their interval stretched by 1.2x to curb sustained write volume.
#[derive(Debug)]
pub struct PublishThrottle {
    session_start: Instant,
    last_publish: Option<Instant>,
    publish_count: u64,
}

impl PublishThrottle {
    pub fn new(now: Instant) -> Self {
        Self {
            session_start: now,
            last_publish: None,
            publish_count: 0,
        }
    }

    /// Number of publishes recorded this session.
    pub fn publish_count(&self) -> u64 {
        self.publish_count
    }

    /// Decide whether `current` should be pushed remotely.
    pub fn should_publish(
        &self,
        current: &Detection,
        previous: Option<&Detection>,
        in_background: bool,
        now: Instant,
    ) -> bool {
        let Some(previous) = previous else {
            // Nothing published yet this session
            return true;
        };

        if current.waiting != previous.waiting {
            return true;
        }

        if (current.normalized_intensity - previous.normalized_intensity).abs()
            > PUBLISH_INTENSITY_DELTA
        {
            return true;
        }

        match self.last_publish {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last) >= self.next_interval(current.waiting, in_background, now)
            }
        }
    }

    /// Policy interval for the current state.
    pub fn next_interval(&self, waiting: bool, in_background: bool, now: Instant) -> Duration {
        let base = if waiting {
            Duration::from_millis(PUBLISH_INTERVAL_WAITING_MS)
        } else if in_background {
            Duration::from_millis(PUBLISH_INTERVAL_BACKGROUND_MS)
        } else {
            Duration::from_millis(PUBLISH_INTERVAL_IDLE_MS)
        };

        if self.is_long_session(now) {
            base.mul_f64(LONG_SESSION_DAMPING)
        } else {
            base
        }
    }

    /// Record that a publish happened at `now`.
    pub fn record_publish(&mut self, now: Instant) {
        self.last_publish = Some(now);
        self.publish_count += 1;
    }

    fn is_long_session(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.session_start)
            > Duration::from_secs(LONG_SESSION_AGE_SECS)
            && self.publish_count > LONG_SESSION_PUBLISH_COUNT
    }
}
