//! beacon-watch: Blue-Light Presence Detection
//!
//! Turns spare devices with cameras into a distributed "customer waiting"
//! sensor network over a shared realtime store.
//!
//! ## Architecture
//!
//! - **Detection Engine**: per-frame blue-light scoring with calibration,
//!   hysteresis and confidence
//! - **Presence Publisher**: registration, heartbeats and the dead-man's
//!   switch on the shared store
//! - **Reaper**: garbage collection of stale device, observer and alert
//!   records
//! - **Aggregator**: observer-side fan-in with edge-triggered notifications

pub mod aggregator;
pub mod config;
pub mod detection;
pub mod health;
pub mod monitor;
pub mod presence;
pub mod reaper;
pub mod store;
pub mod types;

// Re-export watch configuration
pub use config::WatchConfig;

// Re-export commonly used types
pub use types::{
    AlertRecord, DeviceInfo, DeviceRecord, DeviceStatus, ObserverRecord, Platform, Sensitivity,
};

// Re-export detection pipeline
pub use detection::throttle::PublishThrottle;
pub use detection::{Detection, DetectionEngine, DetectionError, DetectionPhase, RgbaFrame};

// Re-export store seam
pub use store::memory::MemoryStore;
pub use store::{PartialUpdate, SharedStore, StoreError};

// Re-export presence components
pub use presence::{PresenceError, PresencePublisher, PresenceRole, PresenceState};

// Re-export reaper components
pub use reaper::{Reaper, ReaperPolicy, ReaperStats, SweepOutcome};

// Re-export aggregator components
pub use aggregator::{Aggregator, NotificationSink};
