//! Shared Store interface — the eventually-consistent replicated
//! key-value hierarchy devices and observers synchronize through.
//!
//! The store itself is an external collaborator; this module defines the
//! seam the engine talks to: hierarchical paths, last-writer-wins writes,
//! value-change streams, a connectivity signal, the server-timestamp
//! sentinel, and the disconnect-triggered write registration (dead-man's
//! switch). [`memory::MemoryStore`] is the in-process reference
//! implementation used by tests and local/simulation runs.

pub mod memory;
pub mod paths;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

/// JSON object used for partial updates.
pub type PartialUpdate = Map<String, Value>;

// ============================================================================
// Server Timestamp Sentinel
// ============================================================================

/// Key marking a value as "replace with the server's clock on write".
pub const SERVER_TIMESTAMP_KEY: &str = ".sv";

/// Sentinel value the store replaces with its own epoch-millisecond clock
/// at write time. Writers never stamp wall-clock time themselves — that
/// keeps `lastUpdate`/`lastSeen` monotone from the store's perspective
/// even across client clock skew.
pub fn server_timestamp() -> Value {
    let mut map = Map::new();
    map.insert(
        SERVER_TIMESTAMP_KEY.to_string(),
        Value::String("timestamp".to_string()),
    );
    Value::Object(map)
}

/// Check whether a value is the server-timestamp sentinel.
pub fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.len() == 1 && m.get(SERVER_TIMESTAMP_KEY).is_some())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is disconnected")]
    Disconnected,

    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid store path: {0}")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

// ============================================================================
// SharedStore
// ============================================================================

/// Seam to the replicated store.
///
/// Semantics the engine relies on:
/// - per-path last-writer-wins; no transactions
/// - server-assigned timestamps via the [`server_timestamp`] sentinel
/// - `on_disconnect_update` registrations are scoped to the current
///   connection session — a reconnect invalidates them, so callers must
///   re-arm after every connectivity restoration
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Replace the value at `path`.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Merge `partial`'s keys into the object at `path`.
    async fn update(&self, path: &str, partial: PartialUpdate) -> Result<(), StoreError>;

    /// Read the value at `path` (`None` when absent).
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Remove the value at `path`. Removing an absent path is not an error.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Arm a dead-man's switch: the store applies `partial` to `path` by
    /// itself when it observes this writer's connection drop.
    async fn on_disconnect_update(
        &self,
        path: &str,
        partial: PartialUpdate,
    ) -> Result<(), StoreError>;

    /// Disarm every dead-man's switch this writer registered at `path`.
    ///
    /// An explicit deregistration must cancel its armed writes, or a later
    /// connection drop would resurrect a partial record for a device that
    /// cleanly removed itself.
    async fn cancel_disconnect_updates(&self, path: &str) -> Result<(), StoreError>;

    /// Stream of snapshots of the value at `path` (current value first).
    async fn watch(&self, path: &str) -> Result<watch::Receiver<Option<Value>>, StoreError>;

    /// Stream of the connection state (true = connected).
    fn watch_connected(&self) -> watch::Receiver<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_shape() {
        let ts = server_timestamp();
        assert!(is_server_timestamp(&ts));
        assert!(!is_server_timestamp(&Value::from(12)));
        assert!(!is_server_timestamp(&serde_json::json!({"a": 1, ".sv": "timestamp"})));
    }
}
