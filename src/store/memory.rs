//! In-memory reference implementation of [`SharedStore`].
//!
//! Backs tests, local runs and the simulation binary. Beyond the trait it
//! exposes the failure-injection surface the engine's tests need:
//! [`simulate_disconnect`](MemoryStore::simulate_disconnect) abruptly drops
//! the "connection" and fires the armed dead-man's-switch writes exactly
//! like a real server would, and [`set_now`](MemoryStore::set_now) pins the
//! server clock so timestamp-boundary behavior is deterministic.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use super::{is_server_timestamp, PartialUpdate, SharedStore, StoreError};

/// One registered value-change stream.
struct Watcher {
    path: Vec<String>,
    tx: watch::Sender<Option<Value>>,
}

/// In-process shared store with last-writer-wins writes, server-assigned
/// timestamps and session-scoped disconnect writes.
pub struct MemoryStore {
    state: RwLock<Value>,
    connected_tx: watch::Sender<bool>,
    watchers: Mutex<Vec<Watcher>>,
    /// Dead-man's-switch registrations for the current session
    armed: Mutex<Vec<(Vec<String>, PartialUpdate)>>,
    /// Pinned server clock (tests); `None` = wall clock
    now_override: Mutex<Option<i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (connected_tx, _) = watch::channel(true);
        Self {
            state: RwLock::new(Value::Object(Map::new())),
            connected_tx,
            watchers: Mutex::new(Vec::new()),
            armed: Mutex::new(Vec::new()),
            now_override: Mutex::new(None),
        }
    }

    /// Pin the server clock to a fixed epoch-millisecond value.
    pub fn set_now(&self, millis: i64) {
        *self.now_override.lock().unwrap_or_else(|e| e.into_inner()) = Some(millis);
    }

    /// Current server clock (pinned value or wall clock).
    pub fn now_millis(&self) -> i64 {
        self.now_override
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
    }

    /// Whether the simulated connection is up.
    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Abruptly drop the writer's connection.
    ///
    /// Applies every armed disconnect write (resolving server timestamps
    /// against the server clock), clears the armings — they were scoped to
    /// the session that just died — and flips the connectivity signal.
    pub async fn simulate_disconnect(&self) {
        let armed: Vec<_> = {
            let mut guard = self.armed.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let now = self.now_millis();

        {
            let mut state = self.state.write().await;
            for (path, partial) in armed {
                let target = ensure_object_mut(&mut state, &path);
                for (key, value) in partial {
                    target.insert(key, resolve_sentinels(value, now));
                }
            }
        }
        // send_replace: the flip must land even with zero subscribers
        self.connected_tx.send_replace(false);
        debug!("Simulated connection drop — disconnect writes applied");
        self.notify_watchers().await;
    }

    /// Restore connectivity as a fresh session.
    ///
    /// Any prior dead-man's-switch arming is invalidated; callers must
    /// re-arm, exactly as with a real store client.
    pub fn reconnect(&self) {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.connected_tx.send_replace(true);
    }

    fn require_connected(&self) -> Result<(), StoreError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }

    /// Push the current value at every watched path, pruning dead streams.
    async fn notify_watchers(&self) {
        let state = self.state.read().await;
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|w| {
            let snapshot = value_at(&state, &w.path).cloned();
            w.tx.send(snapshot).is_ok()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.require_connected()?;
        let parts = path_parts(path)?;
        let (last, parents) = split_last(&parts)?;
        let now = self.now_millis();
        {
            let mut state = self.state.write().await;
            let parent = ensure_object_mut(&mut state, parents);
            parent.insert(last.to_string(), resolve_sentinels(value, now));
        }
        self.notify_watchers().await;
        Ok(())
    }

    async fn update(&self, path: &str, partial: PartialUpdate) -> Result<(), StoreError> {
        self.require_connected()?;
        let parts = path_parts(path)?;
        let now = self.now_millis();
        {
            let mut state = self.state.write().await;
            let target = ensure_object_mut(&mut state, &parts);
            for (key, value) in partial {
                target.insert(key, resolve_sentinels(value, now));
            }
        }
        self.notify_watchers().await;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.require_connected()?;
        let parts = path_parts(path)?;
        let state = self.state.read().await;
        Ok(value_at(&state, &parts).cloned())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.require_connected()?;
        let parts = path_parts(path)?;
        let (last, parents) = split_last(&parts)?;
        let removed = {
            let mut state = self.state.write().await;
            match object_at_mut(&mut state, parents) {
                Some(parent) => parent.remove(last).is_some(),
                None => false,
            }
        };
        if removed {
            self.notify_watchers().await;
        }
        Ok(())
    }

    async fn on_disconnect_update(
        &self,
        path: &str,
        partial: PartialUpdate,
    ) -> Result<(), StoreError> {
        self.require_connected()?;
        let parts = path_parts(path)?;
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((parts, partial));
        Ok(())
    }

    async fn cancel_disconnect_updates(&self, path: &str) -> Result<(), StoreError> {
        self.require_connected()?;
        let parts = path_parts(path)?;
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(armed_path, _)| *armed_path != parts);
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<watch::Receiver<Option<Value>>, StoreError> {
        let parts = path_parts(path)?;
        let initial = {
            let state = self.state.read().await;
            value_at(&state, &parts).cloned()
        };
        let (tx, rx) = watch::channel(initial);
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Watcher { path: parts, tx });
        Ok(rx)
    }

    fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }
}

// ============================================================================
// Tree helpers
// ============================================================================

fn path_parts(path: &str) -> Result<Vec<String>, StoreError> {
    let parts: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

fn split_last<'a>(parts: &'a [String]) -> Result<(&'a str, &'a [String]), StoreError> {
    match parts.split_last() {
        Some((last, parents)) => Ok((last.as_str(), parents)),
        None => Err(StoreError::InvalidPath(String::new())),
    }
}

/// Walk to `parts`, creating (or overwriting non-object nodes as) objects —
/// last-writer-wins semantics for conflicting shapes.
fn ensure_object_mut<'a>(root: &'a mut Value, parts: &[String]) -> &'a mut Map<String, Value> {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let mut cur = root;
    for part in parts {
        let map = match cur {
            Value::Object(m) => m,
            _ => unreachable!("node coerced to object above"),
        };
        let entry = map
            .entry(part.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cur = entry;
    }
    match cur {
        Value::Object(m) => m,
        _ => unreachable!("leaf coerced to object above"),
    }
}

fn object_at_mut<'a>(
    root: &'a mut Value,
    parts: &[String],
) -> Option<&'a mut Map<String, Value>> {
    let mut cur = root;
    for part in parts {
        cur = cur.as_object_mut()?.get_mut(part)?;
    }
    cur.as_object_mut()
}

fn value_at<'a>(root: &'a Value, parts: &[String]) -> Option<&'a Value> {
    let mut cur = root;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

/// Replace every server-timestamp sentinel with the server clock.
fn resolve_sentinels(value: Value, now: i64) -> Value {
    if is_server_timestamp(&value) {
        return Value::from(now);
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_sentinels(v, now)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| resolve_sentinels(v, now)).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::server_timestamp;
    use serde_json::json;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn set_and_get_roundtrip() {
        let store = MemoryStore::new();
        store
            .set("devices/d1", json!({"name": "kiosk"}))
            .await
            .unwrap();
        let value = store.get("devices/d1").await.unwrap().unwrap();
        assert_eq!(value["name"], "kiosk");
        assert!(store.get("devices/nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_merges_without_clobbering_siblings() {
        let store = MemoryStore::new();
        store
            .set("devices/d1/status", json!({"online": true, "waiting": false}))
            .await
            .unwrap();

        let mut partial = Map::new();
        partial.insert("waiting".to_string(), json!(true));
        store.update("devices/d1/status", partial).await.unwrap();

        let status = store.get("devices/d1/status").await.unwrap().unwrap();
        assert_eq!(status["online"], true);
        assert_eq!(status["waiting"], true);
    }

    #[tokio::test]
    async fn server_timestamp_resolves_to_pinned_clock() {
        let store = MemoryStore::new();
        store.set_now(1_000_000);
        store
            .set("devices/d1/status", json!({"lastUpdate": server_timestamp()}))
            .await
            .unwrap();
        let status = store.get("devices/d1/status").await.unwrap().unwrap();
        assert_eq!(status["lastUpdate"], 1_000_000);
    }

    #[tokio::test]
    async fn watch_streams_snapshots() {
        let store = MemoryStore::new();
        let mut rx = store.watch("devices").await.unwrap();
        assert!(rx.borrow().is_none());

        store.set("devices/d1", json!({"name": "a"})).await.unwrap();
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone().unwrap();
        assert_eq!(snapshot["d1"]["name"], "a");
    }

    #[tokio::test]
    async fn disconnect_applies_armed_writes_without_client_action() {
        let store = MemoryStore::new();
        store.set_now(5_000);
        store
            .set("devices/d1/status", json!({"online": true}))
            .await
            .unwrap();

        let mut partial = Map::new();
        partial.insert("online".to_string(), json!(false));
        partial.insert("disconnectedAt".to_string(), server_timestamp());
        store
            .on_disconnect_update("devices/d1/status", partial)
            .await
            .unwrap();

        store.set_now(9_000);
        store.simulate_disconnect().await;

        // Marked offline by the store itself, not by the (dead) client
        store.reconnect();
        let status = store.get("devices/d1/status").await.unwrap().unwrap();
        assert_eq!(status["online"], false);
        assert_eq!(status["disconnectedAt"], 9_000);
    }

    #[tokio::test]
    async fn reconnect_invalidates_previous_arming() {
        let store = MemoryStore::new();
        let mut partial = Map::new();
        partial.insert("online".to_string(), json!(false));
        store
            .on_disconnect_update("devices/d1/status", partial)
            .await
            .unwrap();

        // Session bounce without a server-observed drop
        store.reconnect();
        store.simulate_disconnect().await;
        store.reconnect();

        // The stale arming must not have fired a second session's write
        assert!(store.get("devices/d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_fail_while_disconnected() {
        let store = MemoryStore::new();
        store.simulate_disconnect().await;
        let err = store.set("devices/d1", json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::Disconnected));
        store.reconnect();
        assert_ok!(store.set("devices/d1", json!({})).await);
    }

    #[tokio::test]
    async fn connectivity_flip_lands_without_subscribers() {
        let store = MemoryStore::new();
        // Nobody holds a watch_connected() receiver here
        store.simulate_disconnect().await;
        assert!(!store.is_connected());
        assert!(matches!(
            store.get("devices/d1").await.unwrap_err(),
            StoreError::Disconnected
        ));

        store.reconnect();
        assert!(store.is_connected());
        // A late subscriber sees the current state, not the initial one
        store.simulate_disconnect().await;
        let rx = store.watch_connected();
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.set("alerts/a1", json!({"x": 1})).await.unwrap();
        store.delete("alerts/a1").await.unwrap();
        store.delete("alerts/a1").await.unwrap();
        assert!(store.get("alerts/a1").await.unwrap().is_none());
    }
}
