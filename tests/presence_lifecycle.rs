//! Presence lifecycle tests over the in-process store.
//!
//! Covers the paths that only show up across module boundaries: the
//! dead-man's switch firing on an abrupt disconnect, recovery after
//! reconnect, and the reaper cleaning up what recovery never reclaimed.

use std::sync::Arc;
use std::time::Duration;

use beacon_watch::presence::{PresenceConfig, PresencePublisher, PresenceRole, PresenceState};
use beacon_watch::reaper::{Reaper, ReaperPolicy};
use beacon_watch::store::memory::MemoryStore;
use beacon_watch::store::{paths, SharedStore};
use beacon_watch::types::{DeviceInfo, Platform};

const HOUR_MS: i64 = 3_600_000;

fn fast_config() -> PresenceConfig {
    PresenceConfig {
        remote_timeout: Duration::from_secs(1),
        reregister_backoff_base: Duration::from_millis(10),
        reregister_max_attempts: 3,
        heartbeat_interval: Duration::from_millis(100),
        background_heartbeat_interval: Duration::from_millis(200),
    }
}

fn device(store: Arc<dyn SharedStore>, id: &str, platform: Platform) -> PresencePublisher {
    PresencePublisher::new(
        store,
        id,
        PresenceRole::Device {
            name: format!("cam-{id}"),
            location: "lobby".to_string(),
            info: DeviceInfo {
                platform,
                model: "test".to_string(),
                ..DeviceInfo::default()
            },
        },
        fast_config(),
    )
}

#[tokio::test]
async fn abrupt_disconnect_marks_device_offline_server_side() {
    let store = Arc::new(MemoryStore::new());
    let mut publisher = device(
        Arc::clone(&store) as Arc<dyn SharedStore>,
        "d1",
        Platform::Mobile,
    );
    publisher.register().await.unwrap();

    let status = store.get(&paths::device_status("d1")).await.unwrap().unwrap();
    assert_eq!(status["online"], serde_json::json!(true));

    // Process dies without deregistering; the armed write fires
    store.simulate_disconnect().await;

    // Read back over a fresh connection, the way an observer would
    store.reconnect();
    let status = store.get(&paths::device_status("d1")).await.unwrap().unwrap();
    assert_eq!(status["online"], serde_json::json!(false));
    assert!(status["disconnectedAt"].is_i64());
}

#[tokio::test]
async fn reregister_after_reconnect_restores_the_record() {
    let store = Arc::new(MemoryStore::new());
    let mut publisher = device(
        Arc::clone(&store) as Arc<dyn SharedStore>,
        "d1",
        Platform::Mobile,
    );
    publisher.register().await.unwrap();

    store.simulate_disconnect().await;
    publisher.mark_disconnected();
    assert_eq!(publisher.state(), PresenceState::Disconnected);

    store.reconnect();
    publisher.reregister().await.unwrap();
    assert_eq!(publisher.state(), PresenceState::Active);

    let status = store.get(&paths::device_status("d1")).await.unwrap().unwrap();
    assert_eq!(status["online"], serde_json::json!(true));
}

/// The full ghost story: a device dies, its switch marks it offline, and
/// a later sweep removes the record while a live device is untouched.
#[tokio::test]
async fn reaper_removes_the_ghost_but_spares_the_living()
{
    let store = Arc::new(MemoryStore::new());
    let now = 1_000_000_000_000i64;
    store.set_now(now);

    let mut ghost = device(
        Arc::clone(&store) as Arc<dyn SharedStore>,
        "ghost",
        Platform::Mobile,
    );
    ghost.register().await.unwrap();
    store.simulate_disconnect().await;
    store.reconnect();

    // A healthy device registers two hours later, just before the sweep
    let sweep_at = now + 2 * HOUR_MS;
    store.set_now(sweep_at);
    let mut alive = device(
        Arc::clone(&store) as Arc<dyn SharedStore>,
        "alive",
        Platform::Mobile,
    );
    alive.register().await.unwrap();
    alive.heartbeat().await.unwrap();

    let mut reaper = Reaper::new(
        Arc::clone(&store) as Arc<dyn SharedStore>,
        ReaperPolicy::default(),
    );
    let outcome = reaper.sweep(sweep_at).await.unwrap();

    assert_eq!(outcome.devices_removed, 1);
    assert!(store.get(&paths::device("ghost")).await.unwrap().is_none());
    assert!(store.get(&paths::device("alive")).await.unwrap().is_some());
}

#[tokio::test]
async fn deregister_is_clean_even_when_disconnected() {
    let store = Arc::new(MemoryStore::new());
    let mut publisher = device(
        Arc::clone(&store) as Arc<dyn SharedStore>,
        "d1",
        Platform::Desktop,
    );
    publisher.register().await.unwrap();

    // Best-effort: a deregister against a dead connection must not error
    store.simulate_disconnect().await;
    publisher.deregister().await;
    assert_eq!(publisher.state(), PresenceState::Removed);
}
