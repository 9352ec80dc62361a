//! Watch Configuration Module
//!
//! Provides deployment configuration loaded from TOML files, replacing
//! hardcoded intervals and thresholds with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `BEACON_CONFIG` environment variable (path to TOML file)
//! 2. `beacon_config.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(WatchConfig::load());
//!
//! // Anywhere in the codebase:
//! let interval = config::get().intervals.heartbeat_secs;
//! ```

mod watch_config;
pub mod defaults;

pub use watch_config::*;

use std::sync::OnceLock;

/// Global watch configuration, initialized once at startup.
static WATCH_CONFIG: OnceLock<WatchConfig> = OnceLock::new();

/// Initialize the global watch configuration.
///
/// Must be called exactly once before any calls to `get()`.
pub fn init(config: WatchConfig) {
    if WATCH_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global watch configuration.
///
/// Panics if `init()` has not been called. This is by design — a missing
/// config is a fatal startup error, not a recoverable condition.
pub fn get() -> &'static WatchConfig {
    WATCH_CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

/// Check whether the config has been initialized.
///
/// Useful for tests and optional config paths.
pub fn is_initialized() -> bool {
    WATCH_CONFIG.get().is_some()
}
