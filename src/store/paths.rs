//! Store path layout.
//!
//! Three top-level categories; the reaper deletes a category node outright
//! when a sweep empties it.

/// Top-level device records category.
pub const DEVICES: &str = "devices";

/// Top-level observer records category.
pub const OBSERVERS: &str = "observers";

/// Top-level alert records category.
pub const ALERTS: &str = "alerts";

/// `devices/{id}`
pub fn device(id: &str) -> String {
    format!("{DEVICES}/{id}")
}

/// `devices/{id}/status`
pub fn device_status(id: &str) -> String {
    format!("{DEVICES}/{id}/status")
}

/// `observers/{id}`
pub fn observer(id: &str) -> String {
    format!("{OBSERVERS}/{id}")
}

/// `alerts/{id}`
pub fn alert(id: &str) -> String {
    format!("{ALERTS}/{id}")
}
