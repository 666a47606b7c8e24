//! User Settings
//!
//! Connection policy shared by every decision point of the lifecycle.
//! Stored as one document under the `settings` key; missing fields take
//! their defaults so older documents keep loading.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Reconnect to the most recently used profile at startup
    pub auto_connect_last_used: bool,
    /// Deliver toast notifications
    #[serde(rename = "showNotifications")]
    pub notifications_enabled: bool,
    /// Purge cookies whenever the proxy configuration is cleared
    pub clear_cookies_on_disconnect: bool,
    /// Probe timeout (seconds)
    pub connection_timeout: u64,
    /// Reconnection attempts per connect request
    pub max_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_connect_last_used: false,
            notifications_enabled: true,
            clear_cookies_on_disconnect: true,
            connection_timeout: 30,
            max_retries: 5,
        }
    }
}

impl Settings {
    /// Probe timeout; a zero value falls back to one second
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout.max(1))
    }
}
