//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Root directory holding one credential directory per session.
    pub credentials_dir: PathBuf,
    /// Recoverable closes tolerated before a session moves to `Error`.
    pub max_reconnect_attempts: u32,
    /// Fixed delay before a scheduled reconnect.
    pub reconnect_backoff: Duration,
    /// How long a session may sit in `AwaitingPairing`.
    pub pairing_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Port of the event WebSocket server.
    pub ws_port: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/crm-messaging.db"),
            credentials_dir: PathBuf::from("./sessions"),
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(5),
            pairing_timeout: Duration::from_secs(120),
            event_capacity: 256,
            ws_port: 8080,
        }
    }
}

impl ManagerConfig {
    /// Build from `CRM_MSG_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let db_path = std::env::var("CRM_MSG_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let credentials_dir = std::env::var("CRM_MSG_CREDENTIALS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.credentials_dir);

        let max_reconnect_attempts: u32 = std::env::var("CRM_MSG_MAX_RECONNECT_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_reconnect_attempts);

        let reconnect_backoff = std::env::var("CRM_MSG_RECONNECT_BACKOFF_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.reconnect_backoff);

        let pairing_timeout = std::env::var("CRM_MSG_PAIRING_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.pairing_timeout);

        let event_capacity: usize = std::env::var("CRM_MSG_EVENT_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.event_capacity);

        let ws_port: u16 = std::env::var("CRM_MSG_WS_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.ws_port);

        Self {
            db_path,
            credentials_dir,
            max_reconnect_attempts,
            reconnect_backoff,
            pairing_timeout,
            event_capacity,
            ws_port,
        }
    }
}
