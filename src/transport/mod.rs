//! Protocol client contract.
//!
//! The chat protocol itself is a black box. A transport opens one connection
//! per session and reports everything that happens on it as an ordered
//! stream of [`TransportEvent`]s. Commands go through a [`TransportHandle`].

pub mod loopback;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::store::traits::Identity;

pub use loopback::LoopbackTransport;

// ── Events ──────────────────────────────────────────────────────────

/// Why the protocol closed a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The account was logged out from the device.
    LoggedOut,
    /// The stored credentials were rejected.
    AuthRejected,
    ConnectionLost,
    TimedOut,
    /// The protocol asked for a fresh connection.
    RestartRequired,
    Other(String),
}

impl CloseReason {
    /// Terminal closes end the session; everything else is retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut | Self::AuthRejected)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::AuthRejected => f.write_str("authentication rejected"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::TimedOut => f.write_str("timed out"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// A message as delivered by the protocol, before any filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInbound {
    /// Protocol address of the other party, possibly with a domain suffix.
    pub counterpart_address: String,
    pub body: String,
    pub is_group: bool,
    /// Echo of a message the paired account sent from another device.
    pub from_self: bool,
}

impl RawInbound {
    /// A direct text message from `address`.
    pub fn direct(address: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            counterpart_address: address.into(),
            body: body.into(),
            is_group: false,
            from_self: false,
        }
    }
}

/// Everything a connection reports, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PairingCodeIssued { code: String },
    ConnectionOpened { identity: Identity },
    ConnectionClosed { reason: CloseReason },
    MessageReceived(RawInbound),
}

// ── Client traits ───────────────────────────────────────────────────

/// Commands accepted by a live connection.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send a text message to `address`.
    async fn send(&self, address: &str, body: &str) -> Result<(), TransportError>;

    /// Close the connection. Safe to call more than once.
    async fn end(&self);
}

/// A freshly opened connection: the command handle plus its event stream.
pub struct TransportConnection {
    pub handle: Arc<dyn TransportHandle>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Factory for protocol connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection for `session_id`, using (and writing) the credential
    /// material kept under `credentials`.
    async fn connect(
        &self,
        session_id: &str,
        credentials: &Path,
    ) -> Result<TransportConnection, TransportError>;
}

/// Strip the protocol domain and device suffix from an address.
///
/// `5511999:3@s.whatsapp.net` and `5511999` both become `5511999`.
pub fn normalize_address(address: &str) -> String {
    let user = address.split('@').next().unwrap_or(address);
    let user = user.split(':').next().unwrap_or(user);
    user.trim().to_string()
}
