//! Session and message lifecycle notifications.
//!
//! Publishing is fire-and-forget: a publisher never reports failure back to
//! the session or the pipeline.

pub mod ws;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::session::state::SessionStatus;
use crate::store::traits::{Identity, StoredMessage};

/// A notification for one tenant's listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PairingCodeIssued {
        tenant_id: String,
        session_id: String,
        pairing_code: String,
        qr_data_url: String,
    },
    Connected {
        tenant_id: String,
        session_id: String,
        identity: Identity,
    },
    /// The session left the connected lifecycle: explicit disconnect,
    /// logout, pairing timeout or exhausted reconnects.
    Disconnected {
        tenant_id: String,
        session_id: String,
        status: SessionStatus,
        reason: Option<String>,
    },
    MessageReceived {
        tenant_id: String,
        conversation_id: Uuid,
        message: StoredMessage,
    },
    MessageSent {
        tenant_id: String,
        conversation_id: Uuid,
        message: StoredMessage,
    },
}

impl SessionEvent {
    pub fn tenant_id(&self) -> &str {
        match self {
            Self::PairingCodeIssued { tenant_id, .. }
            | Self::Connected { tenant_id, .. }
            | Self::Disconnected { tenant_id, .. }
            | Self::MessageReceived { tenant_id, .. }
            | Self::MessageSent { tenant_id, .. } => tenant_id,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PairingCodeIssued { .. } => "pairing_code_issued",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::MessageReceived { .. } => "message_received",
            Self::MessageSent { .. } => "message_sent",
        }
    }
}

/// Sink for lifecycle notifications.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: SessionEvent);
}

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Publisher backed by a broadcast channel for fan-out to WS clients.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = if capacity == 0 {
            DEFAULT_BROADCAST_CAPACITY
        } else {
            capacity
        };
        let (tx, _rx) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    /// Subscribe to every tenant's events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: SessionEvent) {
        trace!(tenant_id = %event.tenant_id(), event = event.label(), "Publishing event");
        // Ok if no receivers are listening
        let _ = self.tx.send(event);
    }
}
