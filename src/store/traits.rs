//! Unified `Database` trait: single async interface for all persistence.
//!
//! Covers the session store, conversation/message records and per-tenant
//! bot configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bot::config::BotConfig;
use crate::error::DatabaseError;
use crate::session::state::SessionStatus;

/// Stable session id for a tenant. One session per tenant.
pub fn session_id_for(tenant_id: &str) -> String {
    format!("session-{tenant_id}")
}

/// Protocol-assigned identity of a paired session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Phone number / account address.
    pub number: String,
    pub display_name: Option<String>,
}

/// Pairing code as issued by the protocol plus its QR rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCode {
    pub raw: String,
    /// `data:image/svg+xml;base64,...` QR image for the raw code.
    pub qr_data_url: String,
}

/// Durable record of one tenant's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub tenant_id: String,
    pub session_id: String,
    pub status: SessionStatus,
    /// Present only while `AwaitingPairing`.
    pub pairing_code: Option<PairingCode>,
    /// Present only once `Connected`.
    pub identity: Option<Identity>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    /// Why the session last entered `Error` (or a terminal disconnect).
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// A never-connected session for `tenant_id`.
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            session_id: session_id_for(tenant_id),
            status: SessionStatus::Uninitialized,
            pairing_code: None,
            identity: None,
            last_connected_at: None,
            reconnect_attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Whether a conversation is handled by automation or waits for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationStatus {
    Active,
    NeedsAgent,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::NeedsAgent => "needs-agent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "needs-agent" => Self::NeedsAgent,
            _ => Self::Active,
        }
    }
}

/// One thread per (tenant, counterpart address).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: String,
    pub counterpart_address: String,
    pub status: ConversationStatus,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "outbound" => Self::Outbound,
            _ => Self::Inbound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Received,
    Sent,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            _ => Self::Received,
        }
    }
}

/// A message to append. `id` and `created_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub tenant_id: String,
    pub counterpart_address: String,
    pub body: String,
    pub direction: Direction,
    pub sent_by_automation: bool,
    pub delivery_status: DeliveryStatus,
    pub read_flag: bool,
}

/// An immutable persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tenant_id: String,
    pub counterpart_address: String,
    pub body: String,
    pub direction: Direction,
    pub sent_by_automation: bool,
    pub delivery_status: DeliveryStatus,
    pub read_flag: bool,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Get the session record of a tenant.
    async fn get_session(&self, tenant_id: &str) -> Result<Option<SessionRecord>, DatabaseError>;

    /// Insert or fully replace a session record.
    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), DatabaseError>;

    /// All sessions currently persisted with `status`.
    async fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<SessionRecord>, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Get the conversation for (tenant, address), creating an active one if needed.
    async fn find_or_create_conversation(
        &self,
        tenant_id: &str,
        counterpart_address: &str,
    ) -> Result<Conversation, DatabaseError>;

    /// Get a conversation by ID.
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError>;

    /// Set a conversation's status.
    async fn set_conversation_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
    ) -> Result<(), DatabaseError>;

    /// Update the preview fields shown in conversation lists.
    async fn update_conversation_preview(
        &self,
        id: Uuid,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append a message. `created_at` never goes backwards within a conversation.
    async fn append_message(&self, message: &NewMessage) -> Result<StoredMessage, DatabaseError>;

    /// Messages of a conversation in write order.
    async fn list_messages(&self, conversation_id: Uuid)
    -> Result<Vec<StoredMessage>, DatabaseError>;

    // ── Bot configuration ───────────────────────────────────────────

    async fn get_bot_config(&self, tenant_id: &str) -> Result<Option<BotConfig>, DatabaseError>;

    async fn save_bot_config(&self, tenant_id: &str, config: &BotConfig)
    -> Result<(), DatabaseError>;
}
