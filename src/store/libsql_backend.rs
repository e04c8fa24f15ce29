//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bot::config::BotConfig;
use crate::error::DatabaseError;
use crate::session::state::SessionStatus;
use crate::store::migrations;
use crate::store::traits::{
    Conversation, ConversationStatus, Database, DeliveryStatus, Direction, Identity, NewMessage,
    PairingCode, SessionRecord, StoredMessage,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps lexical and time order equal.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const SESSION_COLUMNS: &str = "tenant_id, session_id, status, pairing_code, pairing_qr, identity_number, identity_name, last_connected_at, reconnect_attempts, last_error, updated_at";

const CONVERSATION_COLUMNS: &str =
    "id, tenant_id, counterpart_address, status, last_message_preview, last_message_at, created_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, tenant_id, counterpart_address, body, direction, sent_by_automation, delivery_status, read_flag, created_at";

/// Map a libsql Row to a SessionRecord (column order = SESSION_COLUMNS).
fn row_to_session(row: &libsql::Row) -> Result<SessionRecord, DatabaseError> {
    let status_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("session row: {e}")))?;
    let status = status_str.parse::<SessionStatus>().unwrap_or_else(|e| {
        warn!("{e}, treating as disconnected");
        SessionStatus::Disconnected
    });

    let pairing_code = match (row.get::<String>(3).ok(), row.get::<String>(4).ok()) {
        (Some(raw), Some(qr_data_url)) => Some(PairingCode { raw, qr_data_url }),
        _ => None,
    };
    let identity = row.get::<String>(5).ok().map(|number| Identity {
        number,
        display_name: row.get::<String>(6).ok(),
    });
    let attempts: i64 = row.get(8).unwrap_or(0);
    let updated_str: String = row.get(10).unwrap_or_default();

    Ok(SessionRecord {
        tenant_id: row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("session row: {e}")))?,
        session_id: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("session row: {e}")))?,
        status,
        pairing_code,
        identity,
        last_connected_at: parse_optional_datetime(row.get::<String>(7).ok()),
        reconnect_attempts: u32::try_from(attempts).unwrap_or(0),
        last_error: row.get::<String>(9).ok(),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, libsql::Error> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(3)?;
    let created_str: String = row.get(6)?;

    Ok(Conversation {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        tenant_id: row.get(1)?,
        counterpart_address: row.get(2)?,
        status: ConversationStatus::parse(&status_str),
        last_message_preview: row.get::<String>(4).ok(),
        last_message_at: parse_optional_datetime(row.get::<String>(5).ok()),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let direction_str: String = row.get(5)?;
    let automated: i64 = row.get(6)?;
    let delivery_str: String = row.get(7)?;
    let read: i64 = row.get(8)?;
    let created_str: String = row.get(9)?;

    Ok(StoredMessage {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        conversation_id: Uuid::parse_str(&conversation_str).unwrap_or_else(|_| Uuid::nil()),
        tenant_id: row.get(2)?,
        counterpart_address: row.get(3)?,
        body: row.get(4)?,
        direction: Direction::parse(&direction_str),
        sent_by_automation: automated != 0,
        delivery_status: DeliveryStatus::parse(&delivery_str),
        read_flag: read != 0,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn get_session(&self, tenant_id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = ?1"),
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session: {e}"))),
        }
    }

    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), DatabaseError> {
        let (code, qr) = match &record.pairing_code {
            Some(p) => (Some(p.raw.as_str()), Some(p.qr_data_url.as_str())),
            None => (None, None),
        };
        let (number, name) = match &record.identity {
            Some(id) => (Some(id.number.as_str()), id.display_name.as_deref()),
            None => (None, None),
        };
        let last_connected = record.last_connected_at.map(fmt_ts);

        self.conn()
            .execute(
                "INSERT INTO sessions (tenant_id, session_id, status, pairing_code, pairing_qr,
                    identity_number, identity_name, last_connected_at, reconnect_attempts,
                    last_error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (tenant_id) DO UPDATE SET
                    session_id = excluded.session_id,
                    status = excluded.status,
                    pairing_code = excluded.pairing_code,
                    pairing_qr = excluded.pairing_qr,
                    identity_number = excluded.identity_number,
                    identity_name = excluded.identity_name,
                    last_connected_at = excluded.last_connected_at,
                    reconnect_attempts = excluded.reconnect_attempts,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at",
                params![
                    record.tenant_id.as_str(),
                    record.session_id.as_str(),
                    record.status.as_str(),
                    opt_text(code),
                    opt_text(qr),
                    opt_text(number),
                    opt_text(name),
                    opt_text(last_connected.as_deref()),
                    i64::from(record.reconnect_attempts),
                    opt_text(record.last_error.as_deref()),
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_session: {e}")))?;

        debug!(
            tenant_id = %record.tenant_id,
            status = %record.status,
            attempts = record.reconnect_attempts,
            "Session persisted"
        );
        Ok(())
    }

    async fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<SessionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1 ORDER BY tenant_id"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sessions_by_status: {e}")))?;

        let mut sessions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_session(&row) {
                Ok(s) => sessions.push(s),
                Err(e) => warn!("Skipping session row: {e}"),
            }
        }
        Ok(sessions)
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn find_or_create_conversation(
        &self,
        tenant_id: &str,
        counterpart_address: &str,
    ) -> Result<Conversation, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conversations (id, tenant_id, counterpart_address, status, created_at)
             VALUES (?1, ?2, ?3, 'active', ?4)
             ON CONFLICT (tenant_id, counterpart_address) DO NOTHING",
            params![
                Uuid::new_v4().to_string(),
                tenant_id,
                counterpart_address,
                fmt_ts(Utc::now()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("find_or_create_conversation: {e}")))?;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE tenant_id = ?1 AND counterpart_address = ?2"
                ),
                params![tenant_id, counterpart_address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_or_create_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_conversation(&row)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: format!("{tenant_id}/{counterpart_address}"),
            }),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_or_create_conversation: {e}"
            ))),
        }
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_conversation(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn set_conversation_status(
        &self,
        id: Uuid,
        status: ConversationStatus,
    ) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE conversations SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_conversation_status: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            });
        }
        debug!(conversation_id = %id, status = status.as_str(), "Conversation status updated");
        Ok(())
    }

    async fn update_conversation_preview(
        &self,
        id: Uuid,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE conversations SET last_message_preview = ?1, last_message_at = ?2
                 WHERE id = ?3 AND (last_message_at IS NULL OR last_message_at <= ?2)",
                params![preview, fmt_ts(at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_conversation_preview: {e}")))?;
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn append_message(&self, message: &NewMessage) -> Result<StoredMessage, DatabaseError> {
        let id = Uuid::new_v4();
        let now = fmt_ts(Utc::now());

        // One statement so the clamp and the insert cannot interleave with
        // another writer on the same conversation.
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO messages (id, conversation_id, tenant_id, counterpart_address, body,
                    direction, sent_by_automation, delivery_status, read_flag, created_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                    MAX(?10, COALESCE(
                        (SELECT MAX(created_at) FROM messages WHERE conversation_id = ?2), ?10))
                 RETURNING created_at",
                params![
                    id.to_string(),
                    message.conversation_id.to_string(),
                    message.tenant_id.as_str(),
                    message.counterpart_address.as_str(),
                    message.body.as_str(),
                    message.direction.as_str(),
                    i64::from(message.sent_by_automation),
                    message.delivery_status.as_str(),
                    i64::from(message.read_flag),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;

        let created_at = match rows.next().await {
            Ok(Some(row)) => {
                let s: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;
                parse_datetime(&s)
            }
            Ok(None) => parse_datetime(&now),
            Err(e) => return Err(DatabaseError::Query(format!("append_message: {e}"))),
        };

        debug!(
            id = %id,
            conversation_id = %message.conversation_id,
            direction = message.direction.as_str(),
            "Message appended"
        );

        Ok(StoredMessage {
            id,
            conversation_id: message.conversation_id,
            tenant_id: message.tenant_id.clone(),
            counterpart_address: message.counterpart_address.clone(),
            body: message.body.clone(),
            direction: message.direction,
            sent_by_automation: message.sent_by_automation,
            delivery_status: message.delivery_status,
            read_flag: message.read_flag,
            created_at,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at ASC, seq ASC"
                ),
                params![conversation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    // ── Bot configuration ───────────────────────────────────────────

    async fn get_bot_config(&self, tenant_id: &str) -> Result<Option<BotConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT config FROM bot_configs WHERE tenant_id = ?1",
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_bot_config: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_bot_config: {e}")))?;
                let config = serde_json::from_str(&json)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                Ok(Some(config))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_bot_config: {e}"))),
        }
    }

    async fn save_bot_config(
        &self,
        tenant_id: &str,
        config: &BotConfig,
    ) -> Result<(), DatabaseError> {
        let json =
            serde_json::to_string(config).map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT INTO bot_configs (tenant_id, config, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (tenant_id) DO UPDATE SET config = excluded.config,
                    updated_at = excluded.updated_at",
                params![tenant_id, json, fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_bot_config: {e}")))?;

        debug!(tenant_id, enabled = config.enabled, "Bot config saved");
        Ok(())
    }
}
