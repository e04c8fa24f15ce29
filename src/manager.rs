//! SessionManager: the operations the CRM layer calls.
//!
//! Wires the store, transport, supervisor, pipeline and bot together and
//! turns internal state into structured views. Callers never see transport
//! failures directly except through `send_message`; everything else shows up
//! as session status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::bot::cache::{BotConfigCache, load_or_init};
use crate::bot::config::BotConfig;
use crate::bot::responder::BotResponder;
use crate::config::ManagerConfig;
use crate::error::{DatabaseError, SendError, SessionError};
use crate::events::EventPublisher;
use crate::pipeline::inbound::InboundPipeline;
use crate::pipeline::outbound::OutboundGateway;
use crate::session::registry::SessionRegistry;
use crate::session::state::SessionStatus;
use crate::session::supervisor::{ConnectionSupervisor, InitMode, RecoveryReport};
use crate::store::traits::{Database, Identity, SessionRecord, StoredMessage, session_id_for};
use crate::transport::Transport;

/// Caller-facing snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatusView {
    pub tenant_id: String,
    pub session_id: String,
    pub connected: bool,
    pub status: SessionStatus,
    pub identity: Option<Identity>,
    /// Raw pairing code while `AwaitingPairing`.
    pub pairing_code: Option<String>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl From<SessionRecord> for SessionStatusView {
    fn from(record: SessionRecord) -> Self {
        Self {
            connected: record.status == SessionStatus::Connected,
            pairing_code: record.pairing_code.map(|p| p.raw),
            tenant_id: record.tenant_id,
            session_id: record.session_id,
            status: record.status,
            identity: record.identity,
            last_error: record.last_error,
            reconnect_attempts: record.reconnect_attempts,
            last_connected_at: record.last_connected_at,
        }
    }
}

/// Answer to `get_pairing_code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PairingCodeView {
    /// Scan this to pair.
    Pending { code: String, qr_data_url: String },
    AlreadyConnected,
    /// No code right now; the session is in `status`.
    Unavailable { status: SessionStatus },
}

pub struct SessionManager {
    db: Arc<dyn Database>,
    supervisor: Arc<ConnectionSupervisor>,
    gateway: Arc<OutboundGateway>,
    bot_configs: Arc<BotConfigCache>,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        db: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let bot_configs = Arc::new(BotConfigCache::new(Arc::clone(&db)));
        let gateway = Arc::new(OutboundGateway::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            Arc::clone(&events),
        ));
        let pipeline = Arc::new(InboundPipeline::new(
            Arc::clone(&db),
            Arc::clone(&events),
            Arc::clone(&bot_configs),
            BotResponder::new(Arc::clone(&gateway)),
        ));
        let supervisor = ConnectionSupervisor::new(
            config,
            Arc::clone(&db),
            transport,
            registry,
            events,
            Arc::clone(&bot_configs),
            pipeline,
        );

        Self {
            db,
            supervisor,
            gateway,
            bot_configs,
        }
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Start (or keep) the tenant's session. Long-running: waits on the
    /// transport handshake.
    pub async fn initialize_session(
        &self,
        tenant_id: &str,
    ) -> Result<SessionStatusView, SessionError> {
        self.supervisor
            .initialize(tenant_id, InitMode::Fresh)
            .await?;
        Ok(self.get_session_status(tenant_id).await?)
    }

    pub async fn get_pairing_code(&self, tenant_id: &str) -> Result<PairingCodeView, DatabaseError> {
        let record = self.load(tenant_id).await?;
        Ok(match (record.status, record.pairing_code) {
            (SessionStatus::AwaitingPairing, Some(code)) => PairingCodeView::Pending {
                code: code.raw,
                qr_data_url: code.qr_data_url,
            },
            (SessionStatus::Connected, _) => PairingCodeView::AlreadyConnected,
            (status, _) => PairingCodeView::Unavailable { status },
        })
    }

    pub async fn get_session_status(
        &self,
        tenant_id: &str,
    ) -> Result<SessionStatusView, DatabaseError> {
        Ok(self.load(tenant_id).await?.into())
    }

    /// Tear the session down. Idempotent.
    pub async fn disconnect_session(&self, tenant_id: &str) -> SessionStatusView {
        self.supervisor.disconnect(tenant_id).await.into()
    }

    /// Run the startup recovery sweep. Call once, before serving requests.
    pub async fn recover_sessions(&self) -> Result<RecoveryReport, DatabaseError> {
        self.supervisor.recover().await
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Send a manual (non-automated) message.
    pub async fn send_message(
        &self,
        tenant_id: &str,
        address: &str,
        body: &str,
    ) -> Result<StoredMessage, SendError> {
        self.gateway.send(tenant_id, address, body, false).await
    }

    // ── Bot configuration ───────────────────────────────────────────

    /// The tenant's bot config; a default one is created on first access.
    pub async fn get_bot_config(&self, tenant_id: &str) -> Result<BotConfig, DatabaseError> {
        load_or_init(self.db.as_ref(), tenant_id).await
    }

    /// Persist a new config and refresh the session's cached copy.
    pub async fn update_bot_config(
        &self,
        tenant_id: &str,
        config: BotConfig,
    ) -> Result<BotConfig, DatabaseError> {
        self.db.save_bot_config(tenant_id, &config).await?;
        self.bot_configs
            .put(&session_id_for(tenant_id), config.clone())
            .await;
        info!(tenant_id, enabled = config.enabled, "Bot config updated");
        Ok(config)
    }

    async fn load(&self, tenant_id: &str) -> Result<SessionRecord, DatabaseError> {
        Ok(self
            .db
            .get_session(tenant_id)
            .await?
            .unwrap_or_else(|| SessionRecord::new(tenant_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastPublisher;
    use crate::store::LibSqlBackend;
    use crate::transport::LoopbackTransport;

    async fn manager() -> (SessionManager, tempfile::TempDir) {
        let creds = tempfile::tempdir().unwrap();
        let config = ManagerConfig {
            credentials_dir: creds.path().to_path_buf(),
            ..ManagerConfig::default()
        };
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let manager = SessionManager::new(
            config,
            db,
            Arc::new(LoopbackTransport::new()),
            BroadcastPublisher::new(16),
        );
        (manager, creds)
    }

    #[tokio::test]
    async fn unknown_tenant_is_uninitialized() {
        let (manager, _creds) = manager().await;
        let view = manager.get_session_status("t1").await.unwrap();
        assert_eq!(view.status, SessionStatus::Uninitialized);
        assert!(!view.connected);
        assert_eq!(view.session_id, "session-t1");
        assert_eq!(
            manager.get_pairing_code("t1").await.unwrap(),
            PairingCodeView::Unavailable {
                status: SessionStatus::Uninitialized
            }
        );
    }

    #[tokio::test]
    async fn bot_config_default_then_update() {
        let (manager, _creds) = manager().await;
        let config = manager.get_bot_config("t1").await.unwrap();
        assert!(!config.enabled);
        assert_eq!(config.response_delay_seconds, 2);

        let updated = BotConfig {
            enabled: true,
            initial_message: "Welcome".into(),
            ..config
        };
        manager.update_bot_config("t1", updated.clone()).await.unwrap();
        assert_eq!(manager.get_bot_config("t1").await.unwrap(), updated);
    }

    #[tokio::test]
    async fn send_without_session_is_not_connected() {
        let (manager, _creds) = manager().await;
        let err = manager.send_message("t1", "5511", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected { .. }));
    }

    #[test]
    fn status_view_exposes_pairing_code_raw() {
        let mut record = SessionRecord::new("t1");
        record.status = SessionStatus::AwaitingPairing;
        record.pairing_code = Some(crate::store::traits::PairingCode {
            raw: "2@x".into(),
            qr_data_url: "data:".into(),
        });
        let view = SessionStatusView::from(record);
        assert_eq!(view.pairing_code.as_deref(), Some("2@x"));
        assert!(!view.connected);
    }
}
