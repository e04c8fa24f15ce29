//! Outbound gateway: sends through a connected session and records the result.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::SendError;
use crate::events::{EventPublisher, SessionEvent};
use crate::pipeline::preview;
use crate::session::registry::SessionRegistry;
use crate::store::traits::{
    Database, DeliveryStatus, Direction, NewMessage, StoredMessage, session_id_for,
};
use crate::transport::normalize_address;

pub struct OutboundGateway {
    db: Arc<dyn Database>,
    registry: Arc<SessionRegistry>,
    events: Arc<dyn EventPublisher>,
}

impl OutboundGateway {
    pub fn new(
        db: Arc<dyn Database>,
        registry: Arc<SessionRegistry>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            db,
            registry,
            events,
        }
    }

    /// Send `body` to `address` on the tenant's session.
    ///
    /// Nothing is persisted unless the transport accepted the message.
    /// Failures are returned as-is; retrying is up to the caller.
    pub async fn send(
        &self,
        tenant_id: &str,
        address: &str,
        body: &str,
        automated: bool,
    ) -> Result<StoredMessage, SendError> {
        let session_id = session_id_for(tenant_id);
        let Some(handle) = self.registry.connected_handle(&session_id).await else {
            debug!(tenant_id, "Send refused, session not connected");
            return Err(SendError::NotConnected { session_id });
        };

        let address = normalize_address(address);
        if let Err(e) = handle.send(&address, body).await {
            warn!(tenant_id, address = %address, error = %e, "Transport send failed");
            return Err(e.into());
        }

        let message = self
            .record(tenant_id, &address, body, automated)
            .await
            .inspect_err(|e| {
                error!(tenant_id, address = %address, error = %e, "Sent message could not be recorded")
            })?;

        info!(
            tenant_id,
            conversation_id = %message.conversation_id,
            automated,
            "Message sent"
        );
        self.events.publish(SessionEvent::MessageSent {
            tenant_id: tenant_id.to_string(),
            conversation_id: message.conversation_id,
            message: message.clone(),
        });
        Ok(message)
    }

    async fn record(
        &self,
        tenant_id: &str,
        address: &str,
        body: &str,
        automated: bool,
    ) -> Result<StoredMessage, SendError> {
        let conversation = self
            .db
            .find_or_create_conversation(tenant_id, address)
            .await?;
        let message = self
            .db
            .append_message(&NewMessage {
                conversation_id: conversation.id,
                tenant_id: tenant_id.to_string(),
                counterpart_address: address.to_string(),
                body: body.to_string(),
                direction: Direction::Outbound,
                sent_by_automation: automated,
                delivery_status: DeliveryStatus::Sent,
                read_flag: true,
            })
            .await?;
        self.db
            .update_conversation_preview(conversation.id, &preview(body), message.created_at)
            .await?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastPublisher;
    use crate::session::state::SessionStatus;
    use crate::store::LibSqlBackend;
    use crate::transport::{LoopbackTransport, Transport};

    struct Fixture {
        db: Arc<dyn Database>,
        registry: Arc<SessionRegistry>,
        transport: LoopbackTransport,
        gateway: OutboundGateway,
        publisher: Arc<BroadcastPublisher>,
        creds: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let publisher = BroadcastPublisher::new(16);
        let gateway = OutboundGateway::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            publisher.clone(),
        );
        Fixture {
            db,
            registry,
            transport: LoopbackTransport::new(),
            gateway,
            publisher,
            creds: tempfile::tempdir().unwrap(),
        }
    }

    async fn connect(f: &Fixture, tenant: &str) {
        let session_id = session_id_for(tenant);
        let (generation, _) = f.registry.begin(&session_id, SessionStatus::Initializing).await;
        let conn = f
            .transport
            .connect(&session_id, &f.creds.path().join(&session_id))
            .await
            .unwrap();
        f.registry.attach(&session_id, generation, conn.handle).await;
        f.registry
            .set_status(&session_id, generation, SessionStatus::Connected)
            .await;
    }

    #[tokio::test]
    async fn not_connected_persists_nothing() {
        let f = fixture().await;
        let err = f.gateway.send("t1", "5511", "hi", false).await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected { .. }));

        let conv = f.db.find_or_create_conversation("t1", "5511").await.unwrap();
        assert!(f.db.list_messages(conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_records_outbound_message_and_publishes() {
        let f = fixture().await;
        connect(&f, "t1").await;
        let mut rx = f.publisher.subscribe();

        let message = f
            .gateway
            .send("t1", "5511@s.whatsapp.net", "hello", true)
            .await
            .unwrap();
        assert_eq!(message.direction, Direction::Outbound);
        assert!(message.sent_by_automation);
        assert_eq!(message.counterpart_address, "5511");

        let sent = f.transport.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].address, "5511");

        let conv = f.db.get_conversation(message.conversation_id).await.unwrap().unwrap();
        assert_eq!(conv.last_message_preview.as_deref(), Some("hello"));

        match rx.recv().await.unwrap() {
            SessionEvent::MessageSent { message: m, .. } => assert_eq!(m.id, message.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_is_not_persisted() {
        let f = fixture().await;
        connect(&f, "t1").await;
        f.transport.set_send_failure(Some("socket closed")).await;

        let err = f.gateway.send("t1", "5511", "hello", false).await.unwrap_err();
        assert!(matches!(err, SendError::Transport(_)));

        let conv = f.db.find_or_create_conversation("t1", "5511").await.unwrap();
        assert!(f.db.list_messages(conv.id).await.unwrap().is_empty());
    }
}
