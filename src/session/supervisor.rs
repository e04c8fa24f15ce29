//! Connection supervisor: owns every session state transition.
//!
//! Each live connection gets one worker task that consumes the transport's
//! events strictly in arrival order. Lifecycle changes of a session are
//! serialized through the registry's per-session lock and tagged with the
//! connection generation, so a stale worker, a late connect or a fired
//! reconnect timer cannot overwrite the effects of a newer operation.
//!
//! Credential policy:
//! - explicit disconnect and terminal closes wipe the session's credentials
//! - reconnects, restores and fresh initializes reuse whatever is stored

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bot::cache::BotConfigCache;
use crate::config::ManagerConfig;
use crate::error::{DatabaseError, SessionError, TransportError};
use crate::events::{EventPublisher, SessionEvent};
use crate::pipeline::inbound::InboundPipeline;
use crate::session::credentials::CredentialStore;
use crate::session::pairing::encode_pairing_code;
use crate::session::registry::SessionRegistry;
use crate::session::state::SessionStatus;
use crate::store::traits::{Database, Identity, SessionRecord, session_id_for};
use crate::transport::{CloseReason, Transport, TransportEvent};

/// How an `initialize` treats the persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Caller-requested. Resets the reconnect counter.
    Fresh,
    /// Startup re-initialize of a session persisted as `Connected`.
    Restore,
    /// Scheduled retry after a recoverable close.
    Reconnect,
}

/// Outcome of the startup recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Tenants whose abandoned session was reset to `Disconnected`.
    pub reset: Vec<String>,
    /// Tenants whose connected session was re-initialized.
    pub restored: Vec<String>,
    /// Tenants whose restore failed to connect.
    pub failed: Vec<String>,
}

/// Identity of one worker: the session and the connection generation it serves.
#[derive(Debug, Clone)]
struct WorkerContext {
    tenant_id: String,
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
}

/// What the worker loop does after an event.
enum Step {
    Continue,
    PairingStarted,
    Paired,
    Stop,
}

pub struct ConnectionSupervisor {
    config: ManagerConfig,
    db: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    credentials: CredentialStore,
    events: Arc<dyn EventPublisher>,
    bot_configs: Arc<BotConfigCache>,
    pipeline: Arc<InboundPipeline>,
}

impl ConnectionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ManagerConfig,
        db: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
        events: Arc<dyn EventPublisher>,
        bot_configs: Arc<BotConfigCache>,
        pipeline: Arc<InboundPipeline>,
    ) -> Arc<Self> {
        let credentials = CredentialStore::new(config.credentials_dir.clone());
        Arc::new(Self {
            config,
            db,
            transport,
            registry,
            credentials,
            events,
            bot_configs,
            pipeline,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Open a connection for the tenant's session.
    ///
    /// A session that is already connected is returned untouched. Any other
    /// live connection is torn down first. May wait on the transport
    /// handshake; the returned record reflects the state right after connect.
    pub async fn initialize(
        self: &Arc<Self>,
        tenant_id: &str,
        mode: InitMode,
    ) -> Result<SessionRecord, SessionError> {
        self.start(tenant_id, mode, None).await
    }

    async fn start(
        self: &Arc<Self>,
        tenant_id: &str,
        mode: InitMode,
        expected_generation: Option<u64>,
    ) -> Result<SessionRecord, SessionError> {
        let session_id = session_id_for(tenant_id);

        let (ctx, record) = {
            let _guard = self.registry.lock(&session_id).await;

            if let Some(expected) = expected_generation {
                if !self.registry.is_current(&session_id, expected).await {
                    debug!(session_id = %session_id, "Reconnect superseded, skipping");
                    return Err(SessionError::Superseded { session_id });
                }
            }

            let mut record = self.load_record(tenant_id).await?;
            if mode == InitMode::Fresh
                && self.registry.status(&session_id).await == Some(SessionStatus::Connected)
                && self.registry.has_handle(&session_id).await
            {
                debug!(session_id = %session_id, "Session already connected");
                return Ok(record);
            }

            self.registry.cancel_reconnect(&session_id).await;
            if let Some(previous) = self.registry.remove(&session_id).await {
                debug!(
                    session_id = %session_id,
                    generation = previous.generation,
                    "Tearing down previous connection"
                );
                previous.shutdown().await;
            }

            match mode {
                InitMode::Fresh => {
                    record.status = SessionStatus::Initializing;
                    record.reconnect_attempts = 0;
                    record.last_error = None;
                }
                InitMode::Restore => record.status = SessionStatus::Initializing,
                InitMode::Reconnect => record.status = SessionStatus::Reconnecting,
            }
            record.pairing_code = None;
            self.db.upsert_session(&record).await?;

            let (generation, cancel) = self.registry.begin(&session_id, record.status).await;
            info!(
                tenant_id,
                session_id = %session_id,
                generation,
                mode = ?mode,
                attempts = record.reconnect_attempts,
                "Initializing session"
            );

            let ctx = WorkerContext {
                tenant_id: tenant_id.to_string(),
                session_id,
                generation,
                cancel,
            };
            (ctx, record)
        };

        let connected = match self.credentials.prepare(&ctx.session_id).await {
            Ok(dir) => self.transport.connect(&ctx.session_id, &dir).await,
            Err(e) => Err(TransportError::ConnectFailed {
                session_id: ctx.session_id.clone(),
                reason: format!("credential directory unavailable: {e}"),
            }),
        };

        match connected {
            Ok(connection) => {
                let _guard = self.registry.lock(&ctx.session_id).await;
                if !self
                    .registry
                    .attach(&ctx.session_id, ctx.generation, Arc::clone(&connection.handle))
                    .await
                {
                    info!(session_id = %ctx.session_id, "Connect finished after a newer operation, discarding");
                    connection.handle.end().await;
                    return Err(SessionError::Superseded {
                        session_id: ctx.session_id,
                    });
                }
                self.spawn_worker(ctx, connection.events);
                Ok(record)
            }
            Err(e) => {
                warn!(session_id = %ctx.session_id, error = %e, "Transport connect failed");
                self.connection_lost(&ctx, &CloseReason::Other(e.to_string()))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Tear the session down. Idempotent, never fails.
    ///
    /// Cancels a pending reconnect and any in-flight initialize, wipes the
    /// stored credentials and leaves the session `Disconnected`.
    pub async fn disconnect(&self, tenant_id: &str) -> SessionRecord {
        let session_id = session_id_for(tenant_id);
        let _guard = self.registry.lock(&session_id).await;

        self.registry.cancel_reconnect(&session_id).await;
        if let Some(live) = self.registry.remove(&session_id).await {
            live.shutdown().await;
        }
        self.bot_configs.evict(&session_id).await;
        if let Err(e) = self.credentials.wipe(&session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to wipe credentials");
        }

        let mut record = match self.load_record(tenant_id).await {
            Ok(record) => record,
            Err(e) => {
                error!(tenant_id, error = %e, "Could not load session during disconnect");
                SessionRecord::new(tenant_id)
            }
        };
        let previous = record.status;
        record.status = SessionStatus::Disconnected;
        record.pairing_code = None;
        record.identity = None;
        if let Err(e) = self.db.upsert_session(&record).await {
            error!(tenant_id, error = %e, "Could not persist disconnect");
        }

        if previous != SessionStatus::Disconnected {
            info!(tenant_id, session_id = %session_id, from = %previous, "Session disconnected");
            self.events.publish(SessionEvent::Disconnected {
                tenant_id: tenant_id.to_string(),
                session_id,
                status: SessionStatus::Disconnected,
                reason: None,
            });
        }
        record
    }

    /// Reconcile persisted sessions with an empty registry after a restart.
    pub async fn recover(self: &Arc<Self>) -> Result<RecoveryReport, DatabaseError> {
        let mut report = RecoveryReport::default();

        for status in SessionStatus::ALL.into_iter().filter(|s| s.is_transient()) {
            for mut record in self.db.list_sessions_by_status(status).await? {
                record.status = SessionStatus::Disconnected;
                record.pairing_code = None;
                self.db.upsert_session(&record).await?;
                info!(tenant_id = %record.tenant_id, from = %status, "Abandoned session reset");
                report.reset.push(record.tenant_id);
            }
        }

        let connected = self
            .db
            .list_sessions_by_status(SessionStatus::Connected)
            .await?;
        let results = futures::future::join_all(
            connected
                .iter()
                .map(|record| self.initialize(&record.tenant_id, InitMode::Restore)),
        )
        .await;

        for (record, result) in connected.into_iter().zip(results) {
            match result {
                Ok(_) => report.restored.push(record.tenant_id),
                Err(e) => {
                    warn!(tenant_id = %record.tenant_id, error = %e, "Session restore failed");
                    report.failed.push(record.tenant_id);
                }
            }
        }

        info!(
            reset = report.reset.len(),
            restored = report.restored.len(),
            failed = report.failed.len(),
            "Startup recovery complete"
        );
        Ok(report)
    }

    // ── Worker ──────────────────────────────────────────────────────

    fn spawn_worker(self: &Arc<Self>, ctx: WorkerContext, events: mpsc::Receiver<TransportEvent>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run_worker(ctx, events).await });
    }

    async fn run_worker(self: Arc<Self>, ctx: WorkerContext, mut events: mpsc::Receiver<TransportEvent>) {
        debug!(session_id = %ctx.session_id, generation = ctx.generation, "Session worker started");
        let mut pairing_deadline: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                _ = deadline_elapsed(pairing_deadline) => {
                    self.pairing_timed_out(&ctx).await;
                    break;
                }
                event = events.recv() => event.unwrap_or(TransportEvent::ConnectionClosed {
                    reason: CloseReason::ConnectionLost,
                }),
            };

            match self.handle_event(&ctx, event).await {
                Step::Continue => {}
                Step::PairingStarted => {
                    // A timeout past the clock's range means no deadline.
                    if pairing_deadline.is_none() {
                        pairing_deadline = Instant::now().checked_add(self.config.pairing_timeout);
                    }
                }
                Step::Paired => pairing_deadline = None,
                Step::Stop => break,
            }
        }

        debug!(session_id = %ctx.session_id, generation = ctx.generation, "Session worker stopped");
    }

    async fn handle_event(self: &Arc<Self>, ctx: &WorkerContext, event: TransportEvent) -> Step {
        match event {
            TransportEvent::PairingCodeIssued { code } => self.pairing_code_issued(ctx, &code).await,
            TransportEvent::ConnectionOpened { identity } => {
                self.connection_opened(ctx, identity).await
            }
            TransportEvent::ConnectionClosed { reason } if reason.is_terminal() => {
                self.terminal_close(ctx, &reason).await;
                Step::Stop
            }
            TransportEvent::ConnectionClosed { reason } => {
                self.connection_lost(ctx, &reason).await;
                Step::Stop
            }
            TransportEvent::MessageReceived(raw) => {
                if let Err(e) = self
                    .pipeline
                    .process(&ctx.tenant_id, &ctx.session_id, raw, &ctx.cancel)
                    .await
                {
                    error!(
                        session_id = %ctx.session_id,
                        error = %e,
                        "Inbound message dropped, could not be persisted"
                    );
                }
                Step::Continue
            }
        }
    }

    // ── Event handlers ──────────────────────────────────────────────

    async fn pairing_code_issued(&self, ctx: &WorkerContext, code: &str) -> Step {
        let pairing = match encode_pairing_code(code) {
            Ok(pairing) => pairing,
            Err(e) => {
                let err = SessionError::PairingFailed {
                    session_id: ctx.session_id.clone(),
                    reason: e.to_string(),
                };
                self.fail(ctx, err, None).await;
                return Step::Stop;
            }
        };

        let stored = pairing.clone();
        let result = self
            .transition(ctx, SessionStatus::AwaitingPairing, move |record| {
                record.pairing_code = Some(stored);
                record.identity = None;
            })
            .await;

        match result {
            Ok(true) => {
                self.events.publish(SessionEvent::PairingCodeIssued {
                    tenant_id: ctx.tenant_id.clone(),
                    session_id: ctx.session_id.clone(),
                    pairing_code: pairing.raw,
                    qr_data_url: pairing.qr_data_url,
                });
                Step::PairingStarted
            }
            Ok(false) => Step::Continue,
            Err(e) => {
                error!(session_id = %ctx.session_id, error = %e, "Failed to store pairing code");
                Step::Continue
            }
        }
    }

    async fn connection_opened(&self, ctx: &WorkerContext, identity: Identity) -> Step {
        let stored = identity.clone();
        let result = self
            .transition(ctx, SessionStatus::Connected, move |record| {
                record.pairing_code = None;
                record.identity = Some(stored);
                record.reconnect_attempts = 0;
                record.last_connected_at = Some(Utc::now());
                record.last_error = None;
            })
            .await;

        match result {
            Ok(true) => {}
            Ok(false) => return Step::Continue,
            Err(e) => {
                error!(session_id = %ctx.session_id, error = %e, "Failed to persist connected session");
                return Step::Continue;
            }
        }

        self.events.publish(SessionEvent::Connected {
            tenant_id: ctx.tenant_id.clone(),
            session_id: ctx.session_id.clone(),
            identity,
        });
        if let Err(e) = self
            .bot_configs
            .reload(&ctx.tenant_id, &ctx.session_id)
            .await
        {
            warn!(session_id = %ctx.session_id, error = %e, "Bot config reload failed");
        }
        Step::Paired
    }

    /// Recoverable close: schedule a reconnect, or give up once the attempts
    /// are used up.
    async fn connection_lost(self: &Arc<Self>, ctx: &WorkerContext, reason: &CloseReason) {
        if let Err(e) = self.try_connection_lost(ctx, reason).await {
            error!(session_id = %ctx.session_id, error = %e, "Failed to record lost connection");
        }
    }

    async fn try_connection_lost(
        self: &Arc<Self>,
        ctx: &WorkerContext,
        reason: &CloseReason,
    ) -> Result<(), SessionError> {
        let _guard = self.registry.lock(&ctx.session_id).await;
        if !self.registry.is_current(&ctx.session_id, ctx.generation).await {
            return Ok(());
        }
        if let Some(handle) = self.registry.detach(&ctx.session_id, ctx.generation).await {
            handle.end().await;
        }

        let mut record = self.load_record(&ctx.tenant_id).await?;
        record.pairing_code = None;

        if record.reconnect_attempts < self.config.max_reconnect_attempts {
            record.reconnect_attempts += 1;
            record.status = SessionStatus::Reconnecting;
            record.last_error = Some(reason.to_string());
            self.db.upsert_session(&record).await?;
            self.registry
                .set_status(&ctx.session_id, ctx.generation, SessionStatus::Reconnecting)
                .await;

            warn!(
                session_id = %ctx.session_id,
                attempt = record.reconnect_attempts,
                max = self.config.max_reconnect_attempts,
                reason = %reason,
                "Connection lost, reconnect scheduled"
            );
            let token = CancellationToken::new();
            self.registry
                .set_reconnect(&ctx.session_id, ctx.generation, token.clone())
                .await;
            self.spawn_reconnect(ctx, token);
        } else {
            let err = SessionError::ReconnectExhausted {
                session_id: ctx.session_id.clone(),
                attempts: record.reconnect_attempts,
            };
            record.status = SessionStatus::Error;
            record.last_error = Some(err.to_string());
            self.db.upsert_session(&record).await?;
            if let Some(live) = self.registry.remove(&ctx.session_id).await {
                live.shutdown().await;
            }

            error!(session_id = %ctx.session_id, reason = %reason, "{err}");
            self.events.publish(SessionEvent::Disconnected {
                tenant_id: ctx.tenant_id.clone(),
                session_id: ctx.session_id.clone(),
                status: SessionStatus::Error,
                reason: Some(err.to_string()),
            });
        }
        Ok(())
    }

    fn spawn_reconnect(self: &Arc<Self>, ctx: &WorkerContext, token: CancellationToken) {
        let supervisor = Arc::clone(self);
        let tenant_id = ctx.tenant_id.clone();
        let session_id = ctx.session_id.clone();
        let generation = ctx.generation;
        let backoff = self.config.reconnect_backoff;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            supervisor.registry.clear_reconnect(&session_id, generation).await;

            match supervisor
                .start(&tenant_id, InitMode::Reconnect, Some(generation))
                .await
            {
                Ok(_) => debug!(session_id = %session_id, "Reconnect attempt started"),
                Err(SessionError::Superseded { .. }) => {}
                Err(e) => debug!(session_id = %session_id, error = %e, "Reconnect attempt failed"),
            }
        });
    }

    /// Logout or rejected credentials: the session is over.
    async fn terminal_close(&self, ctx: &WorkerContext, reason: &CloseReason) {
        let _guard = self.registry.lock(&ctx.session_id).await;
        if !self.registry.is_current(&ctx.session_id, ctx.generation).await {
            return;
        }
        if let Some(live) = self.registry.remove(&ctx.session_id).await {
            live.shutdown().await;
        }
        self.bot_configs.evict(&ctx.session_id).await;
        if let Err(e) = self.credentials.wipe(&ctx.session_id).await {
            warn!(session_id = %ctx.session_id, error = %e, "Failed to wipe credentials");
        }

        match self.load_record(&ctx.tenant_id).await {
            Ok(mut record) => {
                record.status = SessionStatus::Disconnected;
                record.pairing_code = None;
                record.identity = None;
                record.last_error = Some(reason.to_string());
                if let Err(e) = self.db.upsert_session(&record).await {
                    error!(session_id = %ctx.session_id, error = %e, "Could not persist terminal close");
                }
            }
            Err(e) => error!(session_id = %ctx.session_id, error = %e, "Could not load session"),
        }

        info!(session_id = %ctx.session_id, reason = %reason, "Session closed by the protocol");
        self.events.publish(SessionEvent::Disconnected {
            tenant_id: ctx.tenant_id.clone(),
            session_id: ctx.session_id.clone(),
            status: SessionStatus::Disconnected,
            reason: Some(reason.to_string()),
        });
    }

    async fn pairing_timed_out(&self, ctx: &WorkerContext) {
        let err = SessionError::PairingTimeout {
            session_id: ctx.session_id.clone(),
            timeout: self.config.pairing_timeout,
        };
        self.fail(ctx, err, Some(SessionStatus::AwaitingPairing))
            .await;
    }

    /// Move the session to `Error`, optionally only from `only_from`.
    async fn fail(&self, ctx: &WorkerContext, err: SessionError, only_from: Option<SessionStatus>) {
        let _guard = self.registry.lock(&ctx.session_id).await;
        if !self.registry.is_current(&ctx.session_id, ctx.generation).await {
            return;
        }

        let mut record = match self.load_record(&ctx.tenant_id).await {
            Ok(record) => record,
            Err(e) => {
                error!(session_id = %ctx.session_id, error = %e, "Could not load session");
                return;
            }
        };
        if only_from.is_some_and(|status| record.status != status) {
            return;
        }

        if let Some(live) = self.registry.remove(&ctx.session_id).await {
            live.shutdown().await;
        }
        record.status = SessionStatus::Error;
        record.pairing_code = None;
        record.last_error = Some(err.to_string());
        if let Err(e) = self.db.upsert_session(&record).await {
            error!(session_id = %ctx.session_id, error = %e, "Could not persist session error");
        }

        warn!(session_id = %ctx.session_id, "{err}");
        self.events.publish(SessionEvent::Disconnected {
            tenant_id: ctx.tenant_id.clone(),
            session_id: ctx.session_id.clone(),
            status: SessionStatus::Error,
            reason: Some(err.to_string()),
        });
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn load_record(&self, tenant_id: &str) -> Result<SessionRecord, DatabaseError> {
        Ok(self
            .db
            .get_session(tenant_id)
            .await?
            .unwrap_or_else(|| SessionRecord::new(tenant_id)))
    }

    /// Apply one state-machine transition for the worker's generation.
    ///
    /// Returns `false` when the generation was superseded or the move is not
    /// legal from the persisted state.
    async fn transition<F>(
        &self,
        ctx: &WorkerContext,
        target: SessionStatus,
        update: F,
    ) -> Result<bool, DatabaseError>
    where
        F: FnOnce(&mut SessionRecord) + Send,
    {
        let _guard = self.registry.lock(&ctx.session_id).await;
        if !self.registry.is_current(&ctx.session_id, ctx.generation).await {
            debug!(session_id = %ctx.session_id, "Event from a superseded connection ignored");
            return Ok(false);
        }

        let mut record = self.load_record(&ctx.tenant_id).await?;
        if !record.status.can_transition_to(target) {
            warn!(
                session_id = %ctx.session_id,
                from = %record.status,
                to = %target,
                "Ignoring invalid session transition"
            );
            return Ok(false);
        }

        let from = record.status;
        record.status = target;
        update(&mut record);
        self.db.upsert_session(&record).await?;
        self.registry
            .set_status(&ctx.session_id, ctx.generation, target)
            .await;

        info!(
            tenant_id = %ctx.tenant_id,
            session_id = %ctx.session_id,
            from = %from,
            to = %target,
            "Session status changed"
        );
        Ok(true)
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::bot::responder::BotResponder;
    use crate::events::BroadcastPublisher;
    use crate::pipeline::outbound::OutboundGateway;
    use crate::store::LibSqlBackend;
    use crate::transport::{LoopbackTransport, TransportConnection};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Loopback that takes its time to connect.
    struct SlowTransport {
        inner: LoopbackTransport,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn connect(
            &self,
            session_id: &str,
            credentials: &Path,
        ) -> Result<TransportConnection, TransportError> {
            tokio::time::sleep(self.delay).await;
            self.inner.connect(session_id, credentials).await
        }
    }

    struct Fixture {
        supervisor: Arc<ConnectionSupervisor>,
        db: Arc<dyn Database>,
        publisher: Arc<BroadcastPublisher>,
        _creds: tempfile::TempDir,
    }

    async fn fixture(transport: Arc<dyn Transport>, pairing_timeout: Duration) -> Fixture {
        let creds = tempfile::tempdir().unwrap();
        let config = ManagerConfig {
            credentials_dir: creds.path().to_path_buf(),
            reconnect_backoff: Duration::from_millis(300),
            pairing_timeout,
            ..ManagerConfig::default()
        };
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let publisher = BroadcastPublisher::new(32);
        let events: Arc<dyn EventPublisher> = publisher.clone();
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
            BotResponder::new(gateway),
        ));
        let supervisor = ConnectionSupervisor::new(
            config,
            Arc::clone(&db),
            transport,
            registry,
            events,
            bot_configs,
            pipeline,
        );
        Fixture {
            supervisor,
            db,
            publisher,
            _creds: creds,
        }
    }

    async fn wait_for(db: &dyn Database, tenant_id: &str, status: SessionStatus) -> SessionRecord {
        loop {
            if let Some(record) = db.get_session(tenant_id).await.unwrap() {
                if record.status == status {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn identity() -> Identity {
        Identity {
            number: "5511000".into(),
            display_name: None,
        }
    }

    #[tokio::test]
    async fn fresh_initialize_publishes_pairing_code() {
        let loopback = LoopbackTransport::new();
        let f = fixture(Arc::new(loopback.clone()), Duration::from_secs(30)).await;
        let mut rx = f.publisher.subscribe();

        f.supervisor.initialize("t1", InitMode::Fresh).await.unwrap();

        let event = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for pairing event")
            .unwrap();
        let (pairing_code, qr_data_url) = match event {
            SessionEvent::PairingCodeIssued {
                pairing_code,
                qr_data_url,
                ..
            } => (pairing_code, qr_data_url),
            other => panic!("expected pairing code event, got {other:?}"),
        };
        assert!(pairing_code.starts_with("2@session-t1"));
        assert!(qr_data_url.starts_with("data:image/svg+xml;base64,"));

        let record = wait_for(f.db.as_ref(), "t1", SessionStatus::AwaitingPairing).await;
        assert_eq!(record.pairing_code.unwrap().raw, pairing_code);
        assert!(f.supervisor.registry().has_handle("session-t1").await);
    }

    #[tokio::test]
    async fn disconnect_supersedes_in_flight_initialize() {
        let loopback = LoopbackTransport::new();
        let slow = SlowTransport {
            inner: loopback.clone(),
            delay: Duration::from_millis(200),
        };
        let f = fixture(Arc::new(slow), Duration::from_secs(30)).await;

        let supervisor = Arc::clone(&f.supervisor);
        let pending =
            tokio::spawn(async move { supervisor.initialize("t1", InitMode::Fresh).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = f.supervisor.disconnect("t1").await;
        assert_eq!(record.status, SessionStatus::Disconnected);

        let result = tokio::time::timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(SessionError::Superseded { .. })));

        let stored = f.db.get_session("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Disconnected);
        assert_eq!(f.supervisor.registry().live_count().await, 0);
        assert!(loopback.is_ended("session-t1").await);
    }

    #[tokio::test]
    async fn later_initialize_wins() {
        let slow = SlowTransport {
            inner: LoopbackTransport::new(),
            delay: Duration::from_millis(150),
        };
        let f = fixture(Arc::new(slow), Duration::from_secs(30)).await;

        let first = {
            let supervisor = Arc::clone(&f.supervisor);
            tokio::spawn(async move { supervisor.initialize("t1", InitMode::Fresh).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = {
            let supervisor = Arc::clone(&f.supervisor);
            tokio::spawn(async move { supervisor.initialize("t1", InitMode::Fresh).await })
        };

        let first = tokio::time::timeout(TEST_TIMEOUT, first).await.unwrap().unwrap();
        let second = tokio::time::timeout(TEST_TIMEOUT, second).await.unwrap().unwrap();
        assert!(matches!(first, Err(SessionError::Superseded { .. })));
        assert!(second.is_ok());

        wait_for(f.db.as_ref(), "t1", SessionStatus::AwaitingPairing).await;
        assert_eq!(f.supervisor.registry().live_count().await, 1);
    }

    #[tokio::test]
    async fn connect_failure_schedules_reconnect() {
        let loopback = LoopbackTransport::new();
        loopback.fail_next_connects("session-t1", 1).await;
        let f = fixture(Arc::new(loopback.clone()), Duration::from_secs(30)).await;

        let err = f.supervisor.initialize("t1", InitMode::Fresh).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));

        let record = f.db.get_session("t1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Reconnecting);
        assert_eq!(record.reconnect_attempts, 1);
        assert!(f.supervisor.registry().has_pending_reconnect("session-t1").await);

        // The retry connects and the protocol asks for pairing again.
        tokio::time::timeout(
            TEST_TIMEOUT,
            wait_for(f.db.as_ref(), "t1", SessionStatus::AwaitingPairing),
        )
        .await
        .unwrap();
        assert_eq!(loopback.connect_count("session-t1").await, 2);
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let loopback = LoopbackTransport::new();
        let f = fixture(Arc::new(loopback.clone()), Duration::from_secs(30)).await;

        f.supervisor.initialize("t1", InitMode::Fresh).await.unwrap();
        wait_for(f.db.as_ref(), "t1", SessionStatus::AwaitingPairing).await;
        assert!(loopback.complete_pairing("session-t1", identity()).await);
        wait_for(f.db.as_ref(), "t1", SessionStatus::Connected).await;

        assert!(loopback.close("session-t1", CloseReason::ConnectionLost).await);
        wait_for(f.db.as_ref(), "t1", SessionStatus::Reconnecting).await;
        assert!(f.supervisor.registry().has_pending_reconnect("session-t1").await);

        f.supervisor.disconnect("t1").await;
        assert!(!f.supervisor.registry().has_pending_reconnect("session-t1").await);

        // Past the backoff: no retry happened.
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(loopback.connect_count("session-t1").await, 1);
        let record = f.db.get_session("t1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Disconnected);
        assert!(!f.supervisor.credentials().has_credentials("session-t1").await);
    }

    #[tokio::test]
    async fn unpaired_session_times_out_into_error() {
        let f = fixture(Arc::new(LoopbackTransport::new()), Duration::from_millis(100)).await;
        let mut rx = f.publisher.subscribe();

        f.supervisor.initialize("t1", InitMode::Fresh).await.unwrap();
        let record = tokio::time::timeout(
            TEST_TIMEOUT,
            wait_for(f.db.as_ref(), "t1", SessionStatus::Error),
        )
        .await
        .unwrap();
        assert!(record.pairing_code.is_none());
        assert!(record.last_error.unwrap().contains("not paired"));
        assert_eq!(f.supervisor.registry().live_count().await, 0);

        // Pairing code first, then the timeout.
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(SessionEvent::Disconnected {
                status: SessionStatus::Error,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unbounded_pairing_timeout_still_pairs() {
        let loopback = LoopbackTransport::new();
        let f = fixture(Arc::new(loopback.clone()), Duration::from_secs(u64::MAX)).await;

        f.supervisor.initialize("t1", InitMode::Fresh).await.unwrap();
        tokio::time::timeout(
            TEST_TIMEOUT,
            wait_for(f.db.as_ref(), "t1", SessionStatus::AwaitingPairing),
        )
        .await
        .unwrap();
        assert!(loopback.complete_pairing("session-t1", identity()).await);

        let record = tokio::time::timeout(
            TEST_TIMEOUT,
            wait_for(f.db.as_ref(), "t1", SessionStatus::Connected),
        )
        .await
        .unwrap();
        assert_eq!(record.identity.unwrap().number, "5511000");
        assert!(f.supervisor.registry().connected_handle("session-t1").await.is_some());
    }

    #[tokio::test]
    async fn disconnect_drops_cached_bot_config() {
        let f = fixture(Arc::new(LoopbackTransport::new()), Duration::from_secs(30)).await;

        f.supervisor.initialize("t1", InitMode::Fresh).await.unwrap();
        wait_for(f.db.as_ref(), "t1", SessionStatus::AwaitingPairing).await;
        f.supervisor.bot_configs.get("t1", "session-t1").await.unwrap();
        assert!(f.supervisor.bot_configs.is_cached("session-t1").await);

        f.supervisor.disconnect("t1").await;
        assert!(!f.supervisor.bot_configs.is_cached("session-t1").await);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let f = fixture(Arc::new(LoopbackTransport::new()), Duration::from_secs(30)).await;
        let mut rx = f.publisher.subscribe();

        let first = f.supervisor.disconnect("t1").await;
        let second = f.supervisor.disconnect("t1").await;
        assert_eq!(first.status, SessionStatus::Disconnected);
        assert_eq!(second.status, SessionStatus::Disconnected);

        // Only the first call changed anything.
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Disconnected { .. })));
        assert!(rx.try_recv().is_err());
    }
}
