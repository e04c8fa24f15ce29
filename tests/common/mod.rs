//! Shared harness for the integration tests: an in-memory store, the
//! loopback transport and a `SessionManager` with fast timers.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crm_messaging::SessionManager;
use crm_messaging::config::ManagerConfig;
use crm_messaging::events::BroadcastPublisher;
use crm_messaging::manager::SessionStatusView;
use crm_messaging::session::SessionStatus;
use crm_messaging::store::{Database, Identity, LibSqlBackend, session_id_for};
use crm_messaging::transport::{LoopbackTransport, Transport};

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub db: Arc<dyn Database>,
    pub transport: LoopbackTransport,
    pub publisher: Arc<BroadcastPublisher>,
    pub creds: tempfile::TempDir,
}

pub fn test_config(credentials_dir: &Path) -> ManagerConfig {
    ManagerConfig {
        credentials_dir: credentials_dir.to_path_buf(),
        reconnect_backoff: Duration::from_millis(20),
        pairing_timeout: Duration::from_secs(5),
        ..ManagerConfig::default()
    }
}

pub async fn memory_db() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

pub async fn harness() -> Harness {
    harness_with(memory_db().await, |_| {}).await
}

/// Harness over `db`, with `tweak` applied to the fast test config.
pub async fn harness_with(db: Arc<dyn Database>, tweak: impl FnOnce(&mut ManagerConfig)) -> Harness {
    let transport = LoopbackTransport::new();
    harness_with_transport(db, Arc::new(transport.clone()), transport, tweak).await
}

/// Harness whose manager talks to `transport`; `loopback` is the remote side.
pub async fn harness_with_transport(
    db: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    loopback: LoopbackTransport,
    tweak: impl FnOnce(&mut ManagerConfig),
) -> Harness {
    let creds = tempfile::tempdir().unwrap();
    let mut config = test_config(creds.path());
    tweak(&mut config);

    let publisher = BroadcastPublisher::new(64);
    let manager = Arc::new(SessionManager::new(
        config,
        Arc::clone(&db),
        transport,
        publisher.clone(),
    ));
    Harness {
        manager,
        db,
        transport: loopback,
        publisher,
        creds,
    }
}

pub fn identity(number: &str) -> Identity {
    Identity {
        number: number.to_string(),
        display_name: Some(format!("Shop {number}")),
    }
}

/// Poll until the tenant's session reaches `status`.
pub async fn wait_for_status(
    manager: &SessionManager,
    tenant_id: &str,
    status: SessionStatus,
) -> SessionStatusView {
    loop {
        let view = manager.get_session_status(tenant_id).await.unwrap();
        if view.status == status {
            return view;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll until `check` holds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    while !check().await {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Initialize, pair and wait until the tenant is connected.
pub async fn connect_tenant(h: &Harness, tenant_id: &str) -> SessionStatusView {
    h.manager.initialize_session(tenant_id).await.unwrap();
    wait_for_status(&h.manager, tenant_id, SessionStatus::AwaitingPairing).await;
    assert!(
        h.transport
            .complete_pairing(&session_id_for(tenant_id), identity("5511000"))
            .await
    );
    wait_for_status(&h.manager, tenant_id, SessionStatus::Connected).await
}
