use std::sync::Arc;

use anyhow::Context;

use crm_messaging::SessionManager;
use crm_messaging::config::ManagerConfig;
use crm_messaging::events::BroadcastPublisher;
use crm_messaging::events::ws::event_routes;
use crm_messaging::store::LibSqlBackend;
use crm_messaging::transport::LoopbackTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ManagerConfig::from_env();

    eprintln!("CRM messaging v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Credentials: {}", config.credentials_dir.display());
    eprintln!(
        "   Events WS: ws://0.0.0.0:{}/ws/events?tenant_id=...",
        config.ws_port
    );

    let db = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let publisher = BroadcastPublisher::new(config.event_capacity);
    // Development binary: no protocol client is linked, the loopback stands in.
    let transport = Arc::new(LoopbackTransport::new());

    let manager = Arc::new(SessionManager::new(
        config.clone(),
        db,
        transport,
        publisher.clone(),
    ));

    // ── Startup recovery ────────────────────────────────────────────────
    let report = manager
        .recover_sessions()
        .await
        .context("startup recovery")?;
    tracing::info!(
        reset = report.reset.len(),
        restored = report.restored.len(),
        failed = report.failed.len(),
        "Sessions recovered"
    );

    // ── Event WebSocket ─────────────────────────────────────────────────
    let app = event_routes(Arc::clone(&manager), publisher);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.ws_port))
        .await
        .with_context(|| format!("binding port {}", config.ws_port))?;
    tracing::info!(port = config.ws_port, "Event WebSocket server started");

    // Sessions stay persisted as connected and are restored on next start.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
