use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fiscal_audit::api::{self, AppState};
use fiscal_audit::audit::{AlertDispatcher, AuditTrail, FallbackRecorder};
use fiscal_audit::config::AppConfig;
use fiscal_audit::database::SqliteAuditStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fiscal_audit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting fiscal audit trail service");

    let config = AppConfig::load().context("failed to load configuration")?;
    info!("Configuration loaded");

    let store = SqliteAuditStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("failed to connect to audit store")?;
    store
        .run_migrations()
        .await
        .context("failed to run audit store migrations")?;
    info!("Audit store ready");

    let fallback = Arc::new(
        FallbackRecorder::open(&config.fallback.buffer_path)
            .context("failed to open fallback buffer")?,
    );
    let alerts = AlertDispatcher::from_config(&config.alerts)
        .context("failed to configure alert sinks")?;
    let trail = Arc::new(AuditTrail::new(
        Arc::new(store),
        fallback,
        alerts,
        &config.audit,
    ));

    // Fallback reconciliation task
    let reconcile_trail = trail.clone();
    let reconcile_interval = Duration::from_secs(config.fallback.reconcile_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reconcile_interval);
        loop {
            interval.tick().await;
            match reconcile_trail.reconcile_fallback().await {
                Ok(report) if report.error.is_some() => {
                    warn!("Reconciliation incomplete, {} entries still buffered", report.remaining)
                }
                Ok(_) => {}
                Err(e) if e.is_unavailable() => {
                    warn!("Audit store still unavailable, reconciliation deferred")
                }
                Err(e) => error!("Fallback reconciliation failed: {}", e),
            }
        }
    });
    info!("Fallback reconciliation started");

    let app = api::router(AppState::new(trail));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
