//! Session Agent
//!
//! Single-binary host for a `SessionManager`:
//! 1. Loads the agent and session configuration
//! 2. Initializes the OAuth provider and session (restoring any persisted token)
//! 3. Serves bearer tokens and login/logout controls over HTTP
//! 4. Receives the authority's redirect on `/callback`

mod config;
mod error;
mod metrics;
mod routes;
mod user_agent;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use identity::{FileStore, KeyValueStore, MemoryStore, OAuthProvider, StorageTiers};
use session::SessionManager;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::routes::{AppState, build_router};
use crate::user_agent::CallbackBroker;

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting session-agent");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.agent.listen_addr,
        client_id = %config.session.client_id,
        tenant_id = %config.session.tenant_id,
        flow = ?config.session.flow,
        "configuration loaded"
    );

    let durable: Arc<dyn KeyValueStore> = match config.agent.store_path() {
        Some(path) => {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            let store = FileStore::load(path.clone())
                .await
                .with_context(|| format!("failed to open store {}", path.display()))?;
            Arc::new(store)
        }
        None => {
            warn!("no state_dir configured, durable storage will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    let storage = StorageTiers::new(Arc::new(MemoryStore::new()), durable);

    let broker = Arc::new(CallbackBroker::new(
        Duration::from_secs(config.agent.popup_timeout_secs),
        config.agent.embedded,
    ));
    let provider = Arc::new(OAuthProvider::new(
        reqwest::Client::new(),
        storage.clone(),
        broker.clone(),
    ));
    let manager = SessionManager::new(provider.clone(), storage);

    // A failed initialization is visible on /health; keep serving so the
    // operator can inspect it.
    if let Err(e) = manager.initialize(config.session.clone()).await {
        error!(error = %e, "session initialization failed");
    }

    let app_state = AppState::new(manager.clone(), provider, broker, prometheus_handle);
    let app = build_router(app_state, config.agent.max_connections);

    let listen_addr = config.agent.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, phase = manager.phase().label(), "accepting requests");

    // The drain timer starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
