//! Auth Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads OIDC and session configuration
//! 2. Restores the operator session from the token store
//! 3. Serves login, callback, logout, session and token endpoints
//! 4. Disposes the session on SIGTERM/SIGINT

mod config;
mod error;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use auth_session::{AuthSessionManager, Error as SessionError, FileTokenStore};
use oidc_auth::OidcProvider;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::routes::{AppState, build_router};

/// Time allowed for in-flight requests after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for every identity provider request.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting auth-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
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
        listen_addr = %config.gateway.listen_addr,
        token_store = %config.gateway.token_store.display(),
        client_id = %config.oidc.client_id,
        auto_refresh = config.session.auto_refresh,
        "configuration loaded"
    );

    let store = FileTokenStore::load(config.gateway.token_store.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open token store {}",
                config.gateway.token_store.display()
            )
        })?;

    let http_client = reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let adapter = Arc::new(OidcProvider::new(config.oidc.clone(), http_client));

    let manager = Arc::new(
        AuthSessionManager::builder(adapter)
            .session_id(config.gateway.session_id.clone())
            .token_store(Arc::new(store))
            .config(config.session.clone())
            .build(),
    );

    // Pick up tokens persisted by a previous run
    match manager.restore().await {
        Ok(session) => info!(state = %session.state, "session restored"),
        Err(SessionError::NotAuthenticated) => info!("no persisted session, login required"),
        Err(e) => warn!(error = %e, "session restore failed, login required"),
    }

    let state = AppState {
        manager: manager.clone(),
        post_login_path: config.gateway.post_login_path.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(state, config.gateway.max_connections);

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Cancel in-flight session operations so callers waiting on the
    // provider return promptly, then drain
    manager.dispose();
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
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
