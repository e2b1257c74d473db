//! Control plane HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::api::{create_router, AppState};
use crate::release::Dispatcher;

/// Server configuration.
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub state: AppState,
    pub dispatcher: Arc<Dispatcher>,
}

/// Run the API and the release dispatcher until ctrl-c.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let pending = config.state.store.pending_jobs().await?;
    if pending > 0 {
        tracing::info!(count = pending, "Resuming pending release jobs");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = tokio::spawn(Arc::clone(&config.dispatcher).run(shutdown_rx));

    let app = create_router(config.state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    rampart_telemetry::log_listening!(addr = %config.listen_addr, "Control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight rollouts keep their lease; another instance picks them up after expiry.
    let _ = shutdown_tx.send(true);
    dispatcher.await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
