//! Gantry Server - OpenAI-compatible HTTP surface for the gateway core.

pub mod api;
pub mod auth;
pub mod error;
pub mod state;

use std::sync::Arc;

use gantry_core::{Application, Result};
use tokio::signal;
use tracing::info;

use state::AppState;

/// Bind the configured address and serve until a shutdown signal arrives.
pub async fn serve(app: Arc<Application>) -> Result<()> {
    let state = AppState::new(Arc::clone(&app));
    let router = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&app.opts.address).await?;
    info!("server listening on http://{}", app.opts.address);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&app)))
        .await?;

    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal(app: Arc<Application>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
    app.shutdown_token().cancel();
}
