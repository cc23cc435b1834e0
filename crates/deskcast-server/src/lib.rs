//! Deskcast Server Library
//!
//! Streams the host desktop to a browser over WebRTC. Each viewer connects to
//! `/ws`, asks for an offer, and receives VP8 video encoded by an external
//! ffmpeg process. This module exposes the server components for testing and
//! embedding.

pub mod api;
pub mod bridge;
pub mod error;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod state;
pub mod ws;

use anyhow::Result;
use std::sync::Arc;
use ws::connections::ConnectionManager;

/// Create and configure the server application
pub fn create_app(config: state::Config) -> Result<(axum::Router, state::AppState)> {
    let app_state = state::AppState::new(config)?;
    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}

/// Resolves on Ctrl-C (or SIGTERM on unix), after cancelling every connection
pub async fn shutdown_signal(connections: Arc<ConnectionManager>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown requested, closing viewer connections");
    connections.shutdown();
}
