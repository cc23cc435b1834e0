use anyhow::Result;
use deskcast_server::{create_app, shutdown_signal, state};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for viewers to tear down (and reap their encoders) on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "deskcast_server=debug,deskcast_media=info,encoder=info,tower_http=debug".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting Deskcast server...");

    // Load configuration
    let config = state::Config::load()?;

    let (app, state) = create_app(config.clone())?;

    // Start the server
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.connections.clone()))
        .await?;

    if !state.connections.wait_idle(DRAIN_TIMEOUT).await {
        tracing::warn!(
            "{} viewer connections still open after {:?}",
            state.connections.active_count().await,
            DRAIN_TIMEOUT
        );
    }

    tracing::info!("Server stopped");
    Ok(())
}
