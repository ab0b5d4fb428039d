//! Reverse proxy for ML inference servers.
//!
//! Accepts multipart `/predict` requests, splits the entries by type,
//! forwards each type group to its configured backend concurrently, and
//! merges the results back in the caller's order.

mod debug;
mod error;
mod proxy;
mod server;
mod store;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path =
        std::env::var("MLPROXY_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let listen = std::env::var("MLPROXY_LISTEN").unwrap_or_else(|_| "0.0.0.0:3004".to_string());

    let registry = Arc::new(store::Registry::load(&config_path));
    tracing::info!(
        config = %config_path,
        backends = registry.backends().len(),
        "mlproxy starting"
    );

    let app = server::create_router(server::AppState::new(registry));
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
