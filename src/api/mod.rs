//! HTTP + SSE surface over the scheduler core.
//!
//! Runs as a plain axum service (no auth layer — the daemon is meant to sit
//! behind a reverse proxy or bind to loopback only, per the host/port config).

pub mod handlers;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::App;

pub async fn serve(app: Arc<App>, host: &str, port: u16) -> std::io::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = routes::create_router(app)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .expect("invalid AGENTSCHED_HTTP_HOST/AGENTSCHED_HTTP_PORT");

    tracing::info!(%addr, "http api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining http server");
}
