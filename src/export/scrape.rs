//! Scrape endpoint
//!
//! Serves the exposition rendering over HTTP for pull-based collection.
//! The endpoint is read-only and shares the exporter with the rest of the
//! engine.

use crate::export::{ExportFilter, Exporter};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Content type of the exposition text format
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Build the scrape router
pub fn router(exporter: Arc<Exporter>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(exporter)
}

async fn metrics(State(exporter): State<Arc<Exporter>>) -> impl IntoResponse {
    let body = exporter.render_exposition(&ExportFilter::default());
    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body)
}

/// Serve the scrape endpoint until the shutdown signal flips
pub async fn serve(
    addr: SocketAddr,
    exporter: Arc<Exporter>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("scrape endpoint listening on {}", addr);

    let app = router(exporter);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await;

    if let Err(e) = &result {
        error!("scrape endpoint failed: {}", e);
    }
    info!("scrape endpoint stopped");
    result
}
