// src/api/mod.rs
//
// =============================================================================
// CONDUCTOR: API FRONT-END (v 0.1)
// =============================================================================
//
// Receives submit/query/cancel requests, writes Job rows, and returns. The
// scheduler's own tick is what notices new PENDING rows — the API never
// enqueues a dispatch token itself. Request-id middleware and tracing give
// every request a correlation id carried through the structured logs.

pub mod handlers;
pub mod log_reader;
pub mod schemas;

use crate::config::Config;
use crate::db::DbPool;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub db: DbPool,
    pub config: Config,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/jobs/submit", post(handlers::submit))
        .route("/jobs/query/{id}", get(handlers::query))
        .route("/jobs/cancel/{id}", post(handlers::cancel))
        .with_state(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub async fn run(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<()> {
    let router = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("api front-end listening on {addr}");
    axum::serve(listener, router).await?;
    Ok(())
}
