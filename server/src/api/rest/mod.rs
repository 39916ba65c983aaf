pub mod chunks;
pub mod error;
pub mod ingest;
pub mod worker;

use crate::api::AppState;
use axum::http::header;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

pub fn router(state: AppState) -> Router {
    // Request ID header name
    let x_request_id = header::HeaderName::from_static("x-request-id");

    // Tracing layer with request ID included in spans
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().include_headers(true).level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        // Controller surface.
        .route("/ingest/build-secondary-index", post(ingest::build_secondary_index))
        .route(
            "/ingest/transactions",
            post(ingest::begin_transaction).delete(ingest::abort_transaction),
        )
        // Worker administration.
        .route("/admin/chunks", get(chunks::get))
        .route("/admin/chunks/add", post(chunks::add_group))
        .route("/admin/chunks/remove", post(chunks::remove_group))
        .route("/admin/chunks/reload", post(chunks::reload))
        .route("/admin/chunks/rebuild", post(chunks::rebuild))
        .route("/admin/chunks/set", post(chunks::set))
        .route("/admin/echo", post(chunks::echo))
        // Worker data plane.
        .route("/worker/index-data", post(worker::index_data))
        .route(
            "/worker/index-requests/:request_id",
            get(worker::request_status).delete(worker::stop_request),
        )
        // Request ID: Generate UUID, set on request, propagate to response
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(trace_layer)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}
