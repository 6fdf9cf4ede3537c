use axum::{
    extract::{DefaultBodyLimit, Request},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use crate::api::generate;
use crate::api::request_context::{attach_request_context, REQUEST_ID_HEADER};
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            correlation_id = %request_id
        )
    });

    let v1_routes = Router::new()
        .route("/respond", post(generate::respond))
        .route("/transcribe", post(generate::transcribe))
        .layer(DefaultBodyLimit::max(state.max_upload_bytes));

    let router = Router::new()
        .route("/health", get(health))
        .nest("/v1", v1_routes)
        .layer(trace_layer)
        .layer(middleware::from_fn(attach_request_context));

    let router = if state.cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
