pub mod error;
pub mod middleware;
pub mod routes;

use std::{sync::Arc, time::Instant};

use axum::{
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use quorum_core::{db::Db, orchestrator::Orchestrator, ratelimit::RateLimiter};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub orchestrator: Arc<Orchestrator>,
    pub limiter: Arc<RateLimiter>,
    pub max_body_bytes: usize,
    /// SHA-256 of the operator token; `None` disables bypass.
    pub operator_token_hash: Option<String>,
    pub start_time: Instant,
}

// ── Router ────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/v1/health", get(routes::health))
        .route(
            "/v1/projects/",
            post(routes::create_project).get(routes::list_projects),
        )
        .fallback(routes::not_found)
        .layer(from_fn_with_state(Arc::clone(&state), middleware::public_limit));

    let protected = Router::new()
        .route("/v1/reviews/", post(routes::submit_review))
        .route("/v1/reviews/:id", get(routes::get_review))
        .route("/v1/reviews/:id/bypass", post(routes::bypass_review))
        .route("/v1/reviews/:id/audit", get(routes::review_audit))
        .route("/v1/reviews/:id/merge", get(routes::review_merge))
        .route("/v1/resources/pool", get(routes::pool_status))
        .route("/v1/resources/rate-limit", get(routes::rate_limit_status))
        .route_layer(from_fn_with_state(Arc::clone(&state), middleware::guard));

    let body_limit = state.max_body_bytes;
    public
        .merge(protected)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn(middleware::request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
