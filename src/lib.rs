pub mod auth;
pub mod config;
pub mod db;
pub mod http;
pub mod matcher;
pub mod metrics;
pub mod pow;
pub mod rate_limit;
pub mod repo;
pub mod security;
pub mod session;
pub mod spam;
pub mod state;
pub mod validator;
pub mod ws;

pub use state::AppState;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Assemble the full router: the relay protocol endpoint at `/` (content
/// negotiated between the NIP-11 information document and a WebSocket
/// upgrade) plus the ambient health, metrics, and administrative side
/// channels.
pub fn build_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .route("/", get(ws::root))
        .route("/healthz", get(http::health::healthz))
        .route("/readyz", get(http::health::readyz))
        .route("/metrics", get(http::metrics::get_metrics))
        .route("/security/status", get(http::admin::security_status))
        .route("/security/audit", get(http::admin::security_audit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::new();
    }
    if allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(AllowOrigin::any());
    }
    let origins: Vec<_> = allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new().allow_origin(origins)
}

