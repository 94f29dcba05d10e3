use axum::{http::StatusCode, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (StatusCode::OK, [("content-type", encoder.format_type())], buffer).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
