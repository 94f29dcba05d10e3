use axum::{extract::State, http::HeaderValue, response::IntoResponse, Json};

use crate::state::AppState;

const SUPPORTED_NIPS: &[u32] = &[1, 2, 9, 11, 12, 15, 16, 20, 22, 33, 40, 42];

/// `GET /`: the relay information document (NIP-11 shaped).
pub async fn relay_info(State(state): State<AppState>) -> impl IntoResponse {
    let cfg = &state.config;
    let body = serde_json::json!({
        "name": cfg.relay_name,
        "description": cfg.relay_description,
        "pubkey": cfg.relay_pubkey,
        "contact": cfg.relay_contact,
        "supported_nips": SUPPORTED_NIPS,
        "software": "https://github.com/relayd/relayd",
        "version": env!("CARGO_PKG_VERSION"),
        "limitation": {
            "max_message_length": cfg.max_event_bytes,
            "max_subscriptions": cfg.max_subscriptions,
            "max_filters": cfg.max_filters,
            "max_limit": cfg.max_limit,
            "max_subid_length": cfg.max_subid_length,
            "max_event_tags": cfg.max_event_tags,
            "max_content_length": cfg.max_content_length,
            "created_at_lower_limit": 2 * 365 * 24 * 3600,
            "created_at_upper_limit": 900,
            "min_pow_difficulty": cfg.min_pow_difficulty,
            "auth_required": cfg.auth_required,
            "payment_required": false,
        },
    });

    let mut response = Json(body).into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/nostr+json"),
    );
    response
}
