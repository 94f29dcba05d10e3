use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::http::response::gateway_timeout;
use crate::state::AppState;

pub async fn healthz() -> impl IntoResponse {
    "ok"
}

pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query_scalar!("SELECT 1 as \"one!\"").fetch_one(&state.pool).await {
        Ok(_) => (StatusCode::OK, "ok").into_response(),
        Err(e) => gateway_timeout(format!("database not reachable: {e}")).into_response(),
    }
}
