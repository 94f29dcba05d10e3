use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::state::AppState;

/// `GET /security/status`: current violation scores and ban count.
pub async fn security_status(State(state): State<AppState>) -> impl IntoResponse {
    let scores = state.security.all_scores().await;
    let banned = scores.iter().filter(|(_, _, banned)| *banned).count();
    let connections: Vec<serde_json::Value> = scores
        .into_iter()
        .map(|(conn_id, score, banned)| {
            serde_json::json!({ "connection_id": conn_id, "score": score, "banned": banned })
        })
        .collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "banned_count": banned,
            "connections": connections,
        })),
    )
}

/// `GET /security/audit`: recent violation history, newest last.
pub async fn security_audit(State(state): State<AppState>) -> impl IntoResponse {
    let entries: Vec<serde_json::Value> = state
        .security
        .recent_violations()
        .await
        .into_iter()
        .map(|entry| {
            serde_json::json!({
                "connection_id": entry.conn_id,
                "kind": entry.kind.to_string(),
                "action": entry.action.to_string(),
                "at": entry.at_unix,
            })
        })
        .collect();

    (StatusCode::OK, Json(serde_json::json!({ "violations": entries })))
}
