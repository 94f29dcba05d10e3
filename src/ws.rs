//! `GET /` content negotiation: a plain request gets the relay information
//! document, a WebSocket upgrade request gets wired to the per-connection
//! session loop.

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::UPGRADE;
use axum::response::{IntoResponse, Response};

use crate::http::info::relay_info;
use crate::session;
use crate::state::AppState;

pub async fn root(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let wants_upgrade = request
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    if !wants_upgrade {
        return relay_info(State(state)).await.into_response();
    }

    let (mut parts, _body) = request.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws
            .on_upgrade(move |socket| session::run_connection(socket, addr.ip().to_string(), state))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}
