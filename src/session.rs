//! Per-connection message loop translating wire frames to core calls and
//! core results back to wire frames.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{kind_category, parse_client_frame, ClientMessage, FrameError, KindCategory, RelayMessage};
use tokio::sync::mpsc;

use crate::metrics;
use crate::pow::{self, PowResult};
use crate::rate_limit::RateLimitResult;
use crate::repo::events as repo_events;
use crate::security::{PolicyAction, ViolationKind};
use crate::spam::SpamResult;
use crate::state::AppState;
use crate::validator::{self, ValidationResult};

/// Drive one upgraded WebSocket connection to completion.
pub async fn run_connection(socket: WebSocket, source: String, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RelayMessage>();

    match state.rate_limiter.register_connection(&source).await {
        RateLimitResult::Allowed => {}
        _ => {
            let _ = ws_tx
                .send(Message::Text(
                    RelayMessage::Notice {
                        message: "blocked: too many connections from this source".to_owned(),
                    }
                    .to_frame_text(),
                ))
                .await;
            return;
        }
    }

    state.matcher.register_connection(&conn_id, &source, out_tx.clone()).await;
    metrics::ACTIVE_CONNECTIONS.inc();

    if state.config.auth_required {
        let challenge = state.auth.issue_challenge(&conn_id).await;
        let _ = out_tx.send(RelayMessage::AuthChallenge { challenge });
    }

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(Message::Text(msg.to_frame_text())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => {
                if state.security.is_banned(&conn_id).await {
                    break;
                }
                if !handle_frame(&state, &conn_id, &source, &text, &out_tx).await {
                    break;
                }
            }
            Message::Binary(_) => {
                let _ = out_tx.send(RelayMessage::Notice {
                    message: "binary frames are not supported".to_owned(),
                });
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    drop(out_tx);
    forward_task.abort();
    state.matcher.unregister_connection(&conn_id).await;
    state.rate_limiter.unregister_connection(&source).await;
    state.auth.revoke(&conn_id).await;
    state.security.release(&conn_id).await;
    metrics::ACTIVE_CONNECTIONS.dec();
}

/// Process one inbound text frame. Returns `false` if the connection should
/// be torn down (escalated security response).
async fn handle_frame(
    state: &AppState,
    conn_id: &str,
    source: &str,
    text: &str,
    out_tx: &mpsc::UnboundedSender<RelayMessage>,
) -> bool {
    let frame = match parse_client_frame(text) {
        Ok(f) => f,
        Err(e) => {
            let _ = out_tx.send(RelayMessage::Notice {
                message: notice_for_frame_error(&e),
            });
            return true;
        }
    };

    match frame {
        ClientMessage::Event(raw) => handle_event(state, conn_id, source, raw, out_tx).await,
        ClientMessage::Req { sub_id, filters } => {
            handle_req(state, conn_id, source, sub_id, filters, out_tx).await;
            true
        }
        ClientMessage::Close { sub_id } => {
            state.matcher.remove_subscription(&sub_id).await;
            true
        }
        ClientMessage::Auth(raw) => {
            handle_auth(state, conn_id, raw, out_tx).await;
            true
        }
    }
}

/// Report a violation and apply its graduated response. Returns `false` if
/// the connection must be torn down.
async fn report_violation(state: &AppState, conn_id: &str, kind: ViolationKind) -> bool {
    match state.security.report(conn_id, kind).await {
        PolicyAction::Ban => {
            metrics::SECURITY_BANS_TOTAL.inc();
            false
        }
        PolicyAction::Disconnect => false,
        PolicyAction::Allow | PolicyAction::Warn | PolicyAction::Throttle(_) => true,
    }
}

fn notice_for_frame_error(e: &FrameError) -> String {
    match e {
        FrameError::NotAnArray => "malformed: frame must be a JSON array".to_owned(),
        FrameError::UnknownCommand(c) => format!("malformed: unknown command {c}"),
        FrameError::Malformed(m) => format!("malformed: {m}"),
    }
}

async fn handle_event(
    state: &AppState,
    conn_id: &str,
    source: &str,
    raw: serde_json::Value,
    out_tx: &mpsc::UnboundedSender<RelayMessage>,
) -> bool {
    let event_id = raw.get("id").and_then(|v| v.as_str()).unwrap_or("").to_owned();
    let now = chrono::Utc::now().timestamp();

    let event = match validator::validate(&raw, &state.config, now) {
        ValidationResult::Valid(event) => event,
        ValidationResult::Invalid(reason) => {
            metrics::EVENTS_ADMITTED_TOTAL.with_label_values(&["invalid"]).inc();
            let keep_going = report_violation(state, conn_id, ViolationKind::Minor).await;
            let _ = out_tx.send(ok(event_id, false, format!("invalid: {reason}")));
            return keep_going;
        }
    };

    if state.config.auth_required
        && !state.config.auth_pubkey_allowlist.contains(&event.pubkey)
        && !state
            .auth
            .has_permission(conn_id, crate::auth::Permission::Write)
            .await
    {
        let _ = out_tx.send(ok(event.id.clone(), false, "blocked: authentication required".to_owned()));
        return true;
    }

    let event_bytes = serde_json::to_vec(&raw).map(|b| b.len()).unwrap_or(0);
    match state
        .rate_limiter
        .admit_event(source, &event.pubkey, event_bytes, state.config.max_event_bytes)
        .await
    {
        RateLimitResult::Allowed => {}
        RateLimitResult::Limited(reason) => {
            metrics::RATE_LIMIT_REJECTIONS_TOTAL.with_label_values(&["event"]).inc();
            let _ = out_tx.send(RelayMessage::Notice {
                message: format!("rate-limited: {reason}"),
            });
            return true;
        }
        RateLimitResult::Blocked(reason) => {
            metrics::RATE_LIMIT_REJECTIONS_TOTAL.with_label_values(&["blocked"]).inc();
            let _ = out_tx.send(ok(event.id.clone(), false, format!("blocked: {reason}")));
            return true;
        }
    }

    if let PowResult::Rejected(reason) = pow::verify(&event, state.config.min_pow_difficulty) {
        metrics::EVENTS_ADMITTED_TOTAL.with_label_values(&["pow"]).inc();
        let _ = out_tx.send(ok(event.id.clone(), false, format!("pow: {reason}")));
        return true;
    }

    match state.spam_filter.check(&event, &state.config).await {
        SpamResult::Reject(reason) => {
            metrics::SPAM_REJECTIONS_TOTAL.with_label_values(&["reject"]).inc();
            let keep_going = report_violation(state, conn_id, ViolationKind::Moderate).await;
            let _ = out_tx.send(ok(event.id.clone(), false, format!("spam: {reason}")));
            return keep_going;
        }
        SpamResult::Suspicious(reason) => {
            metrics::SPAM_REJECTIONS_TOTAL.with_label_values(&["suspicious"]).inc();
            tracing::debug!(connection = conn_id, reason, "suspicious event admitted");
        }
        SpamResult::Pass => {}
    }

    if kind_category(event.kind) != KindCategory::Ephemeral {
        match repo_events::store(&state.pool, &event).await {
            Ok(repo_events::StoreOutcome::Duplicate) => {
                metrics::EVENTS_ADMITTED_TOTAL.with_label_values(&["duplicate"]).inc();
                let _ = out_tx.send(ok(event.id.clone(), false, "duplicate: event already stored".to_owned()));
                return true;
            }
            Ok(repo_events::StoreOutcome::Superseded) => {
                metrics::EVENTS_ADMITTED_TOTAL.with_label_values(&["duplicate"]).inc();
                let _ = out_tx.send(ok(
                    event.id.clone(),
                    false,
                    "duplicate: a newer replacement already exists".to_owned(),
                ));
                return true;
            }
            Ok(repo_events::StoreOutcome::Stored) => {}
            Err(e) => {
                tracing::error!(error = %e, "failed to store event");
                metrics::EVENTS_ADMITTED_TOTAL.with_label_values(&["error"]).inc();
                let _ = out_tx.send(ok(event.id.clone(), false, "error: failed to store event".to_owned()));
                return true;
            }
        }
    }

    state.matcher.broadcast_event(&event).await;
    metrics::EVENTS_ADMITTED_TOTAL.with_label_values(&["accepted"]).inc();
    let _ = out_tx.send(ok(event.id.clone(), true, String::new()));
    true
}

fn ok(event_id: String, accepted: bool, message: String) -> RelayMessage {
    RelayMessage::Ok {
        event_id,
        accepted,
        message,
    }
}

async fn handle_req(
    state: &AppState,
    conn_id: &str,
    source: &str,
    sub_id: String,
    filters: Vec<relay_protocol::Filter>,
    out_tx: &mpsc::UnboundedSender<RelayMessage>,
) {
    match state.rate_limiter.admit_subscription(source).await {
        RateLimitResult::Allowed => {}
        other => {
            let reason = match other {
                RateLimitResult::Limited(r) => format!("rate-limited: {r}"),
                RateLimitResult::Blocked(r) => format!("blocked: {r}"),
                RateLimitResult::Allowed => unreachable!(),
            };
            let _ = out_tx.send(RelayMessage::Notice { message: reason });
            return;
        }
    }

    if sub_id.len() > state.config.max_subid_length {
        let _ = out_tx.send(RelayMessage::Notice {
            message: format!("invalid: subscription id exceeds {} characters", state.config.max_subid_length),
        });
        return;
    }
    if filters.len() > state.config.max_filters {
        let _ = out_tx.send(RelayMessage::Notice {
            message: format!("invalid: too many filters, maximum is {}", state.config.max_filters),
        });
        return;
    }
    if filters.iter().any(|f| f.limit.is_some_and(|l| l > state.config.max_limit)) {
        let _ = out_tx.send(RelayMessage::Notice {
            message: format!("invalid: filter limit exceeds {}", state.config.max_limit),
        });
        return;
    }
    let existing_count = state.matcher.subscription_count(conn_id).await;
    if existing_count >= state.config.max_subscriptions {
        let _ = out_tx.send(RelayMessage::Notice {
            message: format!("invalid: too many subscriptions, maximum is {}", state.config.max_subscriptions),
        });
        return;
    }

    state.matcher.add_subscription(conn_id, &sub_id, filters.clone()).await;
    metrics::ACTIVE_SUBSCRIPTIONS.inc();

    for filter in &filters {
        match repo_events::query(&state.pool, filter, state.config.max_limit).await {
            Ok(mut events) => {
                events.reverse();
                for event in events {
                    let _ = out_tx.send(RelayMessage::Event {
                        sub_id: sub_id.clone(),
                        event,
                    });
                }
            }
            Err(e) => tracing::error!(error = %e, "historical query failed"),
        }
    }

    let _ = out_tx.send(RelayMessage::Eose { sub_id });
}

async fn handle_auth(
    state: &AppState,
    conn_id: &str,
    raw: serde_json::Value,
    out_tx: &mpsc::UnboundedSender<RelayMessage>,
) {
    let event_id = raw.get("id").and_then(|v| v.as_str()).unwrap_or("").to_owned();
    let now = chrono::Utc::now().timestamp();
    match state.auth.verify(conn_id, &raw, &state.config, now).await {
        crate::auth::AuthResult::Accepted => {
            let _ = out_tx.send(ok(event_id, true, "authenticated".to_owned()));
        }
        crate::auth::AuthResult::Rejected(reason) => {
            let _ = out_tx.send(ok(event_id, false, format!("invalid: {reason}")));
        }
    }
}
