//! HTTP/WS route wiring: cookie-bound session resolution on connect, a JSON
//! message dispatch loop per socket, and the aggregate `/health` + `/ws/...`
//! endpoints.
//!
//! Grounded in `main.py`: non-upgrade `GET` on a WS path returns 426 (ported
//! here as a `route_layer` rather than the framework's default 400, since
//! axum's `WebSocketUpgrade` extractor doesn't have a "reject the HTTP
//! request before upgrading" knob of its own — the pattern is borrowed from
//! `calimero-network-core`'s auth service, which guards its own upgrade
//! routes the same way), the `EVENT_HANDLERS` dispatch table (only
//! `auth.session.get`/`on.connect` are recognized; anything else echoes back
//! as `unknown`), and the support/health WS client-message handling
//! (`refresh`, `support.ping`, `support.subscribe`, ...).

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{Router, extract::Request};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use gateway_protocol::{SupportEvent, SupportFilters};
use serde_json::Value;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info};

use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = build_cors(&state.config.allowed_origins);

    let ws_routes = Router::new()
        .route("/ws", get(main_ws_handler))
        .route("/ws/status", get(main_ws_handler))
        .route("/ws/health", get(health_ws_handler))
        .route("/ws/support", get(support_ws_handler))
        .route_layer(from_fn(require_upgrade));

    Router::new()
        .merge(ws_routes)
        .route("/health", get(health_http_handler))
        .layer(cors)
        .with_state(state)
}

fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<_> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([axum::http::Method::GET])
}

/// A plain `GET` on a WS path (no `Upgrade: websocket` header) returns 426
/// instead of letting `WebSocketUpgrade` reject it with its own 400.
async fn require_upgrade(req: Request, next: Next) -> Response {
    let is_upgrade = req
        .headers()
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_upgrade {
        return (
            StatusCode::UPGRADE_REQUIRED,
            [(axum::http::header::UPGRADE, "websocket")],
            Json(serde_json::json!({"code": "upgrade_required", "message": "this endpoint only accepts a websocket upgrade"})),
        )
            .into_response();
    }
    next.run(req).await
}

async fn health_http_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.snapshot().await)
}

// ---------------------------------------------------------------------------
// Main auth-bound socket (/ws, /ws/status)
// ---------------------------------------------------------------------------

async fn main_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let session_id = extract_cookie(&headers, &state.config.session_cookie_name)
        .unwrap_or_else(|| format!("anon_{}", uuid::Uuid::new_v4()));
    ws.on_upgrade(move |socket| handle_main_socket(socket, state, session_id))
}

async fn handle_main_socket(socket: WebSocket, state: AppState, session_id: String) {
    let (sink, mut stream) = socket.split();
    state.connections.connect(&session_id, sink).await;

    if !state.connect_flow.replay_session(&session_id).await {
        state.connect_flow.handle_on_connect(&session_id, None).await;
    }

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
        let event = value.get("event").and_then(Value::as_str).unwrap_or("");
        match event {
            "auth.session.get" | "on.connect" => {
                let user_id = value.get("data").and_then(|d| d.get("user_id")).and_then(Value::as_i64);
                state.connect_flow.handle_on_connect(&session_id, user_id).await;
            }
            _ => {
                let echo = serde_json::json!({"event": "unknown", "data": value});
                state
                    .connections
                    .safe_send(&session_id, Message::Text(echo.to_string().into()))
                    .await;
            }
        }
    }

    state.connections.disconnect(&session_id).await;
    info!(session_id, "main socket closed");
}

// ---------------------------------------------------------------------------
// Health socket (/ws/health)
// ---------------------------------------------------------------------------

async fn health_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_health_socket(socket, state))
}

async fn handle_health_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = state.health.subscribe();

    let initial = state.health.snapshot().await;
    if sink.send(health_frame(&initial)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            snapshot = rx.recv() => {
                let Ok(snapshot) = snapshot else { return };
                if sink.send(health_frame(&snapshot)).await.is_err() {
                    return;
                }
            }
            msg = stream.next() => {
                let Some(Ok(Message::Text(text))) = msg else { return };
                if matches!(text.as_str(), "refresh" | "health.get") {
                    let snapshot = state.health.snapshot().await;
                    if sink.send(health_frame(&snapshot)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn health_frame(snapshot: &gateway_protocol::HealthSnapshot) -> Message {
    Message::Text(
        serde_json::json!({"event": "services.health", "data": snapshot})
            .to_string()
            .into(),
    )
}

// ---------------------------------------------------------------------------
// Support socket (/ws/support)
// ---------------------------------------------------------------------------

async fn support_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let filters = SupportFilters {
        project_id: params.get("project_id").cloned().unwrap_or_default(),
        user_id: params.get("user_id").cloned().unwrap_or_default(),
        ticket_id: params.get("ticket_id").cloned().unwrap_or_default(),
    };
    ws.on_upgrade(move |socket| handle_support_socket(socket, state, filters))
}

async fn handle_support_socket(socket: WebSocket, state: AppState, mut filters: SupportFilters) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = state.support.subscribe();

    if send_support_snapshot(&mut sink, &state, &filters).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Ok(event) = event else { return };
                if crate::support_relay::matches_filters(&event, &filters)
                    && sink.send(support_frame(&event)).await.is_err()
                {
                    return;
                }
            }
            msg = stream.next() => {
                let Some(Ok(Message::Text(text))) = msg else { return };
                if handle_support_client_message(&mut sink, &mut filters, &state, &text).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn handle_support_client_message(
    sink: &mut SplitSink<WebSocket, Message>,
    filters: &mut SupportFilters,
    state: &AppState,
    text: &str,
) -> Result<(), ()> {
    let value: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    let event = value.get("event").and_then(Value::as_str).unwrap_or(text);
    match event {
        "ping" | "support.ping" => {
            let pong = serde_json::json!({
                "event": "support.pong",
                "meta": {"ts": chrono::Utc::now().to_rfc3339()},
            });
            sink.send(Message::Text(pong.to_string().into())).await.map_err(|_| ())
        }
        "support.get" | "support.refresh" | "refresh" => {
            send_support_snapshot(sink, state, filters).await
        }
        "support.subscribe" => {
            if let Some(incoming) = value.get("filters").and_then(Value::as_object) {
                filters.project_id = incoming.get("project_id").and_then(Value::as_str).unwrap_or_default().to_owned();
                filters.user_id = incoming.get("user_id").and_then(Value::as_str).unwrap_or_default().to_owned();
                filters.ticket_id = incoming.get("ticket_id").and_then(Value::as_str).unwrap_or_default().to_owned();

                let ack = serde_json::json!({
                    "event": "support.subscribed",
                    "namespace": "support",
                    "payload": {"filters": filters},
                });
                sink.send(Message::Text(ack.to_string().into())).await.map_err(|_| ())?;
            }
            send_support_snapshot(sink, state, filters).await
        }
        _ => {
            debug!(event, "ignoring unrecognized support client message");
            Ok(())
        }
    }
}

async fn send_support_snapshot(
    sink: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
    filters: &SupportFilters,
) -> Result<(), ()> {
    let events = state.support.replay_matching(filters).await;
    let frame = serde_json::json!({"event": "support.snapshot", "data": events});
    sink.send(Message::Text(frame.to_string().into())).await.map_err(|_| ())
}

fn support_frame(event: &SupportEvent) -> Message {
    Message::Text(serde_json::json!({"event": event.event, "data": event}).to_string().into())
}

/// Manual `Cookie:` header parsing, matching `ws_common.rs::
/// extract_token_from_headers`'s habit of reading the header by hand rather
/// than pulling in `axum-extra`'s cookie jar for a single lookup.
fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == name).then(|| v.trim().to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_cookie_finds_named_value_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            "other=1; sessionid=abc123; theme=dark".parse().unwrap(),
        );
        assert_eq!(extract_cookie(&headers, "sessionid"), Some("abc123".to_owned()));
    }

    #[test]
    fn extract_cookie_missing_header_returns_none() {
        assert_eq!(extract_cookie(&HeaderMap::new(), "sessionid"), None);
    }
}
