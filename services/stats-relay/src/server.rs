//! Route wiring for the donation-stats relay: a client-facing broadcast
//! socket (reachable at two paths, per `donate_stat.py`'s double
//! `@app.websocket` decorator), a periodic self-health socket, and the plain
//! HTTP health snapshot.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{extract::Request, Router};
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::AppState;

const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

pub fn build_router(state: AppState) -> Router {
    let origins: Vec<_> = state.config.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([axum::http::Method::GET]);

    let ws_routes = Router::new()
        .route("/ws/status", get(stats_ws_handler))
        .route("/donation-stats/ws", get(stats_ws_handler))
        .route("/ws/health", get(health_ws_handler))
        .route_layer(from_fn(require_upgrade));

    Router::new()
        .merge(ws_routes)
        .route("/health", get(health_http_handler))
        .layer(cors)
        .with_state(state)
}

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
    Json(state.health.read().await.clone())
}

async fn stats_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stats_socket(socket, state))
}

async fn handle_stats_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = state.cache.subscribe();

    if let Some(latest) = state.cache.latest().await {
        if sink.send(Message::Text(latest.to_string().into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            update = rx.recv() => {
                let Ok(update) = update else { return };
                if sink.send(Message::Text(update.to_string().into())).await.is_err() {
                    return;
                }
            }
            msg = stream.next() => {
                let Some(Ok(Message::Text(text))) = msg else { return };
                if matches!(text.as_str(), "refresh") {
                    if let Some(latest) = state.cache.latest().await {
                        if sink.send(Message::Text(latest.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn health_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_health_socket(socket, state))
}

async fn handle_health_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    loop {
        let entry = state.health.read().await.clone();
        let frame = serde_json::json!({"event": "health.update", "data": entry});
        if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
            return;
        }
        match tokio::time::timeout(REFRESH_INTERVAL, stream.next()).await {
            Ok(None) => return,
            Ok(Some(Err(_))) => return,
            Ok(Some(Ok(Message::Close(_)))) => return,
            _ => {} // timeout elapsed or a non-close frame arrived: loop and re-push
        }
    }
}
