//! End-to-end session replay: a client connecting with a cookie bound to a
//! cached active session gets replayed `auth.user.session` then
//! `auth.user.profile`; a client with no cookie gets `auth.anonymous`.
//!
//! Exercises scenario 1/2 from the spec's testable-properties section
//! against a real in-process axum server and a real WS client, with no live
//! RabbitMQ/DB-WS broker (the gateway's enrichment path is left `None`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gateway::config::Config;
use gateway::connection_manager::ConnectionManager;
use gateway::profile_store::ProfileStore;
use gateway::session_store::{SessionStore, UpsertSnapshot};
use gateway::AppState;
use serde_json::Value;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

async fn start_gateway(sessions: Arc<SessionStore>, profiles: Arc<ProfileStore>) -> SocketAddr {
    let config = Arc::new(Config::from_env());
    let connections = Arc::new(ConnectionManager::new());
    let state = AppState::new(config, sessions, profiles, connections, None);
    let router = gateway::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("gateway server error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

async fn connect(addr: SocketAddr, cookie: Option<&str>) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let url = format!("ws://{addr}/ws");
    let mut request = url.into_client_request().unwrap();
    if let Some(cookie) = cookie {
        request
            .headers_mut()
            .insert(axum::http::header::COOKIE, cookie.parse().unwrap());
    }
    let (stream, _response) = tokio_tungstenite::connect_async(request).await.unwrap();
    stream
}

async fn next_event(
    stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> (String, Value) {
    let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("ws error");
    let Message::Text(text) = msg else { panic!("expected text frame, got {msg:?}") };
    let value: Value = serde_json::from_str(&text).unwrap();
    let event = value.get("event").and_then(Value::as_str).unwrap_or("").to_owned();
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    (event, data)
}

#[tokio::test]
async fn anonymous_connect_receives_auth_anonymous_first() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(
        SessionStore::load(dir.path().join("sessions.json"), dir.path().join("events.json")).await,
    );
    let profiles = Arc::new(ProfileStore::load(dir.path().join("profiles.json")).await.unwrap());
    let addr = start_gateway(sessions, profiles).await;

    let mut client = connect(addr, None).await;
    let (event, _) = next_event(&mut client).await;
    assert_eq!(event, "auth.anonymous");
}

#[tokio::test]
async fn cookie_bound_session_replays_session_then_profile() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(
        SessionStore::load(dir.path().join("sessions.json"), dir.path().join("events.json")).await,
    );
    let profiles = Arc::new(ProfileStore::load(dir.path().join("profiles.json")).await.unwrap());

    sessions
        .upsert(UpsertSnapshot {
            session_id: Some("s1".into()),
            user_id: Some(42),
            user: Some(serde_json::json!({"id": 42, "email": "e@x"})),
            state: Some("active".into()),
            expires_ts: None,
        })
        .await;
    let mut fields = HashMap::new();
    fields.insert("email".to_owned(), Value::String("e@x".into()));
    profiles
        .update_user_session(42, Some("s1".into()), fields)
        .await
        .unwrap();

    let addr = start_gateway(sessions, profiles).await;
    let mut client = connect(addr, Some("sessionid=s1")).await;

    let (first, first_data) = next_event(&mut client).await;
    assert_eq!(first, "auth.user.session");
    assert_eq!(first_data["user_id"], 42);

    let (second, second_data) = next_event(&mut client).await;
    assert_eq!(second, "auth.user.profile");
    assert_eq!(second_data["email"], "e@x");
}

#[tokio::test]
async fn logout_evicts_session_for_later_connects() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(
        SessionStore::load(dir.path().join("sessions.json"), dir.path().join("events.json")).await,
    );
    let profiles = Arc::new(ProfileStore::load(dir.path().join("profiles.json")).await.unwrap());
    sessions
        .upsert(UpsertSnapshot {
            session_id: Some("s2".into()),
            user_id: Some(7),
            user: Some(serde_json::json!({"id": 7})),
            state: Some("active".into()),
            expires_ts: None,
        })
        .await;
    sessions
        .upsert(UpsertSnapshot {
            session_id: Some("s2".into()),
            user_id: Some(7),
            user: None,
            state: Some("logged_out".into()),
            expires_ts: None,
        })
        .await;

    let addr = start_gateway(sessions.clone(), profiles).await;
    let mut client = connect(addr, Some("sessionid=s2")).await;
    let (event, _) = next_event(&mut client).await;
    assert_eq!(event, "auth.anonymous");
    assert!(sessions.get("s2").await.is_none());
}
