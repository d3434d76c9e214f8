//! Support relay filtering: a `/ws/support` subscriber only receives events
//! whose non-empty filter values match the payload extracts (spec §8
//! scenario 5, the "broadcast set" invariant).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use gateway::config::Config;
use gateway::connection_manager::ConnectionManager;
use gateway::profile_store::ProfileStore;
use gateway::session_store::SessionStore;
use gateway::AppState;
use gateway_protocol::{SupportEvent, SupportMeta};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

async fn start_gateway() -> (SocketAddr, AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(
        SessionStore::load(dir.path().join("sessions.json"), dir.path().join("events.json")).await,
    );
    let profiles = Arc::new(ProfileStore::load(dir.path().join("profiles.json")).await.unwrap());
    let config = Arc::new(Config::from_env());
    let connections = Arc::new(ConnectionManager::new());
    let state = AppState::new(config, sessions, profiles, connections, None);
    let router = gateway::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("gateway server error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, state, dir)
}

fn ticket_event(project_id: &str) -> SupportEvent {
    SupportEvent {
        event: "support.ticket.created".into(),
        namespace: "support".into(),
        payload: serde_json::json!({"ticket": {"project_id": project_id, "id": "t1"}}),
        meta: SupportMeta {
            source: "support".into(),
            timestamp: None,
            received_at: "2026-01-01T00:00:00Z".into(),
        },
    }
}

async fn next_text(
    stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn subscriber_only_receives_events_matching_its_filter() {
    let (addr, state, _dir) = start_gateway().await;

    let url = format!("ws://{addr}/ws/support?project_id=P1");
    let (mut client, _response) = tokio_tungstenite::connect_async(url).await.unwrap();

    // First frame is always the filtered snapshot (empty buffer at this point).
    let snapshot = next_text(&mut client).await;
    assert_eq!(snapshot["event"], "support.snapshot");
    assert_eq!(snapshot["data"].as_array().unwrap().len(), 0);

    state.support.record(ticket_event("P1")).await;
    let matching = next_text(&mut client).await;
    assert_eq!(matching["event"], "support.ticket.created");
    assert_eq!(matching["data"]["payload"]["ticket"]["project_id"], "P1");

    state.support.record(ticket_event("P2")).await;
    // No more matching frames should arrive; a race-free way to assert this
    // is to send one more P1 event and confirm it's the very next frame seen.
    state.support.record(ticket_event("P1")).await;
    let next = next_text(&mut client).await;
    assert_eq!(next["data"]["payload"]["ticket"]["project_id"], "P1");
}

#[tokio::test]
async fn live_subscribe_message_updates_filter() {
    let (addr, state, _dir) = start_gateway().await;

    let url = format!("ws://{addr}/ws/support");
    let (mut client, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    let _snapshot = next_text(&mut client).await;

    use futures_util::SinkExt;
    let subscribe = serde_json::json!({
        "event": "support.subscribe",
        "filters": {"project_id": "P9"},
    });
    client.send(Message::Text(subscribe.to_string().into())).await.unwrap();
    let ack = next_text(&mut client).await;
    assert_eq!(ack["event"], "support.subscribed");
    assert_eq!(ack["payload"]["filters"]["project_id"], "P9");

    let subscribed_snapshot = next_text(&mut client).await;
    assert_eq!(subscribed_snapshot["event"], "support.snapshot");

    state.support.record(ticket_event("P1")).await;
    state.support.record(ticket_event("P9")).await;
    let event = next_text(&mut client).await;
    assert_eq!(event["data"]["payload"]["ticket"]["project_id"], "P9");
}
