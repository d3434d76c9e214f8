//! Donation-stats dedup: two identical snapshots only produce one
//! `donation.stats.update` broadcast, and a late-connecting client still
//! gets the cached snapshot immediately (spec §8 scenario 4).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use stats_relay::config::Config;
use stats_relay::AppState;
use tokio_tungstenite::tungstenite::Message;

async fn start_stats_relay() -> (SocketAddr, AppState) {
    let config = Arc::new(Config::from_env());
    let state = AppState::new(config);
    let router = stats_relay::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("stats-relay server error");
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, state)
}

async fn next_text(
    stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("ws error");
    let Message::Text(text) = msg else { panic!("expected text frame") };
    serde_json::from_str(&text).unwrap()
}

fn snapshot_payload() -> Value {
    serde_json::json!({
        "currency": "USD",
        "monthly_target": 1000,
        "monthly_total": "100.00",
        "monthly_count": 2,
        "percent": 1.43,
        "remaining": 900,
        "today_total": 40,
        "today_count": 3,
    })
}

#[tokio::test]
async fn duplicate_snapshot_only_broadcasts_once() {
    let (addr, state) = start_stats_relay().await;

    let url = format!("ws://{addr}/ws/status");
    let (mut client, _response) = tokio_tungstenite::connect_async(url).await.unwrap();

    // ingest happens after connect, so the client sees no cached-snapshot
    // frame first and instead waits for the live broadcast.
    assert!(state.cache.ingest(snapshot_payload()).await);
    let first = next_text(&mut client).await;
    assert_eq!(first["event"], "donation.stats.update");
    assert_eq!(first["data"]["progress"]["total_raised"], "100.00");

    // identical payload a second time must not rebroadcast
    assert!(!state.cache.ingest(snapshot_payload()).await);
    let result = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(result.is_err(), "duplicate snapshot should not produce a second frame");
}

#[tokio::test]
async fn late_connecting_client_receives_cached_snapshot_immediately() {
    let (addr, state) = start_stats_relay().await;
    state.cache.ingest(snapshot_payload()).await;

    let url = format!("ws://{addr}/ws/status");
    let (mut client, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    let frame = next_text(&mut client).await;
    assert_eq!(frame["event"], "donation.stats.update");
    assert_eq!(frame["data"]["today"]["donations_count"], 3);
}

#[tokio::test]
async fn refresh_message_replays_cache() {
    let (addr, state) = start_stats_relay().await;
    state.cache.ingest(snapshot_payload()).await;

    let url = format!("ws://{addr}/ws/status");
    let (mut client, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    let _initial = next_text(&mut client).await;

    use futures_util::SinkExt;
    client.send(Message::Text("refresh".into())).await.unwrap();
    let replayed = next_text(&mut client).await;
    assert_eq!(replayed["event"], "donation.stats.update");
}
