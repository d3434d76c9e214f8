//! Persistent consumer for the upstream donation-stats WebSocket.
//!
//! Grounded in `donate_stat.py::stats_listener_loop`: reconnects on any
//! error, keeps the connection alive with a 20s/20s ping/pong, and — once
//! the initial snapshot frame has been handled — sends a
//! `donation.stats.get` primer. The primer is redundant when the upstream
//! already pushes a snapshot on connect, but harmless, since both paths
//! funnel through the same dedup/normalize step.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use gateway_protocol::ServiceHealthEntry;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::stats_cache::StatsCache;

const PING_INTERVAL: Duration = Duration::from_secs(20);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const PRIMER: &str = r#"{"event":"donation.stats.get","currency":"USD"}"#;

pub async fn run(url: String, cache: Arc<StatsCache>, health: Arc<RwLock<ServiceHealthEntry>>) -> ! {
    loop {
        match connect_and_stream(&url, &cache, &health).await {
            Ok(()) => {
                warn!(url, "donation-stats stream ended, reconnecting");
                mark_error(&health, "disconnected").await;
            }
            Err(e) => {
                warn!(url, error = %e, "donation-stats connection failed");
                mark_error(&health, &e.to_string()).await;
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_stream(
    url: &str,
    cache: &Arc<StatsCache>,
    health: &Arc<RwLock<ServiceHealthEntry>>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (mut stream, _response) = tokio_tungstenite::connect_async(url).await?;
    debug!(url, "donation-stats websocket connected");
    let mut primed = false;
    let mut ping_tick = tokio::time::interval(PING_INTERVAL);
    ping_tick.tick().await;

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                stream.send(Message::Ping(Vec::new().into())).await?;
            }
            frame = stream.next() => {
                let Some(frame) = frame else { return Ok(()) };
                match frame? {
                    Message::Text(text) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            cache.ingest(value).await;
                            mark_ok(health).await;
                            if !primed {
                                stream.send(Message::Text(PRIMER.into())).await?;
                                primed = true;
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        stream.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

async fn mark_ok(health: &Arc<RwLock<ServiceHealthEntry>>) {
    let mut entry = health.write().await;
    entry.ok = true;
    entry.status = "ok".to_owned();
    entry.error = None;
    entry.updated_at = Utc::now().to_rfc3339();
}

async fn mark_error(health: &Arc<RwLock<ServiceHealthEntry>>, error: &str) {
    let mut entry = health.write().await;
    entry.ok = false;
    entry.status = "error".to_owned();
    entry.error = Some(error.to_owned());
    entry.updated_at = Utc::now().to_rfc3339();
}
