//! Generic persistent WebSocket consumer against an upstream data service.
//!
//! Grounded in `main.py::consume_service_health_stream` and
//! `db_ws_client.py`'s reconnect loop: connect, optionally send a primer
//! frame, read text frames forever, and on any error sleep
//! `reconnect_delay` before trying again. Ping/pong keepalive matches
//! `donate_stat.py`'s `ping_interval=20, ping_timeout=20`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Runs forever. `on_message` is called with every parsed JSON text frame;
/// `on_error` is called with a human-readable reason whenever the connection
/// drops or fails to establish, before the reconnect sleep.
pub async fn run(
    name: &str,
    url: &str,
    reconnect_delay: Duration,
    primer: Option<Value>,
    on_message: impl Fn(Value) + Send + Sync,
    on_error: impl Fn(&str) + Send + Sync,
) -> ! {
    loop {
        match connect_and_read(url, &primer, &on_message).await {
            Ok(()) => {
                warn!(name, "upstream stream ended cleanly");
                on_error("disconnected");
            }
            Err(e) => {
                warn!(name, error = %e, "upstream connection failed");
                on_error(&e.to_string());
            }
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn connect_and_read(
    url: &str,
    primer: &Option<Value>,
    on_message: &(impl Fn(Value) + Send + Sync),
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (mut stream, _response) = tokio_tungstenite::connect_async(url).await?;
    debug!(url, "upstream websocket connected");

    if let Some(primer) = primer {
        stream.send(Message::Text(primer.to_string().into())).await?;
    }

    let mut ping_tick = tokio::time::interval(PING_INTERVAL);
    ping_tick.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                stream.send(Message::Ping(Vec::new().into())).await?;
            }
            frame = stream.next() => {
                let Some(frame) = frame else { return Ok(()) };
                match frame? {
                    Message::Text(text) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => on_message(value),
                            Err(e) => warn!(error = %e, "unparseable upstream frame, skipped"),
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
