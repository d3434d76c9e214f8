use thiserror::Error;

/// Errors surfaced by the gateway's background tasks (bus consumer, upstream
/// consumers). These never reach a client directly — per the error-handling
/// design, internal failures become a health status change, a log line, or
/// silent omission, never a forwarded stack trace.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("bus connection failed: {0}")]
    Bus(#[from] lapin::Error),
    #[error("upstream websocket error: {0}")]
    Upstream(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("upstream connection closed")]
    Disconnected,
}
