use thiserror::Error;

/// Background-task errors. Never surfaced to a client directly — a failed
/// upstream connection becomes a health status change and a log line, not a
/// propagated error response.
#[derive(Debug, Error)]
pub enum StatsRelayError {
    #[error("upstream websocket error: {0}")]
    Upstream(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
