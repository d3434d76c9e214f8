//! Latest-snapshot cache and dedup for the donation-stats feed.
//!
//! Grounded in `donate_stat.py::handle_stats_message`: a plain JSON-string
//! fingerprint (not hashed, unlike the gateway's auth dedup) over a fixed
//! field subset decides whether an incoming payload is actually new before
//! it's normalized and broadcast.

use gateway_protocol::donation_stats_fingerprint;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};

pub struct StatsCache {
    last_fingerprint: Mutex<Option<String>>,
    latest: RwLock<Option<Value>>,
    tx: broadcast::Sender<Value>,
}

impl StatsCache {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(32);
        Self {
            last_fingerprint: Mutex::new(None),
            latest: RwLock::new(None),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    /// Normalizes and broadcasts `payload` unless it fingerprints identically
    /// to the last one seen. Returns whether it broadcast.
    pub async fn ingest(&self, payload: Value) -> bool {
        let fingerprint = donation_stats_fingerprint(&payload);
        {
            let mut last = self.last_fingerprint.lock().await;
            if last.as_deref() == Some(fingerprint.as_str()) {
                return false;
            }
            *last = Some(fingerprint);
        }

        let update = gateway_protocol::normalize_donation_stats(&payload);
        let frame = serde_json::json!({"event": "donation.stats.update", "data": update});
        *self.latest.write().await = Some(frame.clone());
        let _ = self.tx.send(frame);
        true
    }

    pub async fn latest(&self) -> Option<Value> {
        self.latest.read().await.clone()
    }
}

impl Default for StatsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_payload_is_not_rebroadcast() {
        let cache = StatsCache::new();
        let payload = serde_json::json!({"today_total": 10, "monthly_total": 100});
        assert!(cache.ingest(payload.clone()).await);
        assert!(!cache.ingest(payload).await);
    }

    #[tokio::test]
    async fn changed_payload_rebroadcasts_and_updates_latest() {
        let cache = StatsCache::new();
        cache.ingest(serde_json::json!({"today_total": 10})).await;
        cache.ingest(serde_json::json!({"today_total": 20})).await;
        let latest = cache.latest().await.unwrap();
        assert_eq!(latest["data"]["today"]["total_today"], serde_json::json!(20));
    }
}
