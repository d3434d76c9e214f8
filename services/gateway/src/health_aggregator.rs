//! Tracks the last known health snapshot for each configured upstream
//! service and republishes an aggregate only when it changes.
//!
//! Grounded in `main.py`'s `_is_payload_ok` / `_aggregated_health_snapshot` /
//! `_broadcast_health_snapshot`: the aggregate always carries every
//! configured service key (even ones never yet heard from, reported as
//! `"unknown"`), and `ok` is true only when every tracked service is ok.

use std::collections::BTreeMap;

use chrono::Utc;
use gateway_protocol::{HealthSnapshot, ServiceHealthEntry};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

pub struct HealthAggregator {
    entries: RwLock<BTreeMap<String, ServiceHealthEntry>>,
    tx: broadcast::Sender<HealthSnapshot>,
}

impl HealthAggregator {
    /// `services` is the full set of configured service names; every one of
    /// them appears in every snapshot from the start, reported `"unknown"`
    /// until the first payload arrives.
    pub fn new(services: impl IntoIterator<Item = String>) -> Self {
        let now = Utc::now().to_rfc3339();
        let entries = services
            .into_iter()
            .map(|name| {
                let entry = ServiceHealthEntry {
                    service: name.clone(),
                    url: String::new(),
                    ok: false,
                    status: "unknown".to_owned(),
                    payload: None,
                    updated_at: now.clone(),
                    error: None,
                };
                (name, entry)
            })
            .collect();
        let (tx, _rx) = broadcast::channel(32);
        Self {
            entries: RwLock::new(entries),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthSnapshot> {
        self.tx.subscribe()
    }

    /// Records a successful poll/push from `service` and broadcasts the
    /// aggregate if the overall `ok` predicate or this entry's status
    /// changed.
    pub async fn record_ok(&self, service: &str, url: &str, payload: Option<Value>) {
        let status = payload_status(&payload);
        self.upsert(service, url, is_payload_ok(&payload), &status, payload, None)
            .await;
    }

    pub async fn record_error(&self, service: &str, url: &str, error: impl Into<String>) {
        self.upsert(service, url, false, "error", None, Some(error.into()))
            .await;
    }

    async fn upsert(
        &self,
        service: &str,
        url: &str,
        ok: bool,
        status: &str,
        payload: Option<Value>,
        error: Option<String>,
    ) {
        let changed = {
            let mut entries = self.entries.write().await;
            let prev = entries.get(service);
            let changed = prev.map(|e| e.ok != ok || e.status != status).unwrap_or(true);
            entries.insert(
                service.to_owned(),
                ServiceHealthEntry {
                    service: service.to_owned(),
                    url: url.to_owned(),
                    ok,
                    status: status.to_owned(),
                    payload,
                    updated_at: Utc::now().to_rfc3339(),
                    error,
                },
            );
            changed
        };
        if changed {
            let snapshot = self.snapshot().await;
            let _ = self.tx.send(snapshot);
        }
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let entries = self.entries.read().await;
        let status = if entries.values().all(|e| e.ok) {
            "ok"
        } else {
            "degraded"
        };
        HealthSnapshot {
            status: status.to_owned(),
            updated_at: Utc::now().to_rfc3339(),
            services: entries.clone(),
        }
    }
}

/// `status ∈ {"ok","healthy"} OR (status="degraded" AND database ∈
/// {"connected","ok"})`, matching `main.py::_is_payload_ok` exactly
/// (including its case-insensitive comparison).
fn is_payload_ok(payload: &Option<Value>) -> bool {
    let Some(Value::Object(map)) = payload else {
        return false;
    };
    let status = map
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();
    if status == "ok" || status == "healthy" {
        return true;
    }
    if status == "degraded" {
        let database = map
            .get("database")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        return database == "connected" || database == "ok";
    }
    false
}

fn payload_status(payload: &Option<Value>) -> String {
    match payload {
        Some(Value::Object(map)) => map
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("ok")
            .to_owned(),
        Some(_) => "ok".to_owned(),
        None => "unknown".to_owned(),
    }
}
