//! Support ticket/conversation event fan-out: a bounded replay buffer plus a
//! broadcast channel, with per-subscriber filtering by project/user/ticket.
//!
//! Grounded in `main.py`'s support-WS section: `_normalize_filter_value`,
//! `_extract_ticket`, `_support_lookup_values`, and
//! `_support_event_matches_filters`.

use std::collections::VecDeque;

use gateway_protocol::{SupportEvent, SupportFilters};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

pub struct SupportRelay {
    buffer: Mutex<VecDeque<SupportEvent>>,
    capacity: usize,
    tx: broadcast::Sender<SupportEvent>,
}

impl SupportRelay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(256.max(capacity));
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupportEvent> {
        self.tx.subscribe()
    }

    pub async fn record(&self, event: SupportEvent) {
        {
            let mut buf = self.buffer.lock().await;
            buf.push_back(event.clone());
            while buf.len() > self.capacity {
                buf.pop_front();
            }
        }
        let _ = self.tx.send(event);
    }

    /// Replay snapshot sent right after connect, filtered the same way live
    /// events are.
    pub async fn replay_matching(&self, filters: &SupportFilters) -> Vec<SupportEvent> {
        self.buffer
            .lock()
            .await
            .iter()
            .filter(|e| matches_filters(e, filters))
            .cloned()
            .collect()
    }
}

pub fn matches_filters(event: &SupportEvent, filters: &SupportFilters) -> bool {
    if filters.is_empty() {
        return true;
    }
    if !filters.project_id.is_empty() {
        let project = lookup(&event.payload, "project_id");
        if project.as_deref().map(normalize) != Some(normalize(&filters.project_id)) {
            return false;
        }
    }
    if !filters.user_id.is_empty() {
        let user = lookup(&event.payload, "user_id");
        if user.as_deref().map(normalize) != Some(normalize(&filters.user_id)) {
            return false;
        }
    }
    if !filters.ticket_id.is_empty() {
        let Some(ticket) = extract_ticket(event) else {
            return false;
        };
        if normalize(&ticket) != normalize(&filters.ticket_id) {
            return false;
        }
    }
    true
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Looks up `key` at the top level of `payload`, falling back into
/// `payload.ticket.<key>` the way `_support_lookup_values` does
/// (`payload.get(key) or ticket.get(key)`).
fn lookup(payload: &Value, key: &str) -> Option<String> {
    let obj = payload.as_object()?;
    if let Some(v) = obj.get(key) {
        return Some(value_to_string(v));
    }
    let ticket = obj.get("ticket").and_then(Value::as_object)?;
    ticket.get(key).map(value_to_string)
}

/// A ticket id may live at `payload.ticket_id`, `payload.ticket.id`, or be
/// encoded in the event namespace as `ticket:<id>`.
fn extract_ticket(event: &SupportEvent) -> Option<String> {
    if let Some(obj) = event.payload.as_object() {
        if let Some(v) = obj.get("ticket_id") {
            return Some(value_to_string(v));
        }
        if let Some(ticket) = obj.get("ticket").and_then(Value::as_object) {
            if let Some(v) = ticket.get("id") {
                return Some(value_to_string(v));
            }
        }
    }
    event
        .namespace
        .strip_prefix("ticket:")
        .map(|s| s.to_owned())
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_protocol::SupportMeta;

    fn event(namespace: &str, payload: Value) -> SupportEvent {
        SupportEvent {
            event: "support.ticket.updated".into(),
            namespace: namespace.into(),
            payload,
            meta: SupportMeta {
                source: "support".into(),
                timestamp: None,
                received_at: "2026-01-01T00:00:00Z".into(),
            },
        }
    }

    #[test]
    fn empty_filters_match_everything() {
        let e = event("ns", serde_json::json!({}));
        assert!(matches_filters(&e, &SupportFilters::default()));
    }

    #[test]
    fn project_filter_is_case_insensitive() {
        let e = event("ns", serde_json::json!({"project_id": "ABC"}));
        let filters = SupportFilters {
            project_id: "abc".into(),
            ..Default::default()
        };
        assert!(matches_filters(&e, &filters));
    }

    #[test]
    fn ticket_filter_falls_back_to_namespace() {
        let e = event("ticket:42", serde_json::json!({}));
        let filters = SupportFilters {
            ticket_id: "42".into(),
            ..Default::default()
        };
        assert!(matches_filters(&e, &filters));
    }

    #[test]
    fn mismatched_filter_excludes_event() {
        let e = event("ns", serde_json::json!({"user_id": "7"}));
        let filters = SupportFilters {
            user_id: "8".into(),
            ..Default::default()
        };
        assert!(!matches_filters(&e, &filters));
    }

    #[tokio::test]
    async fn replay_buffer_is_bounded() {
        let relay = SupportRelay::new(2);
        for i in 0..5 {
            relay
                .record(event("ns", serde_json::json!({"i": i})))
                .await;
        }
        let all = relay.replay_matching(&SupportFilters::default()).await;
        assert_eq!(all.len(), 2);
    }
}
