//! Consumes normalized auth snapshots off the bus, deduplicates by content
//! fingerprint, updates the session store, and broadcasts the resulting
//! client-facing frame to every socket bound to the affected user.
//!
//! Grounded in `rabbit_consumer.py::process_snapshot`: fingerprint via
//! `sha256(json.dumps(sort_keys=True))`, anonymous/missing-user_id guard,
//! raw-event persistence before any branching, inactive-state removal with a
//! `auth.logged_out` + `auth.anonymous` pair, active-state upsert with a
//! single `auth.user.profile` broadcast, and a keyed in-flight DB-WS
//! enrichment request guarded against replies for a session that has since
//! moved on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use axum::extract::ws::Message;
use gateway_protocol::{normalize_auth_snapshot, AuthSnapshot, BusEnvelope, DbUserGetRequest, DbUserGetResponse};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection_manager::ConnectionManager;
use crate::session_store::{is_anonymous_id, SessionStore, UpsertSnapshot};

/// Issues a DB-WS `db.user.get` request and resolves once a reply with the
/// matching `request_id` arrives (or the upstream connection drops it).
/// Implemented by `db_ws_client`; kept behind a trait object here so this
/// module doesn't need to know about WebSocket reconnection.
pub trait EnrichmentRequester: Send + Sync {
    fn request(&self, req: DbUserGetRequest) -> oneshot::Receiver<DbUserGetResponse>;
}

/// Deduplication uses a bounded set rather than an unbounded one: only the
/// most recent fingerprints are kept, matching the event log's own cap, so
/// a very old duplicate re-delivered after the window closes is treated as
/// new. This trades perfect dedup for bounded memory.
const FINGERPRINT_CAP: usize = 1000;

struct FingerprintWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl FingerprintWindow {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` if this is the first time the fingerprint is seen.
    fn insert(&mut self, fingerprint: String) -> bool {
        if !self.seen.insert(fingerprint.clone()) {
            return false;
        }
        self.order.push_back(fingerprint);
        while self.order.len() > FINGERPRINT_CAP {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

pub type ClientSink =
    futures_util::stream::SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>;

pub struct AuthProcessor {
    sessions: Arc<SessionStore>,
    connections: Arc<ConnectionManager<ClientSink>>,
    fingerprints: Mutex<FingerprintWindow>,
    /// session_id -> the most recently issued enrichment request_id for it.
    /// A reply whose request_id no longer matches is for a superseded
    /// request (the session moved on) and is dropped.
    in_flight: Arc<Mutex<HashMap<String, String>>>,
    enrichment: Option<Arc<dyn EnrichmentRequester>>,
}

impl AuthProcessor {
    pub fn new(
        sessions: Arc<SessionStore>,
        connections: Arc<ConnectionManager<ClientSink>>,
        enrichment: Option<Arc<dyn EnrichmentRequester>>,
    ) -> Self {
        Self {
            sessions,
            connections,
            fingerprints: Mutex::new(FingerprintWindow::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            enrichment,
        }
    }

    /// `routing_key` is the bus routing key the envelope arrived on (used to
    /// pick the normalization default and to recognise `auth.logout`).
    pub async fn process_snapshot(&self, routing_key: &str, envelope: BusEnvelope) {
        let fingerprint = fingerprint_of(&envelope.data);
        if !self.fingerprints.lock().await.insert(fingerprint) {
            debug!(routing_key, "duplicate auth snapshot, skipped");
            return;
        }

        self.sessions.store_event(routing_key, envelope.data.clone()).await;

        let snapshot: AuthSnapshot = match serde_json::from_value(envelope.data.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!(routing_key, error = %e, "unparseable auth snapshot payload");
                return;
            }
        };
        let snapshot = normalize_auth_snapshot(snapshot, routing_key);

        let (Some(session_id), Some(user_id)) = (snapshot.session_id.clone(), snapshot.user_id) else {
            debug!(routing_key, "snapshot missing session_id/user_id, skipped");
            return;
        };
        if is_anonymous_id(&session_id) {
            return;
        }

        if snapshot.state.as_deref() != Some("active") {
            self.sessions.remove_session(&session_id).await;
            self.connections
                .broadcast_to_user(user_id, frame("auth.logged_out", Value::Null))
                .await;
            self.connections
                .broadcast_to_user(user_id, frame("auth.anonymous", Value::Null))
                .await;
            self.connections.detach_user(user_id).await;
            self.connections.detach_session(&session_id).await;
            return;
        }

        self.sessions
            .upsert(UpsertSnapshot {
                session_id: Some(session_id.clone()),
                user_id: Some(user_id),
                user: snapshot.profile.clone(),
                state: snapshot.state.clone(),
                expires_ts: None,
            })
            .await;
        self.connections.attach_user(&session_id, user_id).await;

        match &snapshot.profile {
            Some(profile) => {
                self.connections
                    .broadcast_to_user(user_id, frame("auth.user.profile", profile.clone()))
                    .await;
            }
            None => self.enrich_then_broadcast(session_id, user_id).await,
        }
    }

    /// A profile-less snapshot triggers a DB-WS lookup; the reply is only
    /// applied if the session is still the one bound when the request fired
    /// (guards against a user logging out/back in while the round trip is in
    /// flight).
    async fn enrich_then_broadcast(&self, session_id: String, user_id: i64) {
        let Some(enrichment) = self.enrichment.clone() else {
            return;
        };
        let request_id = Uuid::new_v4().to_string();
        self.in_flight
            .lock()
            .await
            .insert(session_id.clone(), request_id.clone());

        let rx = enrichment.request(DbUserGetRequest {
            event: "db.user.get",
            request_id: request_id.clone(),
            session_id: Some(session_id.clone()),
            email: None,
            user_id: Some(user_id),
        });

        let sessions = self.sessions.clone();
        let connections = self.connections.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let Ok(reply) = rx.await else { return };
            let is_latest = {
                let mut guard = in_flight.lock().await;
                let latest = guard.get(&session_id).cloned();
                if latest.as_deref() == Some(request_id.as_str()) {
                    guard.remove(&session_id);
                    true
                } else {
                    false
                }
            };
            if !is_latest || !reply.found {
                return;
            }
            if let Some(profile) = reply.user {
                sessions
                    .upsert(UpsertSnapshot {
                        session_id: Some(session_id),
                        user_id: Some(user_id),
                        user: Some(profile.clone()),
                        state: Some("active".to_owned()),
                        expires_ts: None,
                    })
                    .await;
                connections
                    .broadcast_to_user(user_id, frame("auth.user.profile", profile))
                    .await;
            }
        });
    }
}

fn frame(event: &str, data: Value) -> Message {
    Message::Text(
        serde_json::json!({ "event": event, "data": data })
            .to_string()
            .into(),
    )
}

fn fingerprint_of(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(value).unwrap_or_default());
    hex::encode(hasher.finalize())
}
