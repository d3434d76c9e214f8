//! On-connect session resolution: replay a cached session first, falling
//! back to a DB-WS restore, and finally `auth.anonymous` if nothing matches.
//!
//! Grounded in `auth_sessions.py::replay_auth_session`/
//! `handle_auth_session_get` and `ws_handler.py::on_connect`: the two-step
//! replay-then-restore sequence avoids an extra round trip whenever the
//! session is already cached, while still recovering a session the gateway
//! never saw cross the bus (e.g. it restarted).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use gateway_protocol::DbUserGetRequest;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::auth_processor::{ClientSink, EnrichmentRequester};
use crate::connection_manager::ConnectionManager;
use crate::profile_store::ProfileStore;
use crate::session_store::{Session, SessionStore, UpsertSnapshot};

const RESTORE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectFlow {
    sessions: Arc<SessionStore>,
    profiles: Arc<ProfileStore>,
    connections: Arc<ConnectionManager<ClientSink>>,
    enrichment: Option<Arc<dyn EnrichmentRequester>>,
}

impl ConnectFlow {
    pub fn new(
        sessions: Arc<SessionStore>,
        profiles: Arc<ProfileStore>,
        connections: Arc<ConnectionManager<ClientSink>>,
        enrichment: Option<Arc<dyn EnrichmentRequester>>,
    ) -> Self {
        Self {
            sessions,
            profiles,
            connections,
            enrichment,
        }
    }

    /// Sends `auth.user.session` + `auth.user.profile` for a cached active
    /// session bound to `session_id`, attaching the socket to the user on
    /// success. Returns `false` without sending anything if there's no
    /// cached active session for this id.
    pub async fn replay_session(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.get(session_id).await else {
            return false;
        };
        if session.state != "active" {
            return false;
        }
        self.send_session_and_profile(&session).await
    }

    /// Full fallback chain: replay, then the user's most recent active
    /// session (covers a reconnect under a fresh anonymous id before the
    /// cookie round-trips), then a DB-WS restore, then `auth.anonymous`.
    pub async fn handle_on_connect(&self, session_id: &str, user_id_hint: Option<i64>) {
        if self.replay_session(session_id).await {
            return;
        }

        if let Some(user_id) = user_id_hint {
            if let Some(session) = self.sessions.get_user_sessions(user_id).await.into_iter().last() {
                if self.send_session_and_profile(&session).await {
                    return;
                }
            }
        }

        if self.restore_from_db(session_id, user_id_hint).await {
            return;
        }

        self.connections
            .safe_send(session_id, frame("auth.anonymous", Value::Null))
            .await;
    }

    async fn restore_from_db(&self, session_id: &str, user_id_hint: Option<i64>) -> bool {
        let Some(enrichment) = &self.enrichment else {
            return false;
        };
        let request_id = Uuid::new_v4().to_string();
        let rx = enrichment.request(DbUserGetRequest {
            event: "db.user.get",
            request_id,
            session_id: Some(session_id.to_owned()),
            email: None,
            user_id: user_id_hint,
        });
        let Ok(Ok(reply)) = tokio::time::timeout(RESTORE_TIMEOUT, rx).await else {
            return false;
        };
        if !reply.found {
            return false;
        }
        let Some(user) = reply.user else { return false };
        let Some(user_id) = user.get("id").and_then(Value::as_i64).or(user_id_hint) else {
            return false;
        };

        self.sessions
            .upsert(UpsertSnapshot {
                session_id: Some(session_id.to_owned()),
                user_id: Some(user_id),
                user: Some(user.clone()),
                state: Some("active".to_owned()),
                expires_ts: None,
            })
            .await;
        let Some(session) = self.sessions.get(session_id).await else {
            return false;
        };
        self.send_session_and_profile(&session).await
    }

    async fn send_session_and_profile(&self, session: &Session) -> bool {
        self.connections
            .safe_send(session.session_id.as_str(), frame("auth.user.session", session_frame(session)))
            .await;
        let profile = self.full_profile_json(session.user_id).await;
        let sent = self
            .connections
            .safe_send(session.session_id.as_str(), frame("auth.user.profile", profile))
            .await;
        if sent {
            self.connections.attach_user(&session.session_id, session.user_id).await;
            debug!(session_id = %session.session_id, user_id = session.user_id, "session replayed to socket");
        }
        sent
    }

    async fn full_profile_json(&self, user_id: i64) -> Value {
        match self.profiles.get_full_profile(user_id).await {
            Some(full) => serde_json::to_value(full.fields).unwrap_or(Value::Null),
            None => Value::Null,
        }
    }
}

fn session_frame(session: &Session) -> Value {
    serde_json::json!({
        "session_id": session.session_id,
        "user_id": session.user_id,
        "email": session.user.email,
        "username": session.user.username,
        "is_staff": session.user.is_staff,
        "is_superuser": session.user.is_superuser,
        "state": session.state,
    })
}

fn frame(event: &str, data: Value) -> Message {
    Message::Text(
        serde_json::json!({ "event": event, "data": data })
            .to_string()
            .into(),
    )
}
