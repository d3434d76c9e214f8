//! Per-client socket registry, generalized over the sink half of a WebSocket
//! so it can be unit-tested without a live HTTP upgrade (production wires it
//! with `SplitSink<WebSocket, Message>`; tests use a plain channel sink).
//!
//! Mirrors `connection_manager.py`: two maps (socket-by-session,
//! user-by-session) kept consistent by construction — every mutating
//! operation that touches one touches the other if needed.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

type SharedSink<S> = Arc<Mutex<S>>;

pub struct ConnectionManager<S> {
    active_connections: RwLock<HashMap<String, SharedSink<S>>>,
    session_users: RwLock<HashMap<String, i64>>,
}

impl<S> Default for ConnectionManager<S> {
    fn default() -> Self {
        Self {
            active_connections: RwLock::new(HashMap::new()),
            session_users: RwLock::new(HashMap::new()),
        }
    }
}

impl<S> ConnectionManager<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` for `session_id`. If a different socket was already
    /// bound, it is closed gracefully (code 1000) before being replaced.
    pub async fn connect(&self, session_id: &str, sink: S) {
        let new_sink = Arc::new(Mutex::new(sink));
        let old = {
            let mut conns = self.active_connections.write().await;
            conns.insert(session_id.to_owned(), new_sink)
        };
        if let Some(old_sink) = old {
            let mut guard = old_sink.lock().await;
            let _ = guard.send(close_message(1000)).await;
            let _ = guard.close().await;
            debug!(session_id, "replaced socket, closed prior one");
        }
        let total = self.active_connections.read().await.len();
        info!(session_id, total, "client connected");
    }

    /// Idempotent; logs only when the binding actually changes.
    pub async fn attach_user(&self, session_id: &str, user_id: i64) {
        if !self.active_connections.read().await.contains_key(session_id) {
            warn!(session_id, user_id, "attach skipped, no active socket");
            return;
        }
        let mut users = self.session_users.write().await;
        let prev = users.insert(session_id.to_owned(), user_id);
        if prev != Some(user_id) {
            debug!(session_id, user_id, "socket bound to user");
        }
    }

    pub async fn detach_session(&self, session_id: &str) {
        self.session_users.write().await.remove(session_id);
    }

    /// Removes every session binding for `user_id`; returns the detached
    /// session ids.
    pub async fn detach_user(&self, user_id: i64) -> Vec<String> {
        let mut users = self.session_users.write().await;
        let detached: Vec<String> = users
            .iter()
            .filter(|(_, &uid)| uid == user_id)
            .map(|(sid, _)| sid.clone())
            .collect();
        for sid in &detached {
            users.remove(sid);
        }
        detached
    }

    /// Sends only if the socket is still registered; never propagates a send
    /// error to the caller.
    pub async fn safe_send(&self, session_id: &str, message: Message) -> bool {
        let sink = {
            let conns = self.active_connections.read().await;
            conns.get(session_id).cloned()
        };
        let Some(sink) = sink else { return false };
        let mut guard = sink.lock().await;
        guard.send(message).await.is_ok()
    }

    /// Sends to every session bound to `user_id`; prunes bindings whose
    /// socket is gone.
    pub async fn broadcast_to_user(&self, user_id: i64, message: Message) {
        let sessions: Vec<String> = {
            let users = self.session_users.read().await;
            users
                .iter()
                .filter(|(_, &uid)| uid == user_id)
                .map(|(sid, _)| sid.clone())
                .collect()
        };
        for session_id in sessions {
            let known = self.active_connections.read().await.contains_key(&session_id);
            if !known {
                self.session_users.write().await.remove(&session_id);
                continue;
            }
            if !self.safe_send(&session_id, clone_message(&message)).await {
                self.cleanup(&session_id).await;
            }
        }
    }

    pub async fn disconnect(&self, session_id: &str) {
        let sink = self.active_connections.write().await.remove(session_id);
        self.session_users.write().await.remove(session_id);
        if let Some(sink) = sink {
            let mut guard = sink.lock().await;
            let _ = guard.close().await;
        }
        info!(session_id, "client disconnected");
    }

    async fn cleanup(&self, session_id: &str) {
        self.active_connections.write().await.remove(session_id);
        self.session_users.write().await.remove(session_id);
        debug!(session_id, "pruned dead connection");
    }

    pub async fn close_all(&self, code: u16) {
        let conns: Vec<SharedSink<S>> = self.active_connections.write().await.drain().map(|(_, v)| v).collect();
        self.session_users.write().await.clear();
        for sink in conns {
            let mut guard = sink.lock().await;
            let _ = guard.send(close_message(code)).await;
            let _ = guard.close().await;
        }
        info!("all client connections closed");
    }

    pub async fn connection_count(&self) -> usize {
        self.active_connections.read().await.len()
    }
}

fn close_message(code: u16) -> Message {
    Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: "".into(),
    }))
}

/// `Message` isn't `Clone`; text frames (the only kind this module
/// broadcasts) are cheap to reconstruct.
fn clone_message(message: &Message) -> Message {
    match message {
        Message::Text(t) => Message::Text(t.clone()),
        Message::Binary(b) => Message::Binary(b.clone()),
        Message::Ping(p) => Message::Ping(p.clone()),
        Message::Pong(p) => Message::Pong(p.clone()),
        Message::Close(c) => Message::Close(c.clone()),
    }
}
