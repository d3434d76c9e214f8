//! In-memory session registry with JSON snapshot persistence, an append-only
//! bounded event log, and an idempotency KV layered on that same log.
//!
//! Mirrors the original `session_store.py`: two files on disk (sessions,
//! events), rewritten in full on every mutation. Persistence here uses
//! write-to-temp-then-rename for an atomic snapshot, per the design note that
//! calls this out as the intended implementation (the semantic — atomic
//! snapshot persistence under a single lock — is mandated, the exact
//! mechanism is not).

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

const EVENT_LOG_CAP: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionUser {
    pub id: i64,
    pub email: Option<String>,
    pub username: Option<String>,
    #[serde(default)]
    pub is_staff: bool,
    #[serde(default)]
    pub is_superuser: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub user_id: i64,
    pub user: SessionUser,
    pub state: String,
    #[serde(default)]
    pub expires_ts: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: String,
    pub payload: Value,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertSnapshot {
    pub session_id: Option<String>,
    pub user_id: Option<i64>,
    pub user: Option<Value>,
    pub state: Option<String>,
    pub expires_ts: Option<f64>,
}

#[derive(Serialize, Deserialize, Default)]
struct SessionFile {
    sessions: HashMap<String, Session>,
    user_sessions: HashMap<String, Vec<String>>,
}

struct Inner {
    sessions: HashMap<String, Session>,
    user_sessions: HashMap<i64, Vec<String>>,
    events: VecDeque<StoredEvent>,
}

pub struct SessionStore {
    inner: Mutex<Inner>,
    sessions_path: PathBuf,
    events_path: PathBuf,
}

fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl SessionStore {
    /// Load from the given pair of on-disk files (created lazily on first
    /// write). Missing or corrupt files are treated as empty, logged, and
    /// not fatal — matching `session_store.py`'s defensive `_load_from_file`.
    pub async fn load(sessions_path: PathBuf, events_path: PathBuf) -> Self {
        let mut sessions = HashMap::new();
        let mut user_sessions: HashMap<i64, Vec<String>> = HashMap::new();
        if let Ok(raw) = tokio::fs::read_to_string(&sessions_path).await {
            match serde_json::from_str::<SessionFile>(&raw) {
                Ok(file) => {
                    sessions = file.sessions;
                    user_sessions = file
                        .user_sessions
                        .into_iter()
                        .filter_map(|(k, v)| k.parse::<i64>().ok().map(|uid| (uid, v)))
                        .collect();
                }
                Err(e) => warn!(error = %e, "failed to load sessions snapshot"),
            }
        }

        let mut events = VecDeque::new();
        if let Ok(raw) = tokio::fs::read_to_string(&events_path).await {
            match serde_json::from_str::<VecDeque<StoredEvent>>(&raw) {
                Ok(loaded) => events = loaded,
                Err(e) => warn!(error = %e, "failed to load session events"),
            }
        }

        Self {
            inner: Mutex::new(Inner {
                sessions,
                user_sessions,
                events,
            }),
            sessions_path,
            events_path,
        }
    }

    async fn save(&self, inner: &Inner) {
        let file = SessionFile {
            sessions: inner.sessions.clone(),
            user_sessions: inner
                .user_sessions
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        };
        if let Err(e) = write_atomic(&self.sessions_path, &file).await {
            warn!(error = %e, "failed to persist sessions");
        }
        if let Err(e) = write_atomic(&self.events_path, &inner.events).await {
            warn!(error = %e, "failed to persist session events");
        }
    }

    /// Anonymous ids are never stored. `state != "active"` invalidates any
    /// existing session for the id instead of storing it.
    pub async fn upsert(&self, snapshot: UpsertSnapshot) {
        let (Some(sid), Some(user_id)) = (snapshot.session_id.clone(), snapshot.user_id) else {
            return;
        };
        if is_anonymous_id(&sid) {
            return;
        }

        let state = snapshot.state.unwrap_or_else(|| "active".to_owned());
        let mut inner = self.inner.lock().await;

        if state != "active" {
            inner.sessions.remove(&sid);
            if let Some(list) = inner.user_sessions.get_mut(&user_id) {
                list.retain(|s| s != &sid);
            }
            self.save(&inner).await;
            return;
        }

        let user_val = snapshot.user.unwrap_or(Value::Null);
        let session_user = SessionUser {
            id: user_id,
            email: user_val.get("email").and_then(Value::as_str).map(str::to_owned),
            username: user_val.get("username").and_then(Value::as_str).map(str::to_owned),
            is_staff: user_val.get("is_staff").and_then(Value::as_bool).unwrap_or(false),
            is_superuser: user_val.get("is_superuser").and_then(Value::as_bool).unwrap_or(false),
        };

        for old_sid in inner.user_sessions.get(&user_id).cloned().unwrap_or_default() {
            inner.sessions.remove(&old_sid);
        }

        inner.sessions.insert(
            sid.clone(),
            Session {
                session_id: sid.clone(),
                user_id,
                user: session_user,
                state,
                expires_ts: snapshot.expires_ts,
            },
        );
        inner.user_sessions.insert(user_id, vec![sid]);
        self.save(&inner).await;
    }

    /// Lazily evicts an expired session on read.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        let mut inner = self.inner.lock().await;
        let session = inner.sessions.get(session_id)?.clone();
        if let Some(expires_ts) = session.expires_ts {
            if expires_ts < now_ts() {
                inner.sessions.remove(session_id);
                if let Some(list) = inner.user_sessions.get_mut(&session.user_id) {
                    list.retain(|s| s != session_id);
                }
                self.save(&inner).await;
                return None;
            }
        }
        Some(session)
    }

    pub async fn get_user_sessions(&self, user_id: i64) -> Vec<Session> {
        let sids = {
            let inner = self.inner.lock().await;
            inner.user_sessions.get(&user_id).cloned().unwrap_or_default()
        };
        let mut out = Vec::with_capacity(sids.len());
        for sid in sids {
            if let Some(s) = self.get(&sid).await {
                out.push(s);
            }
        }
        out
    }

    pub async fn remove_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.remove(session_id) else {
            return;
        };
        if let Some(list) = inner.user_sessions.get_mut(&session.user_id) {
            list.retain(|s| s != session_id);
        }
        self.save(&inner).await;
    }

    pub async fn remove_user_sessions(&self, user_id: i64) {
        let mut inner = self.inner.lock().await;
        let sids = inner.user_sessions.remove(&user_id).unwrap_or_default();
        for sid in sids {
            inner.sessions.remove(&sid);
        }
        self.save(&inner).await;
    }

    /// Appends to the event log, capping it at 1000 newest entries.
    pub async fn store_event(&self, event_name: &str, payload: Value) {
        let mut inner = self.inner.lock().await;
        inner.events.push_back(StoredEvent {
            event: event_name.to_owned(),
            payload,
            timestamp: now_ts(),
        });
        while inner.events.len() > EVENT_LOG_CAP {
            inner.events.pop_front();
        }
        self.save(&inner).await;
    }

    pub async fn events(&self) -> Vec<StoredEvent> {
        self.inner.lock().await.events.iter().cloned().collect()
    }

    /// Idempotency KV, backed by synthetic `__kv__` events in the same log.
    pub async fn exists(&self, key: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.events.iter().any(|e| {
            e.event == "__kv__" && e.payload.get("key").and_then(Value::as_str) == Some(key)
        })
    }

    pub async fn set_kv(&self, key: &str) {
        self.store_event("__kv__", serde_json::json!({ "key": key, "value": true })).await;
    }
}

pub fn is_anonymous_id(session_id: &str) -> bool {
    session_id.starts_with("anon_")
}

pub(crate) async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(
            dir.path().join("sessions.json"),
            dir.path().join("session_events.json"),
        )
        .await;
        (store, dir)
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let (store, _dir) = store().await;
        store
            .upsert(UpsertSnapshot {
                session_id: Some("s1".into()),
                user_id: Some(42),
                user: Some(serde_json::json!({"email": "e@x"})),
                state: Some("active".into()),
                expires_ts: None,
            })
            .await;
        let session = store.get("s1").await.unwrap();
        assert_eq!(session.user_id, 42);
        assert_eq!(session.user.email.as_deref(), Some("e@x"));
    }

    #[tokio::test]
    async fn upsert_evicts_prior_sessions_for_same_user() {
        let (store, _dir) = store().await;
        store
            .upsert(UpsertSnapshot {
                session_id: Some("s1".into()),
                user_id: Some(1),
                user: None,
                state: Some("active".into()),
                expires_ts: None,
            })
            .await;
        store
            .upsert(UpsertSnapshot {
                session_id: Some("s2".into()),
                user_id: Some(1),
                user: None,
                state: Some("active".into()),
                expires_ts: None,
            })
            .await;
        assert!(store.get("s1").await.is_none());
        assert!(store.get("s2").await.is_some());
        assert_eq!(store.get_user_sessions(1).await.len(), 1);
    }

    #[tokio::test]
    async fn anonymous_ids_are_never_stored() {
        let (store, _dir) = store().await;
        store
            .upsert(UpsertSnapshot {
                session_id: Some("anon_123".into()),
                user_id: Some(1),
                user: None,
                state: Some("active".into()),
                expires_ts: None,
            })
            .await;
        assert!(store.get("anon_123").await.is_none());
    }

    #[tokio::test]
    async fn inactive_state_invalidates_existing_session() {
        let (store, _dir) = store().await;
        store
            .upsert(UpsertSnapshot {
                session_id: Some("s1".into()),
                user_id: Some(1),
                user: None,
                state: Some("active".into()),
                expires_ts: None,
            })
            .await;
        store
            .upsert(UpsertSnapshot {
                session_id: Some("s1".into()),
                user_id: Some(1),
                user: None,
                state: Some("logged_out".into()),
                expires_ts: None,
            })
            .await;
        assert!(store.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn event_log_is_capped() {
        let (store, _dir) = store().await;
        for i in 0..(EVENT_LOG_CAP + 10) {
            store.store_event("x", serde_json::json!({"i": i})).await;
        }
        assert_eq!(store.events().await.len(), EVENT_LOG_CAP);
    }

    #[tokio::test]
    async fn idempotency_kv_round_trips() {
        let (store, _dir) = store().await;
        assert!(!store.exists("donation:order:1").await);
        store.set_kv("donation:order:1").await;
        assert!(store.exists("donation:order:1").await);
    }

    #[tokio::test]
    async fn persist_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sessions_path = dir.path().join("sessions.json");
        let events_path = dir.path().join("session_events.json");
        {
            let store = SessionStore::load(sessions_path.clone(), events_path.clone()).await;
            store
                .upsert(UpsertSnapshot {
                    session_id: Some("s1".into()),
                    user_id: Some(7),
                    user: Some(serde_json::json!({"email": "a@b"})),
                    state: Some("active".into()),
                    expires_ts: None,
                })
                .await;
        }
        let reloaded = SessionStore::load(sessions_path, events_path).await;
        let session = reloaded.get("s1").await.unwrap();
        assert_eq!(session.user_id, 7);
        assert_eq!(session.user.email.as_deref(), Some("a@b"));
    }
}
