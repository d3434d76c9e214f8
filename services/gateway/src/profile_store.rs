//! User/profile persistence, keyed by user id, with a secondary session-id
//! index. Grounded in `user_session_store.py`: whole-file JSON load/save, a
//! fixed-field `get_full_profile` projection, and listener fan-out on every
//! mutation where a failing listener never blocks the others.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::session_store::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserProfile {
    pub user_id: i64,
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

/// The fixed field list `get_full_profile` projects, taken verbatim from
/// `user_session_store.py::get_full_profile` (spec 3.1). A field is present
/// in the output only if it was present on the stored record (top-level or
/// nested `user`) at all — unlike `UserProfile.fields`, this is a sparse
/// projection, not a fully-populated shape.
pub const PROFILE_FIELDS: &[&str] = &[
    "id",
    "username",
    "full_name",
    "first_name",
    "last_name",
    "email",
    "phone",
    "bio",
    "location",
    "country",
    "address",
    "state",
    "city",
    "postal_code",
    "profile_image",
    "avatar",
    "facebook_url",
    "x_url",
    "linkedin_url",
    "instagram_url",
    "is_staff",
    "is_superuser",
];

/// The fixed projection `get_full_profile` returns: only fields present on
/// the stored record (top-level, falling back to a nested `user` object)
/// are included.
#[derive(Debug, Clone, Serialize, Default)]
pub struct FullProfile {
    pub user_id: i64,
    pub fields: HashMap<String, Value>,
}

type ListenerFn = Arc<dyn Fn(&UserProfile) + Send + Sync>;

#[derive(Default)]
struct Inner {
    by_user: HashMap<i64, UserProfile>,
    session_to_user: HashMap<String, i64>,
}

pub struct ProfileStore {
    inner: Mutex<Inner>,
    path: PathBuf,
    listeners: Mutex<Vec<ListenerFn>>,
}

impl ProfileStore {
    pub async fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        let mut inner = Inner::default();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let users: Vec<UserProfile> = serde_json::from_slice(&bytes).unwrap_or_default();
                for profile in users {
                    if let Some(sid) = &profile.session_id {
                        inner.session_to_user.insert(sid.clone(), profile.user_id);
                    }
                    inner.by_user.insert(profile.user_id, profile);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(Self {
            inner: Mutex::new(inner),
            path,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub async fn register_listener(&self, listener: ListenerFn) {
        self.listeners.lock().await.push(listener);
    }

    async fn notify(&self, profile: &UserProfile) {
        let listeners = self.listeners.lock().await;
        for listener in listeners.iter() {
            listener(profile);
        }
    }

    async fn save(&self, inner: &Inner) -> std::io::Result<()> {
        let users: Vec<&UserProfile> = inner.by_user.values().collect();
        write_atomic(&self.path, &users).await
    }

    pub async fn update_user_session(
        &self,
        user_id: i64,
        session_id: Option<String>,
        fields: HashMap<String, Value>,
    ) -> std::io::Result<UserProfile> {
        let profile = {
            let mut guard = self.inner.lock().await;
            if let Some(old_sid) = guard.by_user.get(&user_id).and_then(|p| p.session_id.clone()) {
                if Some(&old_sid) != session_id.as_ref() {
                    guard.session_to_user.remove(&old_sid);
                }
            }
            let entry = guard.by_user.entry(user_id).or_insert_with(|| UserProfile {
                user_id,
                session_id: None,
                fields: HashMap::new(),
            });
            entry.fields.extend(fields);
            if session_id.is_some() {
                entry.session_id = session_id.clone();
            }
            if let Some(sid) = &entry.session_id {
                guard.session_to_user.insert(sid.clone(), user_id);
            }
            let snapshot = entry.clone();
            self.save(&guard).await?;
            snapshot
        };
        self.notify(&profile).await;
        Ok(profile)
    }

    pub async fn get_user_session(&self, session_id: &str) -> Option<UserProfile> {
        let guard = self.inner.lock().await;
        let user_id = guard.session_to_user.get(session_id)?;
        guard.by_user.get(user_id).cloned()
    }

    pub async fn get(&self, user_id: i64) -> Option<UserProfile> {
        self.inner.lock().await.by_user.get(&user_id).cloned()
    }

    pub async fn remove_user_session(&self, user_id: i64) -> std::io::Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(profile) = guard.by_user.remove(&user_id) {
            if let Some(sid) = profile.session_id {
                guard.session_to_user.remove(&sid);
            }
        }
        self.save(&guard).await
    }

    /// Removes every stored record bound to `session_id` entirely (not just
    /// the binding) and returns the evicted user ids — `user_session_store.py`
    /// drops the whole entry on logout rather than keeping a profile with no
    /// session attached to it.
    pub async fn remove_by_session_id(&self, session_id: &str) -> std::io::Result<Vec<i64>> {
        let mut guard = self.inner.lock().await;
        guard.session_to_user.remove(session_id);
        let evicted: Vec<i64> = guard
            .by_user
            .iter()
            .filter(|(_, p)| p.session_id.as_deref() == Some(session_id))
            .map(|(uid, _)| *uid)
            .collect();
        for uid in &evicted {
            guard.by_user.remove(uid);
        }
        self.save(&guard).await?;
        Ok(evicted)
    }

    pub async fn get_full_profile(&self, user_id: i64) -> Option<FullProfile> {
        let guard = self.inner.lock().await;
        let profile = guard.by_user.get(&user_id)?;
        let mut fields = HashMap::new();
        for key in PROFILE_FIELDS {
            if let Some(v) = field_or_nested(profile, key) {
                fields.insert((*key).to_owned(), v);
            }
        }
        Some(FullProfile {
            user_id: profile.user_id,
            fields,
        })
    }
}

/// Top-level field first, falling back to the same key nested under a
/// `"user"` object — matches `get_full_profile`'s lookup order.
fn field_or_nested(profile: &UserProfile, key: &str) -> Option<Value> {
    if let Some(v) = profile.fields.get(key) {
        return Some(v.clone());
    }
    profile
        .fields
        .get("user")
        .and_then(|u| u.get(key))
        .cloned()
}
