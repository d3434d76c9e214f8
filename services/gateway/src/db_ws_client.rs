//! Persistent client for the database service's user-lookup WebSocket.
//!
//! Grounded in `db_ws_client.py`: a single long-lived connection with a
//! 2-second reconnect delay, request/reply correlation by `request_id`
//! (`auth_processor`'s `EnrichmentRequester`), and reactive handling of
//! unsolicited `db.user.updated` / `db.user.result` pushes that update the
//! profile store even when nobody asked for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gateway_protocol::{DbUserGetRequest, DbUserGetResponse};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::auth_processor::EnrichmentRequester;
use crate::profile_store::ProfileStore;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct DbWsClient {
    pending: Mutex<HashMap<String, oneshot::Sender<DbUserGetResponse>>>,
    outgoing: mpsc::UnboundedSender<Value>,
}

impl DbWsClient {
    /// Spawns the background connection loop and returns a handle. Pushed
    /// `db.user.updated`/`db.user.result` events are applied to `profiles`
    /// directly; requested replies go through the pending map.
    pub fn spawn(url: String, profiles: Arc<ProfileStore>) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            outgoing: outgoing_tx,
        });
        let task_client = client.clone();
        tokio::spawn(async move {
            run_loop(url, task_client, outgoing_rx, profiles).await;
        });
        client
    }

    fn handle_incoming(&self, value: Value, profiles: &Arc<ProfileStore>) {
        let event = value.get("event").and_then(Value::as_str).unwrap_or("");
        if let Some(request_id) = value.get("request_id").and_then(Value::as_str) {
            if let Ok(reply) = serde_json::from_value::<DbUserGetResponse>(value.clone()) {
                if let Some(tx) = self.pending.lock().unwrap().remove(request_id) {
                    let _ = tx.send(reply);
                    return;
                }
            }
        }
        if event == "db.user.updated" || event == "db.user.result" {
            let Some(user) = value.get("user") else { return };
            let Some(user_id) = user.get("id").and_then(Value::as_i64) else { return };
            let session_id = value.get("session_id").and_then(Value::as_str).map(str::to_owned);
            let fields = map_db_user_to_profile_fields(user);
            let profiles = profiles.clone();
            tokio::spawn(async move {
                if let Err(e) = profiles.update_user_session(user_id, session_id, fields).await {
                    warn!(error = %e, "failed to persist pushed db user update");
                }
            });
        }
    }
}

impl EnrichmentRequester for DbWsClient {
    fn request(&self, req: DbUserGetRequest) -> oneshot::Receiver<DbUserGetResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(req.request_id.clone(), tx);
        let payload = serde_json::to_value(&req).unwrap_or(Value::Null);
        if self.outgoing.send(payload).is_err() {
            // No live connection to send over; the receiver will simply never
            // resolve and the caller's stale-session guard handles the no-op.
            self.pending.lock().unwrap().remove(&req.request_id);
        }
        rx
    }
}

async fn run_loop(
    url: String,
    client: Arc<DbWsClient>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Value>,
    profiles: Arc<ProfileStore>,
) -> ! {
    loop {
        match connect_and_serve(&url, &client, &mut outgoing_rx, &profiles).await {
            Ok(()) => debug!(url, "db ws connection ended"),
            Err(e) => warn!(url, error = %e, "db ws connection failed"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_serve(
    url: &str,
    client: &Arc<DbWsClient>,
    outgoing_rx: &mut mpsc::UnboundedReceiver<Value>,
    profiles: &Arc<ProfileStore>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (mut stream, _response) = tokio_tungstenite::connect_async(url).await?;
    debug!(url, "db ws connected");
    loop {
        tokio::select! {
            outgoing = outgoing_rx.recv() => {
                let Some(payload) = outgoing else { return Ok(()) };
                stream.send(Message::Text(payload.to_string().into())).await?;
            }
            frame = stream.next() => {
                let Some(frame) = frame else { return Ok(()) };
                match frame? {
                    Message::Text(text) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            client.handle_incoming(value, profiles);
                        }
                    }
                    Message::Ping(payload) => {
                        stream.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

/// Maps a raw DB user record into the profile field set
/// `db_ws_client.py::_store_user_session` writes: `full_name` is synthesized
/// from `first_name`/`last_name`, `avatar` mirrors `profile_image`, and
/// `is_authenticated` is always set true for a record the DB resolved.
fn map_db_user_to_profile_fields(user: &Value) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    let str_field = |key: &str| user.get(key).cloned().unwrap_or(Value::Null);
    let first_name = user.get("first_name").and_then(Value::as_str).unwrap_or("");
    let last_name = user.get("last_name").and_then(Value::as_str).unwrap_or("");
    let full_name = format!("{first_name} {last_name}").trim().to_owned();

    fields.insert("id".to_owned(), str_field("id"));
    fields.insert("username".to_owned(), str_field("username"));
    fields.insert("full_name".to_owned(), Value::String(full_name));
    fields.insert("first_name".to_owned(), str_field("first_name"));
    fields.insert("last_name".to_owned(), str_field("last_name"));
    fields.insert("email".to_owned(), str_field("email"));
    fields.insert("phone".to_owned(), str_field("phone"));
    fields.insert("bio".to_owned(), str_field("bio"));
    fields.insert("location".to_owned(), str_field("location"));
    fields.insert("country".to_owned(), str_field("country"));
    fields.insert("address".to_owned(), str_field("address"));
    fields.insert("state".to_owned(), str_field("state"));
    fields.insert("city".to_owned(), str_field("city"));
    fields.insert("postal_code".to_owned(), str_field("postal_code"));
    fields.insert("facebook_url".to_owned(), str_field("facebook_url"));
    fields.insert("x_url".to_owned(), str_field("x_url"));
    fields.insert("linkedin_url".to_owned(), str_field("linkedin_url"));
    fields.insert("instagram_url".to_owned(), str_field("instagram_url"));
    fields.insert("avatar".to_owned(), str_field("profile_image"));
    fields.insert("is_authenticated".to_owned(), Value::Bool(true));
    fields.insert("is_staff".to_owned(), str_field("is_staff"));
    fields.insert("is_superuser".to_owned(), str_field("is_superuser"));
    fields
}
