//! Wire types shared between the gateway and stats-relay binaries: the bus
//! envelope consumed from RabbitMQ, the client-facing WS frames emitted to
//! browsers, and the request/reply shapes used against upstream data-service
//! WebSockets.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Bus envelope (producer -> topic exchange -> consumer)
// ---------------------------------------------------------------------------

/// The envelope every routing key on the `events` exchange carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// Fields pulled out of a `data` object for an auth snapshot/logout event.
/// Missing fields are filled with canonical defaults by the normalization
/// layer rather than rejected outright.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthSnapshot {
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    pub profile: Option<Value>,
    pub expires_at: Option<String>,
}

/// Fill a partially-populated auth snapshot with the canonical defaults
/// described in spec 4.1 ("Normalization layer fills missing fields with a
/// canonical default payload"): an absent `state` defaults to `"active"`
/// unless the originating routing key is `auth.logout`, in which case it
/// defaults to `"logged_out"`.
pub fn normalize_auth_snapshot(mut snapshot: AuthSnapshot, event_name: &str) -> AuthSnapshot {
    if snapshot.state.is_none() {
        snapshot.state = Some(if event_name == "auth.logout" {
            "logged_out".to_owned()
        } else {
            "active".to_owned()
        });
    }
    snapshot
}

// ---------------------------------------------------------------------------
// Donation stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DonationStatsProgress {
    pub monthly_target: Option<Value>,
    pub currency: Option<Value>,
    pub total_raised: Option<Value>,
    pub remaining: Option<Value>,
    pub percent: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DonationStatsToday {
    pub total_today: Option<Value>,
    pub donations_count: Option<Value>,
    pub currency: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationStatsUpdate {
    pub progress: DonationStatsProgress,
    pub today: DonationStatsToday,
    pub raw: Value,
}

/// Builds the normalized `donation.stats.update` payload from whatever shape
/// the upstream donation-stats service sent, per `donate_stat.py`'s
/// normalization contract: `progress.total_raised` reads `monthly_total`,
/// `today.total_today`/`today.donations_count` read `today_total`/
/// `today_count`, and the untouched payload is carried alongside as `raw`.
pub fn normalize_donation_stats(payload: &Value) -> DonationStatsUpdate {
    let get = |key: &str| payload.get(key).cloned();
    DonationStatsUpdate {
        progress: DonationStatsProgress {
            monthly_target: get("monthly_target"),
            currency: get("currency"),
            total_raised: get("monthly_total"),
            remaining: get("remaining"),
            percent: get("percent"),
        },
        today: DonationStatsToday {
            total_today: get("today_total"),
            donations_count: get("today_count"),
            currency: get("currency"),
        },
        raw: payload.clone(),
    }
}

/// The fields `donate_stat.py::_payload_fingerprint` hashes, in order.
const DONATION_FINGERPRINT_FIELDS: &[&str] = &[
    "currency",
    "today_date",
    "today_total",
    "today_count",
    "month",
    "monthly_target",
    "monthly_total",
    "monthly_count",
    "percent",
    "remaining",
    "net_raised",
];

/// A plain sorted-keys JSON string over a fixed field subset — unlike the
/// auth snapshot fingerprint, this is not hashed. `donate_stat.py` compares
/// the string itself, so an update that changes nothing but field order still
/// dedups correctly while staying cheap to log for debugging.
pub fn donation_stats_fingerprint(payload: &Value) -> String {
    let mut map = serde_json::Map::new();
    for key in DONATION_FINGERPRINT_FIELDS {
        map.insert((*key).to_owned(), payload.get(*key).cloned().unwrap_or(Value::Null));
    }
    Value::Object(map).to_string()
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealthEntry {
    pub service: String,
    pub url: String,
    pub ok: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub updated_at: String,
    pub services: std::collections::BTreeMap<String, ServiceHealthEntry>,
}

// ---------------------------------------------------------------------------
// Support
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SupportFilters {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub ticket_id: String,
}

impl SupportFilters {
    pub fn is_empty(&self) -> bool {
        self.project_id.is_empty() && self.user_id.is_empty() && self.ticket_id.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportMeta {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    pub received_at: String,
}

/// A single buffered/broadcast support event. All support frames (tickets,
/// conversations) share this shape; only `event` and `payload` vary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportEvent {
    pub event: String,
    pub namespace: String,
    pub payload: Value,
    pub meta: SupportMeta,
}

// ---------------------------------------------------------------------------
// Upstream DB WS request/reply (auth enrichment)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DbUserGetRequest {
    pub event: &'static str,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbUserGetResponse {
    pub event: String,
    pub request_id: String,
    pub found: bool,
    pub user: Option<Value>,
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub mod error_codes {
    pub const MALFORMED_MESSAGE: &str = "malformed_message";
    pub const UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_defaults_state_active_for_snapshot() {
        let snap = AuthSnapshot {
            user_id: Some(1),
            session_id: Some("s1".into()),
            state: None,
            profile: None,
            expires_at: None,
        };
        let normalized = normalize_auth_snapshot(snap, "auth.session.snapshot");
        assert_eq!(normalized.state.as_deref(), Some("active"));
    }

    #[test]
    fn normalize_defaults_state_logged_out_for_logout() {
        let snap = AuthSnapshot::default();
        let normalized = normalize_auth_snapshot(snap, "auth.logout");
        assert_eq!(normalized.state.as_deref(), Some("logged_out"));
    }

    #[test]
    fn normalize_preserves_explicit_state() {
        let snap = AuthSnapshot {
            state: Some("expired".into()),
            ..Default::default()
        };
        let normalized = normalize_auth_snapshot(snap, "auth.session.snapshot");
        assert_eq!(normalized.state.as_deref(), Some("expired"));
    }

    #[test]
    fn support_filters_empty_is_wildcard() {
        assert!(SupportFilters::default().is_empty());
        let f = SupportFilters {
            project_id: "p1".into(),
            ..Default::default()
        };
        assert!(!f.is_empty());
    }

    #[test]
    fn donation_stats_fingerprint_ignores_key_order() {
        let a = serde_json::json!({"currency": "USD", "today_total": 5});
        let b = serde_json::json!({"today_total": 5, "currency": "USD"});
        assert_eq!(donation_stats_fingerprint(&a), donation_stats_fingerprint(&b));
    }

    #[test]
    fn donation_stats_fingerprint_changes_with_tracked_field() {
        let a = serde_json::json!({"today_total": 5});
        let b = serde_json::json!({"today_total": 6});
        assert_ne!(donation_stats_fingerprint(&a), donation_stats_fingerprint(&b));
    }

    #[test]
    fn normalize_donation_stats_maps_monthly_and_today_fields() {
        let payload = serde_json::json!({
            "currency": "USD",
            "monthly_target": 1000,
            "monthly_total": 250,
            "remaining": 750,
            "percent": 25,
            "today_total": 40,
            "today_count": 3,
        });
        let update = normalize_donation_stats(&payload);
        assert_eq!(update.progress.total_raised, Some(serde_json::json!(250)));
        assert_eq!(update.today.total_today, Some(serde_json::json!(40)));
        assert_eq!(update.today.donations_count, Some(serde_json::json!(3)));
        assert_eq!(update.raw, payload);
    }

    #[test]
    fn bus_envelope_round_trips_through_json() {
        let env = BusEnvelope {
            event: "auth.logout".into(),
            data: serde_json::json!({"user_id": 42}),
            timestamp: Some(1.0),
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: BusEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event, env.event);
        assert_eq!(back.data, env.data);
    }
}
