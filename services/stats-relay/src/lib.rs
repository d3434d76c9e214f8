//! Library crate for the donation-stats relay: a self-contained binary that
//! tracks one upstream donation-stats WebSocket and fans its normalized,
//! deduplicated updates out to browsers. Kept separate from the gateway
//! binary for deployment fault isolation — a donation-stats outage doesn't
//! take the auth/support/health event plane down with it.

pub mod config;
pub mod error;
pub mod server;
pub mod stats_cache;
pub mod upstream;

use std::sync::Arc;

use gateway_protocol::ServiceHealthEntry;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::stats_cache::StatsCache;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<StatsCache>,
    pub health: Arc<RwLock<ServiceHealthEntry>>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        let health = ServiceHealthEntry {
            service: "donation_stats".to_owned(),
            url: config.donation_stats_ws_url.clone(),
            ok: false,
            status: "unknown".to_owned(),
            payload: None,
            updated_at: now,
            error: None,
        };
        Self {
            config,
            cache: Arc::new(StatsCache::new()),
            health: Arc::new(RwLock::new(health)),
        }
    }
}

pub fn build_router(state: AppState) -> axum::Router {
    server::build_router(state)
}
