//! Library crate for the WebSocket event-plane gateway: session/profile
//! storage, connection management, bus and upstream consumers, and the axum
//! router that ties them together. Split out from `main` so integration
//! tests can build a router in-process without a live RabbitMQ/DB-WS broker.

pub mod auth_processor;
pub mod bus;
pub mod config;
pub mod connect_flow;
pub mod connection_manager;
pub mod db_ws_client;
pub mod error;
pub mod health_aggregator;
pub mod profile_store;
pub mod server;
pub mod session_store;
pub mod support_relay;
pub mod upstream_ws;

use std::sync::Arc;

use axum::Router;

use crate::auth_processor::{AuthProcessor, ClientSink, EnrichmentRequester};
use crate::config::Config;
use crate::connect_flow::ConnectFlow;
use crate::connection_manager::ConnectionManager;
use crate::health_aggregator::HealthAggregator;
use crate::profile_store::ProfileStore;
use crate::session_store::SessionStore;
use crate::support_relay::SupportRelay;

/// Everything a route handler needs, bundled behind `Arc`s so cloning
/// `AppState` for a new connection is cheap. Mirrors `main.py`'s module-level
/// singletons (`SESSION_STORE`, `PROFILE_STORE`, `manager`, ...) collected
/// into one struct instead of globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub profiles: Arc<ProfileStore>,
    pub connections: Arc<ConnectionManager<ClientSink>>,
    pub auth_processor: Arc<AuthProcessor>,
    pub connect_flow: Arc<ConnectFlow>,
    pub health: Arc<HealthAggregator>,
    pub support: Arc<SupportRelay>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionStore>,
        profiles: Arc<ProfileStore>,
        connections: Arc<ConnectionManager<ClientSink>>,
        enrichment: Option<Arc<dyn EnrichmentRequester>>,
    ) -> Self {
        let auth_processor = Arc::new(AuthProcessor::new(
            sessions.clone(),
            connections.clone(),
            enrichment.clone(),
        ));
        let connect_flow = Arc::new(ConnectFlow::new(
            sessions.clone(),
            profiles.clone(),
            connections.clone(),
            enrichment,
        ));
        let health = Arc::new(HealthAggregator::new(
            config.health_upstream_urls.iter().map(|(name, _)| name.clone()),
        ));
        let support = Arc::new(SupportRelay::new(config.support_replay_limit));
        Self {
            config,
            sessions,
            profiles,
            connections,
            auth_processor,
            connect_flow,
            health,
            support,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    server::build_router(state)
}
