use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gateway::auth_processor::EnrichmentRequester;
use gateway::config::Config;
use gateway::connection_manager::ConnectionManager;
use gateway::db_ws_client::DbWsClient;
use gateway::profile_store::ProfileStore;
use gateway::session_store::SessionStore;
use gateway::{bus, upstream_ws, AppState};
use gateway_protocol::{BusEnvelope, SupportEvent, SupportMeta};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL")
        .or_else(|_| env::var("GATEWAY_LOG_LEVEL"))
        .unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Arc::new(Config::from_env());
    let data_dir = PathBuf::from(env::var("GATEWAY_DATA_DIR").unwrap_or_else(|_| "data".to_owned()));
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::warn!(error = %e, "failed to create data directory");
    }

    let sessions = Arc::new(
        SessionStore::load(data_dir.join("sessions.json"), data_dir.join("session_events.json")).await,
    );
    let profiles = Arc::new(
        ProfileStore::load(data_dir.join("profiles.json"))
            .await
            .expect("failed to load profile store"),
    );
    let connections = Arc::new(ConnectionManager::new());

    let enrichment: Option<Arc<dyn EnrichmentRequester>> = Some(DbWsClient::spawn(config.db_ws_url.clone(), profiles.clone()));

    let state = AppState::new(config.clone(), sessions, profiles, connections.clone(), enrichment);

    spawn_bus_consumers(&config, &state);
    spawn_health_pollers(&config, &state);

    let router = gateway::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    connections.close_all(1012).await;
    info!("gateway shut down gracefully");
}

fn spawn_bus_consumers(config: &Arc<Config>, state: &AppState) {
    let auth_processor = state.auth_processor.clone();
    let url = config.rabbitmq_url.clone();
    let exchange = config.rabbitmq_exchange.clone();
    tokio::spawn(async move {
        bus::run_consumer(&url, &exchange, bus::AUTH_QUEUE, move |routing_key, envelope| {
            let auth_processor = auth_processor.clone();
            let routing_key = routing_key.to_owned();
            tokio::spawn(async move {
                auth_processor.process_snapshot(&routing_key, envelope).await;
            });
        })
        .await;
    });

    let support = state.support.clone();
    let url = config.rabbitmq_url.clone();
    let exchange = config.rabbitmq_exchange.clone();
    tokio::spawn(async move {
        bus::run_consumer(&url, &exchange, bus::SUPPORT_QUEUE, move |routing_key, envelope| {
            let support = support.clone();
            let routing_key = routing_key.to_owned();
            tokio::spawn(async move {
                support.record(support_event_from_envelope(&routing_key, envelope)).await;
            });
        })
        .await;
    });
}

fn support_event_from_envelope(routing_key: &str, envelope: BusEnvelope) -> SupportEvent {
    SupportEvent {
        event: envelope.event,
        namespace: routing_key.to_owned(),
        payload: envelope.data,
        meta: SupportMeta {
            source: "support".to_owned(),
            timestamp: envelope.timestamp,
            received_at: chrono::Utc::now().to_rfc3339(),
        },
    }
}

fn spawn_health_pollers(config: &Arc<Config>, state: &AppState) {
    let reconnect_delay = Duration::from_secs(config.health_upstream_reconnect_secs);
    for (name, url) in config.health_upstream_urls.clone() {
        let health = state.health.clone();
        tokio::spawn(async move {
            let ok_health = health.clone();
            let ok_name = name.clone();
            let ok_url = url.clone();
            let err_health = health.clone();
            let err_name = name.clone();
            let err_url = url.clone();
            upstream_ws::run(
                &name,
                &url,
                reconnect_delay,
                None,
                move |payload| {
                    let health = ok_health.clone();
                    let name = ok_name.clone();
                    let url = ok_url.clone();
                    tokio::spawn(async move { health.record_ok(&name, &url, Some(payload)).await });
                },
                move |error| {
                    let health = err_health.clone();
                    let name = err_name.clone();
                    let url = err_url.clone();
                    let error = error.to_owned();
                    tokio::spawn(async move { health.record_error(&name, &url, error).await });
                },
            )
            .await;
        });
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
