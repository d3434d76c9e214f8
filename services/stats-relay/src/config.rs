//! Environment-driven configuration, matching the gateway's own `Config`
//! layering (required values `.expect()`, everything else defaulted).

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub donation_stats_ws_url: String,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8008".to_owned()),
            donation_stats_ws_url: env::var("DB_DONATION_STATS_WS_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8012/ws/donations".to_owned()),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:4011,http://127.0.0.1:4011".to_owned())
                .split(',')
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}
