//! Server configuration from the environment (and `.env`, when present).
//!
//!   TRAFFIC_DATABASE_URL           : Postgres connection string; absent means in-memory mode
//!   TRAFFIC_BIND_ADDR              : listen address (default: 0.0.0.0:8080)
//!   TRAFFIC_DB_MAX_CONNECTIONS     : pool size (default: 10)
//!   TRAFFIC_DISPATCHER_INTERVAL_MS : outbox poll interval (default: 500)
//!   TRAFFIC_DISPATCHER_MAX_FAILS   : attempts before dead-lettering (default: 5)
//!   TRAFFIC_RUN_MIGRATIONS         : apply the embedded schema on startup (default: true)
//!   TRAFFIC_CLAIM_LEASE_SECS       : how long an abandoned idempotency claim blocks retries (default: 300)

use std::str::FromStr;
use std::time::Duration;

use traffic_core::ledger::DEFAULT_CLAIM_LEASE;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub max_connections: u32,
    pub dispatcher_interval: Duration,
    pub dispatcher_max_fails: u32,
    pub run_migrations: bool,
    pub claim_lease: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_connections: 10,
            dispatcher_interval: Duration::from_millis(500),
            dispatcher_max_fails: 5,
            run_migrations: true,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("failed to load .env: {e}");
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unparseable values fall back
    /// to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            database_url: var("TRAFFIC_DATABASE_URL"),
            bind_addr: var("TRAFFIC_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_connections: parse_or(var("TRAFFIC_DB_MAX_CONNECTIONS"), defaults.max_connections),
            dispatcher_interval: Duration::from_millis(parse_or(
                var("TRAFFIC_DISPATCHER_INTERVAL_MS"),
                defaults.dispatcher_interval.as_millis() as u64,
            )),
            dispatcher_max_fails: parse_or(
                var("TRAFFIC_DISPATCHER_MAX_FAILS"),
                defaults.dispatcher_max_fails,
            ),
            run_migrations: parse_or(var("TRAFFIC_RUN_MIGRATIONS"), defaults.run_migrations),
            claim_lease: Duration::from_secs(parse_or(
                var("TRAFFIC_CLAIM_LEASE_SECS"),
                defaults.claim_lease.as_secs(),
            )),
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
