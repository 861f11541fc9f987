//! traffic_server: REST server for traffic offense records.
//!
//! See [`traffic_server::config`] for the environment variables it reads.
//! Without `TRAFFIC_DATABASE_URL` it runs entirely in memory.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use traffic_server::config::ServerConfig;
use traffic_server::dispatcher::{LoggingConsumer, OutboxDispatcher};
use traffic_server::router::build_router;
use traffic_server::state::{AppState, Backends};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,traffic_server=debug,traffic_core=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env();

    let backends = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(database_url)
                .await
                .context("failed to connect to database")?;
            tracing::info!("Connected to database");

            if config.run_migrations {
                traffic_postgres::run_migrations(&pool).await?;
            }
            Backends::postgres(pool)?
        }
        None => {
            tracing::warn!("TRAFFIC_DATABASE_URL not set, running with in-memory stores");
            Backends::in_memory()?
        }
    };

    let state = AppState::new(&backends, config.claim_lease);
    warm_index(&state).await;

    let dispatcher = OutboxDispatcher::new(
        Arc::clone(&backends.outbox),
        Arc::new(LoggingConsumer),
        config.dispatcher_interval,
        config.dispatcher_max_fails,
    );
    tokio::spawn(async move {
        dispatcher.run().await;
    });

    let app = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    tracing::info!(store = backends.store_label, "traffic_server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Populate the in-RAM index from the primary store. Failures only cost
/// index hits; reads fall back to the store.
async fn warm_index(state: &AppState) {
    let results = [
        ("offenses", state.offenses.rebuild_index().await),
        ("fines", state.fines.rebuild_index().await),
        ("payments", state.payments.rebuild_index().await),
        ("appeals", state.appeals.rebuild_index().await),
        ("deductions", state.deductions.rebuild_index().await),
    ];
    for (resource, result) in results {
        match result {
            Ok(count) => tracing::debug!(resource, count, "index warmed"),
            Err(e) => tracing::warn!(resource, error = %e, "index warm-up failed"),
        }
    }
}
