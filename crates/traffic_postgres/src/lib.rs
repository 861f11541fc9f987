//! PostgreSQL adapter for the traffic_core ports.
//!
//! Everything lives in the `traffic` schema created by
//! `migrations/001_traffic.sql`.

mod store;

pub use store::{PgLedgerStore, PgOutboxBus, PgPrimaryStore, PgStoreTx};

use sqlx::PgPool;

const SCHEMA_SQL: &str = include_str!("../migrations/001_traffic.sql");

/// One adapter per port, all sharing the same pool.
pub struct PgStores {
    pub primary: PgPrimaryStore,
    pub ledger: PgLedgerStore,
    pub outbox: PgOutboxBus,
}

impl PgStores {
    pub fn new(pool: PgPool) -> Self {
        Self {
            primary: PgPrimaryStore::new(pool.clone()),
            ledger: PgLedgerStore::new(pool.clone()),
            outbox: PgOutboxBus::new(pool),
        }
    }
}

/// Create the `traffic` schema and tables. Idempotent.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    tracing::info!("traffic schema migrations applied");
    Ok(())
}
