//! Postgres implementations of the traffic_core port traits.
//!
//! Each adapter is a newtype wrapping PgPool. All SQL is runtime-checked
//! (sqlx::query, not sqlx::query!) to avoid a compile-time DB requirement.
//! Table names are derived from [`EntityKind::record_name`], never from
//! caller input; filter fields and values are always bound.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

use traffic_core::error::TrafficError;
use traffic_core::ports::{
    BusMessage, BusinessStatus, ClaimOutcome, CommandRecord, LedgerStore, MessageBus, NewCommand,
    OutboxMessage, OutboxStore, PhaseMarker, PrimaryStore, Result, StoreTx, StoredRow,
};
use traffic_core::types::{EntityKind, FieldFilter, MatchMode, RecordQuery};

type RowTuple = (i64, Option<String>, Value, DateTime<Utc>, DateTime<Utc>);

const ROW_COLUMNS: &str = "id, status, body, created_at, updated_at";

fn table(kind: EntityKind) -> String {
    format!("traffic.{}", kind.record_name())
}

fn to_row((id, status, body, created_at, updated_at): RowTuple) -> StoredRow {
    StoredRow {
        id,
        status,
        body,
        created_at,
        updated_at,
    }
}

/// Escape LIKE metacharacters so user input only ever matches literally.
fn like_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// WHERE clause for live rows matching every filter, and the values to
/// bind, in placeholder order starting at `$1`.
fn filter_clause(filters: &[FieldFilter]) -> (String, Vec<String>) {
    let mut clause = String::from("deleted_at IS NULL");
    let mut binds = Vec::with_capacity(filters.len() * 2);
    for filter in filters {
        let field = binds.len() + 1;
        let value = binds.len() + 2;
        let wanted = filter.value.trim().to_lowercase();
        match filter.mode {
            MatchMode::Exact => {
                clause.push_str(&format!(" AND lower(body->>${field}) = ${value}"));
                binds.push(filter.field.clone());
                binds.push(wanted);
            }
            MatchMode::Prefix => {
                clause.push_str(&format!(
                    " AND lower(body->>${field}) LIKE ${value} ESCAPE '\\'"
                ));
                binds.push(filter.field.clone());
                binds.push(format!("{}%", like_escape(&wanted)));
            }
            MatchMode::Fuzzy => {
                clause.push_str(&format!(
                    " AND lower(body->>${field}) LIKE ${value} ESCAPE '\\'"
                ));
                binds.push(filter.field.clone());
                binds.push(format!("%{}%", like_escape(&wanted)));
            }
        }
    }
    (clause, binds)
}

// ── PgPrimaryStore ────────────────────────────────────────────

pub struct PgPrimaryStore {
    pool: PgPool,
}

impl PgPrimaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PrimaryStore for PgPrimaryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        Ok(Box::new(PgStoreTx { tx }))
    }

    async fn fetch(&self, kind: EntityKind, id: i64) -> Result<Option<StoredRow>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE id = $1 AND deleted_at IS NULL",
            table(kind)
        );
        let row = sqlx::query_as::<_, RowTuple>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(row.map(to_row))
    }

    async fn list(&self, kind: EntityKind, query: &RecordQuery) -> Result<(Vec<StoredRow>, u64)> {
        let (clause, binds) = filter_clause(&query.filters);

        let count_sql = format!("SELECT COUNT(*) FROM {} WHERE {clause}", table(kind));
        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
        for value in &binds {
            count = count.bind(value);
        }
        let total = count
            .fetch_one(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        let page_sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE {clause} ORDER BY id LIMIT ${} OFFSET ${}",
            table(kind),
            binds.len() + 1,
            binds.len() + 2
        );
        let mut page = sqlx::query_as::<_, RowTuple>(&page_sql);
        for value in &binds {
            page = page.bind(value);
        }
        let rows = page
            .bind(query.page.limit() as i64)
            .bind(query.page.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        Ok((rows.into_iter().map(to_row).collect(), total.max(0) as u64))
    }

    async fn scan(&self, kind: EntityKind) -> Result<Vec<StoredRow>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE deleted_at IS NULL ORDER BY id",
            table(kind)
        );
        let rows = sqlx::query_as::<_, RowTuple>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(rows.into_iter().map(to_row).collect())
    }
}

/// An open transaction. Dropping it without commit rolls back.
pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn fetch_for_update(&mut self, kind: EntityKind, id: i64) -> Result<Option<StoredRow>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {} WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
            table(kind)
        );
        let row = sqlx::query_as::<_, RowTuple>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(row.map(to_row))
    }

    async fn insert(&mut self, kind: EntityKind, status: Option<&str>, body: &Value) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (status, body) VALUES ($1, $2) RETURNING id",
            table(kind)
        );
        let id = sqlx::query_scalar::<_, i64>(&sql)
            .bind(status)
            .bind(body)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(id)
    }

    async fn update(
        &mut self,
        kind: EntityKind,
        id: i64,
        status: Option<&str>,
        body: &Value,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = $2, body = $3, updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
            table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(status)
            .bind(body)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete(&mut self, kind: EntityKind, id: i64) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {}
            SET deleted_at = now(), updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
            table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

// ── PgLedgerStore ─────────────────────────────────────────────

type CommandRow = (
    String,
    Option<String>,
    Option<String>,
    String,
    Option<i64>,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const COMMAND_COLUMNS: &str = "idempotency_key, business_type, action, business_status, \
     business_id, phase_marker, last_error, created_at, updated_at";

fn to_command(
    (
        idempotency_key,
        business_type,
        action,
        business_status,
        business_id,
        phase_marker,
        last_error,
        created_at,
        updated_at,
    ): CommandRow,
) -> Result<CommandRecord> {
    let business_status = business_status
        .parse::<BusinessStatus>()
        .map_err(|e| anyhow!("bad business_status {business_status:?}: {e}"))?;
    let phase_marker = phase_marker
        .map(|m| {
            m.parse::<PhaseMarker>()
                .map_err(|e| anyhow!("bad phase_marker {m:?}: {e}"))
        })
        .transpose()?;
    Ok(CommandRecord {
        idempotency_key,
        business_type,
        action,
        business_status,
        business_id,
        phase_marker,
        last_error,
        created_at,
        updated_at,
    })
}

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_state(
        &self,
        key: &str,
        status: BusinessStatus,
        marker: Option<PhaseMarker>,
        business_id: Option<i64>,
        last_error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE traffic.sys_request_history
            SET business_status = $2,
                phase_marker = $3,
                business_id = COALESCE($4, business_id),
                last_error = $5,
                updated_at = now()
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .bind(status.as_ref())
        .bind(marker.map(|m| m.as_ref().to_string()))
        .bind(business_id)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        if result.rows_affected() == 0 {
            return Err(TrafficError::NotFound(format!("idempotency key {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn claim(&self, command: &NewCommand) -> Result<ClaimOutcome> {
        // Insert-or-reject on the primary key. A released key (PROCESSING
        // with last_error) or an abandoned one (PROCESSING past its lease) is
        // taken over in the same statement; the row lock taken by ON CONFLICT
        // serializes competing re-claims.
        let sql = format!(
            r#"
            INSERT INTO traffic.sys_request_history (
                idempotency_key, business_type, action, business_status
            ) VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET business_type = EXCLUDED.business_type,
                action = EXCLUDED.action,
                phase_marker = NULL,
                last_error = NULL,
                updated_at = now()
            WHERE sys_request_history.business_status = $4
              AND (sys_request_history.last_error IS NOT NULL
                   OR sys_request_history.updated_at < now() - make_interval(secs => $5))
            RETURNING {COMMAND_COLUMNS}
            "#
        );
        let claimed = sqlx::query_as::<_, CommandRow>(&sql)
            .bind(&command.key)
            .bind(command.kind.as_ref())
            .bind(command.action.as_ref())
            .bind(BusinessStatus::Processing.as_ref())
            .bind(command.claim_lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(to_command(row)?));
        }
        match self.find(&command.key).await? {
            Some(existing) => Ok(ClaimOutcome::Existing(existing)),
            None => Err(TrafficError::Infrastructure(anyhow!(
                "idempotency key {} vanished during claim",
                command.key
            ))),
        }
    }

    async fn find(&self, key: &str) -> Result<Option<CommandRecord>> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM traffic.sys_request_history WHERE idempotency_key = $1"
        );
        let row = sqlx::query_as::<_, CommandRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        row.map(to_command).transpose()
    }

    async fn mark_dispatched(&self, key: &str) -> Result<()> {
        self.set_state(
            key,
            BusinessStatus::Success,
            Some(PhaseMarker::Pending),
            None,
            None,
        )
        .await
    }

    async fn mark_success(&self, key: &str, business_id: Option<i64>) -> Result<()> {
        self.set_state(
            key,
            BusinessStatus::Success,
            Some(PhaseMarker::Done),
            business_id,
            None,
        )
        .await
    }

    async fn mark_failure(&self, key: &str, reason: &str) -> Result<()> {
        self.set_state(key, BusinessStatus::Failed, None, None, Some(reason))
            .await
    }

    async fn release(&self, key: &str, reason: &str) -> Result<()> {
        self.set_state(key, BusinessStatus::Processing, None, None, Some(reason))
            .await
    }
}

// ── PgOutboxBus ───────────────────────────────────────────────

/// Durable bus: publishing appends to the outbox table, from which the
/// dispatcher claims and delivers.
pub struct PgOutboxBus {
    pool: PgPool,
}

impl PgOutboxBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageBus for PgOutboxBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO traffic.message_outbox (channel, message_key, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&message.channel)
        .bind(&message.key)
        .bind(&message.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxBus {
    async fn claim_next(&self, claimer_id: &str) -> Result<Option<OutboxMessage>> {
        // Atomic claim using CTE + FOR UPDATE SKIP LOCKED. Dead-lettered
        // messages (failed_at set) are never re-claimed; a claim that timed
        // out is up for grabs again.
        let row = sqlx::query_as::<_, (i64, String, String, Value, i32, DateTime<Utc>)>(
            r#"
            WITH claimable AS (
                SELECT outbox_seq
                FROM traffic.message_outbox
                WHERE processed_at IS NULL
                  AND failed_at IS NULL
                  AND (claimed_at IS NULL OR claim_timeout_at < now())
                ORDER BY outbox_seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE traffic.message_outbox m
            SET claimed_at = now(),
                claimer_id = $1,
                claim_timeout_at = now() + interval '5 minutes',
                attempt_count = attempt_count + 1
            FROM claimable c
            WHERE m.outbox_seq = c.outbox_seq
            RETURNING m.outbox_seq, m.channel, m.message_key, m.payload,
                      m.attempt_count, m.created_at
            "#,
        )
        .bind(claimer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        Ok(row.map(
            |(seq, channel, key, payload, attempt_count, created_at)| OutboxMessage {
                seq,
                message: BusMessage {
                    channel,
                    key,
                    payload,
                },
                attempt_count: attempt_count.max(0) as u32,
                created_at,
            },
        ))
    }

    async fn mark_processed(&self, seq: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE traffic.message_outbox
            SET processed_at = now()
            WHERE outbox_seq = $1
            "#,
        )
        .bind(seq)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn record_failure(&self, seq: i64, error: &str) -> Result<()> {
        // Clear the claim so the next poll picks the message up again.
        sqlx::query(
            r#"
            UPDATE traffic.message_outbox
            SET claimed_at = NULL,
                claimer_id = NULL,
                claim_timeout_at = NULL,
                last_error = $2
            WHERE outbox_seq = $1
            "#,
        )
        .bind(seq)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn mark_dead_letter(&self, seq: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE traffic.message_outbox
            SET failed_at = now(),
                last_error = $2
            WHERE outbox_seq = $1
            "#,
        )
        .bind(seq)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use traffic_core::types::{PageRequest, SearchField};

    #[test]
    fn like_escape_neutralizes_wildcards() {
        assert_eq!(like_escape("50%_off"), "50\\%\\_off");
        assert_eq!(like_escape("plain"), "plain");
    }

    #[test]
    fn filter_clause_binds_in_order() {
        let query = RecordQuery::all(PageRequest::default())
            .with_filter(&SearchField::new("driverId", MatchMode::Exact), "7")
            .with_filter(
                &SearchField::new("offenseLocation", MatchMode::Fuzzy),
                " Ring ",
            );
        let (clause, binds) = filter_clause(&query.filters);
        assert_eq!(
            clause,
            "deleted_at IS NULL AND lower(body->>$1) = $2 \
             AND lower(body->>$3) LIKE $4 ESCAPE '\\'"
        );
        assert_eq!(binds, vec!["driverId", "7", "offenseLocation", "%ring%"]);
    }

    #[test]
    fn no_filters_means_live_rows_only() {
        let (clause, binds) = filter_clause(&[]);
        assert_eq!(clause, "deleted_at IS NULL");
        assert!(binds.is_empty());
    }
}
