//! Port traits for the external collaborators: primary store, secondary
//! index, message bus and the idempotency ledger table.
//!
//! Adapters live in `traffic_postgres` and `traffic_search`; in-memory
//! doubles live in [`crate::memory`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::document::SearchDocument;
use crate::error::{Disposition, TrafficError};
use crate::types::{ChangeAction, EntityKind, RecordQuery};

pub type Result<T> = std::result::Result<T, TrafficError>;

// ── Primary store ─────────────────────────────────────────────

/// A live row of one kind's table. `body` is the serialized record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: i64,
    pub status: Option<String>,
    pub body: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Source of truth. Soft-deleted rows are invisible to every read.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Open a transaction. Mutations only happen through [`StoreTx`].
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    async fn fetch(&self, kind: EntityKind, id: i64) -> Result<Option<StoredRow>>;

    /// Filtered page ordered by id, plus the total number of matches.
    async fn list(&self, kind: EntityKind, query: &RecordQuery) -> Result<(Vec<StoredRow>, u64)>;

    /// Every live row of a kind, ordered by id.
    async fn scan(&self, kind: EntityKind) -> Result<Vec<StoredRow>>;
}

/// An open primary-store transaction. Dropping it without `commit` rolls
/// back.
#[async_trait]
pub trait StoreTx: Send {
    /// Read a row and hold its lock until the transaction ends.
    async fn fetch_for_update(&mut self, kind: EntityKind, id: i64) -> Result<Option<StoredRow>>;

    /// Insert a row and return its assigned id.
    async fn insert(&mut self, kind: EntityKind, status: Option<&str>, body: &Value) -> Result<i64>;

    /// Replace a live row. Returns false when no live row has that id.
    async fn update(
        &mut self,
        kind: EntityKind,
        id: i64,
        status: Option<&str>,
        body: &Value,
    ) -> Result<bool>;

    /// Mark a live row deleted. Returns false when no live row has that id.
    async fn soft_delete(&mut self, kind: EntityKind, id: i64) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ── Idempotency ledger ────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BusinessStatus {
    Processing,
    Success,
    Failed,
}

/// Secondary completion flag. `Pending` means the change was dispatched to
/// the bus; `Done` means the business mutation itself was applied.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseMarker {
    Pending,
    Done,
}

/// One ledger entry per idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub idempotency_key: String,
    pub business_type: Option<String>,
    pub action: Option<String>,
    pub business_status: BusinessStatus,
    pub business_id: Option<i64>,
    pub phase_marker: Option<PhaseMarker>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandRecord {
    pub fn is_completed(&self) -> bool {
        self.business_status == BusinessStatus::Success
            && self.phase_marker == Some(PhaseMarker::Done)
    }

    /// A PROCESSING claim that was released after an infrastructure
    /// failure, or whose owner has not touched it for longer than `lease`.
    pub fn is_reclaimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        if self.business_status != BusinessStatus::Processing {
            return false;
        }
        if self.last_error.is_some() {
            return true;
        }
        chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| self.updated_at.checked_add_signed(lease))
            .map_or(false, |expires_at| expires_at < now)
    }

    pub fn disposition(&self) -> Disposition {
        if self.is_completed() {
            Disposition::Completed
        } else if self.business_status == BusinessStatus::Failed {
            Disposition::Failed
        } else {
            Disposition::InFlight
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommand {
    pub key: String,
    pub kind: EntityKind,
    pub action: ChangeAction,
    /// How long an unreleased PROCESSING claim blocks other callers.
    pub claim_lease: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller now owns the key (fresh insert, or re-claim of a released
    /// or abandoned key).
    Claimed(CommandRecord),
    /// Someone else saw the key first.
    Existing(CommandRecord),
}

/// Durable ledger table. `claim` must be atomic: concurrent claims for the
/// same key yield exactly one `Claimed`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn claim(&self, command: &NewCommand) -> Result<ClaimOutcome>;

    async fn find(&self, key: &str) -> Result<Option<CommandRecord>>;

    /// SUCCESS + PENDING: the change is on the bus.
    async fn mark_dispatched(&self, key: &str) -> Result<()>;

    /// SUCCESS + DONE: the business mutation is applied.
    async fn mark_success(&self, key: &str, business_id: Option<i64>) -> Result<()>;

    /// FAILED, with a bounded reason. Terminal.
    async fn mark_failure(&self, key: &str, reason: &str) -> Result<()>;

    /// Back to PROCESSING with `last_error` set, so the key can be re-claimed.
    async fn release(&self, key: &str, reason: &str) -> Result<()>;
}

// ── Secondary index ───────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("index write failed: {0}")]
    Write(String),

    #[error("index query failed: {0}")]
    Query(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexHits {
    pub documents: Vec<SearchDocument>,
    pub total: u64,
}

/// Derived, disposable search store. Errors never reach API callers.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, document: SearchDocument) -> std::result::Result<(), IndexError>;

    async fn upsert_many(
        &self,
        documents: Vec<SearchDocument>,
    ) -> std::result::Result<(), IndexError> {
        for document in documents {
            self.upsert(document).await?;
        }
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: i64) -> std::result::Result<(), IndexError>;

    async fn get(
        &self,
        kind: EntityKind,
        id: i64,
    ) -> std::result::Result<Option<SearchDocument>, IndexError>;

    async fn search(
        &self,
        kind: EntityKind,
        query: &RecordQuery,
    ) -> std::result::Result<IndexHits, IndexError>;

    /// Drop every document of a kind.
    async fn clear(&self, kind: EntityKind) -> std::result::Result<(), IndexError>;
}

// ── Message bus ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// `{record_name}_{action}`, e.g. `payment_record_create`.
    pub channel: String,
    /// Partition key: the command's idempotency key.
    pub key: String,
    pub payload: Value,
}

/// Durable, at-least-once append.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub seq: i64,
    pub message: BusMessage,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Claim-based delivery queue behind a durable bus.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim the oldest undelivered message, incrementing its attempt count.
    async fn claim_next(&self, claimer_id: &str) -> Result<Option<OutboxMessage>>;

    async fn mark_processed(&self, seq: i64) -> Result<()>;

    /// Release the claim so the message is retried on a later poll.
    async fn record_failure(&self, seq: i64, error: &str) -> Result<()>;

    /// Stop retrying the message.
    async fn mark_dead_letter(&self, seq: i64, error: &str) -> Result<()>;
}

/// Downstream target of outbox delivery.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn deliver(&self, message: &OutboxMessage) -> Result<()>;
}
