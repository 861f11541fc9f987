//! In-memory adapters for every port.
//!
//! Used by the server when no database is configured and by tests across the
//! workspace. Each adapter can be switched unavailable to exercise the
//! degraded paths. Row locks are not modelled: `fetch_for_update` is a plain
//! read.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::document::SearchDocument;
use crate::error::TrafficError;
use crate::ports::{
    BusMessage, BusinessStatus, ClaimOutcome, CommandRecord, IndexError, IndexHits, LedgerStore,
    MessageBus, NewCommand, OutboxMessage, OutboxStore, PhaseMarker, PrimaryStore, Result,
    SearchIndex, StoreTx, StoredRow,
};
use crate::types::{EntityKind, RecordQuery};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unavailable(what: &str) -> TrafficError {
    TrafficError::Infrastructure(anyhow!("{what} unavailable"))
}

// ── Primary store ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemRow {
    status: Option<String>,
    body: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted: bool,
}

impl MemRow {
    fn to_stored(&self, id: i64) -> StoredRow {
        StoredRow {
            id,
            status: self.status.clone(),
            body: self.body.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

type Tables = BTreeMap<(EntityKind, i64), MemRow>;

pub struct MemoryStore {
    rows: Arc<Mutex<Tables>>,
    next_id: Arc<AtomicI64>,
    fail_next_commit: Arc<AtomicBool>,
    available: AtomicBool,
    reads: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
            available: AtomicBool::new(true),
            reads: AtomicUsize::new(0),
        }
    }

    /// The next transaction commit fails with an infrastructure error.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Live (not soft-deleted) rows of a kind.
    pub fn live_count(&self, kind: EntityKind) -> usize {
        lock(&self.rows)
            .iter()
            .filter(|((k, _), row)| *k == kind && !row.deleted)
            .count()
    }

    /// Non-transactional reads served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(unavailable("primary store"))
        }
    }

    fn live_rows(&self, kind: EntityKind) -> Vec<StoredRow> {
        lock(&self.rows)
            .iter()
            .filter(|((k, _), row)| *k == kind && !row.deleted)
            .map(|((_, id), row)| row.to_stored(*id))
            .collect()
    }
}

#[async_trait]
impl PrimaryStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        self.check()?;
        Ok(Box::new(MemoryTx {
            rows: Arc::clone(&self.rows),
            next_id: Arc::clone(&self.next_id),
            fail_next_commit: Arc::clone(&self.fail_next_commit),
            staged: BTreeMap::new(),
        }))
    }

    async fn fetch(&self, kind: EntityKind, id: i64) -> Result<Option<StoredRow>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.rows)
            .get(&(kind, id))
            .filter(|row| !row.deleted)
            .map(|row| row.to_stored(id)))
    }

    async fn list(&self, kind: EntityKind, query: &RecordQuery) -> Result<(Vec<StoredRow>, u64)> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let matching: Vec<StoredRow> = self
            .live_rows(kind)
            .into_iter()
            .filter(|row| query.matches_body(&row.body))
            .collect();
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(query.page.offset())
            .take(query.page.limit())
            .collect();
        Ok((page, total))
    }

    async fn scan(&self, kind: EntityKind) -> Result<Vec<StoredRow>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.live_rows(kind))
    }
}

/// Writes are staged per row and applied together on commit.
struct MemoryTx {
    rows: Arc<Mutex<Tables>>,
    next_id: Arc<AtomicI64>,
    fail_next_commit: Arc<AtomicBool>,
    staged: Tables,
}

impl MemoryTx {
    fn current(&self, kind: EntityKind, id: i64) -> Option<MemRow> {
        let row = match self.staged.get(&(kind, id)) {
            Some(row) => Some(row.clone()),
            None => lock(&self.rows).get(&(kind, id)).cloned(),
        };
        row.filter(|r| !r.deleted)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn fetch_for_update(&mut self, kind: EntityKind, id: i64) -> Result<Option<StoredRow>> {
        Ok(self.current(kind, id).map(|row| row.to_stored(id)))
    }

    async fn insert(&mut self, kind: EntityKind, status: Option<&str>, body: &Value) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        self.staged.insert(
            (kind, id),
            MemRow {
                status: status.map(str::to_string),
                body: body.clone(),
                created_at: now,
                updated_at: now,
                deleted: false,
            },
        );
        Ok(id)
    }

    async fn update(
        &mut self,
        kind: EntityKind,
        id: i64,
        status: Option<&str>,
        body: &Value,
    ) -> Result<bool> {
        let Some(mut row) = self.current(kind, id) else {
            return Ok(false);
        };
        row.status = status.map(str::to_string);
        row.body = body.clone();
        row.updated_at = Utc::now();
        self.staged.insert((kind, id), row);
        Ok(true)
    }

    async fn soft_delete(&mut self, kind: EntityKind, id: i64) -> Result<bool> {
        let Some(mut row) = self.current(kind, id) else {
            return Ok(false);
        };
        row.deleted = true;
        row.updated_at = Utc::now();
        self.staged.insert((kind, id), row);
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx {
            rows,
            fail_next_commit,
            staged,
            ..
        } = *self;
        if fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(TrafficError::Infrastructure(anyhow!("commit failed")));
        }
        lock(&rows).extend(staged);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ── Ledger ────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<String, CommandRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, key: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut CommandRecord),
    {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(key)
            .ok_or_else(|| TrafficError::NotFound(format!("idempotency key {key}")))?;
        apply(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn claim(&self, command: &NewCommand) -> Result<ClaimOutcome> {
        let mut records = lock(&self.records);
        let now = Utc::now();
        match records.get_mut(&command.key) {
            Some(existing) if existing.is_reclaimable(now, command.claim_lease) => {
                existing.business_type = Some(command.kind.to_string());
                existing.action = Some(command.action.to_string());
                existing.phase_marker = None;
                existing.last_error = None;
                existing.updated_at = now;
                Ok(ClaimOutcome::Claimed(existing.clone()))
            }
            Some(existing) => Ok(ClaimOutcome::Existing(existing.clone())),
            None => {
                let record = CommandRecord {
                    idempotency_key: command.key.clone(),
                    business_type: Some(command.kind.to_string()),
                    action: Some(command.action.to_string()),
                    business_status: BusinessStatus::Processing,
                    business_id: None,
                    phase_marker: None,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                };
                records.insert(command.key.clone(), record.clone());
                Ok(ClaimOutcome::Claimed(record))
            }
        }
    }

    async fn find(&self, key: &str) -> Result<Option<CommandRecord>> {
        Ok(lock(&self.records).get(key).cloned())
    }

    async fn mark_dispatched(&self, key: &str) -> Result<()> {
        self.update(key, |r| {
            r.business_status = BusinessStatus::Success;
            r.phase_marker = Some(PhaseMarker::Pending);
            r.last_error = None;
        })
    }

    async fn mark_success(&self, key: &str, business_id: Option<i64>) -> Result<()> {
        self.update(key, |r| {
            r.business_status = BusinessStatus::Success;
            r.phase_marker = Some(PhaseMarker::Done);
            r.last_error = None;
            if business_id.is_some() {
                r.business_id = business_id;
            }
        })
    }

    async fn mark_failure(&self, key: &str, reason: &str) -> Result<()> {
        self.update(key, |r| {
            r.business_status = BusinessStatus::Failed;
            r.last_error = Some(reason.to_string());
        })
    }

    async fn release(&self, key: &str, reason: &str) -> Result<()> {
        self.update(key, |r| {
            r.business_status = BusinessStatus::Processing;
            r.phase_marker = None;
            r.last_error = Some(reason.to_string());
        })
    }
}

// ── Search index ──────────────────────────────────────────────

pub struct MemoryIndex {
    documents: Mutex<BTreeMap<(EntityKind, i64), SearchDocument>>,
    available: AtomicBool,
    writes: AtomicUsize,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn contains(&self, kind: EntityKind, id: i64) -> bool {
        lock(&self.documents).contains_key(&(kind, id))
    }

    pub fn document(&self, kind: EntityKind, id: i64) -> Option<SearchDocument> {
        lock(&self.documents).get(&(kind, id)).cloned()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        lock(&self.documents).keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.documents).is_empty()
    }

    /// Successful upserts so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> std::result::Result<(), IndexError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IndexError::Unavailable("memory index switched off".into()))
        }
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn upsert(&self, document: SearchDocument) -> std::result::Result<(), IndexError> {
        self.check()?;
        lock(&self.documents).insert((document.kind, document.id), document);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: i64) -> std::result::Result<(), IndexError> {
        self.check()?;
        lock(&self.documents).remove(&(kind, id));
        Ok(())
    }

    async fn get(
        &self,
        kind: EntityKind,
        id: i64,
    ) -> std::result::Result<Option<SearchDocument>, IndexError> {
        self.check()?;
        Ok(self.document(kind, id))
    }

    async fn search(
        &self,
        kind: EntityKind,
        query: &RecordQuery,
    ) -> std::result::Result<IndexHits, IndexError> {
        self.check()?;
        let documents = lock(&self.documents);
        let matching: Vec<&SearchDocument> = documents
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, doc)| doc)
            .filter(|doc| {
                query.filters.iter().all(|f| {
                    doc.fields
                        .get(&f.field)
                        .map_or(false, |value| f.matches(value))
                })
            })
            .collect();
        let total = matching.len() as u64;
        let documents = matching
            .into_iter()
            .skip(query.page.offset())
            .take(query.page.limit())
            .cloned()
            .collect();
        Ok(IndexHits { documents, total })
    }

    async fn clear(&self, kind: EntityKind) -> std::result::Result<(), IndexError> {
        self.check()?;
        lock(&self.documents).retain(|(k, _), _| *k != kind);
        Ok(())
    }
}

// ── Message bus and outbox ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    Pending,
    Claimed,
    Processed,
    DeadLetter,
}

#[derive(Debug, Clone)]
struct OutboxEntry {
    message: OutboxMessage,
    state: OutboxState,
    last_error: Option<String>,
}

/// Bus double that also serves as its own outbox: every accepted message is
/// queued for the dispatcher.
pub struct MemoryBus {
    outbox: Mutex<Vec<OutboxEntry>>,
    available: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            outbox: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every accepted message, in publish order.
    pub fn published(&self) -> Vec<BusMessage> {
        lock(&self.outbox)
            .iter()
            .map(|e| e.message.message.clone())
            .collect()
    }

    pub fn state(&self, seq: i64) -> Option<OutboxState> {
        lock(&self.outbox)
            .iter()
            .find(|e| e.message.seq == seq)
            .map(|e| e.state)
    }

    pub fn last_error(&self, seq: i64) -> Option<String> {
        lock(&self.outbox)
            .iter()
            .find(|e| e.message.seq == seq)
            .and_then(|e| e.last_error.clone())
    }

    fn transition(&self, seq: i64, state: OutboxState, error: Option<&str>) -> Result<()> {
        let mut outbox = lock(&self.outbox);
        let entry = outbox
            .iter_mut()
            .find(|e| e.message.seq == seq)
            .ok_or_else(|| TrafficError::NotFound(format!("outbox message {seq}")))?;
        entry.state = state;
        if let Some(error) = error {
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, message: BusMessage) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(unavailable("message bus"));
        }
        let mut outbox = lock(&self.outbox);
        let seq = outbox.len() as i64 + 1;
        outbox.push(OutboxEntry {
            message: OutboxMessage {
                seq,
                message,
                attempt_count: 0,
                created_at: Utc::now(),
            },
            state: OutboxState::Pending,
            last_error: None,
        });
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryBus {
    async fn claim_next(&self, _claimer_id: &str) -> Result<Option<OutboxMessage>> {
        let mut outbox = lock(&self.outbox);
        let Some(entry) = outbox.iter_mut().find(|e| e.state == OutboxState::Pending) else {
            return Ok(None);
        };
        entry.state = OutboxState::Claimed;
        entry.message.attempt_count += 1;
        Ok(Some(entry.message.clone()))
    }

    async fn mark_processed(&self, seq: i64) -> Result<()> {
        self.transition(seq, OutboxState::Processed, None)
    }

    async fn record_failure(&self, seq: i64, error: &str) -> Result<()> {
        self.transition(seq, OutboxState::Pending, Some(error))
    }

    async fn mark_dead_letter(&self, seq: i64, error: &str) -> Result<()> {
        self.transition(seq, OutboxState::DeadLetter, Some(error))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::{ChangeAction, PageRequest};
    use serde_json::json;

    #[tokio::test]
    async fn store_ids_are_unique_across_transactions() {
        let store = MemoryStore::new();
        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        let id_a = a.insert(EntityKind::Fine, None, &json!({})).await.unwrap();
        let id_b = b.insert(EntityKind::Fine, None, &json!({})).await.unwrap();
        assert_ne!(id_a, id_b);
        a.commit().await.unwrap();
        b.rollback().await.unwrap();

        assert!(store.fetch(EntityKind::Fine, id_a).await.unwrap().is_some());
        assert!(store.fetch(EntityKind::Fine, id_b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_deleted_rows_are_invisible() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx
            .insert(EntityKind::Offense, Some("Unprocessed"), &json!({"driverId": 1}))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.soft_delete(EntityKind::Offense, id).await.unwrap());
        assert!(!tx.update(EntityKind::Offense, id, None, &json!({})).await.unwrap());
        tx.commit().await.unwrap();

        assert!(store.fetch(EntityKind::Offense, id).await.unwrap().is_none());
        let (rows, total) = store
            .list(EntityKind::Offense, &RecordQuery::all(PageRequest::default()))
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn ledger_claim_is_exclusive_until_released() {
        let ledger = MemoryLedger::new();
        let cmd = NewCommand {
            key: "k".into(),
            kind: EntityKind::Payment,
            action: ChangeAction::Create,
            claim_lease: Duration::from_secs(300),
        };
        assert!(matches!(ledger.claim(&cmd).await.unwrap(), ClaimOutcome::Claimed(_)));
        assert!(matches!(ledger.claim(&cmd).await.unwrap(), ClaimOutcome::Existing(_)));

        ledger.release("k", "bus down").await.unwrap();
        assert!(matches!(ledger.claim(&cmd).await.unwrap(), ClaimOutcome::Claimed(_)));
        assert!(matches!(ledger.claim(&cmd).await.unwrap(), ClaimOutcome::Existing(_)));
    }

    #[tokio::test]
    async fn ledger_marks_unknown_key_as_not_found() {
        let ledger = MemoryLedger::new();
        let err = ledger.mark_success("missing", None).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn outbox_claims_in_order_and_retries() {
        let bus = MemoryBus::new();
        for key in ["a", "b"] {
            bus.publish(BusMessage {
                channel: "fine_record_create".into(),
                key: key.into(),
                payload: json!({}),
            })
            .await
            .unwrap();
        }

        let first = bus.claim_next("t").await.unwrap().unwrap();
        assert_eq!(first.message.key, "a");
        assert_eq!(first.attempt_count, 1);
        bus.record_failure(first.seq, "consumer down").await.unwrap();

        let again = bus.claim_next("t").await.unwrap().unwrap();
        assert_eq!(again.seq, first.seq);
        assert_eq!(again.attempt_count, 2);
        bus.mark_processed(again.seq).await.unwrap();

        let second = bus.claim_next("t").await.unwrap().unwrap();
        assert_eq!(second.message.key, "b");
        bus.mark_dead_letter(second.seq, "poison").await.unwrap();
        assert_eq!(bus.state(second.seq), Some(OutboxState::DeadLetter));
        assert!(bus.claim_next("t").await.unwrap().is_none());
    }
}
