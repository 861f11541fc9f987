//! Cache-aside synchronizer between the primary store and the search index.
//!
//! Reads go to the index first and fall back to the primary store on a miss,
//! backfilling the index with whatever the store returned. Writes mutate the
//! primary store inside a [`UnitOfWork`] and touch the index only from
//! post-commit hooks, so a rolled-back transaction never leaves a document
//! behind. Index failures are logged and absorbed; they never reach callers.
//!
//! A post-commit hook that cannot refresh the index evicts the old document
//! instead. If the eviction fails too, the id is remembered as stale: reads
//! of it bypass the index until a backfill or rebuild repairs it.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};

use crate::document::{from_document, to_document};
use crate::error::TrafficError;
use crate::ports::{PrimaryStore, Result, SearchIndex, StoredRow};
use crate::records::Record;
use crate::transaction::UnitOfWork;
use crate::types::{Page, PageRequest, RecordQuery};

/// Ids whose index document may be older than the primary store.
#[derive(Default)]
struct StaleIds(Mutex<HashSet<i64>>);

impl StaleIds {
    fn lock(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn contains(&self, id: i64) -> bool {
        self.lock().contains(&id)
    }

    fn mark(&self, id: i64) {
        self.lock().insert(id);
    }

    fn clear(&self, ids: impl IntoIterator<Item = i64>) {
        let mut stale = self.lock();
        for id in ids {
            stale.remove(&id);
        }
    }

    fn clear_all(&self) {
        self.lock().clear();
    }
}

pub struct CacheAsideRepository<R: Record> {
    store: Arc<dyn PrimaryStore>,
    index: Arc<dyn SearchIndex>,
    stale: Arc<StaleIds>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Clone for CacheAsideRepository<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            index: Arc::clone(&self.index),
            stale: Arc::clone(&self.stale),
            _record: PhantomData,
        }
    }
}

impl<R: Record> CacheAsideRepository<R> {
    pub fn new(store: Arc<dyn PrimaryStore>, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            store,
            index,
            stale: Arc::default(),
            _record: PhantomData,
        }
    }

    /// True while reads of `id` bypass the index.
    pub fn is_stale(&self, id: i64) -> bool {
        self.stale.contains(id)
    }

    // ── Reads ─────────────────────────────────────────────────

    pub async fn find_by_id(&self, id: i64) -> Result<R> {
        require_id::<R>(id)?;

        let stale = self.stale.contains(id);
        if !stale {
            match self.index.get(R::KIND, id).await {
                Ok(Some(document)) => {
                    if let Some(record) = from_document::<R>(Some(&document)) {
                        return Ok(record);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(kind = %R::KIND, id, error = %e, "index lookup failed, reading primary store");
                }
            }
        }

        let Some(row) = self.store.fetch(R::KIND, id).await? else {
            if stale {
                evict::<R>(self.index.as_ref(), &self.stale, id).await;
            }
            return Err(not_found::<R>(id));
        };
        let record = decode::<R>(row)?;
        tracing::debug!(kind = %R::KIND, id, "index miss served from primary store");
        self.backfill(std::slice::from_ref(&record)).await;
        Ok(record)
    }

    pub async fn find_all(&self, page: PageRequest) -> Result<Page<R>> {
        self.search(&RecordQuery::all(page)).await
    }

    /// Filtered page. An empty index result counts as a miss.
    pub async fn search(&self, query: &RecordQuery) -> Result<Page<R>> {
        match self.index.search(R::KIND, query).await {
            Ok(hits) if !hits.documents.is_empty() => {
                let stale: Vec<i64> = hits
                    .documents
                    .iter()
                    .map(|d| d.id)
                    .filter(|id| self.stale.contains(*id))
                    .collect();
                if !stale.is_empty() {
                    tracing::debug!(kind = %R::KIND, ?stale, "index page held stale documents, reading primary store");
                    for id in stale {
                        self.repair(id).await?;
                    }
                    return self.search_store(query).await;
                }
                let items: Vec<R> = hits
                    .documents
                    .iter()
                    .filter_map(|d| from_document::<R>(Some(d)))
                    .collect();
                if items.len() == hits.documents.len() {
                    return Ok(Page::new(items, query.page, hits.total));
                }
                tracing::warn!(kind = %R::KIND, "index page held undecodable documents, reading primary store");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(kind = %R::KIND, error = %e, "index search failed, reading primary store");
            }
        }

        self.search_store(query).await
    }

    async fn search_store(&self, query: &RecordQuery) -> Result<Page<R>> {
        let (rows, total) = self.store.list(R::KIND, query).await?;
        let items = rows
            .into_iter()
            .map(decode::<R>)
            .collect::<Result<Vec<_>>>()?;
        self.backfill(&items).await;
        Ok(Page::new(items, query.page, total))
    }

    // ── Writes ────────────────────────────────────────────────

    pub async fn create(&self, mut record: R) -> Result<R> {
        let now = Utc::now().naive_utc();
        record.prepare(now)?;
        record.stamp_created(now);

        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let body = serde_json::to_value(&record)?;
        let id = uow
            .tx()
            .insert(R::KIND, record.status_code(), &body)
            .await?;
        record.set_id(id);
        self.upsert_after_commit(&mut uow, &record);
        uow.commit().await?;

        tracing::info!(kind = %R::KIND, id, "record created");
        Ok(record)
    }

    /// Replace the record with `id`. Creation metadata is kept from the
    /// stored row.
    pub async fn update(&self, id: i64, mut record: R) -> Result<R> {
        require_id::<R>(id)?;
        let now = Utc::now().naive_utc();
        record.set_id(id);
        record.prepare(now)?;

        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let existing = uow
            .tx()
            .fetch_for_update(R::KIND, id)
            .await?
            .ok_or_else(|| not_found::<R>(id))?;
        let created_at = existing
            .body
            .get("createdAt")
            .and_then(|v| serde_json::from_value::<NaiveDateTime>(v.clone()).ok())
            .unwrap_or_else(|| existing.created_at.naive_utc());
        record.stamp_created(created_at);
        record.stamp_updated(now);

        let body = serde_json::to_value(&record)?;
        if !uow
            .tx()
            .update(R::KIND, id, record.status_code(), &body)
            .await?
        {
            return Err(not_found::<R>(id));
        }
        self.upsert_after_commit(&mut uow, &record);
        uow.commit().await?;

        tracing::info!(kind = %R::KIND, id, "record updated");
        Ok(record)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        require_id::<R>(id)?;

        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        if !uow.tx().soft_delete(R::KIND, id).await? {
            return Err(not_found::<R>(id));
        }
        let index = Arc::clone(&self.index);
        let stale = Arc::clone(&self.stale);
        uow.after_commit(move || async move {
            evict::<R>(index.as_ref(), &stale, id).await;
        });
        uow.commit().await?;

        tracing::info!(kind = %R::KIND, id, "record deleted");
        Ok(())
    }

    /// Load the record under a row lock, let `apply` mutate it, and persist
    /// only if `apply` reports a change. Returns the resulting record and
    /// whether it was written.
    pub async fn modify<F>(&self, id: i64, apply: F) -> Result<(R, bool)>
    where
        F: FnOnce(&mut R) -> bool + Send,
    {
        require_id::<R>(id)?;

        let mut uow = UnitOfWork::begin(self.store.as_ref()).await?;
        let row = uow
            .tx()
            .fetch_for_update(R::KIND, id)
            .await?
            .ok_or_else(|| not_found::<R>(id))?;
        let mut record = decode::<R>(row)?;

        if !apply(&mut record) {
            uow.rollback().await?;
            return Ok((record, false));
        }

        record.stamp_updated(Utc::now().naive_utc());
        let body = serde_json::to_value(&record)?;
        if !uow
            .tx()
            .update(R::KIND, id, record.status_code(), &body)
            .await?
        {
            return Err(not_found::<R>(id));
        }
        self.upsert_after_commit(&mut uow, &record);
        uow.commit().await?;
        Ok((record, true))
    }

    /// Drop the kind's index and repopulate it from the primary store.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let rows = self.store.scan(R::KIND).await?;
        let records = rows
            .into_iter()
            .map(decode::<R>)
            .collect::<Result<Vec<_>>>()?;
        let documents: Vec<_> = records.iter().filter_map(|r| to_document(Some(r))).collect();
        let count = documents.len();

        self.index
            .clear(R::KIND)
            .await
            .map_err(|e| TrafficError::Infrastructure(anyhow!(e)))?;
        self.index
            .upsert_many(documents)
            .await
            .map_err(|e| TrafficError::Infrastructure(anyhow!(e)))?;
        self.stale.clear_all();

        tracing::info!(kind = %R::KIND, count, "index rebuilt");
        Ok(count)
    }

    // ── Internals ─────────────────────────────────────────────

    fn upsert_after_commit(&self, uow: &mut UnitOfWork, record: &R) {
        let Some(document) = to_document(Some(record)) else {
            return;
        };
        let index = Arc::clone(&self.index);
        let stale = Arc::clone(&self.stale);
        uow.after_commit(move || async move {
            let id = document.id;
            match index.upsert(document).await {
                Ok(()) => stale.clear([id]),
                Err(e) => {
                    tracing::warn!(kind = %R::KIND, id, error = %e, "post-commit index write failed");
                    evict::<R>(index.as_ref(), &stale, id).await;
                }
            }
        });
    }

    /// Bring one stale id back in line with the primary store.
    async fn repair(&self, id: i64) -> Result<()> {
        match self.store.fetch(R::KIND, id).await? {
            Some(row) => {
                let record = decode::<R>(row)?;
                self.backfill(std::slice::from_ref(&record)).await;
            }
            None => evict::<R>(self.index.as_ref(), &self.stale, id).await,
        }
        Ok(())
    }

    async fn backfill(&self, records: &[R]) {
        let documents: Vec<_> = records.iter().filter_map(|r| to_document(Some(r))).collect();
        if documents.is_empty() {
            return;
        }
        let ids: Vec<i64> = documents.iter().map(|d| d.id).collect();
        match self.index.upsert_many(documents).await {
            Ok(()) => self.stale.clear(ids),
            Err(e) => tracing::warn!(kind = %R::KIND, error = %e, "index backfill failed"),
        }
    }
}

/// Remove `id`'s document; when even that fails, mark it stale.
async fn evict<R: Record>(index: &dyn SearchIndex, stale: &StaleIds, id: i64) {
    match index.delete(R::KIND, id).await {
        Ok(()) => stale.clear([id]),
        Err(e) => {
            tracing::warn!(kind = %R::KIND, id, error = %e, "index eviction failed, bypassing index for this id");
            stale.mark(id);
        }
    }
}

fn decode<R: Record>(row: StoredRow) -> Result<R> {
    let id = row.id;
    let mut record: R = serde_json::from_value(row.body).map_err(|e| {
        TrafficError::Infrastructure(anyhow!(e).context(format!("decoding {} {id}", R::KIND)))
    })?;
    record.set_id(id);
    Ok(record)
}

fn require_id<R: Record>(id: i64) -> Result<()> {
    if id <= 0 {
        return Err(TrafficError::validation(format!(
            "{} ID must be greater than zero",
            R::KIND
        )));
    }
    Ok(())
}

fn not_found<R: Record>(id: i64) -> TrafficError {
    TrafficError::NotFound(format!("{} {id}", R::KIND))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIndex, MemoryStore};
    use crate::records::{OffenseRecord, PaymentRecord};
    use crate::types::{EntityKind, MatchMode, SearchField};

    struct Fixture {
        repo: CacheAsideRepository<OffenseRecord>,
        store: Arc<MemoryStore>,
        index: Arc<MemoryIndex>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        let repo = CacheAsideRepository::new(store.clone(), index.clone());
        Fixture { repo, store, index }
    }

    fn offense(driver: i64) -> OffenseRecord {
        OffenseRecord {
            driver_id: Some(driver),
            offense_location: Some("Ring Road North".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_indexes_after_commit() {
        let f = fixture();
        let saved = f.repo.create(offense(1)).await.unwrap();
        let id = saved.offense_id.unwrap();

        assert!(f.index.contains(EntityKind::Offense, id));
        let read = f.repo.find_by_id(id).await.unwrap();
        assert_eq!(read, saved);
    }

    #[tokio::test]
    async fn failed_commit_leaves_index_untouched() {
        let f = fixture();
        f.store.fail_next_commit();
        assert!(f.repo.create(offense(1)).await.is_err());

        assert_eq!(f.index.len(EntityKind::Offense), 0);
        assert_eq!(f.store.live_count(EntityKind::Offense), 0);
    }

    #[tokio::test]
    async fn failed_update_commit_keeps_old_document() {
        let f = fixture();
        let saved = f.repo.create(offense(1)).await.unwrap();
        let id = saved.offense_id.unwrap();

        f.store.fail_next_commit();
        let mut changed = saved.clone();
        changed.driver_id = Some(99);
        assert!(f.repo.update(id, changed).await.is_err());

        let doc = f.index.document(EntityKind::Offense, id).unwrap();
        assert_eq!(doc.fields.get("driverId").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn failed_delete_commit_keeps_document() {
        let f = fixture();
        let id = f.repo.create(offense(1)).await.unwrap().offense_id.unwrap();

        f.store.fail_next_commit();
        assert!(f.repo.delete(id).await.is_err());
        assert!(f.index.contains(EntityKind::Offense, id));
        assert!(f.repo.find_by_id(id).await.is_ok());
    }

    #[tokio::test]
    async fn miss_falls_back_and_backfills() {
        let f = fixture();
        let id = f.repo.create(offense(1)).await.unwrap().offense_id.unwrap();
        f.index.clear(EntityKind::Offense).await.unwrap();

        let reads_before = f.store.read_count();
        f.repo.find_by_id(id).await.unwrap();
        assert_eq!(f.store.read_count(), reads_before + 1);
        assert!(f.index.contains(EntityKind::Offense, id));

        // Converged: the next read is served by the index.
        f.repo.find_by_id(id).await.unwrap();
        assert_eq!(f.store.read_count(), reads_before + 1);
    }

    #[tokio::test]
    async fn index_outage_is_invisible() {
        let f = fixture();
        let id = f.repo.create(offense(1)).await.unwrap().offense_id.unwrap();
        f.index.set_available(false);

        let read = f.repo.find_by_id(id).await.unwrap();
        assert_eq!(read.offense_id, Some(id));
        let page = f.repo.find_all(PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 1);

        // Writes still succeed; the index catches up on a later read.
        let second = f.repo.create(offense(2)).await.unwrap();
        f.index.set_available(true);
        assert!(!f.index.contains(EntityKind::Offense, second.offense_id.unwrap()));
        f.repo.find_by_id(second.offense_id.unwrap()).await.unwrap();
        assert!(f.index.contains(EntityKind::Offense, second.offense_id.unwrap()));
    }

    #[tokio::test]
    async fn empty_index_list_falls_back() {
        let f = fixture();
        f.repo.create(offense(1)).await.unwrap();
        f.repo.create(offense(2)).await.unwrap();
        f.index.clear(EntityKind::Offense).await.unwrap();

        let page = f.repo.find_all(PageRequest::default()).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(f.index.len(EntityKind::Offense), 2);
    }

    #[tokio::test]
    async fn filtered_search() {
        let f = fixture();
        f.repo.create(offense(1)).await.unwrap();
        f.repo.create(offense(2)).await.unwrap();

        let driver = SearchField::new("driverId", MatchMode::Exact);
        let q = RecordQuery::all(PageRequest::default()).with_filter(&driver, "2");
        let page = f.repo.search(&q).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].driver_id, Some(2));

        f.index.clear(EntityKind::Offense).await.unwrap();
        let page = f.repo.search(&q).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn delete_removes_document_and_hides_row() {
        let f = fixture();
        let id = f.repo.create(offense(1)).await.unwrap().offense_id.unwrap();
        f.repo.delete(id).await.unwrap();

        assert!(!f.index.contains(EntityKind::Offense, id));
        let err = f.repo.find_by_id(id).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
        assert_eq!(f.repo.delete(id).await.unwrap_err().http_status(), 404);
    }

    #[tokio::test]
    async fn update_keeps_created_at() {
        let f = fixture();
        let saved = f.repo.create(offense(1)).await.unwrap();
        let id = saved.offense_id.unwrap();
        let mut changed = saved.clone();
        changed.created_at = None;
        changed.remarks = Some("late notice".into());

        let updated = f.repo.update(id, changed).await.unwrap();
        assert_eq!(updated.created_at, saved.created_at);
        assert_eq!(
            f.repo.find_by_id(id).await.unwrap().remarks.as_deref(),
            Some("late notice")
        );
    }

    #[tokio::test]
    async fn update_during_outage_is_not_served_stale() {
        let f = fixture();
        let saved = f.repo.create(offense(1)).await.unwrap();
        let id = saved.offense_id.unwrap();

        f.index.set_available(false);
        let mut changed = saved.clone();
        changed.remarks = Some("v2".into());
        f.repo.update(id, changed).await.unwrap();
        assert!(f.repo.is_stale(id));
        f.index.set_available(true);

        for _ in 0..3 {
            let read = f.repo.find_by_id(id).await.unwrap();
            assert_eq!(read.remarks.as_deref(), Some("v2"));
        }
        assert!(!f.repo.is_stale(id));
        let doc = f.index.document(EntityKind::Offense, id).unwrap();
        assert_eq!(doc.fields.get("remarks").map(String::as_str), Some("v2"));
    }

    #[tokio::test]
    async fn stale_search_hits_are_repaired() {
        let f = fixture();
        let saved = f.repo.create(offense(1)).await.unwrap();
        let id = saved.offense_id.unwrap();

        f.index.set_available(false);
        let mut changed = saved.clone();
        changed.remarks = Some("v2".into());
        f.repo.update(id, changed).await.unwrap();
        f.index.set_available(true);

        let page = f.repo.find_all(PageRequest::default()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].remarks.as_deref(), Some("v2"));
        assert!(!f.repo.is_stale(id));
    }

    #[tokio::test]
    async fn delete_during_outage_is_not_served_stale() {
        let f = fixture();
        let id = f.repo.create(offense(1)).await.unwrap().offense_id.unwrap();

        f.index.set_available(false);
        f.repo.delete(id).await.unwrap();
        f.index.set_available(true);

        assert!(f.index.contains(EntityKind::Offense, id));
        let err = f.repo.find_by_id(id).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
        assert!(!f.index.contains(EntityKind::Offense, id));
        assert!(!f.repo.is_stale(id));
    }

    #[tokio::test]
    async fn modify_without_change_does_not_write() {
        let f = fixture();
        let id = f.repo.create(offense(1)).await.unwrap().offense_id.unwrap();
        let writes = f.index.write_count();

        let (record, changed) = f.repo.modify(id, |_| false).await.unwrap();
        assert!(!changed);
        assert_eq!(record.offense_id, Some(id));
        assert_eq!(f.index.write_count(), writes);
    }

    #[tokio::test]
    async fn rebuild_restores_index() {
        let f = fixture();
        f.repo.create(offense(1)).await.unwrap();
        f.repo.create(offense(2)).await.unwrap();
        f.index.clear(EntityKind::Offense).await.unwrap();

        assert_eq!(f.repo.rebuild_index().await.unwrap(), 2);
        assert_eq!(f.index.len(EntityKind::Offense), 2);
    }

    #[tokio::test]
    async fn invalid_ids_and_records_rejected() {
        let f = fixture();
        assert_eq!(f.repo.find_by_id(0).await.unwrap_err().http_status(), 400);

        let payments: CacheAsideRepository<PaymentRecord> =
            CacheAsideRepository::new(f.store.clone(), f.index.clone());
        let err = payments.create(PaymentRecord::default()).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert_eq!(f.store.live_count(EntityKind::Payment), 0);
    }
}
