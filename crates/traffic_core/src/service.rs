//! Per-kind command service: idempotent writes, reads, workflow events.

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;

use crate::cache_aside::CacheAsideRepository;
use crate::error::{Disposition, TrafficError};
use crate::ledger::IdempotencyLedger;
use crate::ports::{CommandRecord, Result};
use crate::records::Record;
use crate::types::{ChangeAction, Page, PageRequest, RecordQuery};
use crate::workflow::{decide, Decision, Governed, StateMachine, WorkflowOutcome};

/// Result of a keyed (or unkeyed) write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum CommandOutcome<R> {
    /// The mutation ran in this call.
    Applied(R),
    /// The key was already completed; nothing ran.
    AlreadyCompleted(CommandRecord),
}

impl<R> CommandOutcome<R> {
    pub fn applied(self) -> Option<R> {
        match self {
            Self::Applied(record) => Some(record),
            Self::AlreadyCompleted(_) => None,
        }
    }
}

/// Events a record's current state accepts under one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableEvents {
    pub machine: &'static str,
    pub state: &'static str,
    pub events: Vec<&'static str>,
}

pub struct RecordService<R: Record> {
    repository: CacheAsideRepository<R>,
    ledger: Arc<IdempotencyLedger>,
}

impl<R: Record> RecordService<R> {
    pub fn new(repository: CacheAsideRepository<R>, ledger: Arc<IdempotencyLedger>) -> Self {
        Self { repository, ledger }
    }

    pub fn repository(&self) -> &CacheAsideRepository<R> {
        &self.repository
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    pub async fn find_by_id(&self, id: i64) -> Result<R> {
        self.repository.find_by_id(id).await
    }

    pub async fn list(&self, page: PageRequest) -> Result<Page<R>> {
        self.repository.find_all(page).await
    }

    pub async fn search(&self, query: &RecordQuery) -> Result<Page<R>> {
        self.repository.search(query).await
    }

    pub async fn create(&self, record: R, key: Option<&str>) -> Result<CommandOutcome<R>> {
        let repository = self.repository.clone();
        let payload = record.clone();
        self.run_keyed(key, ChangeAction::Create, &payload, move || async move {
            repository.create(record).await
        })
        .await
    }

    pub async fn update(&self, id: i64, record: R, key: Option<&str>) -> Result<CommandOutcome<R>> {
        let repository = self.repository.clone();
        let mut payload = record.clone();
        payload.set_id(id);
        self.run_keyed(key, ChangeAction::Update, &payload, move || async move {
            repository.update(id, record).await
        })
        .await
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.repository.delete(id).await
    }

    pub async fn rebuild_index(&self) -> Result<usize> {
        self.repository.rebuild_index().await
    }

    /// Fire `event` at record `id` under machine `M`. An event that is unknown
    /// or not valid from the current state yields `Rejected` and leaves the
    /// record untouched.
    pub async fn fire<M>(&self, id: i64, event: &str) -> Result<WorkflowOutcome<R>>
    where
        M: StateMachine,
        R: Governed<M>,
    {
        let mut decision: Option<Decision<M>> = None;
        let (record, _) = self
            .repository
            .modify(id, |record| {
                let current = <R as Governed<M>>::lifecycle_code(record);
                let outcome = decide::<M>(current, event);
                let changed = match outcome {
                    Decision::Advance { to, .. } => {
                        <R as Governed<M>>::set_lifecycle_code(record, M::state_code(to));
                        true
                    }
                    Decision::Reject { .. } => false,
                };
                decision = Some(outcome);
                changed
            })
            .await?;

        match decision {
            Some(Decision::Advance { from, to }) => {
                let (from, to) = (M::state_code(from), M::state_code(to));
                tracing::info!(machine = M::NAME, kind = %R::KIND, id, event, from, to, "transition applied");
                Ok(WorkflowOutcome::Applied { record, from, to })
            }
            Some(Decision::Reject { from }) => {
                let state = M::state_code(from);
                tracing::info!(machine = M::NAME, kind = %R::KIND, id, event, state, "transition rejected");
                Ok(WorkflowOutcome::Rejected {
                    record,
                    state,
                    event: event.to_string(),
                })
            }
            None => Err(TrafficError::Infrastructure(anyhow!(
                "{} produced no decision for {} {id}",
                M::NAME,
                R::KIND
            ))),
        }
    }

    pub async fn available_events<M>(&self, id: i64) -> Result<AvailableEvents>
    where
        M: StateMachine,
        R: Governed<M>,
    {
        let record = self.repository.find_by_id(id).await?;
        let state = M::resolve(<R as Governed<M>>::lifecycle_code(&record));
        Ok(AvailableEvents {
            machine: M::NAME,
            state: M::state_code(state),
            events: M::available_events(state)
                .into_iter()
                .map(M::event_name)
                .collect(),
        })
    }

    /// Gate `mutation` behind the idempotency ledger when a key is supplied.
    /// Without a key the mutation runs directly and nothing is recorded.
    async fn run_keyed<F, Fut>(
        &self,
        key: Option<&str>,
        action: ChangeAction,
        payload: &R,
        mutation: F,
    ) -> Result<CommandOutcome<R>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let Some(key) = key else {
            return mutation().await.map(CommandOutcome::Applied);
        };

        if self.ledger.should_skip_processing(key).await? {
            if let Some(done) = self.ledger.find(key).await? {
                tracing::info!(key, kind = %R::KIND, "command already completed, skipping");
                return Ok(CommandOutcome::AlreadyCompleted(done));
            }
        }

        match self
            .ledger
            .check_and_insert(key, payload, R::KIND, action)
            .await
        {
            Ok(()) => {}
            Err(TrafficError::DuplicateRequest {
                disposition: Disposition::Completed,
                ..
            }) => {
                if let Some(done) = self.ledger.find(key).await? {
                    return Ok(CommandOutcome::AlreadyCompleted(done));
                }
                return Err(TrafficError::NotFound(format!("idempotency key {key}")));
            }
            Err(e) => return Err(e),
        }

        match mutation().await {
            Ok(record) => {
                // Already committed: report success even if the ledger write fails.
                if let Err(e) = self.ledger.mark_success(key, record.id()).await {
                    tracing::error!(key, error = %e, "failed to mark command completed");
                }
                Ok(CommandOutcome::Applied(record))
            }
            Err(e) => {
                let recorded = if e.is_retryable() {
                    self.ledger.release(key, &e.to_string()).await
                } else {
                    self.ledger.mark_failure(key, &e.to_string()).await
                };
                if let Err(ledger_err) = recorded {
                    tracing::error!(key, error = %ledger_err, "failed to record command outcome");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::future::join_all;

    use crate::ledger::DEFAULT_CLAIM_LEASE;
    use crate::memory::{MemoryBus, MemoryIndex, MemoryLedger, MemoryStore};
    use crate::ports::{BusinessStatus, LedgerStore};
    use crate::publisher::ChangePublisher;
    use crate::records::{AppealRecord, OffenseRecord};
    use crate::types::EntityKind;
    use crate::workflow::{AppealAcceptance, AppealProcess, OffenseProcess};

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger_store: Arc<MemoryLedger>,
        bus: Arc<MemoryBus>,
        ledger: Arc<IdempotencyLedger>,
        index: Arc<MemoryIndex>,
    }

    impl Fixture {
        fn new() -> Self {
            let ledger_store = Arc::new(MemoryLedger::new());
            let bus = Arc::new(MemoryBus::new());
            let ledger = Arc::new(IdempotencyLedger::new(
                ledger_store.clone(),
                ChangePublisher::new(bus.clone()),
            ));
            Self {
                store: Arc::new(MemoryStore::new()),
                ledger_store,
                bus,
                ledger,
                index: Arc::new(MemoryIndex::new()),
            }
        }

        fn service<R: Record>(&self) -> RecordService<R> {
            RecordService::new(
                CacheAsideRepository::new(self.store.clone(), self.index.clone()),
                Arc::clone(&self.ledger),
            )
        }
    }

    fn offense() -> OffenseRecord {
        OffenseRecord {
            driver_id: Some(7),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn keyed_create_runs_once() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();

        let first = svc.create(offense(), Some("idem-1")).await.unwrap();
        let created = first.applied().unwrap();
        let second = svc.create(offense(), Some("idem-1")).await.unwrap();

        match second {
            CommandOutcome::AlreadyCompleted(rec) => {
                assert_eq!(rec.business_id, created.offense_id);
            }
            other => panic!("expected AlreadyCompleted, got {other:?}"),
        }
        assert_eq!(f.store.live_count(EntityKind::Offense), 1);
        assert_eq!(f.bus.published().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_key_creates_once() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();

        let results = join_all((0..8).map(|_| svc.create(offense(), Some("race")))).await;

        let mut applied = 0;
        for result in results {
            match result {
                Ok(CommandOutcome::Applied(_)) => applied += 1,
                Ok(CommandOutcome::AlreadyCompleted(_)) => {}
                Err(e) => assert!(
                    matches!(e.http_status(), 409 | 208),
                    "unexpected error: {e}"
                ),
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(f.store.live_count(EntityKind::Offense), 1);
        assert_eq!(f.bus.published().len(), 1);
    }

    #[tokio::test]
    async fn unkeyed_create_is_not_deduplicated() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();
        svc.create(offense(), None).await.unwrap();
        svc.create(offense(), None).await.unwrap();

        assert_eq!(f.store.live_count(EntityKind::Offense), 2);
        assert!(f.bus.published().is_empty());
    }

    #[tokio::test]
    async fn rejected_mutation_fails_key_terminally() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();
        let bad = OffenseRecord {
            driver_id: Some(-1),
            ..Default::default()
        };
        assert_eq!(
            svc.create(bad.clone(), Some("bad")).await.unwrap_err().http_status(),
            400
        );
        let rec = f.ledger_store.find("bad").await.unwrap().unwrap();
        assert_eq!(rec.business_status, BusinessStatus::Failed);

        let err = svc.create(bad, Some("bad")).await.unwrap_err();
        assert!(matches!(
            err,
            TrafficError::DuplicateRequest {
                disposition: Disposition::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn infrastructure_failure_releases_key() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();
        f.store.fail_next_commit();

        let err = svc.create(offense(), Some("retry-me")).await.unwrap_err();
        assert!(err.is_retryable());
        let rec = f.ledger_store.find("retry-me").await.unwrap().unwrap();
        assert!(rec.is_reclaimable(Utc::now(), DEFAULT_CLAIM_LEASE));

        let outcome = svc.create(offense(), Some("retry-me")).await.unwrap();
        assert!(outcome.applied().is_some());
        assert_eq!(f.store.live_count(EntityKind::Offense), 1);
        let rec = f.ledger_store.find("retry-me").await.unwrap().unwrap();
        assert!(rec.is_completed());
    }

    #[tokio::test]
    async fn keyed_update_records_business_id() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();
        let created = svc.create(offense(), None).await.unwrap().applied().unwrap();
        let id = created.offense_id.unwrap();

        let mut changed = created.clone();
        changed.remarks = Some("corrected plate".into());
        svc.update(id, changed, Some("upd-1")).await.unwrap();

        let rec = f.ledger_store.find("upd-1").await.unwrap().unwrap();
        assert_eq!(rec.business_id, Some(id));
        assert_eq!(rec.action.as_deref(), Some("update"));
        assert_eq!(f.bus.published()[0].channel, "offense_record_update");
    }

    #[tokio::test]
    async fn fire_applies_then_rejects_repeat() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();
        let id = svc
            .create(offense(), None)
            .await
            .unwrap()
            .applied()
            .unwrap()
            .offense_id
            .unwrap();

        let outcome = svc.fire::<OffenseProcess>(id, "START_PROCESSING").await.unwrap();
        assert!(matches!(
            outcome,
            WorkflowOutcome::Applied {
                from: "Unprocessed",
                to: "Processing",
                ..
            }
        ));
        assert_eq!(
            svc.find_by_id(id).await.unwrap().process_status.as_deref(),
            Some("Processing")
        );

        let repeat = svc.fire::<OffenseProcess>(id, "START_PROCESSING").await.unwrap();
        assert!(!repeat.is_applied());
        assert_eq!(repeat.into_result().unwrap_err().http_status(), 409);
    }

    #[tokio::test]
    async fn fire_unknown_event_leaves_status() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();
        let id = svc
            .create(offense(), None)
            .await
            .unwrap()
            .applied()
            .unwrap()
            .offense_id
            .unwrap();

        let outcome = svc.fire::<OffenseProcess>(id, "APPROVE").await.unwrap();
        match outcome {
            WorkflowOutcome::Rejected { state, event, .. } => {
                assert_eq!(state, "Unprocessed");
                assert_eq!(event, "APPROVE");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(
            svc.find_by_id(id).await.unwrap().process_status.as_deref(),
            Some("Unprocessed")
        );
    }

    #[tokio::test]
    async fn fire_on_missing_record_is_not_found() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();
        let err = svc
            .fire::<OffenseProcess>(404, "START_PROCESSING")
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn appeal_machines_are_independent() {
        let f = Fixture::new();
        let svc = f.service::<AppealRecord>();
        let id = svc
            .create(
                AppealRecord {
                    offense_id: Some(1),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap()
            .applied()
            .unwrap()
            .appeal_id
            .unwrap();

        svc.fire::<AppealAcceptance>(id, "ACCEPT").await.unwrap();
        let record = svc.find_by_id(id).await.unwrap();
        assert_eq!(record.acceptance_status.as_deref(), Some("Accepted"));
        assert_eq!(record.process_status.as_deref(), Some("Unprocessed"));

        let events = svc.available_events::<AppealProcess>(id).await.unwrap();
        assert_eq!(events.state, "Unprocessed");
        assert!(!events.events.is_empty());
    }

    #[tokio::test]
    async fn available_events_follow_state() {
        let f = Fixture::new();
        let svc = f.service::<OffenseRecord>();
        let id = svc
            .create(offense(), None)
            .await
            .unwrap()
            .applied()
            .unwrap()
            .offense_id
            .unwrap();

        let events = svc.available_events::<OffenseProcess>(id).await.unwrap();
        assert_eq!(events.machine, "OffenseProcess");
        assert_eq!(events.events, vec!["START_PROCESSING", "CANCEL"]);
    }
}
