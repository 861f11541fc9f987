//! Statically typed action registry.
//!
//! Handlers are registered at startup under a `(service, action)` pair and
//! receive their arguments already decoded into a typed struct. Dispatch by
//! name only ever reaches a handler that was registered explicitly.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TrafficError;
use crate::ports::Result;
use crate::records::Record;
use crate::service::RecordService;
use crate::types::{ChangeAction, PageRequest, DEFAULT_PAGE, DEFAULT_PAGE_SIZE};
use crate::workflow::{Governed, StateMachine};

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn invoke(&self, args: Value) -> Result<Value>;
}

struct TypedHandler<A, O, F> {
    handler: F,
    _types: PhantomData<fn(A) -> O>,
}

#[async_trait]
impl<A, O, F, Fut> ActionHandler for TypedHandler<A, O, F>
where
    A: DeserializeOwned + Send + 'static,
    O: Serialize + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    async fn invoke(&self, args: Value) -> Result<Value> {
        let args: A = serde_json::from_value(args)
            .map_err(|e| TrafficError::validation(format!("invalid arguments: {e}")))?;
        let output = (self.handler)(args).await?;
        Ok(serde_json::to_value(output)?)
    }
}

#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<(String, String), Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler. A later registration for the same pair
    /// replaces the earlier one.
    pub fn register<A, O, F, Fut>(&mut self, service: &str, action: &str, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let key = (service.to_string(), action.to_string());
        if self.handlers.contains_key(&key) {
            tracing::warn!(service, action, "action registration replaced");
        }
        self.handlers.insert(
            key,
            Arc::new(TypedHandler {
                handler,
                _types: PhantomData,
            }),
        );
    }

    pub fn has(&self, service: &str, action: &str) -> bool {
        self.handlers
            .contains_key(&(service.to_string(), action.to_string()))
    }

    pub async fn dispatch(&self, service: &str, action: &str, args: Value) -> Result<Value> {
        let handler = self
            .handlers
            .get(&(service.to_string(), action.to_string()))
            .cloned()
            .ok_or_else(|| TrafficError::NotFound(format!("action {service}#{action}")))?;
        tracing::debug!(service, action, "dispatching action");
        handler.invoke(args).await
    }

    /// Registered pairs, sorted by service then action.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self
            .handlers
            .keys()
            .map(|(s, a)| (s.as_str(), a.as_str()))
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Argument structs ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdArgs {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListArgs {
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound = "R: Record")]
pub struct ClaimArgs<R> {
    pub idempotency_key: String,
    pub payload: R,
    #[serde(default = "default_action")]
    pub action: ChangeAction,
}

fn default_action() -> ChangeAction {
    ChangeAction::Create
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound = "R: Record")]
pub struct CreateArgs<R> {
    pub record: R,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound = "R: Record")]
pub struct UpdateArgs<R> {
    pub id: i64,
    pub record: R,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FireArgs {
    pub id: i64,
    pub event: String,
}

// ── Bulk registration ─────────────────────────────────────────

/// Register the CRUD and ledger actions of one record kind under
/// `<Kind>RecordService`.
pub fn register_record_actions<R: Record>(
    registry: &mut ActionRegistry,
    service: Arc<RecordService<R>>,
) {
    let name = R::KIND.service_name();

    let svc = Arc::clone(&service);
    registry.register(name, "checkAndInsertIdempotency", move |args: ClaimArgs<R>| {
        let svc = Arc::clone(&svc);
        async move {
            let ledger = svc.ledger();
            ledger
                .check_and_insert(&args.idempotency_key, &args.payload, R::KIND, args.action)
                .await?;
            ledger.find(&args.idempotency_key).await
        }
    });

    let svc = Arc::clone(&service);
    registry.register(name, "findById", move |args: IdArgs| {
        let svc = Arc::clone(&svc);
        async move { svc.find_by_id(args.id).await }
    });

    let svc = Arc::clone(&service);
    registry.register(name, "list", move |args: ListArgs| {
        let svc = Arc::clone(&svc);
        async move {
            let page = PageRequest::new(
                args.page.unwrap_or(i64::from(DEFAULT_PAGE)),
                args.size.unwrap_or(i64::from(DEFAULT_PAGE_SIZE)),
            )?;
            svc.list(page).await
        }
    });

    let svc = Arc::clone(&service);
    registry.register(name, "create", move |args: CreateArgs<R>| {
        let svc = Arc::clone(&svc);
        async move {
            svc.create(args.record, args.idempotency_key.as_deref())
                .await
        }
    });

    let svc = Arc::clone(&service);
    registry.register(name, "update", move |args: UpdateArgs<R>| {
        let svc = Arc::clone(&svc);
        async move {
            svc.update(args.id, args.record, args.idempotency_key.as_deref())
                .await
        }
    });

    let svc = service;
    registry.register(name, "delete", move |args: IdArgs| {
        let svc = Arc::clone(&svc);
        async move {
            svc.delete(args.id).await?;
            Ok(json!({ "deleted": args.id }))
        }
    });
}

/// Register `fire` for machine `M` over record kind `R` under `service_name`.
pub fn register_workflow<M, R>(
    registry: &mut ActionRegistry,
    service_name: &str,
    service: Arc<RecordService<R>>,
) where
    M: StateMachine,
    R: Governed<M>,
{
    registry.register(service_name, "fire", move |args: FireArgs| {
        let svc = Arc::clone(&service);
        async move { svc.fire::<M>(args.id, &args.event).await }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_aside::CacheAsideRepository;
    use crate::ledger::IdempotencyLedger;
    use crate::memory::{MemoryBus, MemoryIndex, MemoryLedger, MemoryStore};
    use crate::publisher::ChangePublisher;
    use crate::records::OffenseRecord;
    use crate::workflow::OffenseProcess;

    fn offense_service() -> Arc<RecordService<OffenseRecord>> {
        let ledger = IdempotencyLedger::new(
            Arc::new(MemoryLedger::new()),
            ChangePublisher::new(Arc::new(MemoryBus::new())),
        );
        Arc::new(RecordService::new(
            CacheAsideRepository::new(Arc::new(MemoryStore::new()), Arc::new(MemoryIndex::new())),
            Arc::new(ledger),
        ))
    }

    fn registry() -> ActionRegistry {
        let svc = offense_service();
        let mut registry = ActionRegistry::new();
        register_record_actions(&mut registry, Arc::clone(&svc));
        register_workflow::<OffenseProcess, _>(&mut registry, "OffenseProcessWorkflow", svc);
        registry
    }

    #[test]
    fn lists_registered_pairs_sorted() {
        let registry = registry();
        assert_eq!(registry.len(), 7);
        let pairs = registry.list();
        assert_eq!(pairs[0], ("OffenseProcessWorkflow", "fire"));
        assert!(pairs.contains(&("OffenseRecordService", "checkAndInsertIdempotency")));
        assert!(registry.has("OffenseRecordService", "findById"));
    }

    #[tokio::test]
    async fn dispatches_typed_arguments() {
        let registry = registry();
        let created = registry
            .dispatch(
                "OffenseRecordService",
                "create",
                json!({ "record": { "driverId": 4 } }),
            )
            .await
            .unwrap();
        assert_eq!(created["outcome"], "applied");
        let id = created["value"]["offenseId"].as_i64().unwrap();

        let fired = registry
            .dispatch(
                "OffenseProcessWorkflow",
                "fire",
                json!({ "id": id, "event": "START_PROCESSING" }),
            )
            .await
            .unwrap();
        assert_eq!(fired["outcome"], "applied");
        assert_eq!(fired["record"]["processStatus"], "Processing");

        let found = registry
            .dispatch("OffenseRecordService", "findById", json!({ "id": id }))
            .await
            .unwrap();
        assert_eq!(found["driverId"], 4);
    }

    #[tokio::test]
    async fn unknown_pair_is_not_found() {
        let err = registry()
            .dispatch("VehicleService", "findById", json!({ "id": 1 }))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn bad_arguments_are_validation_errors() {
        let err = registry()
            .dispatch("OffenseRecordService", "findById", json!({ "id": "one" }))
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn claim_action_returns_ledger_record() {
        let registry = registry();
        let rec = registry
            .dispatch(
                "OffenseRecordService",
                "checkAndInsertIdempotency",
                json!({ "idempotencyKey": "abc", "payload": { "driverId": 1 } }),
            )
            .await
            .unwrap();
        assert_eq!(rec["idempotencyKey"], "abc");
        assert_eq!(rec["businessStatus"], "SUCCESS");
        assert_eq!(rec["phaseMarker"], "PENDING");
    }
}
