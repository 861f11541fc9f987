//! Wiring of port implementations into per-kind services.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use traffic_core::memory::{MemoryBus, MemoryLedger, MemoryStore};
use traffic_core::ports::{LedgerStore, MessageBus, OutboxStore, PrimaryStore, SearchIndex};
use traffic_core::records::{
    AppealRecord, DeductionRecord, FineRecord, OffenseRecord, PaymentRecord, Record,
};
use traffic_core::registry::{register_record_actions, register_workflow};
use traffic_core::workflow::{
    AppealAcceptance, AppealProcess, DeductionLifecycle, OffenseProcess, PaymentLifecycle,
};
use traffic_core::{
    ActionRegistry, CacheAsideRepository, ChangePublisher, IdempotencyLedger, RecordService,
};
use traffic_postgres::PgStores;
use traffic_search::TantivySearchIndex;

/// One implementation per port. The outbox is the delivery side of `bus`.
pub struct Backends {
    pub store: Arc<dyn PrimaryStore>,
    pub index: Arc<dyn SearchIndex>,
    pub ledger: Arc<dyn LedgerStore>,
    pub bus: Arc<dyn MessageBus>,
    pub outbox: Arc<dyn OutboxStore>,
    /// Reported by `/health`.
    pub store_label: &'static str,
}

impl Backends {
    /// Everything in process: no database required.
    pub fn in_memory() -> anyhow::Result<Self> {
        let bus = Arc::new(MemoryBus::new());
        Ok(Self {
            store: Arc::new(MemoryStore::new()),
            index: Arc::new(TantivySearchIndex::new()?),
            ledger: Arc::new(MemoryLedger::new()),
            bus: bus.clone(),
            outbox: bus,
            store_label: "memory",
        })
    }

    pub fn postgres(pool: PgPool) -> anyhow::Result<Self> {
        let stores = PgStores::new(pool);
        let outbox = Arc::new(stores.outbox);
        Ok(Self {
            store: Arc::new(stores.primary),
            index: Arc::new(TantivySearchIndex::new()?),
            ledger: Arc::new(stores.ledger),
            bus: outbox.clone(),
            outbox,
            store_label: "postgres",
        })
    }
}

/// Shared, cheaply clonable handles used by the router.
#[derive(Clone)]
pub struct AppState {
    pub offenses: Arc<RecordService<OffenseRecord>>,
    pub fines: Arc<RecordService<FineRecord>>,
    pub payments: Arc<RecordService<PaymentRecord>>,
    pub appeals: Arc<RecordService<AppealRecord>>,
    pub deductions: Arc<RecordService<DeductionRecord>>,
    pub ledger: Arc<IdempotencyLedger>,
    pub registry: Arc<ActionRegistry>,
    pub store_label: &'static str,
}

impl AppState {
    pub fn new(backends: &Backends, claim_lease: Duration) -> Self {
        let ledger = Arc::new(
            IdempotencyLedger::new(
                Arc::clone(&backends.ledger),
                ChangePublisher::new(Arc::clone(&backends.bus)),
            )
            .with_claim_lease(claim_lease),
        );

        let offenses = service(backends, &ledger);
        let fines = service(backends, &ledger);
        let payments = service(backends, &ledger);
        let appeals = service(backends, &ledger);
        let deductions = service(backends, &ledger);

        let mut registry = ActionRegistry::new();
        register_record_actions(&mut registry, Arc::clone(&offenses));
        register_record_actions(&mut registry, Arc::clone(&fines));
        register_record_actions(&mut registry, Arc::clone(&payments));
        register_record_actions(&mut registry, Arc::clone(&appeals));
        register_record_actions(&mut registry, Arc::clone(&deductions));

        register_workflow::<OffenseProcess, _>(
            &mut registry,
            "OffenseProcessWorkflow",
            Arc::clone(&offenses),
        );
        register_workflow::<PaymentLifecycle, _>(
            &mut registry,
            "PaymentWorkflow",
            Arc::clone(&payments),
        );
        register_workflow::<PaymentLifecycle, _>(
            &mut registry,
            "FinePaymentWorkflow",
            Arc::clone(&fines),
        );
        register_workflow::<AppealProcess, _>(
            &mut registry,
            "AppealProcessWorkflow",
            Arc::clone(&appeals),
        );
        register_workflow::<AppealAcceptance, _>(
            &mut registry,
            "AppealAcceptanceWorkflow",
            Arc::clone(&appeals),
        );
        register_workflow::<DeductionLifecycle, _>(
            &mut registry,
            "DeductionWorkflow",
            Arc::clone(&deductions),
        );
        tracing::debug!(actions = registry.len(), "action registry built");

        Self {
            offenses,
            fines,
            payments,
            appeals,
            deductions,
            ledger,
            registry: Arc::new(registry),
            store_label: backends.store_label,
        }
    }
}

fn service<R: Record>(
    backends: &Backends,
    ledger: &Arc<IdempotencyLedger>,
) -> Arc<RecordService<R>> {
    Arc::new(RecordService::new(
        CacheAsideRepository::new(Arc::clone(&backends.store), Arc::clone(&backends.index)),
        Arc::clone(ledger),
    ))
}
