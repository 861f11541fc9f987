//! Router construction for the traffic records server.

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use traffic_core::records::{
    AppealRecord, DeductionRecord, FineRecord, OffenseRecord, PaymentRecord, Record,
};
use traffic_core::workflow::{
    AppealAcceptance, AppealProcess, DeductionLifecycle, OffenseProcess, PaymentLifecycle,
};

use crate::handlers::{self, health::StoreLabel};
use crate::state::AppState;

/// Build the full axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let records = Router::new()
        .merge(record_routes::<OffenseRecord>())
        .merge(record_routes::<FineRecord>())
        .merge(record_routes::<PaymentRecord>())
        .merge(record_routes::<AppealRecord>())
        .merge(record_routes::<DeductionRecord>());

    let workflow = Router::new()
        .route(
            "/api/workflow/offenses/:id/events/:event",
            post(handlers::workflow::fire::<OffenseProcess, OffenseRecord>),
        )
        .route(
            "/api/workflow/offenses/:id/events",
            get(handlers::workflow::events::<OffenseProcess, OffenseRecord>),
        )
        .route(
            "/api/workflow/payments/:id/events/:event",
            post(handlers::workflow::fire::<PaymentLifecycle, PaymentRecord>),
        )
        .route(
            "/api/workflow/payments/:id/events",
            get(handlers::workflow::events::<PaymentLifecycle, PaymentRecord>),
        )
        .route(
            "/api/workflow/fines/:id/events/:event",
            post(handlers::workflow::fire::<PaymentLifecycle, FineRecord>),
        )
        .route(
            "/api/workflow/fines/:id/events",
            get(handlers::workflow::events::<PaymentLifecycle, FineRecord>),
        )
        .route(
            "/api/workflow/appeals/:id/events/:event",
            post(handlers::workflow::fire::<AppealProcess, AppealRecord>),
        )
        .route(
            "/api/workflow/appeals/:id/events",
            get(handlers::workflow::events::<AppealProcess, AppealRecord>),
        )
        .route(
            "/api/workflow/appeals/:id/acceptance/events/:event",
            post(handlers::workflow::fire::<AppealAcceptance, AppealRecord>),
        )
        .route(
            "/api/workflow/appeals/:id/acceptance/events",
            get(handlers::workflow::events::<AppealAcceptance, AppealRecord>),
        )
        .route(
            "/api/workflow/deductions/:id/events/:event",
            post(handlers::workflow::fire::<DeductionLifecycle, DeductionRecord>),
        )
        .route(
            "/api/workflow/deductions/:id/events",
            get(handlers::workflow::events::<DeductionLifecycle, DeductionRecord>),
        );

    let support = Router::new()
        .route(
            "/api/request-history/:key",
            get(handlers::history::get_history),
        )
        .route("/api/actions", get(handlers::actions::list_actions))
        .route(
            "/api/actions/:service/:action",
            post(handlers::actions::invoke_action),
        )
        .route("/health", get(handlers::health::health));

    records
        .merge(workflow)
        .merge(support)
        .layer(Extension(state.offenses))
        .layer(Extension(state.fines))
        .layer(Extension(state.payments))
        .layer(Extension(state.appeals))
        .layer(Extension(state.deductions))
        .layer(Extension(state.ledger))
        .layer(Extension(state.registry))
        .layer(Extension(StoreLabel(state.store_label)))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// CRUD and reindex routes for one record kind.
fn record_routes<R: Record>() -> Router {
    let resource = R::KIND.resource();
    Router::new()
        .route(
            &format!("/api/{resource}"),
            get(handlers::records::list::<R>).post(handlers::records::create::<R>),
        )
        .route(
            &format!("/api/{resource}/:id"),
            get(handlers::records::get::<R>)
                .put(handlers::records::update::<R>)
                .delete(handlers::records::delete::<R>),
        )
        .route(
            &format!("/api/admin/reindex/{resource}"),
            post(handlers::admin::reindex::<R>),
        )
}
