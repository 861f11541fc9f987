//! Lifecycle event handlers.
//!
//! A rejected event is a normal outcome: 409 with the record unchanged.

use std::sync::Arc;

use axum::{
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use traffic_core::workflow::{Governed, StateMachine};
use traffic_core::{AvailableEvents, RecordService};

use crate::error::AppError;

pub async fn fire<M, R>(
    Extension(service): Extension<Arc<RecordService<R>>>,
    Path((id, event)): Path<(i64, String)>,
) -> Result<Response, AppError>
where
    M: StateMachine,
    R: Governed<M>,
{
    let outcome = service.fire::<M>(id, &event).await?;
    let status = if outcome.is_applied() {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(outcome.into_record())).into_response())
}

pub async fn events<M, R>(
    Extension(service): Extension<Arc<RecordService<R>>>,
    Path(id): Path<i64>,
) -> Result<Json<AvailableEvents>, AppError>
where
    M: StateMachine,
    R: Governed<M>,
{
    Ok(Json(service.available_events::<M>(id).await?))
}
