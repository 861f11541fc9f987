use std::sync::Arc;

use axum::{extract::Path, Extension, Json};
use traffic_core::ports::CommandRecord;
use traffic_core::{IdempotencyLedger, TrafficError};

use crate::error::AppError;

/// GET /api/request-history/:key
pub async fn get_history(
    Extension(ledger): Extension<Arc<IdempotencyLedger>>,
    Path(key): Path<String>,
) -> Result<Json<CommandRecord>, AppError> {
    let record = ledger
        .find(&key)
        .await?
        .ok_or_else(|| TrafficError::NotFound(format!("idempotency key {key}")))?;
    Ok(Json(record))
}
