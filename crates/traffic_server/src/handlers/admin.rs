use std::sync::Arc;

use axum::{Extension, Json};
use serde_json::{json, Value};
use traffic_core::records::Record;
use traffic_core::RecordService;

use crate::error::AppError;

/// POST /api/admin/reindex/{resource}: drop the kind's index documents and
/// rebuild them from the primary store.
pub async fn reindex<R: Record>(
    Extension(service): Extension<Arc<RecordService<R>>>,
) -> Result<Json<Value>, AppError> {
    let indexed = service.rebuild_index().await?;
    Ok(Json(json!({ "kind": R::KIND, "indexed": indexed })))
}
