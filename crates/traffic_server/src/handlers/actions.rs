//! Action registry endpoint.
//!
//! GET  /api/actions                  : registered (service, action) pairs
//! POST /api/actions/:service/:action : dispatch with a JSON argument object

use std::sync::Arc;

use axum::{extract::Path, Extension, Json};
use serde_json::{json, Value};
use traffic_core::ActionRegistry;

use crate::error::AppError;

pub async fn list_actions(Extension(registry): Extension<Arc<ActionRegistry>>) -> Json<Value> {
    let actions: Vec<Value> = registry
        .list()
        .into_iter()
        .map(|(service, action)| json!({ "service": service, "action": action }))
        .collect();
    Json(json!({ "actions": actions }))
}

pub async fn invoke_action(
    Extension(registry): Extension<Arc<ActionRegistry>>,
    Path((service, action)): Path<(String, String)>,
    Json(args): Json<Value>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(registry.dispatch(&service, &action, args).await?))
}
