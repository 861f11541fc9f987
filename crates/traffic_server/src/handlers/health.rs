use axum::{Extension, Json};
use serde_json::{json, Value};

/// Which primary store backs the running server.
#[derive(Debug, Clone, Copy)]
pub struct StoreLabel(pub &'static str);

pub async fn health(Extension(StoreLabel(store)): Extension<StoreLabel>) -> Json<Value> {
    Json(json!({ "status": "ok", "store": store }))
}
