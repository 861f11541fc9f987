//! Record CRUD handlers, generic over the record kind.
//!
//! POST   /api/{resource}      : create (optional Idempotency-Key header)
//! GET    /api/{resource}      : filtered page (page, size, searchable fields)
//! GET    /api/{resource}/:id  : fetch one
//! PUT    /api/{resource}/:id  : replace (optional Idempotency-Key header)
//! DELETE /api/{resource}/:id  : soft delete

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use serde_json::json;
use traffic_core::records::Record;
use traffic_core::types::{DEFAULT_PAGE, DEFAULT_PAGE_SIZE};
use traffic_core::{CommandOutcome, Page, PageRequest, RecordQuery, RecordService, TrafficError};

use crate::error::AppError;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

pub async fn create<R: Record>(
    Extension(service): Extension<Arc<RecordService<R>>>,
    headers: HeaderMap,
    Json(record): Json<R>,
) -> Result<Response, AppError> {
    let key = idempotency_key(&headers)?;
    let outcome = service.create(record, key.as_deref()).await?;
    Ok(command_response(outcome, StatusCode::CREATED))
}

pub async fn update<R: Record>(
    Extension(service): Extension<Arc<RecordService<R>>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(record): Json<R>,
) -> Result<Response, AppError> {
    let key = idempotency_key(&headers)?;
    let outcome = service.update(id, record, key.as_deref()).await?;
    Ok(command_response(outcome, StatusCode::OK))
}

pub async fn get<R: Record>(
    Extension(service): Extension<Arc<RecordService<R>>>,
    Path(id): Path<i64>,
) -> Result<Json<R>, AppError> {
    Ok(Json(service.find_by_id(id).await?))
}

pub async fn list<R: Record>(
    Extension(service): Extension<Arc<RecordService<R>>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Page<R>>, AppError> {
    let query = record_query::<R>(&params)?;
    Ok(Json(service.search(&query).await?))
}

pub async fn delete<R: Record>(
    Extension(service): Extension<Arc<RecordService<R>>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    service.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, TrafficError> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|value| {
            value
                .to_str()
                .map(str::to_string)
                .map_err(|_| TrafficError::validation("Idempotency-Key must be visible ASCII"))
        })
        .transpose()
}

fn command_response<R: Serialize>(outcome: CommandOutcome<R>, applied: StatusCode) -> Response {
    match outcome {
        CommandOutcome::Applied(record) => (applied, Json(record)).into_response(),
        CommandOutcome::AlreadyCompleted(done) => (
            StatusCode::ALREADY_REPORTED,
            Json(json!({
                "status": "ALREADY_COMPLETED",
                "idempotencyKey": done.idempotency_key,
                "businessId": done.business_id,
            })),
        )
            .into_response(),
    }
}

/// Pagination plus one filter per non-blank searchable field. Unknown
/// parameters are ignored.
fn record_query<R: Record>(params: &HashMap<String, String>) -> Result<RecordQuery, TrafficError> {
    let page = number_param(params, "page", "Page", DEFAULT_PAGE)?;
    let size = number_param(params, "size", "Size", DEFAULT_PAGE_SIZE)?;
    let mut query = RecordQuery::all(PageRequest::new(page, size)?);
    for field in R::SEARCH_FIELDS {
        if let Some(value) = non_blank(params, field.name) {
            query = query.with_filter(field, value);
        }
    }
    Ok(query)
}

fn number_param(
    params: &HashMap<String, String>,
    name: &str,
    label: &str,
    default: u32,
) -> Result<i64, TrafficError> {
    match non_blank(params, name) {
        None => Ok(i64::from(default)),
        Some(value) => value
            .parse()
            .map_err(|_| TrafficError::validation(format!("{label} must be a number"))),
    }
}

fn non_blank<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use traffic_core::records::OffenseRecord;
    use traffic_core::types::MatchMode;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_query_defaults() {
        let query = record_query::<OffenseRecord>(&params(&[])).unwrap();
        assert_eq!(query.page, PageRequest::default());
        assert!(query.filters.is_empty());
    }

    #[test]
    fn test_query_keeps_known_non_blank_fields() {
        let field = OffenseRecord::SEARCH_FIELDS[0];
        let query = record_query::<OffenseRecord>(&params(&[
            ("page", "2"),
            ("size", "5"),
            (field.name, " abc "),
            ("unknownField", "x"),
        ]))
        .unwrap();
        assert_eq!((query.page.page, query.page.size), (2, 5));
        assert_eq!(query.filters.len(), 1);
        assert_eq!(query.filters[0].field, field.name);
        assert_eq!(query.filters[0].value, "abc");
    }

    #[test]
    fn test_blank_filters_are_skipped() {
        let names: Vec<(&str, &str)> = OffenseRecord::SEARCH_FIELDS
            .iter()
            .map(|f| (f.name, "  "))
            .collect();
        let query = record_query::<OffenseRecord>(&params(&names)).unwrap();
        assert!(query.filters.is_empty());
    }

    #[test]
    fn test_bad_pagination_is_validation() {
        let err = record_query::<OffenseRecord>(&params(&[("page", "zero")])).unwrap_err();
        assert_eq!(err.http_status(), 400);
        let err = record_query::<OffenseRecord>(&params(&[("size", "0")])).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_filter_mode_follows_field() {
        let fuzzy = OffenseRecord::SEARCH_FIELDS
            .iter()
            .find(|f| f.mode == MatchMode::Fuzzy)
            .unwrap();
        let query = record_query::<OffenseRecord>(&params(&[(fuzzy.name, "ring")])).unwrap();
        assert_eq!(query.filters[0].mode, MatchMode::Fuzzy);
    }
}
