//! Record ↔ secondary index document mapping.
//!
//! One generic mapping serves every record kind: the full record travels in
//! `body`, and the kind's search fields are flattened into `fields` for the
//! index to match on. Both directions are total over `Option`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::records::Record;
use crate::types::{field_text, EntityKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub kind: EntityKind,
    pub id: i64,
    /// Search field name → text value, only for fields that are set.
    pub fields: BTreeMap<String, String>,
    pub body: Value,
}

/// Map a record to its index document. `None` in, `None` out. A record
/// that has not been assigned an id yet has no document either.
pub fn to_document<R: Record>(record: Option<&R>) -> Option<SearchDocument> {
    let record = record?;
    let id = record.id()?;
    let body = match serde_json::to_value(record) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(kind = %R::KIND, id, error = %e, "record did not serialize for indexing");
            return None;
        }
    };
    let fields = R::SEARCH_FIELDS
        .iter()
        .filter_map(|f| field_text(&body, f.name).map(|v| (f.name.to_string(), v)))
        .collect();
    Some(SearchDocument {
        kind: R::KIND,
        id,
        fields,
        body,
    })
}

/// Map an index document back to a record. A document of another kind or
/// one that no longer decodes is treated as absent.
pub fn from_document<R: Record>(document: Option<&SearchDocument>) -> Option<R> {
    let document = document?;
    if document.kind != R::KIND {
        return None;
    }
    match serde_json::from_value::<R>(document.body.clone()) {
        Ok(mut record) => {
            record.set_id(document.id);
            Some(record)
        }
        Err(e) => {
            tracing::warn!(
                kind = %R::KIND,
                id = document.id,
                error = %e,
                "stale index document ignored"
            );
            None
        }
    }
}
