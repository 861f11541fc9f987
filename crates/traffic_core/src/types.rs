//! Core value types shared by every port and engine in the crate.
//! Pure values: no store, index or bus dependencies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::error::TrafficError;

// ── Entity kinds ─────────────────────────────────────────────

/// Governed record kinds. Each kind owns one primary-store table, one index
/// collection and one bus channel per action.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
    Offense,
    Fine,
    Payment,
    Appeal,
    Deduction,
}

impl EntityKind {
    /// Plural path segment used by the REST surface.
    pub fn resource(&self) -> &'static str {
        match self {
            Self::Offense => "offenses",
            Self::Fine => "fines",
            Self::Payment => "payments",
            Self::Appeal => "appeals",
            Self::Deduction => "deductions",
        }
    }

    pub fn from_resource(resource: &str) -> Option<Self> {
        Self::iter().find(|k| k.resource() == resource)
    }

    /// Table and channel stem, e.g. `payment_record`.
    pub fn record_name(&self) -> &'static str {
        match self {
            Self::Offense => "offense_record",
            Self::Fine => "fine_record",
            Self::Payment => "payment_record",
            Self::Appeal => "appeal_record",
            Self::Deduction => "deduction_record",
        }
    }

    /// Service name under which the kind's actions are registered.
    pub fn service_name(&self) -> &'static str {
        match self {
            Self::Offense => "OffenseRecordService",
            Self::Fine => "FineRecordService",
            Self::Payment => "PaymentRecordService",
            Self::Appeal => "AppealRecordService",
            Self::Deduction => "DeductionRecordService",
        }
    }
}

/// Mutation carried by a keyed command and named in its bus channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

// ── Pagination ───────────────────────────────────────────────

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// 1-based page request. Construct through [`PageRequest::new`] so that
/// malformed pagination is rejected before any store is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: i64, size: i64) -> Result<Self, TrafficError> {
        if page < 1 {
            return Err(TrafficError::validation("Page must be greater than zero"));
        }
        if size < 1 {
            return Err(TrafficError::validation("Size must be greater than zero"));
        }
        if size > i64::from(MAX_PAGE_SIZE) {
            return Err(TrafficError::validation(format!(
                "Size must not exceed {MAX_PAGE_SIZE}"
            )));
        }
        let page = u32::try_from(page)
            .map_err(|_| TrafficError::validation("Page is out of range"))?;
        let size = u32::try_from(size)
            .map_err(|_| TrafficError::validation("Size is out of range"))?;
        // The row offset must be addressable by every store (i64 in SQL).
        u64::from(page - 1)
            .checked_mul(u64::from(size))
            .and_then(|offset| i64::try_from(offset).ok())
            .ok_or_else(|| TrafficError::validation("Page is out of range"))?;
        Ok(Self { page, size })
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize).saturating_mul(self.size as usize)
    }

    pub fn limit(&self) -> usize {
        self.size as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: u64) -> Self {
        Self {
            items,
            page: request.page,
            size: request.size,
            total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ── Search fields and filters ────────────────────────────────

/// How a searchable field is matched, both in the index and in the
/// primary-store fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Whole-value, case-insensitive equality (ids, status codes).
    Exact,
    /// Case-insensitive leading match (numbers, id cards).
    Prefix,
    /// Case-insensitive substring match (names, places, free text).
    Fuzzy,
}

/// A field a record kind exposes for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchField {
    /// JSON key of the field in the record's serialized form.
    pub name: &'static str,
    pub mode: MatchMode,
}

impl SearchField {
    pub const fn new(name: &'static str, mode: MatchMode) -> Self {
        Self { name, mode }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub value: String,
    pub mode: MatchMode,
}

impl FieldFilter {
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.to_lowercase();
        let wanted = self.value.trim().to_lowercase();
        match self.mode {
            MatchMode::Exact => candidate == wanted,
            MatchMode::Prefix => candidate.starts_with(&wanted),
            MatchMode::Fuzzy => candidate.contains(&wanted),
        }
    }
}

/// Filtered, paginated read against one record kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordQuery {
    pub filters: Vec<FieldFilter>,
    pub page: PageRequest,
}

impl RecordQuery {
    pub fn all(page: PageRequest) -> Self {
        Self {
            filters: Vec::new(),
            page,
        }
    }

    pub fn with_filter(mut self, field: &SearchField, value: impl Into<String>) -> Self {
        self.filters.push(FieldFilter {
            field: field.name.to_string(),
            value: value.into(),
            mode: field.mode,
        });
        self
    }

    /// True when every filter matches the corresponding field of `body`.
    pub fn matches_body(&self, body: &Value) -> bool {
        self.filters.iter().all(|f| {
            field_text(body, &f.field)
                .map(|v| f.matches(&v))
                .unwrap_or(false)
        })
    }
}

/// Text form of a top-level JSON field, used for filtering and indexing.
pub fn field_text(body: &Value, field: &str) -> Option<String> {
    match body.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Cut `input` to at most `max` characters without splitting a code point.
pub fn truncate_chars(input: &str, max: usize) -> String {
    match input.char_indices().nth(max) {
        Some((idx, _)) => input[..idx].to_string(),
        None => input.to_string(),
    }
}
