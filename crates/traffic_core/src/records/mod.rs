//! Governed business records.
//!
//! Every kind is a plain serde struct; the [`Record`] trait is the single seam
//! the generic ledger, synchronizer and workflow driver work through, so no
//! per-kind repository or mapper exists anywhere in the crate.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::TrafficError;
use crate::types::{EntityKind, SearchField};

mod appeal;
mod deduction;
mod fine;
mod offense;
mod payment;

pub use appeal::AppealRecord;
pub use deduction::DeductionRecord;
pub use fine::FineRecord;
pub use offense::OffenseRecord;
pub use payment::PaymentRecord;

pub trait Record:
    Serialize + DeserializeOwned + Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static
{
    const KIND: EntityKind;

    /// Fields exposed for filtered search, with their match mode.
    const SEARCH_FIELDS: &'static [SearchField];

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    /// Primary lifecycle status code, mirrored into the store's `status` column.
    fn status_code(&self) -> Option<&str>;

    /// Validate the record and fill defaults (event time, initial status).
    fn prepare(&mut self, now: NaiveDateTime) -> Result<(), TrafficError>;

    fn stamp_created(&mut self, at: NaiveDateTime);

    fn stamp_updated(&mut self, at: NaiveDateTime);

    fn search_field(name: &str) -> Option<&'static SearchField> {
        Self::SEARCH_FIELDS.iter().find(|f| f.name == name)
    }
}

/// Searchable fields of a kind, for callers that only hold an [`EntityKind`].
pub fn search_fields(kind: EntityKind) -> &'static [SearchField] {
    match kind {
        EntityKind::Offense => OffenseRecord::SEARCH_FIELDS,
        EntityKind::Fine => FineRecord::SEARCH_FIELDS,
        EntityKind::Payment => PaymentRecord::SEARCH_FIELDS,
        EntityKind::Appeal => AppealRecord::SEARCH_FIELDS,
        EntityKind::Deduction => DeductionRecord::SEARCH_FIELDS,
    }
}

// ── Validation helpers ───────────────────────────────────────

pub(crate) fn require_positive(value: Option<i64>, label: &str) -> Result<(), TrafficError> {
    match value {
        Some(v) if v > 0 => Ok(()),
        _ => Err(TrafficError::validation(format!(
            "{label} must be greater than zero"
        ))),
    }
}

pub(crate) fn positive_if_present(value: Option<i64>, label: &str) -> Result<(), TrafficError> {
    match value {
        None => Ok(()),
        some => require_positive(some, label),
    }
}

pub(crate) fn non_negative_amount(
    value: Option<Decimal>,
    label: &str,
) -> Result<(), TrafficError> {
    match value {
        Some(v) if v.is_sign_negative() && !v.is_zero() => Err(TrafficError::validation(
            format!("{label} must not be negative"),
        )),
        _ => Ok(()),
    }
}

pub(crate) fn non_negative_count(value: Option<i32>, label: &str) -> Result<(), TrafficError> {
    match value {
        Some(v) if v < 0 => Err(TrafficError::validation(format!(
            "{label} must not be negative"
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn default_code(slot: &mut Option<String>, code: &str) {
    if slot.as_deref().map_or(true, |s| s.trim().is_empty()) {
        *slot = Some(code.to_string());
    }
}
