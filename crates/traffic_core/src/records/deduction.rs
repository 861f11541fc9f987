use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{default_code, non_negative_count, positive_if_present, Record};
use crate::error::TrafficError;
use crate::types::{EntityKind, MatchMode, SearchField};
use crate::workflow::{DeductionLifecycle, StateMachine};

/// Licence points deducted for an offense.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductionRecord {
    pub deduction_id: Option<i64>,
    pub offense_id: Option<i64>,
    pub driver_id: Option<i64>,
    pub deducted_points: Option<i32>,
    pub deduction_time: Option<NaiveDateTime>,
    pub scoring_cycle: Option<String>,
    pub handler: Option<String>,
    pub handler_dept: Option<String>,
    pub approver: Option<String>,
    pub approval_time: Option<NaiveDateTime>,
    pub status: Option<String>,
    pub restore_time: Option<NaiveDateTime>,
    pub restore_reason: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub deleted_at: Option<NaiveDateTime>,
    pub remarks: Option<String>,
}

impl Record for DeductionRecord {
    const KIND: EntityKind = EntityKind::Deduction;

    const SEARCH_FIELDS: &'static [SearchField] = &[
        SearchField::new("offenseId", MatchMode::Exact),
        SearchField::new("driverId", MatchMode::Exact),
        SearchField::new("status", MatchMode::Exact),
        SearchField::new("scoringCycle", MatchMode::Exact),
        SearchField::new("handler", MatchMode::Fuzzy),
    ];

    fn id(&self) -> Option<i64> {
        self.deduction_id
    }

    fn set_id(&mut self, id: i64) {
        self.deduction_id = Some(id);
    }

    fn status_code(&self) -> Option<&str> {
        self.status.as_deref()
    }

    fn prepare(&mut self, now: NaiveDateTime) -> Result<(), TrafficError> {
        positive_if_present(self.offense_id, "Offense ID")?;
        positive_if_present(self.driver_id, "Driver ID")?;
        non_negative_count(self.deducted_points, "Deducted points")?;
        self.deduction_time.get_or_insert(now);
        default_code(
            &mut self.status,
            DeductionLifecycle::state_code(DeductionLifecycle::INITIAL),
        );
        Ok(())
    }

    fn stamp_created(&mut self, at: NaiveDateTime) {
        self.created_at = Some(at);
        self.updated_at = Some(at);
    }

    fn stamp_updated(&mut self, at: NaiveDateTime) {
        self.updated_at = Some(at);
    }
}
