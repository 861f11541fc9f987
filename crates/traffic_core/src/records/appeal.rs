use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{default_code, require_positive, Record};
use crate::error::TrafficError;
use crate::types::{EntityKind, MatchMode, SearchField};
use crate::workflow::{AppealAcceptance, AppealProcess, StateMachine};

/// An appeal against an offense. Carries two independent lifecycles:
/// acceptance (`acceptanceStatus`) and review (`processStatus`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppealRecord {
    pub appeal_id: Option<i64>,
    pub offense_id: Option<i64>,
    pub appeal_number: Option<String>,
    pub appellant_name: Option<String>,
    pub appellant_id_card: Option<String>,
    pub appellant_contact: Option<String>,
    pub appellant_email: Option<String>,
    pub appellant_address: Option<String>,
    pub appeal_type: Option<String>,
    pub appeal_reason: Option<String>,
    pub appeal_time: Option<NaiveDateTime>,
    pub evidence_description: Option<String>,
    pub evidence_urls: Option<String>,
    pub acceptance_status: Option<String>,
    pub acceptance_time: Option<NaiveDateTime>,
    pub acceptance_handler: Option<String>,
    pub rejection_reason: Option<String>,
    pub process_status: Option<String>,
    pub process_time: Option<NaiveDateTime>,
    pub process_result: Option<String>,
    pub process_handler: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub deleted_at: Option<NaiveDateTime>,
    pub remarks: Option<String>,
}

impl Record for AppealRecord {
    const KIND: EntityKind = EntityKind::Appeal;

    const SEARCH_FIELDS: &'static [SearchField] = &[
        SearchField::new("appealNumber", MatchMode::Prefix),
        SearchField::new("offenseId", MatchMode::Exact),
        SearchField::new("processStatus", MatchMode::Exact),
        SearchField::new("acceptanceStatus", MatchMode::Exact),
        SearchField::new("appellantIdCard", MatchMode::Prefix),
        SearchField::new("appellantName", MatchMode::Fuzzy),
        SearchField::new("appealReason", MatchMode::Fuzzy),
    ];

    fn id(&self) -> Option<i64> {
        self.appeal_id
    }

    fn set_id(&mut self, id: i64) {
        self.appeal_id = Some(id);
    }

    fn status_code(&self) -> Option<&str> {
        self.process_status.as_deref()
    }

    fn prepare(&mut self, now: NaiveDateTime) -> Result<(), TrafficError> {
        require_positive(self.offense_id, "Offense ID")?;
        self.appeal_time.get_or_insert(now);
        default_code(
            &mut self.process_status,
            AppealProcess::state_code(AppealProcess::INITIAL),
        );
        default_code(
            &mut self.acceptance_status,
            AppealAcceptance::state_code(AppealAcceptance::INITIAL),
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
