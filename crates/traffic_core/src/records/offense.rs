use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{default_code, non_negative_amount, non_negative_count, positive_if_present, Record};
use crate::error::TrafficError;
use crate::types::{EntityKind, MatchMode, SearchField};
use crate::workflow::{OffenseProcess, StateMachine};

/// A recorded traffic offense and its processing lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffenseRecord {
    pub offense_id: Option<i64>,
    pub offense_code: Option<String>,
    pub offense_number: Option<String>,
    pub offense_time: Option<NaiveDateTime>,
    pub offense_location: Option<String>,
    pub offense_province: Option<String>,
    pub offense_city: Option<String>,
    pub driver_id: Option<i64>,
    pub vehicle_id: Option<i64>,
    pub offense_description: Option<String>,
    pub evidence_type: Option<String>,
    pub evidence_urls: Option<String>,
    pub enforcement_agency: Option<String>,
    pub enforcement_officer: Option<String>,
    pub enforcement_device: Option<String>,
    pub process_status: Option<String>,
    pub notification_status: Option<String>,
    pub notification_time: Option<NaiveDateTime>,
    pub fine_amount: Option<Decimal>,
    pub deducted_points: Option<i32>,
    pub detention_days: Option<i32>,
    pub process_time: Option<NaiveDateTime>,
    pub process_handler: Option<String>,
    pub process_result: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub deleted_at: Option<NaiveDateTime>,
    pub remarks: Option<String>,
}

impl Record for OffenseRecord {
    const KIND: EntityKind = EntityKind::Offense;

    const SEARCH_FIELDS: &'static [SearchField] = &[
        SearchField::new("offenseNumber", MatchMode::Prefix),
        SearchField::new("offenseCode", MatchMode::Exact),
        SearchField::new("driverId", MatchMode::Exact),
        SearchField::new("vehicleId", MatchMode::Exact),
        SearchField::new("processStatus", MatchMode::Exact),
        SearchField::new("offenseLocation", MatchMode::Fuzzy),
        SearchField::new("offenseDescription", MatchMode::Fuzzy),
        SearchField::new("enforcementAgency", MatchMode::Fuzzy),
    ];

    fn id(&self) -> Option<i64> {
        self.offense_id
    }

    fn set_id(&mut self, id: i64) {
        self.offense_id = Some(id);
    }

    fn status_code(&self) -> Option<&str> {
        self.process_status.as_deref()
    }

    fn prepare(&mut self, now: NaiveDateTime) -> Result<(), TrafficError> {
        positive_if_present(self.driver_id, "Driver ID")?;
        positive_if_present(self.vehicle_id, "Vehicle ID")?;
        non_negative_amount(self.fine_amount, "Fine amount")?;
        non_negative_count(self.deducted_points, "Deducted points")?;
        non_negative_count(self.detention_days, "Detention days")?;
        self.offense_time.get_or_insert(now);
        default_code(
            &mut self.process_status,
            OffenseProcess::state_code(OffenseProcess::INITIAL),
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
