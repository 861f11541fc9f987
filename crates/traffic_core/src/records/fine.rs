use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{default_code, non_negative_amount, positive_if_present, Record};
use crate::error::TrafficError;
use crate::types::{EntityKind, MatchMode, SearchField};
use crate::workflow::{PaymentLifecycle, StateMachine};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FineRecord {
    pub fine_id: Option<i64>,
    pub offense_id: Option<i64>,
    pub fine_number: Option<String>,
    pub fine_amount: Option<Decimal>,
    pub late_fee: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    pub fine_date: Option<NaiveDate>,
    pub payment_deadline: Option<NaiveDate>,
    pub issuing_authority: Option<String>,
    pub handler: Option<String>,
    pub approver: Option<String>,
    pub payment_status: Option<String>,
    pub paid_amount: Option<Decimal>,
    pub unpaid_amount: Option<Decimal>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub deleted_at: Option<NaiveDateTime>,
    pub remarks: Option<String>,
}

impl Record for FineRecord {
    const KIND: EntityKind = EntityKind::Fine;

    const SEARCH_FIELDS: &'static [SearchField] = &[
        SearchField::new("fineNumber", MatchMode::Prefix),
        SearchField::new("offenseId", MatchMode::Exact),
        SearchField::new("paymentStatus", MatchMode::Exact),
        SearchField::new("issuingAuthority", MatchMode::Fuzzy),
        SearchField::new("handler", MatchMode::Fuzzy),
    ];

    fn id(&self) -> Option<i64> {
        self.fine_id
    }

    fn set_id(&mut self, id: i64) {
        self.fine_id = Some(id);
    }

    fn status_code(&self) -> Option<&str> {
        self.payment_status.as_deref()
    }

    fn prepare(&mut self, now: NaiveDateTime) -> Result<(), TrafficError> {
        positive_if_present(self.offense_id, "Offense ID")?;
        non_negative_amount(self.fine_amount, "Fine amount")?;
        non_negative_amount(self.late_fee, "Late fee")?;
        non_negative_amount(self.paid_amount, "Paid amount")?;
        if self.total_amount.is_none() {
            if let Some(amount) = self.fine_amount {
                self.total_amount = Some(amount + self.late_fee.unwrap_or_default());
            }
        }
        self.fine_date.get_or_insert(now.date());
        default_code(
            &mut self.payment_status,
            PaymentLifecycle::state_code(PaymentLifecycle::INITIAL),
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
