use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{default_code, non_negative_amount, require_positive, Record};
use crate::error::TrafficError;
use crate::types::{EntityKind, MatchMode, SearchField};
use crate::workflow::{PaymentLifecycle, StateMachine};

/// A payment made against a fine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub payment_id: Option<i64>,
    pub fine_id: Option<i64>,
    pub payment_number: Option<String>,
    pub payment_amount: Option<Decimal>,
    pub payment_method: Option<String>,
    pub payment_time: Option<NaiveDateTime>,
    pub payment_channel: Option<String>,
    pub payer_name: Option<String>,
    pub payer_id_card: Option<String>,
    pub payer_contact: Option<String>,
    pub bank_name: Option<String>,
    pub bank_account: Option<String>,
    pub transaction_id: Option<String>,
    pub receipt_number: Option<String>,
    pub receipt_url: Option<String>,
    pub payment_status: Option<String>,
    pub refund_amount: Option<Decimal>,
    pub refund_time: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub deleted_at: Option<NaiveDateTime>,
    pub remarks: Option<String>,
}

impl Record for PaymentRecord {
    const KIND: EntityKind = EntityKind::Payment;

    const SEARCH_FIELDS: &'static [SearchField] = &[
        SearchField::new("paymentNumber", MatchMode::Prefix),
        SearchField::new("fineId", MatchMode::Exact),
        SearchField::new("paymentStatus", MatchMode::Exact),
        SearchField::new("paymentMethod", MatchMode::Exact),
        SearchField::new("payerIdCard", MatchMode::Prefix),
        SearchField::new("transactionId", MatchMode::Exact),
        SearchField::new("payerName", MatchMode::Fuzzy),
    ];

    fn id(&self) -> Option<i64> {
        self.payment_id
    }

    fn set_id(&mut self, id: i64) {
        self.payment_id = Some(id);
    }

    fn status_code(&self) -> Option<&str> {
        self.payment_status.as_deref()
    }

    fn prepare(&mut self, now: NaiveDateTime) -> Result<(), TrafficError> {
        require_positive(self.fine_id, "Fine ID")?;
        non_negative_amount(self.payment_amount, "Payment amount")?;
        non_negative_amount(self.refund_amount, "Refund amount")?;
        self.payment_time.get_or_insert(now);
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
