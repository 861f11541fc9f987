//! Lifecycle state machines and their bindings to record status fields.
//!
//! Machines are pure (see [`machine`]). A record opts into a machine by
//! implementing [`Governed`], which names the status field the machine
//! reads and writes. The driving flow (load under lock, decide, persist or
//! report a conflict) lives in [`crate::service::RecordService::fire`].

mod appeal;
mod deduction;
pub mod machine;
mod offense;
mod payment;

pub use appeal::{
    AcceptanceEvent, AcceptanceState, AppealAcceptance, AppealProcess, AppealProcessEvent,
    AppealProcessState,
};
pub use deduction::{DeductionEvent, DeductionLifecycle, DeductionState};
pub use machine::{decide, Decision, StateMachine};
pub use offense::{OffenseEvent, OffenseProcess, OffenseState};
pub use payment::{PaymentEvent, PaymentLifecycle, PaymentState};

use serde::Serialize;

use crate::error::TrafficError;
use crate::records::{AppealRecord, DeductionRecord, FineRecord, OffenseRecord, PaymentRecord, Record};

/// Binds machine `M` to one status field of a record.
pub trait Governed<M: StateMachine>: Record {
    fn lifecycle_code(&self) -> Option<&str>;

    fn set_lifecycle_code(&mut self, code: &'static str);
}

/// Outcome of firing an event at a record. A rejection is a normal result,
/// carrying the unchanged record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkflowOutcome<R> {
    Applied {
        record: R,
        from: &'static str,
        to: &'static str,
    },
    Rejected {
        record: R,
        state: &'static str,
        event: String,
    },
}

impl<R> WorkflowOutcome<R> {
    pub fn record(&self) -> &R {
        match self {
            Self::Applied { record, .. } | Self::Rejected { record, .. } => record,
        }
    }

    pub fn into_record(self) -> R {
        match self {
            Self::Applied { record, .. } | Self::Rejected { record, .. } => record,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Collapse into a `Result` for callers without a conflict channel.
    pub fn into_result(self) -> Result<R, TrafficError> {
        match self {
            Self::Applied { record, .. } => Ok(record),
            Self::Rejected { state, event, .. } => Err(TrafficError::StateConflict {
                state: state.to_string(),
                event,
            }),
        }
    }
}

// ── Bindings ─────────────────────────────────────────────────

impl Governed<OffenseProcess> for OffenseRecord {
    fn lifecycle_code(&self) -> Option<&str> {
        self.process_status.as_deref()
    }

    fn set_lifecycle_code(&mut self, code: &'static str) {
        self.process_status = Some(code.to_string());
    }
}

impl Governed<PaymentLifecycle> for PaymentRecord {
    fn lifecycle_code(&self) -> Option<&str> {
        self.payment_status.as_deref()
    }

    fn set_lifecycle_code(&mut self, code: &'static str) {
        self.payment_status = Some(code.to_string());
    }
}

impl Governed<PaymentLifecycle> for FineRecord {
    fn lifecycle_code(&self) -> Option<&str> {
        self.payment_status.as_deref()
    }

    fn set_lifecycle_code(&mut self, code: &'static str) {
        self.payment_status = Some(code.to_string());
    }
}

impl Governed<AppealProcess> for AppealRecord {
    fn lifecycle_code(&self) -> Option<&str> {
        self.process_status.as_deref()
    }

    fn set_lifecycle_code(&mut self, code: &'static str) {
        self.process_status = Some(code.to_string());
    }
}

impl Governed<AppealAcceptance> for AppealRecord {
    fn lifecycle_code(&self) -> Option<&str> {
        self.acceptance_status.as_deref()
    }

    fn set_lifecycle_code(&mut self, code: &'static str) {
        self.acceptance_status = Some(code.to_string());
    }
}

impl Governed<DeductionLifecycle> for DeductionRecord {
    fn lifecycle_code(&self) -> Option<&str> {
        self.status.as_deref()
    }

    fn set_lifecycle_code(&mut self, code: &'static str) {
        self.status = Some(code.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_outcome_maps_to_conflict() {
        let outcome = WorkflowOutcome::Rejected {
            record: OffenseRecord::default(),
            state: "Processing",
            event: "START_PROCESSING".into(),
        };
        assert!(!outcome.is_applied());
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn test_appeal_has_two_independent_bindings() {
        let mut appeal = AppealRecord::default();
        <AppealRecord as Governed<AppealAcceptance>>::set_lifecycle_code(&mut appeal, "Accepted");
        <AppealRecord as Governed<AppealProcess>>::set_lifecycle_code(&mut appeal, "Under_Review");
        assert_eq!(appeal.acceptance_status.as_deref(), Some("Accepted"));
        assert_eq!(appeal.process_status.as_deref(), Some("Under_Review"));
    }
}
