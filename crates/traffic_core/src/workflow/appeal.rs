use strum::{EnumIter, EnumString, IntoStaticStr};

use super::machine::StateMachine;

// ── Review (processStatus) ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(ascii_case_insensitive)]
pub enum AppealProcessState {
    Unprocessed,
    #[strum(serialize = "Under_Review")]
    UnderReview,
    Approved,
    Rejected,
    Withdrawn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum AppealProcessEvent {
    StartReview,
    Approve,
    Reject,
    ReopenReview,
    Withdraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppealProcess;

impl StateMachine for AppealProcess {
    type State = AppealProcessState;
    type Event = AppealProcessEvent;

    const NAME: &'static str = "AppealProcess";
    const INITIAL: AppealProcessState = AppealProcessState::Unprocessed;

    fn next(state: AppealProcessState, event: AppealProcessEvent) -> AppealProcessState {
        use AppealProcessEvent as E;
        use AppealProcessState as S;
        match (state, event) {
            (S::Unprocessed, E::StartReview) => S::UnderReview,
            (S::UnderReview, E::Approve) => S::Approved,
            (S::UnderReview, E::Reject) => S::Rejected,
            (S::Rejected, E::ReopenReview) => S::UnderReview,
            (S::Unprocessed | S::UnderReview, E::Withdraw) => S::Withdrawn,
            (s, _) => s,
        }
    }
}

// ── Acceptance (acceptanceStatus) ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(ascii_case_insensitive)]
pub enum AcceptanceState {
    Pending,
    Accepted,
    Rejected,
    #[strum(serialize = "Need_Supplement")]
    NeedSupplement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum AcceptanceEvent {
    Accept,
    Reject,
    RequestSupplement,
    SupplementComplete,
    Resubmit,
}

/// Intake decision on an appeal, before review starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppealAcceptance;

impl StateMachine for AppealAcceptance {
    type State = AcceptanceState;
    type Event = AcceptanceEvent;

    const NAME: &'static str = "AppealAcceptance";
    const INITIAL: AcceptanceState = AcceptanceState::Pending;

    fn next(state: AcceptanceState, event: AcceptanceEvent) -> AcceptanceState {
        use AcceptanceEvent as E;
        use AcceptanceState as S;
        match (state, event) {
            (S::Pending, E::Accept) => S::Accepted,
            (S::Pending, E::Reject) => S::Rejected,
            (S::Pending, E::RequestSupplement) => S::NeedSupplement,
            (S::NeedSupplement, E::SupplementComplete) => S::Pending,
            (S::Rejected, E::Resubmit) => S::Pending,
            (s, _) => s,
        }
    }
}
