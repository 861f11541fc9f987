use strum::{EnumIter, EnumString, IntoStaticStr};

use super::machine::StateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(ascii_case_insensitive)]
pub enum OffenseState {
    Unprocessed,
    Processing,
    Processed,
    Appealing,
    #[strum(serialize = "Appeal_Approved")]
    AppealApproved,
    #[strum(serialize = "Appeal_Rejected")]
    AppealRejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum OffenseEvent {
    StartProcessing,
    CompleteProcessing,
    SubmitAppeal,
    ApproveAppeal,
    RejectAppeal,
    WithdrawAppeal,
    Cancel,
}

/// Offense processing lifecycle, stored in `processStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffenseProcess;

impl StateMachine for OffenseProcess {
    type State = OffenseState;
    type Event = OffenseEvent;

    const NAME: &'static str = "OffenseProcess";
    const INITIAL: OffenseState = OffenseState::Unprocessed;

    fn next(state: OffenseState, event: OffenseEvent) -> OffenseState {
        use OffenseEvent as E;
        use OffenseState as S;
        match (state, event) {
            (S::Unprocessed, E::StartProcessing) => S::Processing,
            (S::Processing, E::CompleteProcessing) => S::Processed,
            (S::Processed, E::SubmitAppeal) => S::Appealing,
            (S::Appealing, E::ApproveAppeal) => S::AppealApproved,
            (S::Appealing, E::RejectAppeal) => S::AppealRejected,
            (S::Appealing, E::WithdrawAppeal) => S::Processed,
            (S::Unprocessed | S::Processing | S::Processed, E::Cancel) => S::Cancelled,
            (s, _) => s,
        }
    }
}
