use strum::{EnumIter, EnumString, IntoStaticStr};

use super::machine::StateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(ascii_case_insensitive)]
pub enum DeductionState {
    Effective,
    Cancelled,
    Restored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum DeductionEvent {
    Cancel,
    Restore,
    Reactivate,
}

/// Points deduction lifecycle, stored in `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeductionLifecycle;

impl StateMachine for DeductionLifecycle {
    type State = DeductionState;
    type Event = DeductionEvent;

    const NAME: &'static str = "Deduction";
    const INITIAL: DeductionState = DeductionState::Effective;

    fn next(state: DeductionState, event: DeductionEvent) -> DeductionState {
        use DeductionEvent as E;
        use DeductionState as S;
        match (state, event) {
            (S::Effective, E::Cancel) => S::Cancelled,
            (S::Effective, E::Restore) => S::Restored,
            (S::Cancelled | S::Restored, E::Reactivate) => S::Effective,
            (s, _) => s,
        }
    }
}
