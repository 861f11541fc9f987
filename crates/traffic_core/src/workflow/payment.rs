use strum::{EnumIter, EnumString, IntoStaticStr};

use super::machine::StateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(ascii_case_insensitive)]
pub enum PaymentState {
    Unpaid,
    Partial,
    Paid,
    Overdue,
    Waived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PaymentEvent {
    PartialPay,
    ContinuePayment,
    CompletePayment,
    MarkOverdue,
    WaiveFine,
}

/// Payment lifecycle, stored in `paymentStatus` on payments and fines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentLifecycle;

impl StateMachine for PaymentLifecycle {
    type State = PaymentState;
    type Event = PaymentEvent;

    const NAME: &'static str = "Payment";
    const INITIAL: PaymentState = PaymentState::Unpaid;

    fn next(state: PaymentState, event: PaymentEvent) -> PaymentState {
        use PaymentEvent as E;
        use PaymentState as S;
        match (state, event) {
            (S::Unpaid, E::PartialPay) => S::Partial,
            (S::Partial, E::ContinuePayment) => S::Paid,
            (S::Unpaid | S::Overdue, E::CompletePayment) => S::Paid,
            (S::Unpaid | S::Partial, E::MarkOverdue) => S::Overdue,
            (S::Unpaid | S::Partial | S::Overdue | S::Paid, E::WaiveFine) => S::Waived,
            (s, _) => s,
        }
    }
}
