//! Finite state machine contract shared by every record lifecycle.
//!
//! A machine is a zero-sized type naming its state and event enums. Both
//! enums derive their string forms through strum, so code/name parsing and
//! rendering stay in one place per enum.

use std::fmt::Debug;
use std::hash::Hash;
use std::str::FromStr;

use strum::IntoEnumIterator;

pub trait StateMachine: Send + Sync + 'static {
    type State: Copy
        + Eq
        + Hash
        + Debug
        + Send
        + Sync
        + FromStr
        + IntoEnumIterator
        + Into<&'static str>
        + 'static;

    type Event: Copy
        + Eq
        + Debug
        + Send
        + Sync
        + FromStr
        + IntoEnumIterator
        + Into<&'static str>
        + 'static;

    /// Machine name, used for registry keys and log fields.
    const NAME: &'static str;

    /// State assigned to a null or unrecognised persisted code.
    const INITIAL: Self::State;

    /// Total transition function. An event that is not permitted from
    /// `state` returns `state` unchanged.
    fn next(state: Self::State, event: Self::Event) -> Self::State;

    fn state_code(state: Self::State) -> &'static str {
        state.into()
    }

    fn event_name(event: Self::Event) -> &'static str {
        event.into()
    }

    /// Resolve a persisted code. Total: never fails.
    fn resolve(code: Option<&str>) -> Self::State {
        code.map(str::trim)
            .and_then(|c| c.parse().ok())
            .unwrap_or(Self::INITIAL)
    }

    fn parse_event(name: &str) -> Option<Self::Event> {
        name.trim().parse().ok()
    }

    /// Events that move the machine out of `state`.
    fn available_events(state: Self::State) -> Vec<Self::Event> {
        Self::Event::iter()
            .filter(|e| Self::next(state, *e) != state)
            .collect()
    }
}

/// Result of evaluating an event name against a persisted status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<M: StateMachine> {
    Advance { from: M::State, to: M::State },
    /// The event is unknown to the machine or not valid from `from`.
    Reject { from: M::State },
}

/// Pure core of the workflow controller contract: resolve, step, compare.
pub fn decide<M: StateMachine>(code: Option<&str>, event_name: &str) -> Decision<M> {
    let from = M::resolve(code);
    match M::parse_event(event_name) {
        Some(event) => {
            let to = M::next(from, event);
            if to == from {
                Decision::Reject { from }
            } else {
                Decision::Advance { from, to }
            }
        }
        None => Decision::Reject { from },
    }
}
