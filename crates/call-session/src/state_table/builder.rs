//! Builder used by the table definitions

use super::types::{CallState, EventType, MasterStateTable, StateKey, Transition};

pub struct StateTableBuilder {
    table: MasterStateTable,
}

impl StateTableBuilder {
    pub fn new() -> Self {
        Self { table: MasterStateTable::new() }
    }

    pub fn add_transition(&mut self, state: CallState, event: EventType, transition: Transition) -> &mut Self {
        self.table.insert(StateKey { state, event }, transition);
        self
    }

    /// Shorthand for a plain state change
    pub fn add_state_change(&mut self, from: CallState, event: EventType, to: CallState) -> &mut Self {
        self.add_transition(from, event, Transition::to(to))
    }

    /// Event accepted in `state` without a state change
    pub fn add_accept(&mut self, state: CallState, event: EventType) -> &mut Self {
        self.add_transition(state, event, Transition::stay())
    }

    /// Same transition for every listed state
    pub fn add_for_states(&mut self, states: &[CallState], event: EventType, transition: Transition) -> &mut Self {
        for &state in states {
            self.add_transition(state, event, transition.clone());
        }
        self
    }

    pub fn build(self) -> MasterStateTable {
        self.table
    }
}
