use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Call session states
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CallState {
    /// Created, no INVITE sent yet
    Idle,
    /// INVITE sent, waiting for a response
    Calling,
    /// Provisional response with early media received
    EarlyMedia,
    /// Session established
    Confirmed,
    /// Mid-call offer/answer in progress
    Updating,
    /// Absorbing end state
    Terminated,
}

impl CallState {
    pub const ALL: [CallState; 6] = [
        CallState::Idle,
        CallState::Calling,
        CallState::EarlyMedia,
        CallState::Confirmed,
        CallState::Updating,
        CallState::Terminated,
    ];

    pub fn is_terminated(self) -> bool {
        self == CallState::Terminated
    }

    /// Dialog has been confirmed by a 2xx
    pub fn is_established(self) -> bool {
        matches!(self, CallState::Confirmed | CallState::Updating)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Event types that trigger transitions, without their payloads
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventType {
    // Call-control intents
    StartCall,
    Hold,
    Resume,
    AddVideo,
    SendDtmf,
    SetSessionTimer,
    Set100rel,
    SetQos,
    Terminate,

    // Transport events
    ProvisionalResponse,
    SuccessResponse,
    FailureResponse,
    RemoteOffer,
    RemoteBye,
    TransportFailure,

    // Timer events
    TimerDue,
    TimerExpired,

    // Media engine events
    DtmfResult,
    MediaFailure,
}

impl EventType {
    /// Intents come from the application and fail with `InvalidState`
    /// when the table has no entry; other events are dropped instead.
    pub fn is_intent(self) -> bool {
        matches!(
            self,
            EventType::StartCall
                | EventType::Hold
                | EventType::Resume
                | EventType::AddVideo
                | EventType::SendDtmf
                | EventType::SetSessionTimer
                | EventType::Set100rel
                | EventType::SetQos
                | EventType::Terminate
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::StartCall => "start_call",
            EventType::Hold => "hold",
            EventType::Resume => "resume",
            EventType::AddVideo => "add_video",
            EventType::SendDtmf => "send_dtmf",
            EventType::SetSessionTimer => "set_session_timer",
            EventType::Set100rel => "set_100rel",
            EventType::SetQos => "set_qos",
            EventType::Terminate => "terminate",
            EventType::ProvisionalResponse => "provisional_response",
            EventType::SuccessResponse => "success_response",
            EventType::FailureResponse => "failure_response",
            EventType::RemoteOffer => "remote_offer",
            EventType::RemoteBye => "remote_bye",
            EventType::TransportFailure => "transport_failure",
            EventType::TimerDue => "timer_due",
            EventType::TimerExpired => "timer_expired",
            EventType::DtmfResult => "dtmf_result",
            EventType::MediaFailure => "media_failure",
        }
    }
}

/// Key for looking up transitions in the state table
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StateKey {
    pub state: CallState,
    pub event: EventType,
}

/// Conditions that gate the state change of a transition. The event
/// handler still runs when a guard does not hold; only `next_state` is
/// skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guard {
    /// The provisional response carries an early media description
    HasEarlyMedia,
    /// The response answers the pending INVITE/re-INVITE
    AnswersPendingInvite,
}

/// Transition definition - what state follows an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Conditions that must be true for the state change
    pub guards: Vec<Guard>,

    /// Next state on success (if changing)
    pub next_state: Option<CallState>,

    /// Next state when the handler reports a failure (if changing)
    pub failure_state: Option<CallState>,
}

impl Transition {
    pub fn to(next_state: CallState) -> Self {
        Self { guards: vec![], next_state: Some(next_state), failure_state: None }
    }

    /// Event accepted, state unchanged
    pub fn stay() -> Self {
        Self { guards: vec![], next_state: None, failure_state: None }
    }

    pub fn on_failure(mut self, state: CallState) -> Self {
        self.failure_state = Some(state);
        self
    }

    pub fn guarded(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }
}

/// Master state table containing all transitions
#[derive(Debug, Default)]
pub struct MasterStateTable {
    transitions: HashMap<StateKey, Transition>,
}

/// Type alias for external use
pub type StateTable = MasterStateTable;

impl MasterStateTable {
    pub fn new() -> Self {
        Self { transitions: HashMap::new() }
    }

    pub fn insert(&mut self, key: StateKey, transition: Transition) {
        self.transitions.insert(key, transition);
    }

    pub fn get(&self, state: CallState, event: EventType) -> Option<&Transition> {
        self.transitions.get(&StateKey { state, event })
    }

    pub fn has_transition(&self, state: CallState, event: EventType) -> bool {
        self.transitions.contains_key(&StateKey { state, event })
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// Intents accepted in `state`
    pub fn valid_intents(&self, state: CallState) -> Vec<EventType> {
        let mut intents: Vec<EventType> = self
            .transitions
            .keys()
            .filter(|k| k.state == state && k.event.is_intent())
            .map(|k| k.event)
            .collect();
        intents.sort_by_key(|e| e.name());
        intents
    }

    /// Collect all states referenced in this state table
    pub fn collect_used_states(&self) -> HashSet<CallState> {
        let mut states = HashSet::new();
        for (key, transition) in &self.transitions {
            states.insert(key.state);
            states.extend(transition.next_state);
            states.extend(transition.failure_state);
        }
        states
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for state in self.collect_used_states() {
            let has_exit = self.transitions.keys().any(|k| k.state == state);
            if state.is_terminated() {
                if has_exit {
                    errors.push("Terminated must be absorbing".to_string());
                }
            } else if !self.has_transition(state, EventType::Terminate) {
                errors.push(format!("State {} cannot be terminated", state));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
