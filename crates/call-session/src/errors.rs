//! Error types for the call session core
//!
//! Every failure the state machine can surface maps onto one
//! [`SessionError`] variant. Validation failures (`InvalidState`,
//! `InvalidTimerValue`, `InvalidDigit`) never change session state.
//! Collaborator failures that are fatal (`is_fatal() == true`) are fed
//! back into the session by the coordinator and end in the single
//! termination path; other collaborator errors are only logged.

use crate::state_table::types::CallState;
use crate::types::{MediaKind, SessionId};

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, SessionError>;

/// Why an offer/answer exchange could not produce a description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationFailureKind {
    /// No media line of the remote description has a usable local counterpart
    NoCommonMedia,
    /// The remote description carried no media lines at all
    EmptyDescription,
}

impl std::fmt::Display for NegotiationFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationFailureKind::NoCommonMedia => write!(f, "no common media"),
            NegotiationFailureKind::EmptyDescription => write!(f, "empty description"),
        }
    }
}

/// Outcome of a failed `accept_inbound`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("negotiation failed: {kind}")]
pub struct NegotiationFailure {
    pub kind: NegotiationFailureKind,
}

impl NegotiationFailure {
    pub fn no_common_media() -> Self {
        Self { kind: NegotiationFailureKind::NoCommonMedia }
    }

    pub fn empty_description() -> Self {
        Self { kind: NegotiationFailureKind::EmptyDescription }
    }
}

/// Call session errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("{operation} is not valid in state {state}")]
    InvalidState { operation: String, state: CallState },

    #[error("invalid session timer value {value}s (allowed {min}..={max})")]
    InvalidTimerValue { value: u32, min: u32, max: u32 },

    #[error("invalid DTMF digit {digit:?}")]
    InvalidDigit { digit: String },

    #[error("dialog protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("out of order request: CSeq {received} <= last {last}")]
    OutOfOrderRequest { received: u32, last: u32 },

    #[error(transparent)]
    Negotiation(#[from] NegotiationFailure),

    #[error("{kind} media is already part of the session")]
    MediaAlreadyPresent { kind: MediaKind },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("media engine error: {message}")]
    Media { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SessionError {
    pub fn invalid_state(operation: &str, state: CallState) -> Self {
        SessionError::InvalidState { operation: operation.to_string(), state }
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        SessionError::ProtocolViolation { message: message.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        SessionError::Transport { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SessionError::Config { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SessionError::Internal { message: message.into() }
    }

    /// Whether a collaborator returning this error ends the call
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Transport { .. } | SessionError::Media { .. })
    }

    /// The negotiation failure kind, if this is a negotiation error
    pub fn negotiation_kind(&self) -> Option<NegotiationFailureKind> {
        match self {
            SessionError::Negotiation(failure) => Some(failure.kind),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for SessionError {
    fn from(err: serde_yaml::Error) -> Self {
        SessionError::Config { message: err.to_string() }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Config { message: err.to_string() }
    }
}
