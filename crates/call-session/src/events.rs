//! Call Session Event System
//!
//! Notifications produced by the state machine are published on a
//! `tokio::sync::broadcast` channel. Subscribers that fall behind lose
//! the oldest events; the state machine never waits on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::{Result, SessionError};
use crate::state_table::CallState;
use crate::types::{DroppedLine, DtmfDigit, NegotiatedMediaDescription, SessionId};

/// Mid-call operation an update notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    Hold,
    Resume,
    AddVideo,
    SessionTimer,
    /// Session refresh sent because the timer was due
    Refresh,
    /// Offer received from the remote side
    RemoteOffer,
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    LocalHangup,
    RemoteHangup,
    /// Final non-2xx response to the initial INVITE
    Rejected { status: u16 },
    /// The answer to the initial offer had no usable media
    NoCommonMedia,
    SessionTimerExpired,
    /// Fatal dialog error (408/481 to a mid-call request)
    DialogFailure { status: u16 },
    TransportFailure { message: String },
    MediaFailure { message: String },
    /// The owner released the session
    Released,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::LocalHangup => write!(f, "local hangup"),
            TerminationReason::RemoteHangup => write!(f, "remote hangup"),
            TerminationReason::Rejected { status } => write!(f, "rejected with {}", status),
            TerminationReason::NoCommonMedia => write!(f, "no common media"),
            TerminationReason::SessionTimerExpired => write!(f, "session timer expired"),
            TerminationReason::DialogFailure { status } => write!(f, "dialog failure {}", status),
            TerminationReason::TransportFailure { message } => write!(f, "transport failure: {}", message),
            TerminationReason::MediaFailure { message } => write!(f, "media failure: {}", message),
            TerminationReason::Released => write!(f, "released"),
        }
    }
}

/// Notifications about a call session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Every state change, in order
    StateChanged {
        session_id: SessionId,
        old_state: CallState,
        new_state: CallState,
        timestamp: DateTime<Utc>,
    },

    /// Provisional response received
    CallProgress {
        session_id: SessionId,
        status: u16,
        early_media: bool,
    },

    /// 2xx answer accepted, media committed
    CallEstablished {
        session_id: SessionId,
        description: NegotiatedMediaDescription,
    },

    /// Mid-call offer/answer committed a new description
    MediaUpdated {
        session_id: SessionId,
        operation: UpdateKind,
        description: NegotiatedMediaDescription,
    },

    /// Partial compatibility: some remote lines were left out
    MediaLinesDropped {
        session_id: SessionId,
        dropped: Vec<DroppedLine>,
    },

    /// Mid-call operation failed; the previous description stays active
    UpdateFailed {
        session_id: SessionId,
        operation: UpdateKind,
        reason: String,
    },

    /// We are the refresher and the refresh has been sent
    RefreshDue {
        session_id: SessionId,
    },

    /// Session timer re-armed after a refresh
    SessionRefreshed {
        session_id: SessionId,
        interval_secs: u32,
    },

    DtmfCompleted {
        session_id: SessionId,
        digit: DtmfDigit,
        success: bool,
        reason: Option<String>,
    },

    /// A message was ignored because it broke dialog rules
    ProtocolError {
        session_id: SessionId,
        message: String,
    },

    /// Terminal notification, published exactly once per session
    CallTerminated {
        session_id: SessionId,
        reason: TerminationReason,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::CallProgress { session_id, .. }
            | SessionEvent::CallEstablished { session_id, .. }
            | SessionEvent::MediaUpdated { session_id, .. }
            | SessionEvent::MediaLinesDropped { session_id, .. }
            | SessionEvent::UpdateFailed { session_id, .. }
            | SessionEvent::RefreshDue { session_id }
            | SessionEvent::SessionRefreshed { session_id, .. }
            | SessionEvent::DtmfCompleted { session_id, .. }
            | SessionEvent::ProtocolError { session_id, .. }
            | SessionEvent::CallTerminated { session_id, .. } => session_id,
        }
    }
}

/// Simple subscriber wrapper for session events
pub struct SessionEventSubscriber {
    receiver: broadcast::Receiver<SessionEvent>,
}

impl SessionEventSubscriber {
    pub fn new(receiver: broadcast::Receiver<SessionEvent>) -> Self {
        Self { receiver }
    }

    /// Receive the next event
    pub async fn receive(&mut self) -> Result<SessionEvent> {
        self.receiver
            .recv()
            .await
            .map_err(|e| SessionError::internal(format!("Failed to receive event: {}", e)))
    }

    /// Try to receive an event without blocking
    pub fn try_receive(&mut self) -> Result<Option<SessionEvent>> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(e) => Err(SessionError::internal(format!("Failed to try receive event: {}", e))),
        }
    }
}

/// Broadcast bus for session events
#[derive(Debug, Clone)]
pub struct SessionEventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: SessionEvent) {
        match &event {
            SessionEvent::StateChanged { session_id, old_state, new_state, .. } => {
                tracing::debug!("Session {} state {} -> {}", session_id, old_state, new_state);
            }
            SessionEvent::CallTerminated { session_id, reason } => {
                tracing::info!("Session {} terminated: {}", session_id, reason);
            }
            _ => {}
        }

        if self.sender.send(event).is_err() {
            // No receivers are currently listening, which is fine
            tracing::trace!("No subscribers listening for session event");
        }
    }

    pub fn subscribe(&self) -> SessionEventSubscriber {
        SessionEventSubscriber::new(self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = SessionEventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let session_id = SessionId("s1".to_string());

        bus.publish(SessionEvent::RefreshDue { session_id: session_id.clone() });

        for subscriber in [&mut first, &mut second] {
            let event = subscriber.receive().await.unwrap();
            assert_eq!(event.session_id(), &session_id);
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = SessionEventBus::new(8);
        bus.publish(SessionEvent::RefreshDue { session_id: SessionId("s1".to_string()) });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_try_receive_empty() {
        let bus = SessionEventBus::new(8);
        let mut subscriber = bus.subscribe();
        assert!(subscriber.try_receive().unwrap().is_none());
    }
}
