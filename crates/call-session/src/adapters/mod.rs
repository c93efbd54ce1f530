//! Collaborator seams
//!
//! The core never touches the network or media devices. Outbound actions
//! go through these traits; inbound events come back through
//! [`CallSessionCoordinator::handle_transport_event`] and
//! [`CallSessionCoordinator::handle_media_event`].
//!
//! [`CallSessionCoordinator::handle_transport_event`]: crate::coordinator::CallSessionCoordinator::handle_transport_event
//! [`CallSessionCoordinator::handle_media_event`]: crate::coordinator::CallSessionCoordinator::handle_media_event

use async_trait::async_trait;

use crate::errors::Result;
use crate::state_machine::{OutboundRequest, OutboundResponse};
use crate::types::{DtmfDigit, NegotiatedMediaDescription, SessionId};

/// Transport/transaction layer
#[async_trait]
pub trait SignalingAdapter: Send + Sync {
    /// Send a request within (or creating) the session's dialog.
    /// An error is treated as a fatal transport failure.
    async fn send_request(&self, session_id: &SessionId, request: OutboundRequest) -> Result<()>;

    /// Answer an inbound request
    async fn send_response(&self, session_id: &SessionId, response: OutboundResponse) -> Result<()>;
}

/// Media engine
#[async_trait]
pub trait MediaAdapter: Send + Sync {
    /// Start, redirect or update flows to match `description`
    async fn apply_description(&self, session_id: &SessionId, description: &NegotiatedMediaDescription) -> Result<()>;

    /// Stop all flows of the session
    async fn stop(&self, session_id: &SessionId) -> Result<()>;

    /// Queue a DTMF digit; completion is reported as a `MediaEvent`
    async fn send_dtmf(&self, session_id: &SessionId, digit: DtmfDigit) -> Result<()>;
}
