//! Events delivered to a call session by its collaborators

use serde::{Deserialize, Serialize};

use super::actions::{SessionTimerHeader, SipMethod};
use crate::dialog::DialogTags;
use crate::state_table::EventType;
use crate::types::{DtmfDigit, SessionDescription};

/// A response to one of our requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundResponse {
    pub status: u16,
    pub method: SipMethod,
    pub cseq: u32,
    /// Local/remote tags; absent on responses that do not create a dialog (e.g. 100)
    pub tags: Option<DialogTags>,
    pub route_set: Vec<String>,
    pub body: Option<SessionDescription>,
    pub session_timer: Option<SessionTimerHeader>,
    /// RSeq of a reliable provisional response
    pub rseq: Option<u32>,
}

impl InboundResponse {
    pub fn new(status: u16, method: SipMethod, cseq: u32) -> Self {
        Self {
            status,
            method,
            cseq,
            tags: None,
            route_set: Vec::new(),
            body: None,
            session_timer: None,
            rseq: None,
        }
    }

    pub fn with_tags(mut self, tags: DialogTags) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_route_set(mut self, route_set: Vec<String>) -> Self {
        self.route_set = route_set;
        self
    }

    pub fn with_body(mut self, body: SessionDescription) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_session_timer(mut self, header: SessionTimerHeader) -> Self {
        self.session_timer = Some(header);
        self
    }

    pub fn with_rseq(mut self, rseq: u32) -> Self {
        self.rseq = Some(rseq);
        self
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request received inside the dialog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRequest {
    pub method: SipMethod,
    pub cseq: u32,
    /// Retransmission detected by the transaction layer
    pub retransmission: bool,
    pub body: Option<SessionDescription>,
    pub session_timer: Option<SessionTimerHeader>,
}

impl InboundRequest {
    pub fn new(method: SipMethod, cseq: u32) -> Self {
        Self { method, cseq, retransmission: false, body: None, session_timer: None }
    }

    pub fn with_body(mut self, body: SessionDescription) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_session_timer(mut self, header: SessionTimerHeader) -> Self {
        self.session_timer = Some(header);
        self
    }

    pub fn retransmitted(mut self) -> Self {
        self.retransmission = true;
        self
    }
}

/// Events from the transport/transaction layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportEvent {
    Response(InboundResponse),
    Request(InboundRequest),
    /// A client transaction timed out
    Timeout { method: SipMethod, cseq: u32 },
    /// Fatal transport error for this dialog
    TransportError { message: String },
}

impl TransportEvent {
    /// Table event for this input, `None` for requests the core does not handle
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            TransportEvent::Response(r) if r.is_provisional() => Some(EventType::ProvisionalResponse),
            TransportEvent::Response(r) if r.is_success() => Some(EventType::SuccessResponse),
            TransportEvent::Response(_) => Some(EventType::FailureResponse),
            TransportEvent::Request(r) => match r.method {
                SipMethod::Invite | SipMethod::Update => Some(EventType::RemoteOffer),
                SipMethod::Bye => Some(EventType::RemoteBye),
                _ => None,
            },
            TransportEvent::Timeout { .. } | TransportEvent::TransportError { .. } => {
                Some(EventType::TransportFailure)
            }
        }
    }
}

/// Events from the media engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaEvent {
    DtmfSent { digit: DtmfDigit },
    DtmfFailed { digit: DtmfDigit, reason: String },
    /// Media flows cannot continue
    Failure { message: String },
}

impl MediaEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            MediaEvent::DtmfSent { .. } | MediaEvent::DtmfFailed { .. } => EventType::DtmfResult,
            MediaEvent::Failure { .. } => EventType::MediaFailure,
        }
    }
}
