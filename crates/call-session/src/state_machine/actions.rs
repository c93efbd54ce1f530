use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapters::{MediaAdapter, SignalingAdapter};
use crate::dialog::DialogSnapshot;
use crate::errors::Result;
use crate::timer::Refresher;
use crate::types::{DtmfDigit, NegotiatedMediaDescription, SessionDescription, SessionId};

/// SIP methods the call session core sends or reacts to
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum SipMethod {
    Invite,
    Ack,
    Prack,
    Update,
    Bye,
    Cancel,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Prack => "PRACK",
            SipMethod::Update => "UPDATE",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
        };
        f.write_str(name)
    }
}

/// Session-Expires value carried by a request or response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimerHeader {
    pub interval_secs: u32,
    pub refresher: Refresher,
}

/// RAck value of a PRACK (RFC 3262)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: SipMethod,
}

/// A request the transport layer should send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub method: SipMethod,
    pub dialog: DialogSnapshot,
    pub cseq: u32,
    pub body: Option<SessionDescription>,
    pub session_timer: Option<SessionTimerHeader>,
    /// `Require: 100rel`
    pub require_100rel: bool,
    pub rack: Option<RAck>,
    pub headers: Vec<(String, String)>,
}

impl OutboundRequest {
    pub fn new(method: SipMethod, dialog: DialogSnapshot, cseq: u32) -> Self {
        Self {
            method,
            dialog,
            cseq,
            body: None,
            session_timer: None,
            require_100rel: false,
            rack: None,
            headers: Vec::new(),
        }
    }
}

/// A response to an inbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub status: u16,
    pub reason: String,
    pub method: SipMethod,
    pub cseq: u32,
    pub body: Option<SessionDescription>,
    pub session_timer: Option<SessionTimerHeader>,
}

impl OutboundResponse {
    pub fn new(status: u16, reason: &str, method: SipMethod, cseq: u32) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            method,
            cseq,
            body: None,
            session_timer: None,
        }
    }
}

/// Side effects produced by a state machine step, executed in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendRequest(OutboundRequest),
    SendResponse(OutboundResponse),
    /// Hand a negotiated description to the media engine
    ApplyMedia(NegotiatedMediaDescription),
    StopMedia,
    SendDtmf(DtmfDigit),
}

impl Action {
    /// Method of the request this action sends, if any
    pub fn request_method(&self) -> Option<SipMethod> {
        match self {
            Action::SendRequest(request) => Some(request.method),
            _ => None,
        }
    }
}

/// Execute an action through the collaborators
pub async fn execute_action(
    session_id: &SessionId,
    action: Action,
    signaling: &Arc<dyn SignalingAdapter>,
    media: &Arc<dyn MediaAdapter>,
) -> Result<()> {
    debug!("Executing action for session {}: {:?}", session_id, action);

    match action {
        Action::SendRequest(request) => signaling.send_request(session_id, request).await,
        Action::SendResponse(response) => signaling.send_response(session_id, response).await,
        Action::ApplyMedia(description) => media.apply_description(session_id, &description).await,
        Action::StopMedia => media.stop(session_id).await,
        Action::SendDtmf(digit) => media.send_dtmf(session_id, digit).await,
    }
}
