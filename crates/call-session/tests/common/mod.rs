//! Shared helpers for the call session integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use rvoip_call_session::dialog::DialogTags;
use rvoip_call_session::prelude::*;
use rvoip_call_session::state_machine::StepOutput;
use rvoip_call_session::{
    CallSession, DtmfDigit, MediaFormat, MediaLine, NegotiatedMediaDescription, SessionDescription,
};

pub const REMOTE_URI: &str = "sip:bob@example.com";

pub fn config() -> CallSessionConfig {
    CallSessionConfig::new("sip:alice@example.com")
}

pub fn new_session(config: &CallSessionConfig) -> CallSession {
    CallSession::new(SessionId::new(), config).unwrap()
}

pub fn tags() -> DialogTags {
    DialogTags::new("alice-tag", "bob-tag")
}

pub fn audio_line(direction: MediaDirection) -> MediaLine {
    MediaLine::new(MediaKind::Audio, direction, 30000, vec![MediaFormat::pcmu()])
}

pub fn video_line(direction: MediaDirection) -> MediaLine {
    MediaLine::new(MediaKind::Video, direction, 30002, vec![MediaFormat::h264()])
}

/// Video line nobody locally supports
pub fn vp9_line() -> MediaLine {
    MediaLine::new(MediaKind::Video, MediaDirection::SendRecv, 30002, vec![MediaFormat::new(98, "VP9", 90000)])
}

pub fn description(version: u64, lines: Vec<MediaLine>) -> SessionDescription {
    SessionDescription::new(version, "192.0.2.20", lines)
}

pub fn requests(out: &StepOutput) -> Vec<&OutboundRequest> {
    out.actions
        .iter()
        .filter_map(|action| match action {
            Action::SendRequest(request) => Some(request),
            _ => None,
        })
        .collect()
}

pub fn responses(out: &StepOutput) -> Vec<&OutboundResponse> {
    out.actions
        .iter()
        .filter_map(|action| match action {
            Action::SendResponse(response) => Some(response),
            _ => None,
        })
        .collect()
}

pub fn methods(out: &StepOutput) -> Vec<SipMethod> {
    requests(out).iter().map(|r| r.method).collect()
}

/// CSeq of the single INVITE/UPDATE the step sent
pub fn sent_cseq(out: &StepOutput, method: SipMethod) -> u32 {
    requests(out)
        .into_iter()
        .find(|r| r.method == method)
        .map(|r| r.cseq)
        .unwrap_or_else(|| panic!("no {} in {:?}", method, out.actions))
}

pub fn termination_reason(out: &StepOutput) -> Option<TerminationReason> {
    out.events.iter().find_map(|event| match event {
        SessionEvent::CallTerminated { reason, .. } => Some(reason.clone()),
        _ => None,
    })
}

pub fn invite_response(status: u16, cseq: u32) -> InboundResponse {
    InboundResponse::new(status, SipMethod::Invite, cseq).with_tags(tags())
}

pub fn answer(cseq: u32, body: SessionDescription) -> TransportEvent {
    TransportEvent::Response(invite_response(200, cseq).with_body(body))
}

/// Start a call with `proposal` and answer it with `body`
pub fn establish(
    session: &mut CallSession,
    proposal: MediaProposal,
    body: SessionDescription,
    now: Instant,
) -> StepOutput {
    let out = session.start_call(REMOTE_URI, proposal, None).unwrap();
    let cseq = sent_cseq(&out, SipMethod::Invite);
    session.handle_transport_event(answer(cseq, body), now).unwrap()
}

/// Confirmed audio-only call
pub fn confirmed_audio(config: &CallSessionConfig, now: Instant) -> CallSession {
    let mut session = new_session(config);
    establish(
        &mut session,
        MediaProposal::audio(),
        description(1, vec![audio_line(MediaDirection::SendRecv)]),
        now,
    );
    assert_eq!(session.state(), CallState::Confirmed);
    session
}

/// Confirmed audio+video call
pub fn confirmed_audio_video(config: &CallSessionConfig, now: Instant) -> CallSession {
    let mut session = new_session(config);
    establish(
        &mut session,
        MediaProposal::audio_video(),
        description(1, vec![audio_line(MediaDirection::SendRecv), video_line(MediaDirection::SendRecv)]),
        now,
    );
    assert_eq!(session.state(), CallState::Confirmed);
    session
}

/// Signaling collaborator that records everything it is asked to send
#[derive(Default)]
pub struct RecordingSignaling {
    requests: Mutex<Vec<(SessionId, OutboundRequest)>>,
    responses: Mutex<Vec<(SessionId, OutboundResponse)>>,
    fail_method: Mutex<Option<SipMethod>>,
}

impl RecordingSignaling {
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn responses(&self) -> Vec<OutboundResponse> {
        self.responses.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn methods(&self) -> Vec<SipMethod> {
        self.requests().iter().map(|r| r.method).collect()
    }

    pub fn last_request(&self, method: SipMethod) -> Option<OutboundRequest> {
        self.requests().into_iter().rev().find(|r| r.method == method)
    }

    /// Make every later request with `method` fail
    pub fn fail_on(&self, method: SipMethod) {
        *self.fail_method.lock().unwrap() = Some(method);
    }
}

#[async_trait]
impl SignalingAdapter for RecordingSignaling {
    async fn send_request(&self, session_id: &SessionId, request: OutboundRequest) -> Result<()> {
        if *self.fail_method.lock().unwrap() == Some(request.method) {
            return Err(SessionError::transport(format!("{} could not be sent", request.method)));
        }
        self.requests.lock().unwrap().push((session_id.clone(), request));
        Ok(())
    }

    async fn send_response(&self, session_id: &SessionId, response: OutboundResponse) -> Result<()> {
        self.responses.lock().unwrap().push((session_id.clone(), response));
        Ok(())
    }
}

/// Media collaborator that records applied descriptions and digits
#[derive(Default)]
pub struct RecordingMedia {
    applied: Mutex<Vec<NegotiatedMediaDescription>>,
    digits: Mutex<Vec<DtmfDigit>>,
    stops: AtomicUsize,
    apply_error: Mutex<Option<SessionError>>,
}

impl RecordingMedia {
    pub fn applied(&self) -> Vec<NegotiatedMediaDescription> {
        self.applied.lock().unwrap().clone()
    }

    pub fn digits(&self) -> Vec<char> {
        self.digits.lock().unwrap().iter().map(|d| d.as_char()).collect()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_apply(&self) {
        self.fail_apply_with(SessionError::Media { message: "no ports available".to_string() });
    }

    /// Make every later `apply_description` fail with `error`
    pub fn fail_apply_with(&self, error: SessionError) {
        *self.apply_error.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl MediaAdapter for RecordingMedia {
    async fn apply_description(&self, _session_id: &SessionId, description: &NegotiatedMediaDescription) -> Result<()> {
        if let Some(error) = self.apply_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.applied.lock().unwrap().push(description.clone());
        Ok(())
    }

    async fn stop(&self, _session_id: &SessionId) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_dtmf(&self, _session_id: &SessionId, digit: DtmfDigit) -> Result<()> {
        self.digits.lock().unwrap().push(digit);
        Ok(())
    }
}
