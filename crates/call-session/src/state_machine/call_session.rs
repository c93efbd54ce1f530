//! Call session state machine
//!
//! [`CallSession`] is the synchronous core of one call. Intents and
//! collaborator events go in; a [`StepOutput`] with the actions to execute
//! and the notifications to publish comes out. Every input is checked
//! against [`MASTER_TABLE`] first: an intent with no entry for the
//! current state fails with `InvalidState`, any other event without an
//! entry is dropped. Handlers never leave the session half-updated; a
//! description or timer change is committed only once the exchange that
//! carries it has succeeded.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::actions::{Action, OutboundRequest, OutboundResponse, RAck, SessionTimerHeader, SipMethod};
use super::inputs::{InboundRequest, InboundResponse, MediaEvent, TransportEvent};
use crate::config::{CallSessionConfig, ExpiryPolicy};
use crate::dialog::{DialogContext, ResponseKind};
use crate::errors::{NegotiationFailure, Result, SessionError};
use crate::events::{SessionEvent, TerminationReason, UpdateKind};
use crate::negotiator::{NegotiationOutcome, OfferAnswerNegotiator};
use crate::state_table::{CallState, EventType, Guard, Transition, MASTER_TABLE};
use crate::timer::{Refresher, SessionRefresh, SessionTimerManager, TimerStatus};
use crate::types::{
    ActionConfig, DroppedLine, DtmfDigit, MediaDirection, MediaKind, MediaProposal, NegotiatedMediaDescription,
    ProposedLine, QosPreference, QosStrength, QosType, SessionDescription, SessionId,
};

/// Actions and notifications produced by one step
#[derive(Debug, Default)]
pub struct StepOutput {
    pub actions: Vec<Action>,
    pub events: Vec<SessionEvent>,
}

impl StepOutput {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.events.is_empty()
    }

    pub fn extend(&mut self, other: StepOutput) {
        self.actions.extend(other.actions);
        self.events.extend(other.events);
    }
}

/// Our INVITE or re-INVITE waiting for its final response
#[derive(Debug, Clone)]
struct PendingInvite {
    /// `None` for the initial INVITE
    operation: Option<UpdateKind>,
    cseq: u32,
    offer: SessionDescription,
    lines: Vec<ProposedLine>,
    timer_request: Option<(u32, Refresher)>,
    provisional_received: bool,
    /// Answer carried by a reliable provisional; the 2xx may omit it
    reliable_answer: Option<NegotiationOutcome>,
}

/// Initial INVITE abandoned by `terminate`. Its transaction can still
/// produce responses after the session has ended.
#[derive(Debug, Clone, Copy)]
struct CancelledInvite {
    cseq: u32,
    cancel_sent: bool,
}

/// One SIP call leg
#[derive(Debug)]
pub struct CallSession {
    id: SessionId,
    state: CallState,
    local_uri: String,
    negotiator: OfferAnswerNegotiator,
    dialog: Option<DialogContext>,
    timer: SessionTimerManager,
    expiry_policy: ExpiryPolicy,
    qos: Option<QosPreference>,
    reliable_provisional: bool,

    /// Lines we currently want, with their local directions
    local_lines: Vec<ProposedLine>,
    /// Lines to restore on resume, set while on hold
    held_lines: Option<Vec<ProposedLine>>,
    media: Option<NegotiatedMediaDescription>,
    early_media: Option<NegotiatedMediaDescription>,
    /// Version of the last description we sent
    local_version: u64,

    pending: Option<PendingInvite>,
    cancelled: Option<CancelledInvite>,
    refresh_in_flight: Option<u32>,
    /// Set while the refresh in flight is the last chance after expiry
    expiry_refresh: bool,
    last_rseq: Option<u32>,
    created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(id: SessionId, config: &CallSessionConfig) -> Result<Self> {
        let mut timer = SessionTimerManager::new(config.timer.refresh_grace_secs);
        if let Some(settings) = &config.session_timer {
            timer.enable(settings.interval_secs, settings.refresher)?;
        }

        Ok(Self {
            id,
            state: CallState::Idle,
            local_uri: config.local_uri.clone(),
            negotiator: OfferAnswerNegotiator::new(config.media.clone()),
            dialog: None,
            timer,
            expiry_policy: config.timer.expiry_policy,
            qos: config.qos,
            reliable_provisional: config.reliable_provisional,
            local_lines: Vec::new(),
            held_lines: None,
            media: None,
            early_media: None,
            local_version: 0,
            pending: None,
            cancelled: None,
            refresh_in_flight: None,
            expiry_refresh: false,
            last_rseq: None,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn dialog(&self) -> Option<&DialogContext> {
        self.dialog.as_ref()
    }

    /// Last committed description, `None` before establishment
    pub fn media_description(&self) -> Option<&NegotiatedMediaDescription> {
        self.media.as_ref()
    }

    pub fn early_media(&self) -> Option<&NegotiatedMediaDescription> {
        self.early_media.as_ref()
    }

    pub fn timer(&self) -> &SessionTimerManager {
        &self.timer
    }

    pub fn is_on_hold(&self) -> bool {
        self.held_lines.is_some()
    }

    pub fn qos(&self) -> Option<QosPreference> {
        self.qos
    }

    pub fn reliable_provisional(&self) -> bool {
        self.reliable_provisional
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // ===== Call-control intents =====

    /// Send the initial INVITE for `proposal`
    pub fn start_call(
        &mut self,
        remote_uri: impl Into<String>,
        proposal: MediaProposal,
        config: Option<ActionConfig>,
    ) -> Result<StepOutput> {
        let transition = self.lookup_intent(EventType::StartCall)?;
        if proposal.lines.is_empty() {
            return Err(NegotiationFailure::empty_description().into());
        }

        let mut proposal = proposal;
        if proposal.qos.is_none() {
            proposal.qos = self.qos;
        }
        proposal.reliable_provisional |= self.reliable_provisional;

        let version = self.local_version + 1;
        let offer = self.negotiator.propose_outbound(&proposal, None, version);
        if offer.lines.is_empty() {
            // nothing we asked for is locally supported
            return Err(NegotiationFailure::no_common_media().into());
        }

        let mut dialog = DialogContext::initialize(self.local_uri.clone(), remote_uri);
        let cseq = dialog.next_local_cseq();
        let mut request = OutboundRequest::new(SipMethod::Invite, dialog.snapshot(), cseq);
        request.body = Some(offer.clone());
        request.session_timer = self.timer_header();
        request.require_100rel = proposal.reliable_provisional;
        apply_action_config(&mut request, config);

        let lines: Vec<ProposedLine> = offer
            .lines
            .iter()
            .map(|l| ProposedLine { kind: l.kind, direction: l.direction })
            .collect();

        self.local_version = version;
        self.qos = proposal.qos;
        self.reliable_provisional = proposal.reliable_provisional;
        self.dialog = Some(dialog);
        self.local_lines = lines.clone();
        self.pending = Some(PendingInvite {
            operation: None,
            cseq,
            offer,
            lines,
            timer_request: None,
            provisional_received: false,
            reliable_answer: None,
        });

        let mut out = StepOutput::default();
        out.actions.push(Action::SendRequest(request));
        self.apply_next(&transition, &mut out);
        Ok(out)
    }

    /// Put all active lines on hold
    pub fn hold(&mut self, config: Option<ActionConfig>) -> Result<StepOutput> {
        let transition = self.lookup_intent(EventType::Hold)?;
        if self.held_lines.is_some() {
            return Err(SessionError::invalid_state("hold (already on hold)", self.state));
        }

        let override_direction = config.as_ref().and_then(|c| c.hold_direction);
        let lines = self
            .local_lines
            .iter()
            .map(|line| {
                let direction = match override_direction {
                    Some(direction) if line.direction != MediaDirection::Inactive => direction,
                    _ => line.direction.on_hold(),
                };
                ProposedLine { kind: line.kind, direction }
            })
            .collect();

        self.start_reinvite(UpdateKind::Hold, lines, None, config, &transition)
    }

    /// Restore the directions saved by the last successful hold
    pub fn resume(&mut self, config: Option<ActionConfig>) -> Result<StepOutput> {
        let transition = self.lookup_intent(EventType::Resume)?;
        let Some(lines) = self.held_lines.clone() else {
            return Err(SessionError::invalid_state("resume (not on hold)", self.state));
        };
        self.start_reinvite(UpdateKind::Resume, lines, None, config, &transition)
    }

    /// Offer an additional send-receive video line
    pub fn add_video(&mut self, config: Option<ActionConfig>) -> Result<StepOutput> {
        let transition = self.lookup_intent(EventType::AddVideo)?;
        if self.local_lines.iter().any(|l| l.kind == MediaKind::Video) {
            return Err(SessionError::MediaAlreadyPresent { kind: MediaKind::Video });
        }
        if self.negotiator.capabilities().for_kind(MediaKind::Video).is_none() {
            return Err(SessionError::config("no local video capability configured"));
        }

        let direction = if self.is_on_hold() {
            MediaDirection::SendRecv.on_hold()
        } else {
            MediaDirection::SendRecv
        };
        let mut lines = self.local_lines.clone();
        lines.push(ProposedLine { kind: MediaKind::Video, direction });

        self.start_reinvite(UpdateKind::AddVideo, lines, None, config, &transition)
    }

    /// Hand a DTMF digit to the media engine
    pub fn send_dtmf(&mut self, digit: char) -> Result<StepOutput> {
        self.lookup_intent(EventType::SendDtmf)?;
        let digit = DtmfDigit::new(digit)?;
        Ok(self.dtmf_output(digit))
    }

    /// Same as [`send_dtmf`](Self::send_dtmf) with a telephone-event code
    pub fn send_dtmf_code(&mut self, code: i32) -> Result<StepOutput> {
        self.lookup_intent(EventType::SendDtmf)?;
        let digit = DtmfDigit::from_code(code)?;
        Ok(self.dtmf_output(digit))
    }

    fn dtmf_output(&self, digit: DtmfDigit) -> StepOutput {
        debug!("Session {} sending DTMF {}", self.id, digit);
        let mut out = StepOutput::default();
        out.actions.push(Action::SendDtmf(digit));
        out
    }

    /// Request a session timer. Before the call it becomes part of the
    /// INVITE; on an established call it is negotiated with a re-INVITE.
    pub fn set_session_timer(&mut self, interval_secs: u32, refresher: Refresher) -> Result<StepOutput> {
        let transition = self.lookup_intent(EventType::SetSessionTimer)?;
        SessionTimerManager::validate_interval(interval_secs)?;

        if self.state == CallState::Idle {
            self.timer.enable(interval_secs, refresher)?;
            return Ok(StepOutput::default());
        }

        let lines = self.local_lines.clone();
        self.start_reinvite(UpdateKind::SessionTimer, lines, Some((interval_secs, refresher)), None, &transition)
    }

    /// Require reliable provisional responses on later offers
    pub fn set_100rel(&mut self, enabled: bool) -> Result<StepOutput> {
        self.lookup_intent(EventType::Set100rel)?;
        self.reliable_provisional = enabled;
        Ok(StepOutput::default())
    }

    /// QoS preference for later offers
    pub fn set_qos(&mut self, qos_type: QosType, strength: QosStrength) -> Result<StepOutput> {
        self.lookup_intent(EventType::SetQos)?;
        let preference = QosPreference::new(qos_type, strength);
        self.qos = if preference.is_disabled() { None } else { Some(preference) };
        Ok(StepOutput::default())
    }

    /// End the call from any live state
    pub fn terminate(&mut self) -> Result<StepOutput> {
        self.end_call(TerminationReason::LocalHangup)
    }

    /// Owner releases the session; terminates it first if still live
    pub fn release(&mut self) -> Result<StepOutput> {
        if self.state.is_terminated() {
            return Ok(StepOutput::default());
        }
        self.end_call(TerminationReason::Released)
    }

    fn end_call(&mut self, reason: TerminationReason) -> Result<StepOutput> {
        let transition = self.lookup_intent(EventType::Terminate)?;
        let mut out = StepOutput::default();

        match self.state {
            CallState::Calling | CallState::EarlyMedia => self.send_cancel(&mut out)?,
            CallState::Confirmed | CallState::Updating => self.send_bye(&mut out)?,
            CallState::Idle | CallState::Terminated => {}
        }

        self.finish(transition.next_state, reason, &mut out);
        Ok(out)
    }

    // ===== Collaborator events =====

    /// Feed a transport event. Protocol problems in the event are reported
    /// as [`SessionEvent::ProtocolError`] and the event is ignored.
    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) -> Result<StepOutput> {
        let mut out = StepOutput::default();
        let Some(event_type) = event.event_type() else {
            debug!("Session {} ignoring unsupported transport event {:?}", self.id, event);
            return Ok(out);
        };
        if self.state.is_terminated() {
            if let TransportEvent::Response(response) = &event {
                self.on_cancelled_invite_response(response, &mut out)?;
            }
            return Ok(out);
        }
        let Some(transition) = self.lookup_event(event_type) else {
            return Ok(out);
        };

        match event {
            TransportEvent::Response(response) if response.is_provisional() => {
                self.on_provisional(response, &transition, &mut out)?
            }
            TransportEvent::Response(response) if response.is_success() => {
                self.on_success(response, &transition, now, &mut out)?
            }
            TransportEvent::Response(response) => self.on_failure_response(response, &transition, &mut out)?,
            TransportEvent::Request(request) if request.method == SipMethod::Bye => {
                self.on_remote_bye(request, &transition, &mut out)
            }
            TransportEvent::Request(request) => self.on_remote_offer(request, now, &mut out),
            TransportEvent::Timeout { method, cseq } => {
                let message = format!("{} transaction (CSeq {}) timed out", method, cseq);
                self.finish(transition.next_state, TerminationReason::TransportFailure { message }, &mut out)
            }
            TransportEvent::TransportError { message } => {
                self.finish(transition.next_state, TerminationReason::TransportFailure { message }, &mut out)
            }
        }

        Ok(out)
    }

    /// Feed a media engine report
    pub fn handle_media_event(&mut self, event: MediaEvent) -> Result<StepOutput> {
        let mut out = StepOutput::default();
        let Some(transition) = self.lookup_event(event.event_type()) else {
            return Ok(out);
        };

        match event {
            MediaEvent::DtmfSent { digit } => out.events.push(SessionEvent::DtmfCompleted {
                session_id: self.id.clone(),
                digit,
                success: true,
                reason: None,
            }),
            MediaEvent::DtmfFailed { digit, reason } => out.events.push(SessionEvent::DtmfCompleted {
                session_id: self.id.clone(),
                digit,
                success: false,
                reason: Some(reason),
            }),
            MediaEvent::Failure { message } => {
                warn!("Session {} media failure: {}", self.id, message);
                if self.state.is_established() {
                    self.send_bye(&mut out)?;
                } else {
                    self.send_cancel(&mut out)?;
                }
                self.finish(transition.next_state, TerminationReason::MediaFailure { message }, &mut out);
            }
        }

        Ok(out)
    }

    /// Check the session timer
    pub fn tick(&mut self, now: Instant) -> Result<StepOutput> {
        let mut out = StepOutput::default();
        if !self.state.is_established() {
            return Ok(out);
        }

        match self.timer.check_expiry(now) {
            TimerStatus::Disarmed | TimerStatus::Armed => {}
            TimerStatus::Due => {
                if self.lookup_event(EventType::TimerDue).is_some() && self.can_send_refresh() && self.timer.is_local_refresher() {
                    self.send_refresh(&mut out)?;
                }
            }
            TimerStatus::Expired => {
                let Some(transition) = self.lookup_event(EventType::TimerExpired) else {
                    return Ok(out);
                };
                self.on_timer_expired(&transition, now, &mut out)?;
            }
        }

        Ok(out)
    }

    // ===== Handlers =====

    fn on_provisional(&mut self, response: InboundResponse, transition: &Transition, out: &mut StepOutput) -> Result<()> {
        if !self.answers_pending(&response) {
            debug!("Session {} ignoring provisional {} for CSeq {}", self.id, response.status, response.cseq);
            return Ok(());
        }

        if let Some(tags) = &response.tags {
            if let Some(dialog) = self.dialog.as_mut() {
                if let Err(e) = dialog.apply_response(ResponseKind::Provisional, tags, &response.route_set) {
                    self.protocol_error(e, out);
                    return Ok(());
                }
            }
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.provisional_received = true;
        }

        if let Some(rseq) = response.rseq {
            if self.last_rseq.is_some_and(|last| rseq <= last) {
                debug!("Session {} ignoring duplicate reliable provisional RSeq {}", self.id, rseq);
                return Ok(());
            }
            self.send_prack(rseq, response.cseq, out)?;
        }

        let has_early_media = self.accept_early_media(&response, out);
        out.events.push(SessionEvent::CallProgress {
            session_id: self.id.clone(),
            status: response.status,
            early_media: has_early_media,
        });

        if guards_hold(transition, |guard| match guard {
            Guard::HasEarlyMedia => has_early_media,
            Guard::AnswersPendingInvite => true,
        }) {
            self.apply_next(transition, out);
        }
        Ok(())
    }

    /// Negotiate early media of the initial INVITE. The description is
    /// handed to the media engine but not committed. An answer in a
    /// reliable provisional is kept for a 2xx without a body (RFC 3262).
    fn accept_early_media(&mut self, response: &InboundResponse, out: &mut StepOutput) -> bool {
        let (Some(body), Some(pending)) = (&response.body, &self.pending) else {
            return false;
        };
        if pending.operation.is_some() {
            return false;
        }

        match self.negotiator.accept_inbound(body, &pending.offer) {
            Ok(outcome) => {
                if self.early_media.as_ref() != Some(&outcome.description) {
                    out.actions.push(Action::ApplyMedia(outcome.description.clone()));
                    self.early_media = Some(outcome.description.clone());
                }
                if response.rseq.is_some() {
                    if let Some(pending) = self.pending.as_mut() {
                        pending.reliable_answer = Some(outcome);
                    }
                }
                true
            }
            Err(failure) => {
                warn!("Session {} ignoring unusable early media: {}", self.id, failure);
                false
            }
        }
    }

    fn on_success(
        &mut self,
        response: InboundResponse,
        transition: &Transition,
        now: Instant,
        out: &mut StepOutput,
    ) -> Result<()> {
        if response.method == SipMethod::Update && self.refresh_in_flight == Some(response.cseq) {
            self.on_refresh_answered(&response, now, out);
            return Ok(());
        }

        if !self.answers_pending(&response) {
            if response.method == SipMethod::Invite && self.state.is_established() {
                debug!("Session {} re-acknowledging 2xx retransmission", self.id);
                let ack = self.request_with_cseq(SipMethod::Ack, response.cseq)?;
                out.actions.push(Action::SendRequest(ack));
            } else {
                debug!("Session {} ignoring {} for CSeq {}", self.id, response.status, response.cseq);
            }
            return Ok(());
        }

        let Some(mut pending) = self.pending.take() else {
            return Ok(());
        };

        let kind = ResponseKind::Final;
        let dialog_result = match (&response.tags, self.dialog.as_mut()) {
            (Some(tags), Some(dialog)) => dialog.apply_response(kind, tags, &response.route_set),
            (None, _) if pending.operation.is_none() => {
                Err(SessionError::protocol_violation("2xx to INVITE without dialog tags"))
            }
            _ => Ok(()),
        };
        if let Err(e) = dialog_result {
            self.pending = Some(pending);
            self.protocol_error(e, out);
            return Ok(());
        }

        let ack = self.request_with_cseq(SipMethod::Ack, pending.cseq)?;
        out.actions.push(Action::SendRequest(ack));

        let negotiated = match (&response.body, pending.reliable_answer.take()) {
            (Some(answer), _) => self.negotiator.accept_inbound(answer, &pending.offer),
            (None, Some(outcome)) => Ok(outcome),
            (None, None) => Err(NegotiationFailure::empty_description()),
        };

        match (pending.operation, negotiated) {
            (None, Ok(outcome)) => {
                let description = self.establish(pending, outcome, &response, now, out);
                self.apply_next(transition, out);
                out.events.push(SessionEvent::CallEstablished { session_id: self.id.clone(), description });
            }
            (None, Err(failure)) => {
                warn!("Session {} answer unusable, tearing down: {}", self.id, failure);
                self.send_bye(out)?;
                self.finish(transition.failure_state, TerminationReason::NoCommonMedia, out);
            }
            (Some(operation), Ok(outcome)) => {
                self.commit_update(operation, pending, outcome, &response, now, out);
                self.apply_next(transition, out);
            }
            (Some(operation), Err(failure)) => {
                warn!("Session {} {:?} failed, keeping previous description: {}", self.id, operation, failure);
                out.events.push(SessionEvent::UpdateFailed {
                    session_id: self.id.clone(),
                    operation,
                    reason: failure.to_string(),
                });
                self.apply_next(transition, out);
            }
        }
        Ok(())
    }

    fn establish(
        &mut self,
        pending: PendingInvite,
        outcome: NegotiationOutcome,
        response: &InboundResponse,
        now: Instant,
        out: &mut StepOutput,
    ) -> NegotiatedMediaDescription {
        let description = outcome.description;
        self.local_lines = pending.lines;
        self.local_lines.retain(|l| description.has_kind(l.kind));
        self.early_media = None;
        self.media = Some(description.clone());
        out.actions.push(Action::ApplyMedia(description.clone()));
        self.report_dropped(outcome.dropped, out);

        match response.session_timer {
            Some(header) => self.timer.on_refresh_received(
                SessionRefresh {
                    interval_secs: header.interval_secs,
                    refresher: header.refresher,
                    via_offer_answer: true,
                },
                now,
            ),
            None => self.timer.arm(now),
        }
        description
    }

    /// Replace the committed description after a successful re-INVITE
    fn commit_update(
        &mut self,
        operation: UpdateKind,
        pending: PendingInvite,
        outcome: NegotiationOutcome,
        response: &InboundResponse,
        now: Instant,
        out: &mut StepOutput,
    ) {
        let description = outcome.description;
        let previous = std::mem::replace(&mut self.local_lines, pending.lines);
        self.local_lines.retain(|l| description.has_kind(l.kind));

        match operation {
            UpdateKind::Hold => self.held_lines = Some(previous),
            UpdateKind::Resume => self.held_lines = None,
            UpdateKind::AddVideo => {
                if let Some(held) = self.held_lines.as_mut() {
                    held.push(ProposedLine { kind: MediaKind::Video, direction: MediaDirection::SendRecv });
                }
            }
            _ => {}
        }
        if let Some(held) = self.held_lines.as_mut() {
            held.retain(|l| description.has_kind(l.kind));
        }

        info!("Session {} {:?} committed, directions {:?}", self.id, operation, description.directions());
        self.media = Some(description.clone());
        out.actions.push(Action::ApplyMedia(description.clone()));
        out.events.push(SessionEvent::MediaUpdated {
            session_id: self.id.clone(),
            operation,
            description,
        });
        self.report_dropped(outcome.dropped, out);

        let refresh = response
            .session_timer
            .map(|h| (h.interval_secs, h.refresher))
            .or(pending.timer_request)
            .or_else(|| self.timer.state().map(|s| (s.interval_secs, s.refresher)));
        if let Some((interval_secs, refresher)) = refresh {
            self.timer.on_refresh_received(SessionRefresh { interval_secs, refresher, via_offer_answer: true }, now);
            self.report_refreshed(out);
        }
    }

    fn on_refresh_answered(&mut self, response: &InboundResponse, now: Instant, out: &mut StepOutput) {
        self.refresh_in_flight = None;
        self.expiry_refresh = false;

        let refresh = response
            .session_timer
            .map(|h| (h.interval_secs, h.refresher))
            .or_else(|| self.timer.state().map(|s| (s.interval_secs, s.refresher)));
        if let Some((interval_secs, refresher)) = refresh {
            self.timer.on_refresh_received(SessionRefresh { interval_secs, refresher, via_offer_answer: false }, now);
            self.report_refreshed(out);
        }
    }

    fn on_failure_response(&mut self, response: InboundResponse, transition: &Transition, out: &mut StepOutput) -> Result<()> {
        let status = response.status;

        if response.method == SipMethod::Update && self.refresh_in_flight == Some(response.cseq) {
            self.refresh_in_flight = None;
            if is_dialog_fatal(status) {
                return self.dialog_failure(status, transition, out);
            }
            if std::mem::take(&mut self.expiry_refresh) {
                self.send_bye(out)?;
                self.finish(transition.failure_state, TerminationReason::SessionTimerExpired, out);
                return Ok(());
            }
            warn!("Session {} refresh rejected with {}", self.id, status);
            out.events.push(SessionEvent::UpdateFailed {
                session_id: self.id.clone(),
                operation: UpdateKind::Refresh,
                reason: format!("{} response", status),
            });
            return Ok(());
        }

        if !self.answers_pending(&response) {
            debug!("Session {} ignoring {} for CSeq {}", self.id, status, response.cseq);
            return Ok(());
        }
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        match pending.operation {
            None => {
                info!("Session {} call rejected with {}", self.id, status);
                self.finish(transition.next_state, TerminationReason::Rejected { status }, out);
            }
            Some(_) if is_dialog_fatal(status) => self.dialog_failure(status, transition, out)?,
            Some(operation) => {
                warn!("Session {} {:?} rejected with {}, keeping previous description", self.id, operation, status);
                out.events.push(SessionEvent::UpdateFailed {
                    session_id: self.id.clone(),
                    operation,
                    reason: format!("{} response", status),
                });
                self.apply_next(transition, out);
            }
        }
        Ok(())
    }

    /// 408/481 to a mid-call request: the dialog is gone
    fn dialog_failure(&mut self, status: u16, transition: &Transition, out: &mut StepOutput) -> Result<()> {
        warn!("Session {} dialog failed with {}", self.id, status);
        if status == 408 {
            self.send_bye(out)?;
        }
        self.finish(transition.failure_state, TerminationReason::DialogFailure { status }, out);
        Ok(())
    }

    fn on_remote_offer(&mut self, request: InboundRequest, now: Instant, out: &mut StepOutput) {
        if !self.accept_remote_cseq(&request, out) {
            return;
        }

        if self.state == CallState::Updating {
            debug!("Session {} glare on {}, answering 491", self.id, request.method);
            out.actions.push(Action::SendResponse(OutboundResponse::new(
                491,
                "Request Pending",
                request.method,
                request.cseq,
            )));
            return;
        }

        let Some(offer) = request.body.clone() else {
            // refresh without renegotiation
            self.apply_remote_refresh(&request, false, now);
            let mut response = OutboundResponse::new(200, "OK", request.method, request.cseq);
            response.session_timer = self.timer_header();
            if request.method == SipMethod::Invite {
                response.body = Some(self.current_offer(self.local_version));
            }
            out.actions.push(Action::SendResponse(response));
            self.report_refreshed(out);
            return;
        };

        let lines = self.answerable_lines(&offer);
        let version = self.local_version + 1;
        let proposal = MediaProposal::new(lines.clone()).with_qos(self.qos);
        let local = self.negotiator.propose_outbound(&proposal, self.media.as_ref(), version);

        match self.negotiator.accept_inbound(&offer, &local) {
            Ok(outcome) => {
                let answer = self.negotiator.build_answer(&offer, &outcome, version);
                self.local_version = version;

                let description = outcome.description;
                self.local_lines = lines;
                self.local_lines.retain(|l| description.has_kind(l.kind));
                if let Some(held) = self.held_lines.as_mut() {
                    for line in &self.local_lines {
                        if !held.iter().any(|h| h.kind == line.kind) {
                            held.push(ProposedLine { kind: line.kind, direction: MediaDirection::SendRecv });
                        }
                    }
                    held.retain(|l| description.has_kind(l.kind));
                }

                self.apply_remote_refresh(&request, true, now);
                let mut response = OutboundResponse::new(200, "OK", request.method, request.cseq);
                response.body = Some(answer);
                response.session_timer = self.timer_header();
                out.actions.push(Action::SendResponse(response));

                info!("Session {} accepted remote offer, directions {:?}", self.id, description.directions());
                self.media = Some(description.clone());
                out.actions.push(Action::ApplyMedia(description.clone()));
                out.events.push(SessionEvent::MediaUpdated {
                    session_id: self.id.clone(),
                    operation: UpdateKind::RemoteOffer,
                    description,
                });
                self.report_dropped(outcome.dropped, out);
                self.report_refreshed(out);
            }
            Err(failure) => {
                warn!("Session {} rejecting remote offer: {}", self.id, failure);
                out.actions.push(Action::SendResponse(OutboundResponse::new(
                    488,
                    "Not Acceptable Here",
                    request.method,
                    request.cseq,
                )));
                out.events.push(SessionEvent::UpdateFailed {
                    session_id: self.id.clone(),
                    operation: UpdateKind::RemoteOffer,
                    reason: failure.to_string(),
                });
            }
        }
    }

    fn on_remote_bye(&mut self, request: InboundRequest, transition: &Transition, out: &mut StepOutput) {
        if !self.accept_remote_cseq(&request, out) {
            return;
        }
        out.actions.push(Action::SendResponse(OutboundResponse::new(200, "OK", SipMethod::Bye, request.cseq)));
        self.finish(transition.next_state, TerminationReason::RemoteHangup, out);
    }

    fn on_timer_expired(&mut self, transition: &Transition, now: Instant, out: &mut StepOutput) -> Result<()> {
        match self.expiry_policy {
            ExpiryPolicy::Refresh if !self.expiry_refresh => {
                info!("Session {} timer expired, attempting a last refresh", self.id);
                if let Some(state) = self.timer.state().copied() {
                    self.timer.on_refresh_received(
                        SessionRefresh {
                            interval_secs: state.interval_secs,
                            refresher: state.refresher,
                            via_offer_answer: false,
                        },
                        now,
                    );
                }
                if self.can_send_refresh() {
                    self.send_refresh(out)?;
                }
                self.expiry_refresh = true;
            }
            _ => {
                warn!("Session {} timer expired without refresh", self.id);
                self.send_bye(out)?;
                self.finish(transition.next_state, TerminationReason::SessionTimerExpired, out);
            }
        }
        Ok(())
    }

    // ===== Helpers =====

    fn lookup_intent(&self, event: EventType) -> Result<Transition> {
        match MASTER_TABLE.get(self.state, event) {
            Some(transition) => Ok(transition.clone()),
            None => {
                debug!("Session {} rejecting {} in state {}", self.id, event.name(), self.state);
                Err(SessionError::invalid_state(event.name(), self.state))
            }
        }
    }

    fn lookup_event(&self, event: EventType) -> Option<Transition> {
        let transition = MASTER_TABLE.get(self.state, event).cloned();
        if transition.is_none() {
            debug!("Session {} dropping {} in state {}", self.id, event.name(), self.state);
        }
        transition
    }

    fn answers_pending(&self, response: &InboundResponse) -> bool {
        response.method == SipMethod::Invite && self.pending.as_ref().is_some_and(|p| p.cseq == response.cseq)
    }

    fn apply_next(&mut self, transition: &Transition, out: &mut StepOutput) {
        if let Some(next) = transition.next_state {
            self.transition_to(next, out);
        }
    }

    fn transition_to(&mut self, next: CallState, out: &mut StepOutput) {
        if next == self.state {
            return;
        }
        let old = std::mem::replace(&mut self.state, next);
        info!("Session {} {} -> {}", self.id, old, next);
        out.events.push(SessionEvent::StateChanged {
            session_id: self.id.clone(),
            old_state: old,
            new_state: next,
            timestamp: Utc::now(),
        });
    }

    /// Move to `target`; entering `Terminated` goes through the cleanup path
    fn finish(&mut self, target: Option<CallState>, reason: TerminationReason, out: &mut StepOutput) {
        match target {
            Some(CallState::Terminated) => self.terminate_with(reason, out),
            Some(state) => self.transition_to(state, out),
            None => {}
        }
    }

    /// Single termination path: releases dialog, media and timer exactly once
    fn terminate_with(&mut self, reason: TerminationReason, out: &mut StepOutput) {
        if self.state.is_terminated() {
            return;
        }

        if let Some(dialog) = self.dialog.as_mut() {
            dialog.terminate();
        }
        let had_media = self.media.take().is_some();
        let had_early_media = self.early_media.take().is_some();
        if had_media || had_early_media {
            out.actions.push(Action::StopMedia);
        }
        self.timer.disarm();
        self.pending = None;
        self.refresh_in_flight = None;
        self.expiry_refresh = false;
        self.held_lines = None;

        self.transition_to(CallState::Terminated, out);
        out.events.push(SessionEvent::CallTerminated { session_id: self.id.clone(), reason });
    }

    fn start_reinvite(
        &mut self,
        operation: UpdateKind,
        lines: Vec<ProposedLine>,
        timer_request: Option<(u32, Refresher)>,
        config: Option<ActionConfig>,
        transition: &Transition,
    ) -> Result<StepOutput> {
        let version = self.local_version + 1;
        let proposal = MediaProposal::new(lines.clone()).with_qos(self.qos);
        let offer = self.negotiator.propose_outbound(&proposal, self.media.as_ref(), version);

        let mut request = self.new_request(SipMethod::Invite)?;
        request.body = Some(offer.clone());
        request.session_timer = timer_request
            .map(|(interval_secs, refresher)| SessionTimerHeader { interval_secs, refresher })
            .or_else(|| self.timer_header());
        request.require_100rel = self.reliable_provisional;
        apply_action_config(&mut request, config);

        debug!("Session {} starting {:?} with CSeq {}", self.id, operation, request.cseq);
        self.local_version = version;
        self.pending = Some(PendingInvite {
            operation: Some(operation),
            cseq: request.cseq,
            offer,
            lines,
            timer_request,
            provisional_received: false,
            reliable_answer: None,
        });

        let mut out = StepOutput::default();
        out.actions.push(Action::SendRequest(request));
        self.apply_next(transition, &mut out);
        Ok(out)
    }

    fn new_request(&mut self, method: SipMethod) -> Result<OutboundRequest> {
        let dialog = self
            .dialog
            .as_mut()
            .ok_or_else(|| SessionError::protocol_violation(format!("cannot send {} without a dialog", method)))?;
        let cseq = dialog.next_local_cseq();
        Ok(OutboundRequest::new(method, dialog.snapshot(), cseq))
    }

    /// ACK and CANCEL reuse the INVITE's CSeq number
    fn request_with_cseq(&self, method: SipMethod, cseq: u32) -> Result<OutboundRequest> {
        let dialog = self
            .dialog
            .as_ref()
            .ok_or_else(|| SessionError::protocol_violation(format!("cannot send {} without a dialog", method)))?;
        Ok(OutboundRequest::new(method, dialog.snapshot(), cseq))
    }

    fn send_bye(&mut self, out: &mut StepOutput) -> Result<()> {
        let bye = self.new_request(SipMethod::Bye)?;
        out.actions.push(Action::SendRequest(bye));
        Ok(())
    }

    /// CANCEL the initial INVITE. Before any provisional response the
    /// CANCEL is held back until one arrives (RFC 3261 §9.1).
    fn send_cancel(&mut self, out: &mut StepOutput) -> Result<()> {
        let Some((cseq, provisional_received)) = self.pending.as_ref().map(|p| (p.cseq, p.provisional_received))
        else {
            return Ok(());
        };
        if provisional_received {
            let cancel = self.request_with_cseq(SipMethod::Cancel, cseq)?;
            out.actions.push(Action::SendRequest(cancel));
        } else {
            debug!("Session {} holding CANCEL for CSeq {} until a provisional arrives", self.id, cseq);
        }
        self.cancelled = Some(CancelledInvite { cseq, cancel_sent: provisional_received });
        Ok(())
    }

    /// Responses to a cancelled INVITE that arrive after termination. A
    /// held-back CANCEL goes out on the first provisional; a 2xx that
    /// crossed the CANCEL is acknowledged and closed with BYE.
    fn on_cancelled_invite_response(&mut self, response: &InboundResponse, out: &mut StepOutput) -> Result<()> {
        let Some(cancelled) = self.cancelled.filter(|c| response.method == SipMethod::Invite && c.cseq == response.cseq)
        else {
            debug!("Session {} dropping {} for CSeq {} after termination", self.id, response.status, response.cseq);
            return Ok(());
        };

        if response.is_provisional() {
            if !cancelled.cancel_sent {
                let cancel = self.request_with_cseq(SipMethod::Cancel, cancelled.cseq)?;
                out.actions.push(Action::SendRequest(cancel));
                self.cancelled = Some(CancelledInvite { cancel_sent: true, ..cancelled });
            }
            return Ok(());
        }

        if response.is_success() {
            info!("Session {} answered after CANCEL, closing the dialog", self.id);
            let mut ack = self.request_with_cseq(SipMethod::Ack, cancelled.cseq)?;
            let mut bye = self.new_request(SipMethod::Bye)?;
            if let Some(tags) = &response.tags {
                for request in [&mut ack, &mut bye] {
                    request.dialog.local_tag = Some(tags.local.clone());
                    request.dialog.remote_tag = Some(tags.remote.clone());
                    request.dialog.route_set = response.route_set.clone();
                }
            }
            out.actions.push(Action::SendRequest(ack));
            out.actions.push(Action::SendRequest(bye));
        }
        // non-2xx finals are acknowledged by the transaction layer
        self.cancelled = None;
        Ok(())
    }

    fn send_prack(&mut self, rseq: u32, invite_cseq: u32, out: &mut StepOutput) -> Result<()> {
        let mut prack = self.new_request(SipMethod::Prack)?;
        prack.rack = Some(RAck { rseq, cseq: invite_cseq, method: SipMethod::Invite });
        debug!("Session {} acknowledging RSeq {} with PRACK", self.id, rseq);
        self.last_rseq = Some(rseq);
        out.actions.push(Action::SendRequest(prack));
        Ok(())
    }

    fn can_send_refresh(&self) -> bool {
        self.state == CallState::Confirmed && self.refresh_in_flight.is_none() && self.pending.is_none()
    }

    /// Session refresh: UPDATE without a body
    fn send_refresh(&mut self, out: &mut StepOutput) -> Result<()> {
        let mut update = self.new_request(SipMethod::Update)?;
        update.session_timer = self.timer_header();
        debug!("Session {} sending session refresh with CSeq {}", self.id, update.cseq);
        self.refresh_in_flight = Some(update.cseq);
        out.actions.push(Action::SendRequest(update));
        out.events.push(SessionEvent::RefreshDue { session_id: self.id.clone() });
        Ok(())
    }

    fn timer_header(&self) -> Option<SessionTimerHeader> {
        self.timer
            .state()
            .map(|s| (s.interval_secs, s.refresher))
            .or(self.timer.requested())
            .map(|(interval_secs, refresher)| SessionTimerHeader { interval_secs, refresher })
    }

    fn apply_remote_refresh(&mut self, request: &InboundRequest, via_offer_answer: bool, now: Instant) {
        let refresh = request
            .session_timer
            .map(|h| (h.interval_secs, h.refresher))
            .or_else(|| self.timer.state().map(|s| (s.interval_secs, s.refresher)));
        if let Some((interval_secs, refresher)) = refresh {
            self.timer.on_refresh_received(SessionRefresh { interval_secs, refresher, via_offer_answer }, now);
        }
    }

    /// In-order check for a request from the remote side. Retransmissions
    /// and out-of-order requests are not processed further.
    fn accept_remote_cseq(&mut self, request: &InboundRequest, out: &mut StepOutput) -> bool {
        let Some(dialog) = self.dialog.as_mut() else {
            return false;
        };
        match dialog.record_remote_cseq(request.cseq, request.retransmission) {
            Ok(()) if request.retransmission => {
                debug!("Session {} ignoring retransmitted {}", self.id, request.method);
                false
            }
            Ok(()) => true,
            Err(e) => {
                out.actions.push(Action::SendResponse(OutboundResponse::new(
                    500,
                    "Server Internal Error",
                    request.method,
                    request.cseq,
                )));
                self.protocol_error(e, out);
                false
            }
        }
    }

    /// Lines to answer a remote offer with: what we have now, plus any
    /// offered kind we support but do not use yet
    fn answerable_lines(&self, offer: &SessionDescription) -> Vec<ProposedLine> {
        let mut lines = self.local_lines.clone();
        for offered in &offer.lines {
            let known = lines.iter().any(|l| l.kind == offered.kind);
            if !known && self.negotiator.capabilities().for_kind(offered.kind).is_some() {
                let direction = if self.is_on_hold() {
                    MediaDirection::SendRecv.on_hold()
                } else {
                    MediaDirection::SendRecv
                };
                lines.push(ProposedLine { kind: offered.kind, direction });
            }
        }
        lines
    }

    /// Our current view as a description, for offerless re-INVITEs
    fn current_offer(&self, version: u64) -> SessionDescription {
        let proposal = MediaProposal::new(self.local_lines.clone()).with_qos(self.qos);
        self.negotiator.propose_outbound(&proposal, self.media.as_ref(), version)
    }

    fn report_dropped(&self, dropped: Vec<DroppedLine>, out: &mut StepOutput) {
        if dropped.is_empty() {
            return;
        }
        info!("Session {} dropped {} media line(s)", self.id, dropped.len());
        out.events.push(SessionEvent::MediaLinesDropped { session_id: self.id.clone(), dropped });
    }

    fn report_refreshed(&self, out: &mut StepOutput) {
        if let Some(state) = self.timer.state() {
            out.events.push(SessionEvent::SessionRefreshed {
                session_id: self.id.clone(),
                interval_secs: state.interval_secs,
            });
        }
    }

    fn protocol_error(&self, error: SessionError, out: &mut StepOutput) {
        warn!("Session {} protocol error: {}", self.id, error);
        out.events.push(SessionEvent::ProtocolError {
            session_id: self.id.clone(),
            message: error.to_string(),
        });
    }
}

fn guards_hold(transition: &Transition, check: impl Fn(Guard) -> bool) -> bool {
    transition.guards.iter().all(|guard| check(*guard))
}

/// 408 and 481 to a mid-dialog request mean the dialog no longer exists
fn is_dialog_fatal(status: u16) -> bool {
    matches!(status, 408 | 481)
}

fn apply_action_config(request: &mut OutboundRequest, config: Option<ActionConfig>) {
    if let Some(config) = config {
        request.headers.extend(config.headers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::DialogTags;
    use crate::types::{MediaFormat, MediaLine};

    fn session() -> CallSession {
        CallSession::new(SessionId("test".to_string()), &CallSessionConfig::new("sip:alice@example.com")).unwrap()
    }

    fn invite_cseq(out: &StepOutput) -> u32 {
        match &out.actions[0] {
            Action::SendRequest(request) => request.cseq,
            other => panic!("expected request, got {:?}", other),
        }
    }

    fn audio_answer(direction: MediaDirection) -> SessionDescription {
        SessionDescription::new(
            1,
            "192.0.2.20",
            vec![MediaLine::new(MediaKind::Audio, direction, 30000, vec![MediaFormat::pcmu()])],
        )
    }

    fn ok(cseq: u32, body: SessionDescription) -> TransportEvent {
        TransportEvent::Response(
            InboundResponse::new(200, SipMethod::Invite, cseq)
                .with_tags(DialogTags::new("local", "remote"))
                .with_body(body),
        )
    }

    fn confirmed() -> CallSession {
        let mut session = session();
        let out = session.start_call("sip:bob@example.com", MediaProposal::audio(), None).unwrap();
        let cseq = invite_cseq(&out);
        session
            .handle_transport_event(ok(cseq, audio_answer(MediaDirection::SendRecv)), Instant::now())
            .unwrap();
        assert_eq!(session.state(), CallState::Confirmed);
        session
    }

    #[test]
    fn test_start_call_sends_invite() {
        let mut session = session();
        let out = session.start_call("sip:bob@example.com", MediaProposal::audio(), None).unwrap();

        assert_eq!(session.state(), CallState::Calling);
        assert_eq!(out.actions[0].request_method(), Some(SipMethod::Invite));
        assert!(matches!(
            out.events.as_slice(),
            [SessionEvent::StateChanged { old_state: CallState::Idle, new_state: CallState::Calling, .. }]
        ));
    }

    #[test]
    fn test_start_call_twice_is_invalid() {
        let mut session = session();
        session.start_call("sip:bob@example.com", MediaProposal::audio(), None).unwrap();
        let err = session.start_call("sip:bob@example.com", MediaProposal::audio(), None).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { state: CallState::Calling, .. }));
        assert_eq!(session.state(), CallState::Calling);
    }

    #[test]
    fn test_provisional_without_media_stays_calling() {
        let mut session = session();
        let out = session.start_call("sip:bob@example.com", MediaProposal::audio(), None).unwrap();
        let cseq = invite_cseq(&out);

        let ringing = InboundResponse::new(180, SipMethod::Invite, cseq).with_tags(DialogTags::new("local", "remote"));
        session.handle_transport_event(TransportEvent::Response(ringing), Instant::now()).unwrap();
        assert_eq!(session.state(), CallState::Calling);

        let progress = InboundResponse::new(183, SipMethod::Invite, cseq)
            .with_tags(DialogTags::new("local", "remote"))
            .with_body(audio_answer(MediaDirection::SendRecv));
        let out = session.handle_transport_event(TransportEvent::Response(progress), Instant::now()).unwrap();
        assert_eq!(session.state(), CallState::EarlyMedia);
        assert!(session.media_description().is_none());
        assert!(out.actions.iter().any(|a| matches!(a, Action::ApplyMedia(_))));
    }

    #[test]
    fn test_answer_acknowledged() {
        let mut session = session();
        let out = session.start_call("sip:bob@example.com", MediaProposal::audio(), None).unwrap();
        let cseq = invite_cseq(&out);

        let out = session
            .handle_transport_event(ok(cseq, audio_answer(MediaDirection::SendRecv)), Instant::now())
            .unwrap();
        match &out.actions[0] {
            Action::SendRequest(ack) => {
                assert_eq!(ack.method, SipMethod::Ack);
                assert_eq!(ack.cseq, cseq);
            }
            other => panic!("expected ACK, got {:?}", other),
        }
        assert!(session.media_description().is_some());
    }

    #[test]
    fn test_dtmf_validation() {
        let mut session = confirmed();
        let out = session.send_dtmf('5').unwrap();
        assert!(matches!(out.actions.as_slice(), [Action::SendDtmf(d)] if d.as_char() == '5'));

        let err = session.send_dtmf('X').unwrap_err();
        assert!(matches!(err, SessionError::InvalidDigit { .. }));
        assert_eq!(session.state(), CallState::Confirmed);
    }

    #[test]
    fn test_terminated_rejects_everything() {
        let mut session = confirmed();
        session.terminate().unwrap();
        assert_eq!(session.state(), CallState::Terminated);
        assert!(session.dialog().is_some_and(|d| d.state() == crate::dialog::DialogState::Terminated));
        assert!(session.terminate().is_err());
        assert!(session.hold(None).is_err());
        assert!(session.send_dtmf('1').is_err());
    }

    #[test]
    fn test_terminate_from_idle_sends_nothing() {
        let mut session = session();
        let out = session.terminate().unwrap();
        assert!(out.actions.is_empty());
        assert_eq!(session.state(), CallState::Terminated);
    }

    #[test]
    fn test_set_qos_disabled_clears_preference() {
        let mut session = session();
        session.set_qos(QosType::Segmented, QosStrength::Optional).unwrap();
        assert!(session.qos().is_some());
        session.set_qos(QosType::None, QosStrength::None).unwrap();
        assert!(session.qos().is_none());
    }
}
