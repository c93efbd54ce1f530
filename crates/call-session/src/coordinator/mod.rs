//! Call session coordinator
//!
//! Owns every live [`CallSession`] and is the single entry point for
//! intents and collaborator events. Each session sits behind its own
//! `tokio::sync::Mutex`: an operation holds it from table lookup until
//! the resulting actions have been executed, so one session never has
//! two transitions in flight while distinct sessions run concurrently.

use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::adapters::{MediaAdapter, SignalingAdapter};
use crate::config::CallSessionConfig;
use crate::errors::{Result, SessionError};
use crate::events::{SessionEventBus, SessionEventSubscriber};
use crate::state_machine::{execute_action, Action, CallSession, MediaEvent, StepOutput, TransportEvent};
use crate::state_table::CallState;
use crate::timer::Refresher;
use crate::types::{ActionConfig, DtmfDigit, MediaProposal, NegotiatedMediaDescription, QosStrength, QosType, SessionId};

type SessionHandle = Arc<Mutex<CallSession>>;

/// Where a failed action is reported back into the session
enum FailureRoute {
    Transport,
    Media,
    Dtmf(DtmfDigit),
}

impl FailureRoute {
    fn for_action(action: &Action) -> Self {
        match action {
            Action::SendRequest(_) | Action::SendResponse(_) => FailureRoute::Transport,
            Action::ApplyMedia(_) | Action::StopMedia => FailureRoute::Media,
            Action::SendDtmf(digit) => FailureRoute::Dtmf(*digit),
        }
    }
}

/// Entry point for all call sessions of one user agent
pub struct CallSessionCoordinator {
    config: CallSessionConfig,
    sessions: DashMap<SessionId, SessionHandle>,
    /// Call-ID index for routing transport events
    by_call_id: DashMap<String, SessionId>,
    signaling: Arc<dyn SignalingAdapter>,
    media: Arc<dyn MediaAdapter>,
    events: SessionEventBus,
}

impl std::fmt::Debug for CallSessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionCoordinator")
            .field("sessions", &self.sessions.len())
            .field("local_uri", &self.config.local_uri)
            .finish()
    }
}

impl CallSessionCoordinator {
    pub fn new(
        config: CallSessionConfig,
        signaling: Arc<dyn SignalingAdapter>,
        media: Arc<dyn MediaAdapter>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let events = SessionEventBus::new(config.event_channel_capacity);
        info!("Call session coordinator started for {}", config.local_uri);

        Ok(Arc::new(Self {
            config,
            sessions: DashMap::new(),
            by_call_id: DashMap::new(),
            signaling,
            media,
            events,
        }))
    }

    pub fn config(&self) -> &CallSessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> SessionEventSubscriber {
        self.events.subscribe()
    }

    /// Create an idle call session
    pub fn create_session(&self) -> Result<SessionId> {
        let session_id = SessionId::new();
        let session = CallSession::new(session_id.clone(), &self.config)?;
        self.sessions.insert(session_id.clone(), Arc::new(Mutex::new(session)));
        debug!("Created call session {}", session_id);
        Ok(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Session owning the dialog with `call_id`
    pub fn find_by_call_id(&self, call_id: &str) -> Option<SessionId> {
        self.by_call_id.get(call_id).map(|entry| entry.value().clone())
    }

    pub async fn state(&self, session_id: &SessionId) -> Result<CallState> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        Ok(session.state())
    }

    pub async fn media_description(&self, session_id: &SessionId) -> Result<Option<NegotiatedMediaDescription>> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        Ok(session.media_description().cloned())
    }

    // ===== Call-control intents =====

    pub async fn start_call(
        &self,
        session_id: &SessionId,
        remote_uri: &str,
        proposal: MediaProposal,
        config: Option<ActionConfig>,
    ) -> Result<()> {
        let remote_uri = remote_uri.to_string();
        self.run(session_id, "start_call", move |s| s.start_call(remote_uri, proposal, config))
            .await?;
        self.index_call_id(session_id).await
    }

    pub async fn call_audio(&self, session_id: &SessionId, remote_uri: &str, config: Option<ActionConfig>) -> Result<()> {
        self.start_call(session_id, remote_uri, MediaProposal::audio(), config).await
    }

    pub async fn call_video(&self, session_id: &SessionId, remote_uri: &str, config: Option<ActionConfig>) -> Result<()> {
        self.start_call(session_id, remote_uri, MediaProposal::video(), config).await
    }

    pub async fn call_audio_video(
        &self,
        session_id: &SessionId,
        remote_uri: &str,
        config: Option<ActionConfig>,
    ) -> Result<()> {
        self.start_call(session_id, remote_uri, MediaProposal::audio_video(), config).await
    }

    pub async fn hold(&self, session_id: &SessionId, config: Option<ActionConfig>) -> Result<()> {
        self.run(session_id, "hold", move |s| s.hold(config)).await
    }

    pub async fn resume(&self, session_id: &SessionId, config: Option<ActionConfig>) -> Result<()> {
        self.run(session_id, "resume", move |s| s.resume(config)).await
    }

    pub async fn add_video(&self, session_id: &SessionId, config: Option<ActionConfig>) -> Result<()> {
        self.run(session_id, "add_video", move |s| s.add_video(config)).await
    }

    pub async fn send_dtmf(&self, session_id: &SessionId, digit: char) -> Result<()> {
        self.run(session_id, "send_dtmf", move |s| s.send_dtmf(digit)).await
    }

    pub async fn send_dtmf_code(&self, session_id: &SessionId, code: i32) -> Result<()> {
        self.run(session_id, "send_dtmf", move |s| s.send_dtmf_code(code)).await
    }

    pub async fn set_session_timer(&self, session_id: &SessionId, interval_secs: u32, refresher: Refresher) -> Result<()> {
        self.run(session_id, "set_session_timer", move |s| s.set_session_timer(interval_secs, refresher))
            .await
    }

    pub async fn set_100rel(&self, session_id: &SessionId, enabled: bool) -> Result<()> {
        self.run(session_id, "set_100rel", move |s| s.set_100rel(enabled)).await
    }

    pub async fn set_qos(&self, session_id: &SessionId, qos_type: QosType, strength: QosStrength) -> Result<()> {
        self.run(session_id, "set_qos", move |s| s.set_qos(qos_type, strength)).await
    }

    pub async fn terminate(&self, session_id: &SessionId) -> Result<()> {
        self.run(session_id, "terminate", |s| s.terminate()).await
    }

    /// Drop the session, terminating it first if it is still live
    pub async fn release(&self, session_id: &SessionId) -> Result<()> {
        let (_, handle) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::SessionNotFound { session_id: session_id.clone() })?;
        self.by_call_id.retain(|_, owner| *owner != *session_id);

        let span = info_span!("call_session", session_id = %session_id, operation = "release");
        async move {
            let mut session = handle.lock().await;
            let output = session.release()?;
            self.execute(&mut session, output).await;
            info!("Released call session");
            Ok::<(), SessionError>(())
        }
        .instrument(span)
        .await
    }

    // ===== Collaborator events =====

    pub async fn handle_transport_event(&self, session_id: &SessionId, event: TransportEvent) -> Result<()> {
        self.run(session_id, "transport_event", move |s| s.handle_transport_event(event, now()))
            .await
    }

    pub async fn handle_media_event(&self, session_id: &SessionId, event: MediaEvent) -> Result<()> {
        self.run(session_id, "media_event", move |s| s.handle_media_event(event)).await
    }

    /// Check the session timers of every session against `now`
    pub async fn tick(&self, now: Instant) {
        let handles: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (session_id, handle) in handles {
            let span = info_span!("call_session", session_id = %session_id, operation = "tick");
            async {
                let mut session = handle.lock().await;
                match session.tick(now) {
                    Ok(output) => self.execute(&mut session, output).await,
                    Err(e) => warn!("Timer check failed: {}", e),
                }
            }
            .instrument(span)
            .await;
        }
    }

    /// Spawn the periodic timer check. The task stops once the
    /// coordinator is dropped.
    pub fn start_timer_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let period = self.config.timer.tick_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.tick(now()).await;
            }
            debug!("Session timer loop stopped");
        })
    }

    // ===== Internals =====

    fn handle(&self, session_id: &SessionId) -> Result<SessionHandle> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::SessionNotFound { session_id: session_id.clone() })
    }

    /// Run one step under the session lock and execute its output
    async fn run<F>(&self, session_id: &SessionId, operation: &'static str, step: F) -> Result<()>
    where
        F: FnOnce(&mut CallSession) -> Result<StepOutput> + Send,
    {
        let handle = self.handle(session_id)?;
        let span = info_span!("call_session", session_id = %session_id, operation);

        async move {
            let mut session = handle.lock().await;
            let output = step(&mut *session).inspect_err(|e| debug!("{} failed: {}", operation, e))?;
            self.execute(&mut session, output).await;
            Ok::<(), SessionError>(())
        }
        .instrument(span)
        .await
    }

    /// Publish notifications and execute actions in order. A fatal
    /// transport or media failure and any DTMF failure are fed back into
    /// the session; the follow-up output is executed in turn. Other
    /// failures, and failures after termination, are only logged.
    async fn execute(&self, session: &mut CallSession, output: StepOutput) {
        let mut output = output;

        loop {
            for event in output.events.drain(..) {
                self.events.publish(event);
            }

            let mut follow_up = None;
            for action in output.actions.drain(..) {
                let route = FailureRoute::for_action(&action);
                let Err(e) = execute_action(session.id(), action, &self.signaling, &self.media).await else {
                    continue;
                };

                if session.state().is_terminated() {
                    debug!("Ignoring failed cleanup action: {}", e);
                    continue;
                }
                if !e.is_fatal() && !matches!(route, FailureRoute::Dtmf(_)) {
                    warn!("Action failed, session continues: {}", e);
                    continue;
                }
                warn!("Action failed: {}", e);

                let reported = match route {
                    FailureRoute::Transport => session.handle_transport_event(
                        TransportEvent::TransportError { message: e.to_string() },
                        now(),
                    ),
                    FailureRoute::Media => session.handle_media_event(MediaEvent::Failure { message: e.to_string() }),
                    FailureRoute::Dtmf(digit) => {
                        session.handle_media_event(MediaEvent::DtmfFailed { digit, reason: e.to_string() })
                    }
                };
                match reported {
                    Ok(next) => {
                        follow_up = Some(next);
                        break;
                    }
                    Err(e) => warn!("Failed to report action failure: {}", e),
                }
            }

            match follow_up {
                Some(next) => output = next,
                None => break,
            }
        }
    }

    async fn index_call_id(&self, session_id: &SessionId) -> Result<()> {
        let handle = self.handle(session_id)?;
        let session = handle.lock().await;
        if let Some(dialog) = session.dialog() {
            self.by_call_id.insert(dialog.call_id.clone(), session_id.clone());
        }
        Ok(())
    }
}

/// Current time on the tokio clock, so paused test time drives the timers
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::state_machine::{OutboundRequest, OutboundResponse};

    struct NullSignaling;

    #[async_trait]
    impl SignalingAdapter for NullSignaling {
        async fn send_request(&self, _session_id: &SessionId, _request: OutboundRequest) -> Result<()> {
            Ok(())
        }

        async fn send_response(&self, _session_id: &SessionId, _response: OutboundResponse) -> Result<()> {
            Ok(())
        }
    }

    struct NullMedia;

    #[async_trait]
    impl MediaAdapter for NullMedia {
        async fn apply_description(&self, _session_id: &SessionId, _description: &NegotiatedMediaDescription) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _session_id: &SessionId) -> Result<()> {
            Ok(())
        }

        async fn send_dtmf(&self, _session_id: &SessionId, _digit: DtmfDigit) -> Result<()> {
            Ok(())
        }
    }

    fn coordinator() -> Arc<CallSessionCoordinator> {
        CallSessionCoordinator::new(CallSessionConfig::default(), Arc::new(NullSignaling), Arc::new(NullMedia)).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let coordinator = coordinator();
        let missing = SessionId("missing".to_string());
        assert!(matches!(
            coordinator.terminate(&missing).await,
            Err(SessionError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_call_indexes_call_id() {
        let coordinator = coordinator();
        let id = coordinator.create_session().unwrap();
        coordinator.call_audio(&id, "sip:bob@example.com", None).await.unwrap();

        assert_eq!(coordinator.state(&id).await.unwrap(), CallState::Calling);
        let handle = coordinator.handle(&id).unwrap();
        let call_id = handle.lock().await.dialog().unwrap().call_id.clone();
        assert_eq!(coordinator.find_by_call_id(&call_id), Some(id.clone()));

        coordinator.release(&id).await.unwrap();
        assert_eq!(coordinator.session_count(), 0);
        assert!(coordinator.find_by_call_id(&call_id).is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CallSessionConfig { event_channel_capacity: 0, ..Default::default() };
        assert!(CallSessionCoordinator::new(config, Arc::new(NullSignaling), Arc::new(NullMedia)).is_err());
    }
}
