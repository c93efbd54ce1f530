use tracing::info;

use super::SipSession;
use crate::dialog::DialogContext;
use crate::errors::{Result, SessionError};
use crate::state_machine::StepOutput;
use crate::state_table::CallState;
use crate::types::SessionId;

/// Lifecycle of the non-call session kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    Terminated,
}

/// A registration binding. Only the lifecycle is modelled here.
#[derive(Debug)]
pub struct RegistrationSession {
    id: SessionId,
    dialog: DialogContext,
    state: LifecycleState,
}

impl RegistrationSession {
    pub fn new(id: SessionId, aor: impl Into<String>, registrar: impl Into<String>) -> Self {
        Self { id, dialog: DialogContext::initialize(aor, registrar), state: LifecycleState::Active }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }
}

impl SipSession for RegistrationSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn dialog(&self) -> Option<&DialogContext> {
        Some(&self.dialog)
    }

    fn is_terminated(&self) -> bool {
        self.state == LifecycleState::Terminated
    }

    fn terminate(&mut self) -> Result<StepOutput> {
        end_lifecycle(&self.id, &mut self.state, &mut self.dialog, "registration")
    }
}

/// An event subscription (e.g. presence, dialog state)
#[derive(Debug)]
pub struct SubscriptionSession {
    id: SessionId,
    dialog: DialogContext,
    event_package: String,
    state: LifecycleState,
}

impl SubscriptionSession {
    pub fn new(
        id: SessionId,
        local_uri: impl Into<String>,
        remote_uri: impl Into<String>,
        event_package: impl Into<String>,
    ) -> Self {
        Self {
            id,
            dialog: DialogContext::initialize(local_uri, remote_uri),
            event_package: event_package.into(),
            state: LifecycleState::Active,
        }
    }

    pub fn event_package(&self) -> &str {
        &self.event_package
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }
}

impl SipSession for SubscriptionSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn dialog(&self) -> Option<&DialogContext> {
        Some(&self.dialog)
    }

    fn is_terminated(&self) -> bool {
        self.state == LifecycleState::Terminated
    }

    fn terminate(&mut self) -> Result<StepOutput> {
        end_lifecycle(&self.id, &mut self.state, &mut self.dialog, "subscription")
    }
}

fn end_lifecycle(
    id: &SessionId,
    state: &mut LifecycleState,
    dialog: &mut DialogContext,
    kind: &str,
) -> Result<StepOutput> {
    if *state == LifecycleState::Terminated {
        return Err(SessionError::invalid_state("terminate", CallState::Terminated));
    }
    *state = LifecycleState::Terminated;
    dialog.terminate();
    info!("{} session {} terminated", kind, id);
    Ok(StepOutput::default())
}
