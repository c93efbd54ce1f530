//! Session kinds sharing one capability set
//!
//! Calls, registrations and subscriptions all own a dialog context and a
//! lifecycle that ends in a terminated state. [`SipSession`] is that
//! shared surface; [`SessionKind`] selects the concrete variant.

mod lifecycle;

pub use lifecycle::{LifecycleState, RegistrationSession, SubscriptionSession};

use crate::dialog::DialogContext;
use crate::errors::Result;
use crate::state_machine::{CallSession, StepOutput};
use crate::types::SessionId;

/// Capabilities every SIP session kind provides
pub trait SipSession {
    fn id(&self) -> &SessionId;

    fn dialog(&self) -> Option<&DialogContext>;

    fn is_terminated(&self) -> bool;

    /// End the session; returns the actions that do so
    fn terminate(&mut self) -> Result<StepOutput>;
}

impl SipSession for CallSession {
    fn id(&self) -> &SessionId {
        CallSession::id(self)
    }

    fn dialog(&self) -> Option<&DialogContext> {
        CallSession::dialog(self)
    }

    fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    fn terminate(&mut self) -> Result<StepOutput> {
        CallSession::terminate(self)
    }
}

/// Tagged session variants
#[derive(Debug)]
pub enum SessionKind {
    Call(CallSession),
    Registration(RegistrationSession),
    Subscription(SubscriptionSession),
}

impl SessionKind {
    pub fn name(&self) -> &'static str {
        match self {
            SessionKind::Call(_) => "call",
            SessionKind::Registration(_) => "registration",
            SessionKind::Subscription(_) => "subscription",
        }
    }

    pub fn as_call(&self) -> Option<&CallSession> {
        match self {
            SessionKind::Call(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_call_mut(&mut self) -> Option<&mut CallSession> {
        match self {
            SessionKind::Call(call) => Some(call),
            _ => None,
        }
    }

    fn inner(&self) -> &dyn SipSession {
        match self {
            SessionKind::Call(s) => s,
            SessionKind::Registration(s) => s,
            SessionKind::Subscription(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn SipSession {
        match self {
            SessionKind::Call(s) => s,
            SessionKind::Registration(s) => s,
            SessionKind::Subscription(s) => s,
        }
    }
}

impl SipSession for SessionKind {
    fn id(&self) -> &SessionId {
        self.inner().id()
    }

    fn dialog(&self) -> Option<&DialogContext> {
        self.inner().dialog()
    }

    fn is_terminated(&self) -> bool {
        self.inner().is_terminated()
    }

    fn terminate(&mut self) -> Result<StepOutput> {
        self.inner_mut().terminate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallSessionConfig;

    #[test]
    fn test_kinds_share_terminate() {
        let config = CallSessionConfig::default();
        let mut kinds = vec![
            SessionKind::Call(CallSession::new(SessionId::new(), &config).unwrap()),
            SessionKind::Registration(RegistrationSession::new(SessionId::new(), "sip:alice@example.com", "sip:example.com")),
            SessionKind::Subscription(SubscriptionSession::new(
                SessionId::new(),
                "sip:alice@example.com",
                "sip:bob@example.com",
                "presence",
            )),
        ];

        for kind in kinds.iter_mut() {
            assert!(!kind.is_terminated(), "{}", kind.name());
            kind.terminate().unwrap();
            assert!(kind.is_terminated(), "{}", kind.name());
            assert!(kind.terminate().is_err(), "{}", kind.name());
        }
    }

    #[test]
    fn test_as_call() {
        let config = CallSessionConfig::default();
        let kind = SessionKind::Call(CallSession::new(SessionId::new(), &config).unwrap());
        assert!(kind.as_call().is_some());

        let kind = SessionKind::Registration(RegistrationSession::new(SessionId::new(), "sip:a@b", "sip:b"));
        assert!(kind.as_call().is_none());
        assert!(kind.dialog().is_some());
    }
}
