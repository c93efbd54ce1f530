pub mod actions;
pub mod call_session;
pub mod inputs;

pub use actions::{execute_action, Action, OutboundRequest, OutboundResponse, RAck, SessionTimerHeader, SipMethod};
pub use call_session::{CallSession, StepOutput};
pub use inputs::{InboundRequest, InboundResponse, MediaEvent, TransportEvent};
