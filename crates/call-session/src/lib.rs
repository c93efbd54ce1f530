//! # Call-Session - SIP call session state machine for RVoIP
//!
//! This crate provides the control logic of one SIP call leg:
//! - Dialog context (tags, CSeq counters, route set)
//! - Offer/answer negotiation against local media capabilities
//! - Session timers (RFC 4028) with refresh and expiry handling
//! - The call state machine driven by a static transition table
//!
//! ## Architecture
//!
//! [`CallSession`] is synchronous: call-control intents and transport or
//! media events go in, [`Action`]s and [`SessionEvent`] notifications come
//! out. [`CallSessionCoordinator`] serializes everything per session,
//! executes actions through the [`SignalingAdapter`] and [`MediaAdapter`]
//! collaborators, publishes notifications on a broadcast channel and
//! drives session timers from a periodic tick.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rvoip_call_session::prelude::*;
//!
//! # async fn example(signaling: Arc<dyn SignalingAdapter>, media: Arc<dyn MediaAdapter>) -> Result<()> {
//! let config = CallSessionConfig::new("sip:alice@example.com").with_session_timer(1800, Refresher::Local);
//! let coordinator = CallSessionCoordinator::new(config, signaling, media)?;
//! let _timers = coordinator.start_timer_loop();
//!
//! let session_id = coordinator.create_session()?;
//! coordinator.call_audio(&session_id, "sip:bob@example.com", None).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod coordinator;
pub mod dialog;
pub mod errors;
pub mod events;
pub mod logging;
pub mod negotiator;
pub mod session;
pub mod state_machine;
pub mod state_table;
pub mod timer;
pub mod types;

pub use adapters::{MediaAdapter, SignalingAdapter};
pub use config::{CallSessionConfig, ExpiryPolicy, MediaCapabilities};
pub use coordinator::CallSessionCoordinator;
pub use dialog::{DialogContext, DialogState, DialogTags};
pub use errors::{NegotiationFailure, NegotiationFailureKind, Result, SessionError};
pub use events::{SessionEvent, SessionEventSubscriber, TerminationReason, UpdateKind};
pub use negotiator::{NegotiationOutcome, OfferAnswerNegotiator};
pub use session::{SessionKind, SipSession};
pub use state_machine::{Action, CallSession, MediaEvent, StepOutput, TransportEvent};
pub use state_table::CallState;
pub use timer::{Refresher, SessionTimerManager, TimerStatus};
pub use types::*;

/// Common imports for applications
pub mod prelude {
    pub use crate::adapters::{MediaAdapter, SignalingAdapter};
    pub use crate::config::CallSessionConfig;
    pub use crate::coordinator::CallSessionCoordinator;
    pub use crate::errors::{Result, SessionError};
    pub use crate::events::{SessionEvent, TerminationReason};
    pub use crate::state_machine::{
        Action, InboundRequest, InboundResponse, MediaEvent, OutboundRequest, OutboundResponse, SipMethod,
        TransportEvent,
    };
    pub use crate::state_table::CallState;
    pub use crate::timer::Refresher;
    pub use crate::types::{ActionConfig, MediaDirection, MediaKind, MediaProposal, SessionId};
}
