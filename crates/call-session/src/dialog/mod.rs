//! Dialog context for one call leg
//!
//! Holds the identifiers of a SIP dialog (Call-ID, tags, CSeq counters,
//! route set). The state machine is the only writer.

pub mod context;

pub use context::{DialogContext, DialogSnapshot, DialogState, DialogTags, ResponseKind};
