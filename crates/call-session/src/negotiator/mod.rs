//! Offer/answer negotiation
//!
//! [`OfferAnswerNegotiator`] turns a [`MediaProposal`](crate::types::MediaProposal)
//! into an outbound offer and validates inbound offers/answers against the
//! local capabilities. Direction and QoS resolution rules live in
//! [`resolve`].

pub mod offer_answer;
pub mod resolve;

pub use offer_answer::{NegotiationOutcome, OfferAnswerNegotiator};
pub use resolve::{negotiate_qos, resolve_direction};
