//! Dialog context implementation
//!
//! Tracks the identifiers and sequence numbers of one SIP dialog as
//! defined in RFC 3261 §12.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, SessionError};

/// Dialog state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Request sent, no response with a remote tag yet
    Initial,
    /// Established by a provisional response
    Early,
    /// Established by a final 2xx response
    Confirmed,
    /// Dialog ended
    Terminated,
}

/// Which kind of response is being applied to the dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Provisional,
    Final,
}

/// Local/remote tag pair carried by a response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogTags {
    pub local: String,
    pub remote: String,
}

impl DialogTags {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self { local: local.into(), remote: remote.into() }
    }
}

/// Read-only copy of the dialog identifiers attached to outbound requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogSnapshot {
    pub call_id: String,
    pub local_uri: String,
    pub remote_uri: String,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
    pub route_set: Vec<String>,
}

/// A SIP dialog as seen by the call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogContext {
    /// Call-ID, unique per call leg
    pub call_id: String,

    pub local_uri: String,

    pub remote_uri: String,

    /// Unset until a response establishes the dialog, immutable afterwards
    local_tag: Option<String>,

    remote_tag: Option<String>,

    /// Last CSeq used for a request we sent
    local_cseq: u32,

    /// Last CSeq seen on a request from the remote side
    remote_cseq: Option<u32>,

    /// Ordered proxies requests within the dialog must traverse
    route_set: Vec<String>,

    state: DialogState,
}

impl DialogContext {
    /// Create a dialog context for a new outgoing call
    pub fn initialize(local_uri: impl Into<String>, remote_uri: impl Into<String>) -> Self {
        // RFC 3261 §8.1.1.5: initial CSeq must be below 2^31
        let initial_cseq = rand::thread_rng().gen_range(1..=u16::MAX as u32);
        Self::with_initial_cseq(local_uri, remote_uri, initial_cseq)
    }

    /// Same as [`initialize`](Self::initialize) with a fixed first CSeq
    pub fn with_initial_cseq(local_uri: impl Into<String>, remote_uri: impl Into<String>, first_cseq: u32) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            local_uri: local_uri.into(),
            remote_uri: remote_uri.into(),
            local_tag: None,
            remote_tag: None,
            local_cseq: first_cseq.saturating_sub(1),
            remote_cseq: None,
            route_set: Vec::new(),
            state: DialogState::Initial,
        }
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn local_tag(&self) -> Option<&str> {
        self.local_tag.as_deref()
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn route_set(&self) -> &[String] {
        &self.route_set
    }

    pub fn local_cseq(&self) -> u32 {
        self.local_cseq
    }

    pub fn remote_cseq(&self) -> Option<u32> {
        self.remote_cseq
    }

    /// Apply the tags and route set of a provisional or final response.
    ///
    /// The first response carrying tags establishes the dialog. Later
    /// responses with the same tags are a no-op apart from promoting an
    /// early dialog to confirmed; responses with different tags fail with
    /// `ProtocolViolation` and leave the context untouched.
    pub fn apply_response(&mut self, kind: ResponseKind, tags: &DialogTags, route_set: &[String]) -> Result<()> {
        if self.state == DialogState::Terminated {
            return Err(SessionError::protocol_violation("response applied to a terminated dialog"));
        }

        match (&self.local_tag, &self.remote_tag) {
            (Some(local), Some(remote)) => {
                if *local != tags.local || *remote != tags.remote {
                    return Err(SessionError::protocol_violation(format!(
                        "dialog tags conflict: have {}/{}, got {}/{}",
                        local, remote, tags.local, tags.remote
                    )));
                }
            }
            _ => {
                self.local_tag = Some(tags.local.clone());
                self.remote_tag = Some(tags.remote.clone());
                self.route_set = route_set.to_vec();
                debug!(call_id = %self.call_id, remote_tag = %tags.remote, "dialog established");
            }
        }

        if kind == ResponseKind::Final && self.state != DialogState::Confirmed {
            // The route set is fixed by the 2xx (RFC 3261 §12.1.2)
            self.route_set = route_set.to_vec();
            self.state = DialogState::Confirmed;
        } else if self.state == DialogState::Initial {
            self.state = DialogState::Early;
        }

        Ok(())
    }

    /// Allocate the CSeq for a new outbound request
    pub fn next_local_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Record the CSeq of an inbound request.
    ///
    /// A retransmission is accepted without updating the counter.
    pub fn record_remote_cseq(&mut self, value: u32, is_retransmission: bool) -> Result<()> {
        if is_retransmission {
            return Ok(());
        }
        if let Some(last) = self.remote_cseq {
            if value <= last {
                return Err(SessionError::OutOfOrderRequest { received: value, last });
            }
        }
        self.remote_cseq = Some(value);
        Ok(())
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    pub fn snapshot(&self) -> DialogSnapshot {
        DialogSnapshot {
            call_id: self.call_id.clone(),
            local_uri: self.local_uri.clone(),
            remote_uri: self.remote_uri.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: self.remote_tag.clone(),
            route_set: self.route_set.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog() -> DialogContext {
        DialogContext::with_initial_cseq("sip:alice@example.com", "sip:bob@example.com", 1)
    }

    #[test]
    fn test_tags_unset_until_response() {
        let d = dialog();
        assert_eq!(d.state(), DialogState::Initial);
        assert!(d.local_tag().is_none());
        assert!(d.remote_tag().is_none());
    }

    #[test]
    fn test_apply_same_tags_twice_is_noop() {
        let mut d = dialog();
        let tags = DialogTags::new("a1", "b1");
        let routes = vec!["sip:p1.example.com;lr".to_string()];
        d.apply_response(ResponseKind::Final, &tags, &routes).unwrap();
        let before = d.snapshot();

        d.apply_response(ResponseKind::Final, &tags, &[]).unwrap();
        assert_eq!(d.snapshot(), before);
        assert_eq!(d.state(), DialogState::Confirmed);
    }

    #[test]
    fn test_conflicting_tags_rejected() {
        let mut d = dialog();
        d.apply_response(ResponseKind::Provisional, &DialogTags::new("a1", "b1"), &[]).unwrap();
        assert_eq!(d.state(), DialogState::Early);

        let err = d
            .apply_response(ResponseKind::Final, &DialogTags::new("a1", "b2"), &[])
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation { .. }));
        assert_eq!(d.remote_tag(), Some("b1"));
        assert_eq!(d.state(), DialogState::Early);
    }

    #[test]
    fn test_early_then_final_confirms_and_fixes_route_set() {
        let mut d = dialog();
        let tags = DialogTags::new("a1", "b1");
        d.apply_response(ResponseKind::Provisional, &tags, &["sip:p1".to_string()]).unwrap();
        d.apply_response(ResponseKind::Final, &tags, &["sip:p2".to_string()]).unwrap();
        assert_eq!(d.state(), DialogState::Confirmed);
        assert_eq!(d.route_set(), &["sip:p2".to_string()]);
    }

    #[test]
    fn test_local_cseq_strictly_increases() {
        let mut d = DialogContext::initialize("sip:a@x", "sip:b@y");
        let mut last = d.local_cseq();
        for _ in 0..50 {
            let next = d.next_local_cseq();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_remote_cseq_ordering() {
        let mut d = dialog();
        d.record_remote_cseq(10, false).unwrap();
        d.record_remote_cseq(11, false).unwrap();
        assert!(matches!(
            d.record_remote_cseq(11, false),
            Err(SessionError::OutOfOrderRequest { received: 11, last: 11 })
        ));
        assert!(d.record_remote_cseq(5, false).is_err());
        d.record_remote_cseq(11, true).unwrap();
        assert_eq!(d.remote_cseq(), Some(11));
    }
}
