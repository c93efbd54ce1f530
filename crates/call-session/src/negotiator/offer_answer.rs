//! Offer/answer negotiator (RFC 3264 subset)

use tracing::debug;

use super::resolve::{negotiate_qos, resolve_direction, select_format};
use crate::config::MediaCapabilities;
use crate::errors::NegotiationFailure;
use crate::types::{
    DropReason, DroppedLine, MediaLine, MediaProposal, NegotiatedMediaDescription,
    NegotiatedMediaLine, SessionDescription,
};

/// Successful negotiation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationOutcome {
    pub description: NegotiatedMediaDescription,
    /// Remote lines that were left out. Non-empty means partial compatibility.
    pub dropped: Vec<DroppedLine>,
}

impl NegotiationOutcome {
    pub fn is_partial(&self) -> bool {
        !self.dropped.is_empty()
    }
}

/// Builds offers and validates inbound offers/answers against local capabilities
#[derive(Debug, Clone)]
pub struct OfferAnswerNegotiator {
    capabilities: MediaCapabilities,
}

impl OfferAnswerNegotiator {
    pub fn new(capabilities: MediaCapabilities) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> &MediaCapabilities {
        &self.capabilities
    }

    /// Build the offer for `proposal`.
    ///
    /// Lines whose kind has no local capability are left out. Ports and the
    /// previously negotiated format of an existing line are kept so that a
    /// re-offer does not move media unnecessarily.
    pub fn propose_outbound(
        &self,
        proposal: &MediaProposal,
        prior: Option<&NegotiatedMediaDescription>,
        version: u64,
    ) -> SessionDescription {
        let mut lines = Vec::with_capacity(proposal.lines.len());

        for proposed in &proposal.lines {
            let Some(capability) = self.capabilities.for_kind(proposed.kind) else {
                debug!("No local capability for {} line, not offering it", proposed.kind);
                continue;
            };

            let prior_line = prior.and_then(|p| p.line(proposed.kind));
            let port = prior_line.map(|l| l.local_port).unwrap_or(capability.port);

            let mut formats = capability.formats.clone();
            if let Some(current) = prior_line.map(|l| &l.format) {
                if let Some(pos) = formats.iter().position(|f| f.is_compatible(current)) {
                    let preferred = formats.remove(pos);
                    formats.insert(0, preferred);
                }
            }

            let mut line = MediaLine::new(proposed.kind, proposed.direction, port, formats);
            line.qos = proposal.qos;
            lines.push(line);
        }

        SessionDescription::new(version, self.capabilities.address.clone(), lines)
    }

    /// Validate a remote offer or answer against the local view.
    ///
    /// `local` is our offer when `remote` is an answer, or our capability
    /// description at the current directions when `remote` is an offer.
    /// Each remote line is paired with the first unused local line of the
    /// same kind. Lines without a counterpart or a shared format are
    /// dropped and reported; if nothing is left the negotiation fails with
    /// `NoCommonMedia`.
    pub fn accept_inbound(
        &self,
        remote: &SessionDescription,
        local: &SessionDescription,
    ) -> Result<NegotiationOutcome, NegotiationFailure> {
        if remote.lines.is_empty() {
            return Err(NegotiationFailure::empty_description());
        }

        let mut used = vec![false; local.lines.len()];
        let mut accepted = Vec::new();
        let mut dropped = Vec::new();

        for (index, remote_line) in remote.lines.iter().enumerate() {
            let counterpart = local
                .lines
                .iter()
                .enumerate()
                .find(|(j, l)| !used[*j] && l.kind == remote_line.kind);

            let Some((j, local_line)) = counterpart else {
                dropped.push(DroppedLine { index, kind: remote_line.kind, reason: DropReason::NoLocalCounterpart });
                continue;
            };
            used[j] = true;

            if remote_line.is_rejected() || local_line.is_rejected() {
                dropped.push(DroppedLine { index, kind: remote_line.kind, reason: DropReason::RejectedByRemote });
                continue;
            }

            let Some(format) = select_format(&local_line.formats, &remote_line.formats) else {
                dropped.push(DroppedLine { index, kind: remote_line.kind, reason: DropReason::NoCommonFormat });
                continue;
            };

            accepted.push(NegotiatedMediaLine {
                index,
                kind: remote_line.kind,
                direction: resolve_direction(local_line.direction, remote_line.direction),
                format,
                remote_address: remote.address.clone(),
                remote_port: remote_line.port,
                local_port: local_line.port,
                qos: negotiate_qos(local_line.qos, remote_line.qos),
            });
        }

        if accepted.is_empty() {
            debug!("Negotiation failed, all {} remote lines dropped", remote.lines.len());
            return Err(NegotiationFailure::no_common_media());
        }

        Ok(NegotiationOutcome {
            description: NegotiatedMediaDescription { remote_version: remote.version, lines: accepted },
            dropped,
        })
    }

    /// Build our answer to a remote offer from a negotiation outcome.
    ///
    /// The answer has one line per offered line, in offer order; dropped
    /// lines are answered with port 0.
    pub fn build_answer(
        &self,
        offer: &SessionDescription,
        outcome: &NegotiationOutcome,
        version: u64,
    ) -> SessionDescription {
        let lines = offer
            .lines
            .iter()
            .enumerate()
            .map(|(index, offered)| match outcome.description.lines.iter().find(|l| l.index == index) {
                Some(accepted) => {
                    let mut line = MediaLine::new(accepted.kind, accepted.direction, accepted.local_port, vec![accepted.format.clone()]);
                    line.qos = accepted.qos;
                    line
                }
                None => MediaLine::new(offered.kind, offered.direction.reversed(), 0, offered.formats.clone()),
            })
            .collect();

        SessionDescription::new(version, self.capabilities.address.clone(), lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KindCapability;
    use crate::errors::NegotiationFailureKind;
    use crate::types::{MediaDirection, MediaFormat, MediaKind, ProposedLine, QosPreference, QosStrength, QosType};
    use pretty_assertions::assert_eq;

    fn negotiator() -> OfferAnswerNegotiator {
        OfferAnswerNegotiator::new(MediaCapabilities::default())
    }

    fn audio_only_negotiator() -> OfferAnswerNegotiator {
        OfferAnswerNegotiator::new(MediaCapabilities {
            address: "10.0.0.1".to_string(),
            audio: KindCapability { port: 30000, formats: vec![MediaFormat::pcmu()] },
            video: None,
        })
    }

    fn remote(lines: Vec<MediaLine>) -> SessionDescription {
        SessionDescription::new(7, "203.0.113.5", lines)
    }

    #[test]
    fn test_propose_outbound_uses_capabilities() {
        let n = negotiator();
        let offer = n.propose_outbound(&MediaProposal::audio_video(), None, 1);
        assert_eq!(offer.version, 1);
        assert_eq!(offer.lines.len(), 2);
        assert_eq!(offer.lines[0].kind, MediaKind::Audio);
        assert_eq!(offer.lines[0].port, 16000);
        assert_eq!(offer.lines[1].kind, MediaKind::Video);
        assert_eq!(offer.lines[1].direction, MediaDirection::SendRecv);
    }

    #[test]
    fn test_propose_outbound_skips_unsupported_kind() {
        let offer = audio_only_negotiator().propose_outbound(&MediaProposal::audio_video(), None, 1);
        assert_eq!(offer.lines.len(), 1);
        assert_eq!(offer.lines[0].kind, MediaKind::Audio);
    }

    #[test]
    fn test_propose_outbound_keeps_negotiated_format_first() {
        let n = negotiator();
        let offer = n.propose_outbound(&MediaProposal::audio(), None, 1);
        let answer = remote(vec![MediaLine::new(MediaKind::Audio, MediaDirection::SendRecv, 5000, vec![MediaFormat::pcma()])]);
        let outcome = n.accept_inbound(&answer, &offer).unwrap();

        let reoffer = n.propose_outbound(&MediaProposal::audio(), Some(&outcome.description), 2);
        assert_eq!(reoffer.lines[0].formats[0], MediaFormat::pcma());
    }

    #[test]
    fn test_no_overlapping_kinds_is_no_common_media() {
        let n = audio_only_negotiator();
        let offer = n.propose_outbound(&MediaProposal::audio(), None, 1);
        let answer = remote(vec![MediaLine::new(MediaKind::Video, MediaDirection::SendRecv, 5002, vec![MediaFormat::h264()])]);
        let failure = n.accept_inbound(&answer, &offer).unwrap_err();
        assert_eq!(failure.kind, NegotiationFailureKind::NoCommonMedia);
    }

    #[test]
    fn test_empty_remote_description() {
        let n = negotiator();
        let offer = n.propose_outbound(&MediaProposal::audio(), None, 1);
        let failure = n.accept_inbound(&remote(vec![]), &offer).unwrap_err();
        assert_eq!(failure.kind, NegotiationFailureKind::EmptyDescription);
    }

    #[test]
    fn test_exclusive_directions_mark_line_inactive() {
        let n = negotiator();
        let proposal = MediaProposal::new(vec![ProposedLine { kind: MediaKind::Audio, direction: MediaDirection::SendOnly }]);
        let offer = n.propose_outbound(&proposal, None, 1);
        let answer = remote(vec![MediaLine::new(MediaKind::Audio, MediaDirection::SendOnly, 5000, vec![MediaFormat::pcmu()])]);

        let outcome = n.accept_inbound(&answer, &offer).unwrap();
        assert_eq!(outcome.description.lines.len(), 1);
        assert_eq!(outcome.description.lines[0].direction, MediaDirection::Inactive);
    }

    #[test]
    fn test_partial_compatibility_reports_dropped_lines() {
        let n = negotiator();
        let offer = n.propose_outbound(&MediaProposal::audio_video(), None, 1);
        let answer = remote(vec![
            MediaLine::new(MediaKind::Audio, MediaDirection::SendRecv, 5000, vec![MediaFormat::pcmu()]),
            MediaLine::new(MediaKind::Video, MediaDirection::SendRecv, 0, vec![MediaFormat::h264()]),
        ]);

        let outcome = n.accept_inbound(&answer, &offer).unwrap();
        assert!(outcome.is_partial());
        assert_eq!(outcome.description.lines.len(), 1);
        assert_eq!(
            outcome.dropped,
            vec![DroppedLine { index: 1, kind: MediaKind::Video, reason: DropReason::RejectedByRemote }]
        );
    }

    #[test]
    fn test_no_common_format_drops_line() {
        let n = negotiator();
        let offer = n.propose_outbound(&MediaProposal::audio_video(), None, 1);
        let answer = remote(vec![
            MediaLine::new(MediaKind::Audio, MediaDirection::SendRecv, 5000, vec![MediaFormat::pcmu()]),
            MediaLine::new(MediaKind::Video, MediaDirection::SendRecv, 5002, vec![MediaFormat::new(98, "AV1", 90000)]),
        ]);
        let outcome = n.accept_inbound(&answer, &offer).unwrap();
        assert_eq!(outcome.dropped[0].reason, DropReason::NoCommonFormat);
    }

    #[test]
    fn test_qos_negotiated_per_line() {
        let n = negotiator();
        let proposal = MediaProposal::audio()
            .with_qos(Some(QosPreference::new(QosType::Segmented, QosStrength::Mandatory)));
        let offer = n.propose_outbound(&proposal, None, 1);
        let answer = remote(vec![
            MediaLine::new(MediaKind::Audio, MediaDirection::SendRecv, 5000, vec![MediaFormat::pcmu()])
                .with_qos(QosPreference::new(QosType::Segmented, QosStrength::Optional)),
        ]);
        let outcome = n.accept_inbound(&answer, &offer).unwrap();
        assert_eq!(
            outcome.description.lines[0].qos,
            Some(QosPreference::new(QosType::Segmented, QosStrength::Optional))
        );
    }

    #[test]
    fn test_build_answer_rejects_dropped_lines_with_port_zero() {
        let n = audio_only_negotiator();
        let local = n.propose_outbound(&MediaProposal::audio_video(), None, 3);
        let offer = remote(vec![
            MediaLine::new(MediaKind::Audio, MediaDirection::SendOnly, 5000, vec![MediaFormat::pcmu()]),
            MediaLine::new(MediaKind::Video, MediaDirection::SendRecv, 5002, vec![MediaFormat::h264()]),
        ]);
        let outcome = n.accept_inbound(&offer, &local).unwrap();
        let answer = n.build_answer(&offer, &outcome, 3);

        assert_eq!(answer.lines.len(), 2);
        assert_eq!(answer.lines[0].direction, MediaDirection::RecvOnly);
        assert_eq!(answer.lines[0].port, 30000);
        assert_eq!(answer.lines[1].port, 0);
    }
}
