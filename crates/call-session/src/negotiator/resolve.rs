//! Per-line resolution rules used by the negotiator

use crate::types::{MediaDirection, MediaFormat, QosPreference};

/// Resolve the direction of a line from the local point of view.
///
/// We send only if we want to and the remote accepts to receive, and
/// likewise for receiving. Mutually exclusive directions (e.g. sendonly
/// against sendonly) therefore resolve to `Inactive` instead of failing.
pub fn resolve_direction(local: MediaDirection, remote: MediaDirection) -> MediaDirection {
    MediaDirection::from_flags(
        local.sends() && remote.receives(),
        local.receives() && remote.sends(),
    )
}

/// Negotiate the QoS precondition of a line.
///
/// If either side omits QoS (or disables it) the result omits it. With the
/// same type on both sides the weaker strength wins; different types have
/// nothing in common and also yield no QoS.
pub fn negotiate_qos(local: Option<QosPreference>, remote: Option<QosPreference>) -> Option<QosPreference> {
    let (local, remote) = (local?, remote?);
    if local.is_disabled() || remote.is_disabled() || local.qos_type != remote.qos_type {
        return None;
    }
    Some(QosPreference::new(local.qos_type, local.strength.min(remote.strength)))
}

/// First local format (in local preference order) the remote also lists
pub fn select_format(local: &[MediaFormat], remote: &[MediaFormat]) -> Option<MediaFormat> {
    local
        .iter()
        .find(|l| remote.iter().any(|r| l.is_compatible(r)))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QosStrength, QosType};
    use MediaDirection::*;

    #[test]
    fn test_direction_table() {
        assert_eq!(resolve_direction(SendRecv, SendRecv), SendRecv);
        assert_eq!(resolve_direction(SendRecv, RecvOnly), SendOnly);
        assert_eq!(resolve_direction(SendRecv, SendOnly), RecvOnly);
        assert_eq!(resolve_direction(SendOnly, RecvOnly), SendOnly);
        assert_eq!(resolve_direction(SendRecv, Inactive), Inactive);
    }

    #[test]
    fn test_exclusive_directions_become_inactive() {
        assert_eq!(resolve_direction(SendOnly, SendOnly), Inactive);
        assert_eq!(resolve_direction(RecvOnly, RecvOnly), Inactive);
    }

    #[test]
    fn test_qos_weaker_strength_wins() {
        let local = QosPreference::new(QosType::Segmented, QosStrength::Mandatory);
        let remote = QosPreference::new(QosType::Segmented, QosStrength::Optional);
        assert_eq!(
            negotiate_qos(Some(local), Some(remote)),
            Some(QosPreference::new(QosType::Segmented, QosStrength::Optional))
        );
    }

    #[test]
    fn test_qos_omitted_when_either_side_omits() {
        let local = QosPreference::new(QosType::EndToEnd, QosStrength::Mandatory);
        assert_eq!(negotiate_qos(Some(local), None), None);
        assert_eq!(negotiate_qos(None, Some(local)), None);
        let other = QosPreference::new(QosType::Segmented, QosStrength::Mandatory);
        assert_eq!(negotiate_qos(Some(local), Some(other)), None);
    }

    #[test]
    fn test_format_selection_prefers_local_order() {
        let local = vec![MediaFormat::pcma(), MediaFormat::pcmu()];
        let remote = vec![MediaFormat::pcmu(), MediaFormat::new(8, "pcma", 8000)];
        assert_eq!(select_format(&local, &remote), Some(MediaFormat::pcma()));
        assert_eq!(select_format(&local, &[MediaFormat::h264()]), None);
    }
}
