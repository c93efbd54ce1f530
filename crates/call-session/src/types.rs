//! Core types for the call session core
//!
//! Identifiers, media vocabulary (kinds, directions, QoS, formats), the
//! already-parsed session descriptions exchanged with the transport
//! collaborator, and the per-intent [`ActionConfig`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{Result, SessionError};

/// Session ID type
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media line kind
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Direction attribute of a media line, always from the local point of view
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn sends(self) -> bool {
        matches!(self, MediaDirection::SendRecv | MediaDirection::SendOnly)
    }

    pub fn receives(self) -> bool {
        matches!(self, MediaDirection::SendRecv | MediaDirection::RecvOnly)
    }

    pub fn from_flags(send: bool, recv: bool) -> Self {
        match (send, recv) {
            (true, true) => MediaDirection::SendRecv,
            (true, false) => MediaDirection::SendOnly,
            (false, true) => MediaDirection::RecvOnly,
            (false, false) => MediaDirection::Inactive,
        }
    }

    /// The direction as seen by the other party
    pub fn reversed(self) -> Self {
        Self::from_flags(self.receives(), self.sends())
    }

    /// Direction to offer when putting this line on hold: we keep sending
    /// (music on hold) but stop receiving.
    pub fn on_hold(self) -> Self {
        Self::from_flags(self.sends(), false)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaDirection {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sendrecv" => Ok(MediaDirection::SendRecv),
            "sendonly" => Ok(MediaDirection::SendOnly),
            "recvonly" => Ok(MediaDirection::RecvOnly),
            "inactive" => Ok(MediaDirection::Inactive),
            other => Err(SessionError::config(format!("unknown media direction: {}", other))),
        }
    }
}

/// QoS precondition type
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QosType {
    None,
    Segmented,
    EndToEnd,
}

/// QoS precondition strength. Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosStrength {
    None,
    Optional,
    Mandatory,
}

/// QoS preference attached to a media line
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct QosPreference {
    pub qos_type: QosType,
    pub strength: QosStrength,
}

impl QosPreference {
    pub fn new(qos_type: QosType, strength: QosStrength) -> Self {
        Self { qos_type, strength }
    }

    /// `QosType::None` or `QosStrength::None` both mean "no precondition"
    pub fn is_disabled(&self) -> bool {
        self.qos_type == QosType::None || self.strength == QosStrength::None
    }
}

/// A validated DTMF digit from the alphabet `0-9 A-D * #`
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct DtmfDigit(char);

impl DtmfDigit {
    pub fn new(c: char) -> Result<Self> {
        match c {
            '0'..='9' | 'A'..='D' | '*' | '#' => Ok(Self(c)),
            _ => Err(SessionError::InvalidDigit { digit: c.to_string() }),
        }
    }

    /// Numeric event code as used by telephone-event payloads:
    /// 0-9, `*` = 10, `#` = 11, `A`-`D` = 12-15.
    pub fn from_code(code: i32) -> Result<Self> {
        let c = match code {
            0..=9 => char::from(b'0' + code as u8),
            10 => '*',
            11 => '#',
            12..=15 => char::from(b'A' + (code - 12) as u8),
            _ => return Err(SessionError::InvalidDigit { digit: code.to_string() }),
        };
        Ok(Self(c))
    }

    pub fn as_char(&self) -> char {
        self.0
    }

    pub fn code(&self) -> u8 {
        match self.0 {
            '*' => 10,
            '#' => 11,
            c @ 'A'..='D' => 12 + (c as u8 - b'A'),
            c => c as u8 - b'0',
        }
    }
}

impl TryFrom<char> for DtmfDigit {
    type Error = SessionError;

    fn try_from(c: char) -> Result<Self> {
        Self::new(c)
    }
}

impl From<DtmfDigit> for char {
    fn from(digit: DtmfDigit) -> char {
        digit.0
    }
}

impl fmt::Display for DtmfDigit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One payload format of a media line
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
}

impl MediaFormat {
    pub fn new(payload_type: u8, encoding: impl Into<String>, clock_rate: u32) -> Self {
        Self { payload_type, encoding: encoding.into(), clock_rate }
    }

    /// Formats are compatible when encoding name and clock rate agree;
    /// payload type numbers may differ for dynamic formats.
    pub fn is_compatible(&self, other: &MediaFormat) -> bool {
        self.clock_rate == other.clock_rate && self.encoding.eq_ignore_ascii_case(&other.encoding)
    }

    pub fn pcmu() -> Self {
        Self::new(0, "PCMU", 8000)
    }

    pub fn pcma() -> Self {
        Self::new(8, "PCMA", 8000)
    }

    pub fn h264() -> Self {
        Self::new(96, "H264", 90000)
    }

    pub fn vp8() -> Self {
        Self::new(97, "VP8", 90000)
    }
}

/// A media line of an already-parsed session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaLine {
    pub kind: MediaKind,
    pub direction: MediaDirection,
    /// Transport port; 0 marks a line rejected by its author
    pub port: u16,
    pub formats: Vec<MediaFormat>,
    pub qos: Option<QosPreference>,
}

impl MediaLine {
    pub fn new(kind: MediaKind, direction: MediaDirection, port: u16, formats: Vec<MediaFormat>) -> Self {
        Self { kind, direction, port, formats, qos: None }
    }

    pub fn with_qos(mut self, qos: QosPreference) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }
}

/// Session description (offer or answer) handed to / received from the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Session version, incremented on every new local offer
    pub version: u64,
    /// Connection address for all lines
    pub address: String,
    pub lines: Vec<MediaLine>,
}

impl SessionDescription {
    pub fn new(version: u64, address: impl Into<String>, lines: Vec<MediaLine>) -> Self {
        Self { version, address: address.into(), lines }
    }
}

/// One desired media line of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedLine {
    pub kind: MediaKind,
    pub direction: MediaDirection,
}

/// What a call-control intent wants the session media to look like
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaProposal {
    pub lines: Vec<ProposedLine>,
    pub qos: Option<QosPreference>,
    /// Require reliable provisional responses (100rel)
    pub reliable_provisional: bool,
}

impl MediaProposal {
    pub fn new(lines: Vec<ProposedLine>) -> Self {
        Self { lines, qos: None, reliable_provisional: false }
    }

    pub fn audio() -> Self {
        Self::from_kinds(&[MediaKind::Audio])
    }

    pub fn video() -> Self {
        Self::from_kinds(&[MediaKind::Video])
    }

    pub fn audio_video() -> Self {
        Self::from_kinds(&[MediaKind::Audio, MediaKind::Video])
    }

    fn from_kinds(kinds: &[MediaKind]) -> Self {
        Self::new(
            kinds
                .iter()
                .map(|&kind| ProposedLine { kind, direction: MediaDirection::SendRecv })
                .collect(),
        )
    }

    pub fn with_qos(mut self, qos: Option<QosPreference>) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_reliable_provisional(mut self, enabled: bool) -> Self {
        self.reliable_provisional = enabled;
        self
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.lines.iter().any(|l| l.kind == kind)
    }
}

/// One accepted media line after offer/answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedMediaLine {
    /// Position of the line in the remote description
    pub index: usize,
    pub kind: MediaKind,
    /// Resolved direction, local point of view
    pub direction: MediaDirection,
    /// First format both sides support, in local preference order
    pub format: MediaFormat,
    pub remote_address: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub qos: Option<QosPreference>,
}

/// Result of a successful offer/answer exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedMediaDescription {
    pub remote_version: u64,
    pub lines: Vec<NegotiatedMediaLine>,
}

impl NegotiatedMediaDescription {
    pub fn directions(&self) -> Vec<MediaDirection> {
        self.lines.iter().map(|l| l.direction).collect()
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.lines.iter().any(|l| l.kind == kind)
    }

    pub fn line(&self, kind: MediaKind) -> Option<&NegotiatedMediaLine> {
        self.lines.iter().find(|l| l.kind == kind)
    }
}

/// Why a remote media line did not make it into the negotiated description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// Remote line has port 0
    RejectedByRemote,
    /// We have no line of that kind to pair it with
    NoLocalCounterpart,
    /// Kinds match but no payload format is shared
    NoCommonFormat,
}

/// A remote line left out of the negotiated description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedLine {
    pub index: usize,
    pub kind: MediaKind,
    pub reason: DropReason,
}

/// Optional per-intent configuration. Replaces the with/without
/// configuration overloads of the call-control operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Extra headers copied onto the outbound request
    pub headers: Vec<(String, String)>,
    /// Direction to offer for held lines instead of the default
    pub hold_direction: Option<MediaDirection>,
}

impl ActionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_hold_direction(mut self, direction: MediaDirection) -> Self {
        self.hold_direction = Some(direction);
        self
    }
}
