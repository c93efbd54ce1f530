//! Call session configuration
//!
//! [`CallSessionConfig`] carries the local capabilities and the policy
//! knobs of the core. It can be built in code (`Default` plus `with_*`
//! methods) or loaded from YAML:
//!
//! ```yaml
//! local_uri: "sip:alice@example.com"
//! media:
//!   address: "192.0.2.10"
//!   audio:
//!     port: 40000
//!     formats:
//!       - { payload_type: 0, encoding: PCMU, clock_rate: 8000 }
//! reliable_provisional: true
//! session_timer:
//!   interval_secs: 1800
//!   refresher: local
//! timer:
//!   expiry_policy: terminate
//!   tick_interval_ms: 1000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SessionError};
use crate::timer::{Refresher, MAX_SESSION_INTERVAL, MIN_SESSION_INTERVAL};
use crate::types::{MediaFormat, MediaKind, QosPreference};

/// Local media capabilities for one media kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCapability {
    pub port: u16,
    /// Supported formats in preference order
    pub formats: Vec<MediaFormat>,
}

/// Everything the negotiator may offer or accept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCapabilities {
    pub address: String,
    pub audio: KindCapability,
    #[serde(default)]
    pub video: Option<KindCapability>,
}

impl MediaCapabilities {
    pub fn for_kind(&self, kind: MediaKind) -> Option<&KindCapability> {
        match kind {
            MediaKind::Audio => Some(&self.audio),
            MediaKind::Video => self.video.as_ref(),
        }
    }
}

impl Default for MediaCapabilities {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            audio: KindCapability {
                port: 16000,
                formats: vec![MediaFormat::pcmu(), MediaFormat::pcma()],
            },
            video: Some(KindCapability {
                port: 16002,
                formats: vec![MediaFormat::h264(), MediaFormat::vp8()],
            }),
        }
    }
}

/// Session timer requested for new calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTimerSettings {
    pub interval_secs: u32,
    pub refresher: Refresher,
}

/// What to do when the session timer expires without a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryPolicy {
    /// Tear the call down (RFC 4028 behaviour)
    Terminate,
    /// Send one last refresh and keep the call if it succeeds
    Refresh,
}

/// Timer-related policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerPolicy {
    /// Fixed grace window before the deadline at which a refresh is due.
    /// `None` uses the RFC 4028 defaults (half the interval for the refresher).
    pub refresh_grace_secs: Option<u32>,
    pub expiry_policy: ExpiryPolicy,
    /// Period of the coordinator's expiry check
    pub tick_interval_ms: u64,
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self {
            refresh_grace_secs: None,
            expiry_policy: ExpiryPolicy::Terminate,
            tick_interval_ms: 1000,
        }
    }
}

impl TimerPolicy {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Configuration for call sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSessionConfig {
    /// Our address-of-record, used as From URI
    pub local_uri: String,
    pub media: MediaCapabilities,
    /// QoS preference for new calls
    pub qos: Option<QosPreference>,
    /// Require 100rel on new calls
    pub reliable_provisional: bool,
    /// Session timer for new calls
    pub session_timer: Option<SessionTimerSettings>,
    pub timer: TimerPolicy,
    /// Capacity of the notification broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for CallSessionConfig {
    fn default() -> Self {
        Self {
            local_uri: "sip:user@127.0.0.1".to_string(),
            media: MediaCapabilities::default(),
            qos: None,
            reliable_provisional: false,
            session_timer: None,
            timer: TimerPolicy::default(),
            event_channel_capacity: 256,
        }
    }
}

impl CallSessionConfig {
    pub fn new(local_uri: impl Into<String>) -> Self {
        Self { local_uri: local_uri.into(), ..Default::default() }
    }

    pub fn with_media(mut self, media: MediaCapabilities) -> Self {
        self.media = media;
        self
    }

    pub fn with_qos(mut self, qos: QosPreference) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_reliable_provisional(mut self, enabled: bool) -> Self {
        self.reliable_provisional = enabled;
        self
    }

    pub fn with_session_timer(mut self, interval_secs: u32, refresher: Refresher) -> Self {
        self.session_timer = Some(SessionTimerSettings { interval_secs, refresher });
        self
    }

    pub fn with_expiry_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.timer.expiry_policy = policy;
        self
    }

    pub fn with_refresh_grace(mut self, grace_secs: u32) -> Self {
        self.timer.refresh_grace_secs = Some(grace_secs);
        self
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading call session config from: {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_uri.is_empty() {
            return Err(SessionError::config("local_uri must not be empty"));
        }
        if self.media.audio.formats.is_empty() {
            return Err(SessionError::config("at least one audio format is required"));
        }
        if let Some(video) = &self.media.video {
            if video.formats.is_empty() {
                return Err(SessionError::config("video capability without formats"));
            }
        }
        if let Some(timer) = &self.session_timer {
            if !(MIN_SESSION_INTERVAL..=MAX_SESSION_INTERVAL).contains(&timer.interval_secs) {
                return Err(SessionError::InvalidTimerValue {
                    value: timer.interval_secs,
                    min: MIN_SESSION_INTERVAL,
                    max: MAX_SESSION_INTERVAL,
                });
            }
        }
        if self.timer.tick_interval_ms == 0 {
            return Err(SessionError::config("timer.tick_interval_ms must be positive"));
        }
        if self.event_channel_capacity == 0 {
            return Err(SessionError::config("event_channel_capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
local_uri: "sip:alice@example.com"
media:
  address: "192.0.2.10"
  audio:
    port: 40000
    formats:
      - { payload_type: 0, encoding: PCMU, clock_rate: 8000 }
reliable_provisional: true
session_timer:
  interval_secs: 1800
  refresher: local
timer:
  expiry_policy: refresh
"#;

    #[test]
    fn test_default_is_valid() {
        CallSessionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_yaml_loading() {
        let config = CallSessionConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.local_uri, "sip:alice@example.com");
        assert_eq!(config.media.audio.port, 40000);
        assert!(config.media.video.is_none());
        assert!(config.reliable_provisional);
        assert_eq!(
            config.session_timer,
            Some(SessionTimerSettings { interval_secs: 1800, refresher: Refresher::Local })
        );
        assert_eq!(config.timer.expiry_policy, ExpiryPolicy::Refresh);
        assert_eq!(config.timer.tick_interval_ms, 1000);
    }

    #[test]
    fn test_yaml_file_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = CallSessionConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.media.address, "192.0.2.10");
    }

    #[test]
    fn test_invalid_timer_rejected() {
        let config = CallSessionConfig::default().with_session_timer(60, Refresher::Local);
        assert!(matches!(config.validate(), Err(SessionError::InvalidTimerValue { value: 60, .. })));
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = CallSessionConfig::from_yaml_str("timer: [1, 2").unwrap_err();
        assert!(matches!(err, SessionError::Config { .. }));
    }
}
