//! Session timer manager (RFC 4028)
//!
//! The manager validates requested intervals, keeps the negotiated
//! interval and refresher role, and answers "is a refresh due / has the
//! session expired" for a given instant. It never sleeps or spawns; the
//! coordinator drives it with a periodic tick.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, SessionError};

/// Smallest acceptable session interval (RFC 4028 Min-SE floor)
pub const MIN_SESSION_INTERVAL: u32 = 90;

/// Largest session interval we accept
pub const MAX_SESSION_INTERVAL: u32 = 7200;

/// Upper bound of the non-refresher's grace window (RFC 4028 §10)
const MAX_NON_REFRESHER_GRACE: u32 = 32;

/// Which side sends the refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Refresher {
    Local,
    Remote,
}

impl fmt::Display for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refresher::Local => write!(f, "local"),
            Refresher::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for Refresher {
    type Err = SessionError;

    /// Accepts `local`/`remote` and, for calls we originate, `uac`/`uas`
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "uac" => Ok(Refresher::Local),
            "remote" | "uas" => Ok(Refresher::Remote),
            other => Err(SessionError::config(format!("unknown refresher: {}", other))),
        }
    }
}

/// Result of an expiry check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    /// No timer running
    Disarmed,
    /// Deadline not reached and not within the grace window
    Armed,
    /// Within the grace window, a refresh should be sent
    Due,
    /// Deadline passed without refresh
    Expired,
}

/// Running timer for an established session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimerState {
    pub interval_secs: u32,
    pub refresher: Refresher,
    pub deadline: Instant,
}

/// A refresh observed on the dialog (our UPDATE answered, or the remote's request)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRefresh {
    pub interval_secs: u32,
    pub refresher: Refresher,
    /// The refresh carried a fresh offer/answer exchange
    pub via_offer_answer: bool,
}

/// Tracks the requested and the running session timer of one call
#[derive(Debug, Clone, Default)]
pub struct SessionTimerManager {
    requested: Option<(u32, Refresher)>,
    state: Option<SessionTimerState>,
    fixed_grace_secs: Option<u32>,
}

impl SessionTimerManager {
    pub fn new(fixed_grace_secs: Option<u32>) -> Self {
        Self { requested: None, state: None, fixed_grace_secs }
    }

    pub fn validate_interval(interval_secs: u32) -> Result<()> {
        if (MIN_SESSION_INTERVAL..=MAX_SESSION_INTERVAL).contains(&interval_secs) {
            Ok(())
        } else {
            Err(SessionError::InvalidTimerValue {
                value: interval_secs,
                min: MIN_SESSION_INTERVAL,
                max: MAX_SESSION_INTERVAL,
            })
        }
    }

    /// Request a session timer. Takes effect on the next establishment or
    /// confirmed refresh via [`arm`](Self::arm).
    pub fn enable(&mut self, interval_secs: u32, refresher: Refresher) -> Result<()> {
        Self::validate_interval(interval_secs)?;
        self.requested = Some((interval_secs, refresher));
        Ok(())
    }

    pub fn requested(&self) -> Option<(u32, Refresher)> {
        self.requested
    }

    pub fn state(&self) -> Option<&SessionTimerState> {
        self.state.as_ref()
    }

    pub fn is_local_refresher(&self) -> bool {
        matches!(self.state, Some(SessionTimerState { refresher: Refresher::Local, .. }))
    }

    /// Start the timer from the requested values (session established or
    /// re-negotiated). No-op when nothing was requested.
    pub fn arm(&mut self, now: Instant) {
        if let Some((interval_secs, refresher)) = self.requested {
            self.state = Some(SessionTimerState {
                interval_secs,
                refresher,
                deadline: now + Duration::from_secs(interval_secs as u64),
            });
            debug!("Session timer armed: {}s, refresher {}", interval_secs, refresher);
        }
    }

    /// Re-arm after a refresh.
    ///
    /// A different interval is adopted only when it came with a fresh
    /// offer/answer and is valid; otherwise the current interval is kept.
    /// A refresh with no running timer starts one.
    pub fn on_refresh_received(&mut self, refresh: SessionRefresh, now: Instant) {
        let (interval_secs, refresher) = match (&self.state, self.requested) {
            (Some(current), _) if refresh.interval_secs != current.interval_secs => {
                if refresh.via_offer_answer && Self::validate_interval(refresh.interval_secs).is_ok() {
                    (refresh.interval_secs, refresh.refresher)
                } else {
                    (current.interval_secs, current.refresher)
                }
            }
            (Some(_), _) => (refresh.interval_secs, refresh.refresher),
            (None, _) if Self::validate_interval(refresh.interval_secs).is_ok() => {
                (refresh.interval_secs, refresh.refresher)
            }
            (None, Some(requested)) => requested,
            (None, None) => return,
        };

        self.requested = Some((interval_secs, refresher));
        self.state = Some(SessionTimerState {
            interval_secs,
            refresher,
            deadline: now + Duration::from_secs(interval_secs as u64),
        });
    }

    /// Grace window before the deadline in which a refresh is due
    pub fn grace_window(&self) -> Option<Duration> {
        let state = self.state.as_ref()?;
        let secs = match (self.fixed_grace_secs, state.refresher) {
            (Some(fixed), _) => fixed.min(state.interval_secs),
            (None, Refresher::Local) => state.interval_secs / 2,
            (None, Refresher::Remote) => MAX_NON_REFRESHER_GRACE.min(state.interval_secs / 3),
        };
        Some(Duration::from_secs(secs as u64))
    }

    pub fn check_expiry(&self, now: Instant) -> TimerStatus {
        let (Some(state), Some(grace)) = (self.state.as_ref(), self.grace_window()) else {
            return TimerStatus::Disarmed;
        };
        if now >= state.deadline {
            TimerStatus::Expired
        } else if now + grace >= state.deadline {
            TimerStatus::Due
        } else {
            TimerStatus::Armed
        }
    }

    /// Drop the running timer and the request
    pub fn disarm(&mut self) {
        self.state = None;
        self.requested = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_range() {
        let mut timer = SessionTimerManager::default();
        assert!(matches!(
            timer.enable(60, Refresher::Local),
            Err(SessionError::InvalidTimerValue { value: 60, min: 90, max: 7200 })
        ));
        assert!(timer.enable(7201, Refresher::Local).is_err());
        timer.enable(1800, Refresher::Local).unwrap();
        timer.enable(90, Refresher::Remote).unwrap();
        timer.enable(7200, Refresher::Remote).unwrap();
        assert_eq!(timer.requested(), Some((7200, Refresher::Remote)));
    }

    #[test]
    fn test_enable_does_not_arm() {
        let mut timer = SessionTimerManager::default();
        timer.enable(1800, Refresher::Local).unwrap();
        assert_eq!(timer.check_expiry(Instant::now()), TimerStatus::Disarmed);
    }

    #[test]
    fn test_expiry_only_at_deadline() {
        let start = Instant::now();
        let mut timer = SessionTimerManager::default();
        timer.enable(1800, Refresher::Remote).unwrap();
        timer.arm(start);

        assert_eq!(timer.check_expiry(start), TimerStatus::Armed);
        // remote refresher: grace is min(32, 600)
        assert_eq!(timer.check_expiry(start + Duration::from_secs(1767)), TimerStatus::Armed);
        assert_eq!(timer.check_expiry(start + Duration::from_secs(1768)), TimerStatus::Due);
        assert_eq!(timer.check_expiry(start + Duration::from_secs(1799)), TimerStatus::Due);
        assert_eq!(timer.check_expiry(start + Duration::from_secs(1800)), TimerStatus::Expired);
    }

    #[test]
    fn test_local_refresher_due_at_half_interval() {
        let start = Instant::now();
        let mut timer = SessionTimerManager::default();
        timer.enable(600, Refresher::Local).unwrap();
        timer.arm(start);
        assert_eq!(timer.check_expiry(start + Duration::from_secs(299)), TimerStatus::Armed);
        assert_eq!(timer.check_expiry(start + Duration::from_secs(300)), TimerStatus::Due);
    }

    #[test]
    fn test_fixed_grace_window() {
        let start = Instant::now();
        let mut timer = SessionTimerManager::new(Some(10));
        timer.enable(600, Refresher::Local).unwrap();
        timer.arm(start);
        assert_eq!(timer.check_expiry(start + Duration::from_secs(589)), TimerStatus::Armed);
        assert_eq!(timer.check_expiry(start + Duration::from_secs(590)), TimerStatus::Due);
    }

    #[test]
    fn test_refresh_rearms_deadline() {
        let start = Instant::now();
        let mut timer = SessionTimerManager::default();
        timer.enable(600, Refresher::Remote).unwrap();
        timer.arm(start);

        let later = start + Duration::from_secs(500);
        timer.on_refresh_received(
            SessionRefresh { interval_secs: 600, refresher: Refresher::Remote, via_offer_answer: false },
            later,
        );
        assert_eq!(timer.state().unwrap().deadline, later + Duration::from_secs(600));
        assert_eq!(timer.check_expiry(start + Duration::from_secs(700)), TimerStatus::Armed);
    }

    #[test]
    fn test_new_interval_needs_offer_answer() {
        let start = Instant::now();
        let mut timer = SessionTimerManager::default();
        timer.enable(600, Refresher::Remote).unwrap();
        timer.arm(start);

        timer.on_refresh_received(
            SessionRefresh { interval_secs: 1200, refresher: Refresher::Remote, via_offer_answer: false },
            start,
        );
        assert_eq!(timer.state().unwrap().interval_secs, 600);

        timer.on_refresh_received(
            SessionRefresh { interval_secs: 1200, refresher: Refresher::Local, via_offer_answer: true },
            start,
        );
        assert_eq!(timer.state().unwrap().interval_secs, 1200);
        assert!(timer.is_local_refresher());
    }

    #[test]
    fn test_disarm() {
        let mut timer = SessionTimerManager::default();
        timer.enable(600, Refresher::Local).unwrap();
        timer.arm(Instant::now());
        timer.disarm();
        assert!(timer.state().is_none());
        assert_eq!(timer.check_expiry(Instant::now()), TimerStatus::Disarmed);
    }

    #[test]
    fn test_refresher_parsing() {
        assert_eq!("uac".parse::<Refresher>().unwrap(), Refresher::Local);
        assert_eq!("Remote".parse::<Refresher>().unwrap(), Refresher::Remote);
        assert!("both".parse::<Refresher>().is_err());
    }
}
