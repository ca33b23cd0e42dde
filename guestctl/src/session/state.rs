//! Session lifecycle status and wait vocabulary.

use bitflags::bitflags;
use guestctl_shared::protocol::SessionNotifyType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a guest session.
///
/// ```text
/// Undefined → Starting → Started → Terminating → Terminated
///                 │          │
///                 │          ├──→ TimedOutKilled | TimedOutAbnormally
///                 └──────────┴──→ Error
/// any ──→ Down (guest service going away)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Undefined,
    Starting,
    Started,
    Terminating,
    Terminated,
    TimedOutKilled,
    TimedOutAbnormally,
    Down,
    Error,
}

impl SessionStatus {
    /// No further transitions happen from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Terminated
                | SessionStatus::TimedOutKilled
                | SessionStatus::TimedOutAbnormally
                | SessionStatus::Down
                | SessionStatus::Error
        )
    }

    pub fn is_started(&self) -> bool {
        matches!(self, SessionStatus::Started)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(
            self,
            SessionStatus::TimedOutKilled | SessionStatus::TimedOutAbnormally
        )
    }

    /// Check if transition to target status is valid.
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, target),
            (_, Down) |
            (_, Error) |
            (Undefined, Starting) |
            // Legacy guests have no handshake.
            (Undefined, Started) |
            (Starting, Started) |
            (Starting, Terminated) |
            (Starting | Started, TimedOutKilled | TimedOutAbnormally) |
            (Started, Terminating) |
            (Started | Terminating, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Undefined => "undefined",
            SessionStatus::Starting => "starting",
            SessionStatus::Started => "started",
            SessionStatus::Terminating => "terminating",
            SessionStatus::Terminated => "terminated",
            SessionStatus::TimedOutKilled => "timed_out_killed",
            SessionStatus::TimedOutAbnormally => "timed_out_abnormally",
            SessionStatus::Down => "down",
            SessionStatus::Error => "error",
        }
    }

    /// Status implied by a guest notification, `None` for undefined ones.
    pub fn from_notify(kind: SessionNotifyType) -> Option<Self> {
        match kind {
            SessionNotifyType::Error => Some(SessionStatus::Error),
            SessionNotifyType::Started => Some(SessionStatus::Started),
            SessionNotifyType::TerminatedNormally
            | SessionNotifyType::TerminatedSignal
            | SessionNotifyType::TerminatedAbnormally => Some(SessionStatus::Terminated),
            SessionNotifyType::TimedOutKilled => Some(SessionStatus::TimedOutKilled),
            SessionNotifyType::TimedOutAbnormally => Some(SessionStatus::TimedOutAbnormally),
            SessionNotifyType::Down => Some(SessionStatus::Down),
            SessionNotifyType::Undefined => None,
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "undefined" => Ok(SessionStatus::Undefined),
            "starting" => Ok(SessionStatus::Starting),
            "started" => Ok(SessionStatus::Started),
            "terminating" => Ok(SessionStatus::Terminating),
            "terminated" => Ok(SessionStatus::Terminated),
            "timed_out_killed" => Ok(SessionStatus::TimedOutKilled),
            "timed_out_abnormally" => Ok(SessionStatus::TimedOutAbnormally),
            "down" => Ok(SessionStatus::Down),
            "error" => Ok(SessionStatus::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

bitflags! {
    /// What a [`Session::wait_for`](crate::Session::wait_for) caller waits for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SessionWaitFlags: u32 {
        const START = 1 << 0;
        const TERMINATE = 1 << 1;
        /// Also return on intermediate status changes.
        const STATUS = 1 << 2;
    }
}

/// Outcome of a session wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionWaitResult {
    None,
    Start,
    Terminate,
    Status,
    Error,
    Timeout,
    WaitFlagNotSupported,
}

impl SessionWaitResult {
    /// Result implied by the current status without waiting.
    pub(crate) fn immediate(flags: SessionWaitFlags, status: SessionStatus) -> Self {
        use SessionStatus::*;
        if flags.contains(SessionWaitFlags::TERMINATE) {
            return match status {
                Terminated | Down => SessionWaitResult::Terminate,
                TimedOutKilled | TimedOutAbnormally => SessionWaitResult::Timeout,
                Error => SessionWaitResult::Error,
                Started => SessionWaitResult::Start,
                Undefined | Starting | Terminating => SessionWaitResult::None,
            };
        }
        if flags.contains(SessionWaitFlags::START) {
            return match status {
                Started | Terminating | Terminated | Down => SessionWaitResult::Start,
                Error => SessionWaitResult::Error,
                TimedOutKilled | TimedOutAbnormally => SessionWaitResult::Timeout,
                Undefined | Starting => SessionWaitResult::None,
            };
        }
        SessionWaitResult::None
    }

    /// Result implied by a status change observed while waiting.
    pub(crate) fn after_change(flags: SessionWaitFlags, status: SessionStatus) -> Self {
        use SessionStatus::*;
        match status {
            Started => SessionWaitResult::Start,
            Starting | Terminating if flags.contains(SessionWaitFlags::STATUS) => {
                SessionWaitResult::Status
            }
            Starting | Terminating | Undefined => SessionWaitResult::None,
            Terminated | Down => SessionWaitResult::Terminate,
            TimedOutKilled | TimedOutAbnormally => SessionWaitResult::Timeout,
            Error => SessionWaitResult::Error,
        }
    }
}

/// Account a guest session runs under. Empty user means the guest
/// service's own account.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub user: String,
    pub password: String,
    pub domain: String,
}

impl SessionCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            domain: String::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.user.is_empty()
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}
