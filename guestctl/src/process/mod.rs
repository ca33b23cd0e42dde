//! Guest processes.
//!
//! A [`GuestProcess`] is created by [`Session::process_create`] without
//! being started. Starting sends the execute request; every later status
//! change arrives from the guest and is fired as a process state event that
//! [`GuestProcess::wait_for`] and I/O calls wait on.
//!
//! [`Session::process_create`]: crate::Session::process_create

pub mod stream;
pub mod toolbox;

use crate::session::wait::{Deadline, EventPayload, EventType};
use crate::session::{ObjectCore, SessionEvent, SessionStatus};
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use guestctl_shared::constants::{handles, protocol, timeouts};
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::flags::{ProcessCreateFlags, ProcessInputFlags, ProcessOutputFlags};
use guestctl_shared::protocol::{ExecCommand, ExecStatus, HostMessage, InputStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a guest process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Undefined,
    Starting,
    Started,
    Paused,
    Terminating,
    TerminatedNormally,
    TerminatedSignal,
    TerminatedAbnormally,
    TimedOutKilled,
    TimedOutAbnormally,
    Down,
    Error,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::TerminatedNormally
                | ProcessStatus::TerminatedSignal
                | ProcessStatus::TerminatedAbnormally
                | ProcessStatus::TimedOutKilled
                | ProcessStatus::TimedOutAbnormally
                | ProcessStatus::Down
                | ProcessStatus::Error
        )
    }

    pub fn is_started(&self) -> bool {
        matches!(self, ProcessStatus::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Undefined => "undefined",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Started => "started",
            ProcessStatus::Paused => "paused",
            ProcessStatus::Terminating => "terminating",
            ProcessStatus::TerminatedNormally => "terminated_normally",
            ProcessStatus::TerminatedSignal => "terminated_signal",
            ProcessStatus::TerminatedAbnormally => "terminated_abnormally",
            ProcessStatus::TimedOutKilled => "timed_out_killed",
            ProcessStatus::TimedOutAbnormally => "timed_out_abnormally",
            ProcessStatus::Down => "down",
            ProcessStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ProcessStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "undefined" => Ok(ProcessStatus::Undefined),
            "starting" => Ok(ProcessStatus::Starting),
            "started" => Ok(ProcessStatus::Started),
            "paused" => Ok(ProcessStatus::Paused),
            "terminating" => Ok(ProcessStatus::Terminating),
            "terminated_normally" => Ok(ProcessStatus::TerminatedNormally),
            "terminated_signal" => Ok(ProcessStatus::TerminatedSignal),
            "terminated_abnormally" => Ok(ProcessStatus::TerminatedAbnormally),
            "timed_out_killed" => Ok(ProcessStatus::TimedOutKilled),
            "timed_out_abnormally" => Ok(ProcessStatus::TimedOutAbnormally),
            "down" => Ok(ProcessStatus::Down),
            "error" => Ok(ProcessStatus::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProcessWaitFlags: u32 {
        const START = 1 << 0;
        const TERMINATE = 1 << 1;
        const STDIN = 1 << 2;
        const STDOUT = 1 << 3;
        const STDERR = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessWaitResult {
    None,
    Start,
    Terminate,
    Status,
    Error,
    Timeout,
    StdIn,
    StdOut,
    StdErr,
    /// The caller asked for I/O readiness, which is not signalled; poll
    /// with [`GuestProcess::read`] instead.
    WaitFlagNotSupported,
}

impl ProcessWaitResult {
    /// Result implied by a move from `old` to `new` status.
    pub(crate) fn from_status(
        flags: ProcessWaitFlags,
        old: ProcessStatus,
        new: ProcessStatus,
        create_flags: ProcessCreateFlags,
    ) -> Self {
        use ProcessStatus::*;
        let result = match new {
            TerminatedNormally | TerminatedSignal | TerminatedAbnormally | Down => {
                ProcessWaitResult::Terminate
            }
            TimedOutKilled | TimedOutAbnormally => ProcessWaitResult::Timeout,
            Started => match old {
                Undefined | Starting
                    if flags.contains(ProcessWaitFlags::START)
                        || create_flags.contains(ProcessCreateFlags::WAIT_FOR_START_ONLY) =>
                {
                    ProcessWaitResult::Start
                }
                Started if flags.contains(ProcessWaitFlags::START) => ProcessWaitResult::Start,
                _ => ProcessWaitResult::None,
            },
            Error => ProcessWaitResult::Error,
            Undefined | Starting | Terminating | Paused => ProcessWaitResult::None,
        };

        let io_flags = ProcessWaitFlags::STDIN | ProcessWaitFlags::STDOUT | ProcessWaitFlags::STDERR;
        if new == Started && result == ProcessWaitResult::None && flags.intersects(io_flags) {
            return ProcessWaitResult::WaitFlagNotSupported;
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProcessPriority {
    Invalid,
    #[default]
    Default,
}

/// Outcome of a stdin write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInputResult {
    pub status: InputStatus,
    pub processed: u32,
}

// ============================================================================
// Startup Info
// ============================================================================

/// What to run and how.
///
/// # Example
///
/// ```rust,no_run
/// use guestctl::process::ProcessStartupInfo;
/// use guestctl_shared::ProcessCreateFlags;
///
/// let startup = ProcessStartupInfo::new("/bin/ls")
///     .args(["-l", "/tmp"])
///     .env("LC_ALL=C")
///     .flags(ProcessCreateFlags::WAIT_FOR_STDOUT);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessStartupInfo {
    pub name: String,
    pub executable: String,
    /// Full argument vector, `argv[0]` included.
    pub arguments: Vec<String>,
    /// Putenv-style changes on top of the session environment.
    pub environment: Vec<String>,
    pub flags: ProcessCreateFlags,
    /// Zero means no limit.
    pub timeout_ms: u32,
    pub priority: ProcessPriority,
    pub affinity: Vec<u64>,
}

impl ProcessStartupInfo {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    /// Append arguments. When no `argv[0]` was set yet, the executable is
    /// used for it on validation.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.arguments.is_empty() && !self.executable.is_empty() {
            self.arguments.push(self.executable.clone());
        }
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.environment.push(entry.into());
        self
    }

    pub fn flags(mut self, flags: ProcessCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(timeouts::INFINITE_MS);
        self
    }

    pub fn priority(mut self, priority: ProcessPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn affinity(mut self, affinity: Vec<u64>) -> Self {
        self.affinity = affinity;
        self
    }

    /// Check and normalize before creation.
    pub(crate) fn validate(&mut self) -> GuestctlResult<()> {
        if self.executable.is_empty() {
            match self.arguments.first() {
                Some(argv0) if !argv0.is_empty() => self.executable = argv0.clone(),
                _ => {
                    return Err(GuestctlError::InvalidArgument(
                        "No command to execute specified".into(),
                    ));
                }
            }
        }
        if self.arguments.is_empty() {
            self.arguments.push(self.executable.clone());
        }

        let unknown = self.flags.bits() & !ProcessCreateFlags::all().bits();
        if unknown != 0 {
            return Err(GuestctlError::InvalidArgument(format!(
                "Unknown process creation flags: {:#x}",
                unknown
            )));
        }
        if self.flags.contains(ProcessCreateFlags::WAIT_FOR_START_ONLY)
            && self
                .flags
                .intersects(ProcessCreateFlags::WAIT_FOR_STDOUT | ProcessCreateFlags::WAIT_FOR_STDERR)
        {
            return Err(GuestctlError::InvalidArgument(
                "Waiting for output cannot be combined with waiting for start only".into(),
            ));
        }
        if self.priority != ProcessPriority::Default {
            return Err(GuestctlError::InvalidArgument(format!(
                "Process priority {:?} is not supported",
                self.priority
            )));
        }
        if self.timeout_ms == 0 {
            self.timeout_ms = timeouts::INFINITE_MS;
        }
        if self.name.is_empty() {
            self.name = self.executable.clone();
        }
        Ok(())
    }
}

// ============================================================================
// Process Object
// ============================================================================

#[derive(Debug)]
struct ProcessState {
    status: ProcessStatus,
    rc: GuestRc,
    pid: u32,
    exit_code: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

struct ProcessInner {
    core: ObjectCore,
    startup: ProcessStartupInfo,
    /// Session environment merged with the startup overrides.
    environment: Vec<String>,
    /// Legacy guests take the account with every execute request.
    legacy_credentials: Option<(String, String)>,
    state: Mutex<ProcessState>,
}

/// Handle to a process object of a session. Cheap to clone.
#[derive(Clone)]
pub struct GuestProcess {
    inner: Arc<ProcessInner>,
}

impl fmt::Debug for GuestProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("GuestProcess")
            .field("object_id", &self.inner.core.object_id)
            .field("executable", &self.inner.startup.executable)
            .field("pid", &state.pid)
            .field("status", &state.status)
            .finish()
    }
}

impl GuestProcess {
    pub(crate) fn new(
        core: ObjectCore,
        startup: ProcessStartupInfo,
        environment: Vec<String>,
        legacy_credentials: Option<(String, String)>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                core,
                startup,
                environment,
                legacy_credentials,
                state: Mutex::new(ProcessState {
                    status: ProcessStatus::Undefined,
                    rc: GuestRc::SUCCESS,
                    pid: 0,
                    exit_code: None,
                    started_at: None,
                    ended_at: None,
                }),
            }),
        }
    }

    pub fn object_id(&self) -> u32 {
        self.inner.core.object_id
    }

    pub fn pid(&self) -> u32 {
        self.inner.state.lock().pid
    }

    pub fn status(&self) -> ProcessStatus {
        self.inner.state.lock().status
    }

    /// Exit code, or signal number for [`ProcessStatus::TerminatedSignal`].
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.state.lock().exit_code
    }

    /// Guest result code recorded with the last status.
    pub fn last_rc(&self) -> GuestRc {
        self.inner.state.lock().rc
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().ended_at
    }

    pub fn executable(&self) -> &str {
        &self.inner.startup.executable
    }

    pub fn arguments(&self) -> &[String] {
        &self.inner.startup.arguments
    }

    pub fn environment(&self) -> &[String] {
        &self.inner.environment
    }

    pub fn startup(&self) -> &ProcessStartupInfo {
        &self.inner.startup
    }

    fn guest_error(&self, rc: GuestRc) -> GuestctlError {
        GuestctlError::guest(GuestErrorKind::Process, rc, self.inner.startup.executable.clone())
    }

    /// Start and wait until the guest reports the process running (or
    /// already finished).
    pub async fn start(&self) -> GuestctlResult<()> {
        self.start_async().await?;
        match self
            .wait_for(ProcessWaitFlags::START, self.inner.core.request_timeout)
            .await?
        {
            ProcessWaitResult::Start | ProcessWaitResult::Terminate => Ok(()),
            ProcessWaitResult::Timeout => Err(GuestctlError::timeout(format_args!(
                "process \"{}\" did not start within {:?}",
                self.executable(),
                self.inner.core.request_timeout
            ))),
            other => Err(GuestctlError::InvalidState(format!(
                "process \"{}\" did not start: {:?}",
                self.executable(),
                other
            ))),
        }
    }

    /// Send the execute request without waiting for the guest.
    pub async fn start_async(&self) -> GuestctlResult<()> {
        let core = &self.inner.core;
        core.ensure_session_started()?;
        {
            let mut state = self.inner.state.lock();
            if state.status != ProcessStatus::Undefined {
                return Err(GuestctlError::InvalidState(format!(
                    "process \"{}\" was already started ({})",
                    self.executable(),
                    state.status
                )));
            }
            state.status = ProcessStatus::Starting;
        }

        let startup = &self.inner.startup;
        let legacy = core.protocol < protocol::VERSION_SESSIONS;
        let (user, password) = match &self.inner.legacy_credentials {
            Some((user, password)) if legacy => (Some(user.clone()), Some(password.clone())),
            _ => (None, None),
        };
        let command = ExecCommand {
            cid: core.events.next_cid(core.object_id),
            executable: startup.executable.clone(),
            flags: startup.flags,
            arguments: startup.arguments.clone(),
            environment: self.inner.environment.clone(),
            user,
            password,
            timeout_ms: startup.timeout_ms,
            priority: (!legacy).then_some(ProcessPriority::Default as u32),
            affinity: (!legacy && !startup.affinity.is_empty()).then(|| startup.affinity.clone()),
        };

        tracing::debug!(
            session_id = core.session_id,
            object_id = core.object_id,
            executable = %startup.executable,
            "Starting guest process"
        );
        if let Err(e) = core.send(HostMessage::ExecCmd(command)).await {
            self.set_status(ProcessStatus::Error, GuestRc::GENERAL_FAILURE);
            return Err(e);
        }
        Ok(())
    }

    /// Wait until a status matching `flags` is reached, at most `timeout`.
    ///
    /// Running out of time yields [`ProcessWaitResult::Timeout`], not an
    /// error. An error status yields the recorded guest error.
    pub async fn wait_for(
        &self,
        flags: ProcessWaitFlags,
        timeout: Duration,
    ) -> GuestctlResult<ProcessWaitResult> {
        let deadline = Deadline::after(timeout);
        let create_flags = self.inner.startup.flags;
        let mut old = self.status();

        loop {
            let mut waiter = self
                .inner
                .core
                .register(&[EventType::ProcessStateChanged])?;

            let (status, rc) = {
                let state = self.inner.state.lock();
                (state.status, state.rc)
            };
            match ProcessWaitResult::from_status(flags, old, status, create_flags) {
                ProcessWaitResult::None => {}
                ProcessWaitResult::Error => return Err(self.guest_error(rc)),
                result => return Ok(result),
            }
            old = status;

            let Some(remaining) = deadline.remaining() else {
                return Ok(ProcessWaitResult::Timeout);
            };
            match waiter.wait(remaining).await {
                Ok(_) => continue,
                Err(e) if e.is_timeout() => return Ok(ProcessWaitResult::Timeout),
                Err(e) => return Err(e),
            }
        }
    }

    /// Read up to `size` bytes of stdout or stderr.
    ///
    /// Returns nothing when the process is not running or the handle was
    /// not requested at creation.
    pub async fn read(&self, handle: u32, size: u32, timeout: Duration) -> GuestctlResult<Vec<u8>> {
        let wanted = match handle {
            handles::STDOUT => ProcessCreateFlags::WAIT_FOR_STDOUT,
            handles::STDERR => ProcessCreateFlags::WAIT_FOR_STDERR,
            other => {
                return Err(GuestctlError::InvalidArgument(format!(
                    "cannot read from handle {}",
                    other
                )));
            }
        };
        if size == 0 {
            return Err(GuestctlError::InvalidArgument("read size must not be zero".into()));
        }

        let core = &self.inner.core;
        let mut waiter = core.register(&[EventType::ProcessOutput, EventType::ProcessStateChanged])?;
        let pid = {
            let state = self.inner.state.lock();
            if state.status != ProcessStatus::Started || !self.inner.startup.flags.contains(wanted) {
                return Ok(Vec::new());
            }
            state.pid
        };

        let flags = if handle == handles::STDERR {
            ProcessOutputFlags::STDERR
        } else {
            ProcessOutputFlags::empty()
        };
        core.send(HostMessage::ExecGetOutput {
            cid: waiter.cid(),
            pid,
            handle,
            flags,
            size,
        })
        .await?;

        let signal = waiter.wait(timeout).await?;
        if signal.rc.is_failure() {
            return Err(self.guest_error(signal.rc));
        }
        match signal.payload {
            EventPayload::ProcessOutput { handle: h, mut data } if h == handle => {
                data.truncate(size as usize);
                Ok(data)
            }
            // Status change, or output of the other handle.
            _ => Ok(Vec::new()),
        }
    }

    /// Write `data` to stdin. [`ProcessInputFlags::END_OF_FILE`] closes it.
    pub async fn write(
        &self,
        handle: u32,
        flags: ProcessInputFlags,
        data: &[u8],
        timeout: Duration,
    ) -> GuestctlResult<ProcessInputResult> {
        if handle != handles::STDIN {
            return Err(GuestctlError::InvalidArgument(format!(
                "cannot write to handle {}",
                handle
            )));
        }

        let core = &self.inner.core;
        let mut waiter =
            core.register(&[EventType::ProcessInputNotify, EventType::ProcessStateChanged])?;
        let pid = {
            let state = self.inner.state.lock();
            if state.status != ProcessStatus::Started {
                return Err(GuestctlError::InvalidState(format!(
                    "process \"{}\" is not running ({})",
                    self.executable(),
                    state.status
                )));
            }
            state.pid
        };

        core.send(HostMessage::ExecSetInput {
            cid: waiter.cid(),
            pid,
            flags,
            data: data.to_vec(),
        })
        .await?;

        let signal = waiter.wait(timeout).await?;
        if signal.rc.is_failure() {
            return Err(self.guest_error(signal.rc));
        }
        match signal.payload {
            EventPayload::ProcessInput { status, processed } => Ok(ProcessInputResult { status, processed }),
            _ => Err(GuestctlError::InvalidState(format!(
                "process \"{}\" ended while writing input",
                self.executable()
            ))),
        }
    }

    /// Ask the guest to terminate the process.
    pub async fn terminate(&self) -> GuestctlResult<()> {
        let core = &self.inner.core;
        if core.protocol < protocol::VERSION_SESSIONS {
            return Err(GuestctlError::Unsupported(
                "terminating guest processes needs a guest with session support".into(),
            ));
        }

        let mut waiter = core.register(&[EventType::ProcessStateChanged])?;
        let pid = {
            let state = self.inner.state.lock();
            if state.status != ProcessStatus::Started {
                tracing::warn!(
                    object_id = core.object_id,
                    status = %state.status,
                    "Process not running, nothing to terminate"
                );
                return Ok(());
            }
            state.pid
        };

        core.send(HostMessage::ExecTerminate {
            cid: waiter.cid(),
            pid,
        })
        .await?;
        let signal = waiter.wait(core.request_timeout).await?;
        if signal.rc.is_failure() {
            return Err(self.guest_error(signal.rc));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn set_status(&self, status: ProcessStatus, rc: GuestRc) {
        let core = &self.inner.core;
        let pid = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() || state.status == status {
                return;
            }
            state.status = status;
            state.rc = rc;
            match status {
                ProcessStatus::Started => state.started_at = Some(Utc::now()),
                s if s.is_terminal() => state.ended_at = Some(Utc::now()),
                _ => {}
            }
            state.pid
        };

        tracing::debug!(object_id = core.object_id, pid, %status, rc = rc.0, "Process status changed");
        core.fire(
            EventType::ProcessStateChanged,
            rc,
            EventPayload::ProcessStatus { status, rc },
        );
        core.notify(SessionEvent::ProcessStateChanged {
            object_id: core.object_id,
            pid,
            status,
        });
    }

    pub(crate) fn on_exec_status(&self, pid: u32, status: ExecStatus, flags: u32) {
        let (new, rc, exit_code) = match status {
            ExecStatus::Started => (ProcessStatus::Started, GuestRc::SUCCESS, None),
            ExecStatus::TerminatedNormally => {
                (ProcessStatus::TerminatedNormally, GuestRc::SUCCESS, Some(flags as i32))
            }
            ExecStatus::TerminatedSignal => {
                (ProcessStatus::TerminatedSignal, GuestRc::SUCCESS, Some(flags as i32))
            }
            ExecStatus::TerminatedAbnormally => {
                (ProcessStatus::TerminatedAbnormally, GuestRc::SUCCESS, None)
            }
            ExecStatus::TimedOutKilled => (ProcessStatus::TimedOutKilled, GuestRc::SUCCESS, None),
            ExecStatus::TimedOutAbnormally => {
                (ProcessStatus::TimedOutAbnormally, GuestRc::SUCCESS, None)
            }
            ExecStatus::Down => (ProcessStatus::Down, GuestRc::SUCCESS, None),
            ExecStatus::Error => {
                let rc = GuestRc(flags as i32);
                let rc = if rc.is_failure() { rc } else { GuestRc::GENERAL_FAILURE };
                (ProcessStatus::Error, rc, None)
            }
            ExecStatus::Undefined => {
                tracing::warn!(object_id = self.object_id(), pid, "Ignoring undefined process status");
                return;
            }
        };

        {
            let mut state = self.inner.state.lock();
            if state.pid != 0 && pid != 0 && state.pid != pid {
                tracing::warn!(
                    object_id = self.object_id(),
                    expected = state.pid,
                    got = pid,
                    "Ignoring status for a different PID"
                );
                return;
            }
            if state.pid == 0 {
                state.pid = pid;
            }
            if exit_code.is_some() {
                state.exit_code = exit_code;
            }
        }
        self.set_status(new, rc);
    }

    pub(crate) fn on_exec_output(&self, pid: u32, handle: u32, data: Vec<u8>) {
        tracing::trace!(object_id = self.object_id(), pid, handle, len = data.len(), "Process output");
        self.inner.core.fire(
            EventType::ProcessOutput,
            GuestRc::SUCCESS,
            EventPayload::ProcessOutput { handle, data },
        );
    }

    pub(crate) fn on_input_status(&self, pid: u32, status: InputStatus, flags: u32, processed: u32) {
        let rc = match status {
            InputStatus::Broken => GuestRc::BROKEN_PIPE,
            _ if (flags as i32) < 0 => GuestRc(flags as i32),
            _ => GuestRc::SUCCESS,
        };
        tracing::trace!(object_id = self.object_id(), pid, ?status, processed, "Process input status");
        self.inner.core.fire(
            EventType::ProcessInputNotify,
            rc,
            EventPayload::ProcessInput { status, processed },
        );
    }

    /// Session went away: the process is unreachable from now on.
    pub(crate) fn on_session_status(&self, status: SessionStatus) {
        if status.is_terminal() {
            self.set_status(ProcessStatus::Down, GuestRc::SUCCESS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_validation_defaults() {
        let mut info = ProcessStartupInfo::default().args(["/bin/echo", "hi"]);
        info.validate().unwrap();
        assert_eq!(info.executable, "/bin/echo");
        assert_eq!(info.arguments, vec!["/bin/echo", "hi"]);
        assert_eq!(info.timeout_ms, timeouts::INFINITE_MS);

        let mut bare = ProcessStartupInfo::new("/bin/true");
        bare.validate().unwrap();
        assert_eq!(bare.arguments, vec!["/bin/true"]);
        assert_eq!(bare.name, "/bin/true");
    }

    #[test]
    fn test_startup_validation_rejects() {
        let mut nothing = ProcessStartupInfo::default();
        let err = nothing.validate().unwrap_err();
        assert!(err.to_string().contains("No command to execute specified"));

        let mut exclusive = ProcessStartupInfo::new("/bin/ls").flags(
            ProcessCreateFlags::WAIT_FOR_START_ONLY | ProcessCreateFlags::WAIT_FOR_STDOUT,
        );
        assert!(matches!(
            exclusive.validate(),
            Err(GuestctlError::InvalidArgument(_))
        ));

        let mut priority = ProcessStartupInfo::new("/bin/ls").priority(ProcessPriority::Invalid);
        assert!(priority.validate().is_err());

        let mut unknown = ProcessStartupInfo::new("/bin/ls")
            .flags(ProcessCreateFlags::from_bits_retain(1 << 30));
        assert!(unknown.validate().is_err());
    }

    #[test]
    fn test_wait_result_mapping() {
        use ProcessStatus::*;
        let none = ProcessCreateFlags::empty();
        let start = ProcessWaitFlags::START;
        let term = ProcessWaitFlags::TERMINATE;

        assert_eq!(ProcessWaitResult::from_status(start, Starting, Started, none), ProcessWaitResult::Start);
        assert_eq!(ProcessWaitResult::from_status(term, Starting, Started, none), ProcessWaitResult::None);
        assert_eq!(
            ProcessWaitResult::from_status(term, Starting, Started, ProcessCreateFlags::WAIT_FOR_START_ONLY),
            ProcessWaitResult::Start
        );
        assert_eq!(ProcessWaitResult::from_status(term, Started, Down, none), ProcessWaitResult::Terminate);
        assert_eq!(
            ProcessWaitResult::from_status(term, Started, TimedOutKilled, none),
            ProcessWaitResult::Timeout
        );
        assert_eq!(ProcessWaitResult::from_status(term, Started, Error, none), ProcessWaitResult::Error);
        assert_eq!(
            ProcessWaitResult::from_status(term | ProcessWaitFlags::STDOUT, Started, Started, none),
            ProcessWaitResult::WaitFlagNotSupported
        );
        assert_eq!(ProcessWaitResult::from_status(start, Started, Paused, none), ProcessWaitResult::None);
    }

    #[test]
    fn test_status_strings() {
        for status in [ProcessStatus::Started, ProcessStatus::TerminatedSignal, ProcessStatus::Down] {
            assert_eq!(status.as_str().parse::<ProcessStatus>(), Ok(status));
        }
        assert!(ProcessStatus::Error.is_terminal());
        assert!(!ProcessStatus::Terminating.is_terminal());
    }
}
