//! Guest sessions.
//!
//! A [`Session`] is an authenticated context inside the guest. It owns the
//! processes, files and directories created under it, routes guest
//! callbacks to them and tracks its own lifecycle.
//!
//! Status changes are applied in a fixed order: owned objects are told
//! first, then the new status is stored, then the session-level event is
//! fired. Waiters never see a session status their objects have not seen.

pub mod env;
mod fs_ops;
pub mod objects;
pub mod state;
pub(crate) mod wait;

pub use env::EnvironmentChanges;
pub use objects::ObjectKind;
pub use state::{SessionCredentials, SessionStatus, SessionWaitFlags, SessionWaitResult};

use crate::channel::GuestChannel;
use crate::config::GuestctlOptions;
use crate::fs::directory::{DirectoryOpenInfo, DirectoryStatus, GuestDirectory};
use crate::fs::file::{FileOpenInfo, FileStatus, GuestFile};
use crate::fs::path::PathStyle;
use crate::guest::{GuestInner, GuestOsType};
use crate::process::{GuestProcess, ProcessStartupInfo, ProcessStatus};
use crate::progress::Progress;
use chrono::{DateTime, Utc};
use guestctl_shared::constants::protocol;
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::flags::GuestFeatures;
use guestctl_shared::protocol::{ContextId, GuestCallback, HostMessage, SessionNotifyType};
use objects::ObjectRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use wait::{Deadline, EventPayload, EventType, Signal, WaitEventRegistry, WaitHandle};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Events
// ============================================================================

/// Everything a session reports to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        session_id: u32,
        status: SessionStatus,
        rc: GuestRc,
    },
    ObjectRegistered {
        kind: ObjectKind,
        object_id: u32,
    },
    ObjectUnregistered {
        kind: ObjectKind,
        object_id: u32,
    },
    ProcessStateChanged {
        object_id: u32,
        pid: u32,
        status: ProcessStatus,
    },
    FileStateChanged {
        object_id: u32,
        status: FileStatus,
    },
    DirectoryStateChanged {
        object_id: u32,
        status: DirectoryStatus,
    },
}

// ============================================================================
// Object Core
// ============================================================================

/// What every session object needs to talk to the guest.
#[derive(Clone)]
pub(crate) struct ObjectCore {
    session: Weak<SessionInner>,
    pub session_id: u32,
    pub object_id: u32,
    pub protocol: u32,
    pub request_timeout: Duration,
    pub events: Arc<WaitEventRegistry>,
    channel: Arc<dyn GuestChannel>,
    notifier: broadcast::Sender<SessionEvent>,
}

impl ObjectCore {
    pub fn register(&self, types: &[EventType]) -> GuestctlResult<WaitHandle> {
        self.events.register(self.object_id, types)
    }

    pub async fn send(&self, message: HostMessage) -> GuestctlResult<()> {
        tracing::trace!(
            session_id = self.session_id,
            object_id = self.object_id,
            message = message.name(),
            "Sending to guest"
        );
        self.channel.send(message).await
    }

    /// Signal the one request `cid` answers.
    pub fn reply(&self, cid: ContextId, event: EventType, rc: GuestRc, payload: EventPayload) -> bool {
        self.events.signal_reply(cid, event, rc, payload)
    }

    /// Signal waiters of this object interested in `event`.
    pub fn fire(&self, event: EventType, rc: GuestRc, payload: EventPayload) -> usize {
        self.events.signal_type(self.object_id, event, rc, payload)
    }

    pub fn notify(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.notifier.send(event);
    }

    pub fn session(&self) -> GuestctlResult<Session> {
        self.session
            .upgrade()
            .map(|inner| Session { inner })
            .ok_or_else(|| GuestctlError::InvalidState(format!("session {} is gone", self.session_id)))
    }

    pub fn ensure_session_started(&self) -> GuestctlResult<()> {
        self.session()?.ensure_started()
    }
}

// ============================================================================
// Session
// ============================================================================

/// Everything a new session is created with.
pub(crate) struct SessionSetup {
    pub id: u32,
    pub name: String,
    pub credentials: SessionCredentials,
    pub protocol: u32,
    pub os_type: GuestOsType,
    pub features: GuestFeatures,
    pub options: Arc<GuestctlOptions>,
    pub channel: Arc<dyn GuestChannel>,
    pub parent: Weak<GuestInner>,
}

struct SessionState {
    status: SessionStatus,
    /// Guest result recorded with the status; a failure only for `Error`.
    rc: GuestRc,
    environment: EnvironmentChanges,
    objects: ObjectRegistry,
    directories: BTreeMap<u32, GuestDirectory>,
    files: BTreeMap<u32, GuestFile>,
    processes: BTreeMap<u32, GuestProcess>,
}

pub(crate) struct SessionInner {
    id: u32,
    name: String,
    /// Object ID the session itself uses for its own requests.
    object_id: u32,
    credentials: SessionCredentials,
    protocol: u32,
    os_type: GuestOsType,
    features: GuestFeatures,
    options: Arc<GuestctlOptions>,
    channel: Arc<dyn GuestChannel>,
    parent: Weak<GuestInner>,
    events: Arc<WaitEventRegistry>,
    notifier: broadcast::Sender<SessionEvent>,
    created_at: DateTime<Utc>,
    /// Serializes status changes so a terminal status cannot be overwritten
    /// while objects are being told about it.
    transition: Mutex<()>,
    state: RwLock<SessionState>,
}

/// Handle to a guest session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("protocol", &self.inner.protocol)
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(setup: SessionSetup) -> GuestctlResult<Self> {
        let mut objects = ObjectRegistry::new(setup.options.max_objects);
        let object_id = objects.register(ObjectKind::Session)?;
        let (notifier, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::debug!(
            session_id = setup.id,
            name = %setup.name,
            user = %setup.credentials.user,
            protocol = setup.protocol,
            "Created guest session"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                id: setup.id,
                object_id,
                events: WaitEventRegistry::new(setup.id, setup.name.clone()),
                name: setup.name,
                credentials: setup.credentials,
                protocol: setup.protocol,
                os_type: setup.os_type,
                features: setup.features,
                options: setup.options,
                channel: setup.channel,
                parent: setup.parent,
                notifier,
                created_at: Utc::now(),
                transition: Mutex::new(()),
                state: RwLock::new(SessionState {
                    status: SessionStatus::Undefined,
                    rc: GuestRc::SUCCESS,
                    environment: EnvironmentChanges::new(setup.os_type.is_windows()),
                    objects,
                    directories: BTreeMap::new(),
                    files: BTreeMap::new(),
                    processes: BTreeMap::new(),
                }),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn user(&self) -> &str {
        &self.inner.credentials.user
    }

    pub fn domain(&self) -> &str {
        &self.inner.credentials.domain
    }

    pub fn protocol_version(&self) -> u32 {
        self.inner.protocol
    }

    pub fn os_type(&self) -> GuestOsType {
        self.inner.os_type
    }

    /// Path convention of the guest.
    pub fn path_style(&self) -> PathStyle {
        if self.inner.os_type.is_windows() {
            PathStyle::Dos
        } else {
            PathStyle::Unix
        }
    }

    pub fn features(&self) -> GuestFeatures {
        self.inner.features
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.read().status
    }

    /// Guest result code recorded with the current status.
    pub fn last_rc(&self) -> GuestRc {
        self.inner.state.read().rc
    }

    pub fn options(&self) -> &GuestctlOptions {
        &self.inner.options
    }

    /// Number of live objects, the session itself included.
    pub fn object_count(&self) -> usize {
        self.inner.state.read().objects.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.notifier.subscribe()
    }

    pub(crate) fn object_core(&self, object_id: u32) -> ObjectCore {
        ObjectCore {
            session: Arc::downgrade(&self.inner),
            session_id: self.inner.id,
            object_id,
            protocol: self.inner.protocol,
            request_timeout: self.inner.options.request_timeout(),
            events: self.inner.events.clone(),
            channel: self.inner.channel.clone(),
            notifier: self.inner.notifier.clone(),
        }
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.inner.notifier.send(event);
    }

    pub(crate) fn ensure_started(&self) -> GuestctlResult<()> {
        let status = self.status();
        if status != SessionStatus::Started {
            return Err(GuestctlError::InvalidState(format!(
                "session \"{}\" is not started ({})",
                self.inner.name, status
            )));
        }
        Ok(())
    }

    fn guest_error(&self, rc: GuestRc) -> GuestctlError {
        GuestctlError::guest(GuestErrorKind::Session, rc, self.inner.name.clone())
    }

    /// Send a session-level request and wait for its direct reply.
    pub(crate) async fn request(
        &self,
        build: impl FnOnce(ContextId) -> HostMessage,
    ) -> GuestctlResult<Signal> {
        self.ensure_started()?;
        let mut waiter = self
            .inner
            .events
            .register(self.inner.object_id, &[EventType::Reply])?;
        let message = build(waiter.cid());
        tracing::trace!(session_id = self.inner.id, message = message.name(), "Sending to guest");
        self.inner.channel.send(message).await?;
        waiter.wait(self.inner.options.request_timeout()).await
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the session inside the guest and wait until it is started.
    ///
    /// Legacy guests have no session concept; the session counts as started
    /// right away.
    pub async fn start(&self) -> GuestctlResult<()> {
        let status = self.status();
        if status != SessionStatus::Undefined {
            return Err(GuestctlError::InvalidState(format!(
                "session \"{}\" cannot be started from {}",
                self.inner.name, status
            )));
        }

        if self.inner.protocol < protocol::VERSION_SESSIONS {
            tracing::debug!(session_id = self.inner.id, "Legacy guest, session started implicitly");
            self.set_status(SessionStatus::Started, GuestRc::SUCCESS);
            return Ok(());
        }

        self.set_status(SessionStatus::Starting, GuestRc::SUCCESS);
        let mut waiter = self
            .inner
            .events
            .register(self.inner.object_id, &[EventType::SessionStateChanged])?;

        let credentials = &self.inner.credentials;
        let message = HostMessage::SessionCreate {
            cid: waiter.cid(),
            protocol: self.inner.protocol,
            user: credentials.user.clone(),
            password: credentials.password.clone(),
            domain: credentials.domain.clone(),
            flags: 0,
        };
        if let Err(e) = self.inner.channel.send(message).await {
            tracing::warn!(session_id = self.inner.id, error = %e, "Sending session create failed");
            self.set_status(SessionStatus::Error, GuestRc::GENERAL_FAILURE);
            return Err(e);
        }

        let timeout = self.inner.options.session_start_timeout();
        let signal = waiter.wait(timeout).await?;
        match signal.payload {
            EventPayload::SessionStatus {
                status: SessionStatus::Started,
                ..
            } => {
                tracing::info!(session_id = self.inner.id, name = %self.inner.name, "Guest session started");
                Ok(())
            }
            EventPayload::SessionStatus {
                status: SessionStatus::Error,
                rc,
            } => Err(self.guest_error(rc)),
            EventPayload::SessionStatus { status, .. } => Err(GuestctlError::InvalidState(format!(
                "session \"{}\" ended up {} while starting",
                self.inner.name, status
            ))),
            other => Err(GuestctlError::Protocol(format!(
                "unexpected answer while starting session: {:?}",
                other
            ))),
        }
    }

    /// Start on a background task; the returned handle completes with the
    /// outcome.
    pub fn start_async(&self) -> Progress {
        let progress = Progress::new(
            format!("Starting guest session \"{}\"", self.inner.name),
            1,
            "Opening guest session",
        );
        let session = self.clone();
        progress.run_in_background(async move { session.start().await });
        progress
    }

    /// Close the session.
    ///
    /// Open files and directories are closed first. The guest gets a close
    /// request (retried on local timeouts with growing budgets); whatever it
    /// answers, the session is removed from its guest and all its objects
    /// are released.
    pub async fn close(&self) -> GuestctlResult<()> {
        let status = self.status();
        let result = if self.inner.protocol < protocol::VERSION_SESSIONS
            || status != SessionStatus::Started
        {
            Ok(())
        } else {
            self.close_objects().await;
            self.close_on_guest().await
        };

        if let Some(guest) = self.inner.parent.upgrade() {
            guest.session_destroy(self.inner.id);
        }
        // Also covers sessions their guest no longer knows.
        self.teardown();

        if let Err(e) = &result {
            tracing::warn!(session_id = self.inner.id, error = %e, "Guest did not confirm session close");
        }
        result
    }

    async fn close_objects(&self) {
        let (files, directories) = {
            let state = self.inner.state.read();
            (
                state.files.values().cloned().collect::<Vec<_>>(),
                state.directories.values().cloned().collect::<Vec<_>>(),
            )
        };
        for file in files {
            if let Err(e) = file.close().await {
                tracing::debug!(object_id = file.object_id(), error = %e, "Closing file with session failed");
            }
        }
        for directory in directories {
            if let Err(e) = directory.close().await {
                tracing::debug!(object_id = directory.object_id(), error = %e, "Closing directory with session failed");
            }
        }
    }

    async fn close_on_guest(&self) -> GuestctlResult<()> {
        self.set_status(SessionStatus::Terminating, GuestRc::SUCCESS);

        let policy = &self.inner.options.close_retry;
        let mut last_error = None;
        for attempt in 0..policy.attempts {
            let timeout = policy.timeout_for_attempt(attempt);
            let mut waiter = self
                .inner
                .events
                .register(self.inner.object_id, &[EventType::SessionStateChanged])?;
            self.inner
                .channel
                .send(HostMessage::SessionClose {
                    cid: waiter.cid(),
                    flags: 0,
                })
                .await?;

            match waiter.wait(timeout).await {
                Ok(signal) if signal.rc.is_failure() => return Err(self.guest_error(signal.rc)),
                Ok(_) => return Ok(()),
                Err(e) if e.is_timeout() => {
                    tracing::warn!(
                        session_id = self.inner.id,
                        attempt = attempt + 1,
                        ?timeout,
                        "Session close timed out"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| GuestctlError::timeout("session close")))
    }

    /// Release everything locally. Idempotent.
    pub(crate) fn teardown(&self) {
        let status = self.status();
        if !status.is_terminal() {
            let last = match status {
                SessionStatus::Started | SessionStatus::Terminating => SessionStatus::Terminated,
                _ => SessionStatus::Down,
            };
            self.set_status(last, GuestRc::SUCCESS);
        }

        let released: Vec<(ObjectKind, u32)> = {
            let mut state = self.inner.state.write();
            let mut released = Vec::new();
            for id in std::mem::take(&mut state.processes).into_keys() {
                released.push((ObjectKind::Process, id));
            }
            for id in std::mem::take(&mut state.files).into_keys() {
                released.push((ObjectKind::File, id));
            }
            for id in std::mem::take(&mut state.directories).into_keys() {
                released.push((ObjectKind::Directory, id));
            }
            for (_, id) in &released {
                let _ = state.objects.unregister(*id);
            }
            released
        };

        if !released.is_empty() {
            tracing::debug!(session_id = self.inner.id, count = released.len(), "Released session objects");
        }
        for (kind, object_id) in released {
            self.notify(SessionEvent::ObjectUnregistered { kind, object_id });
        }
    }

    /// Wait for the session to reach a status matching `flags`.
    ///
    /// Never waits longer than `timeout` overall; running out of time
    /// yields [`SessionWaitResult::Timeout`]. An error status yields the
    /// recorded guest error.
    pub async fn wait_for(
        &self,
        flags: SessionWaitFlags,
        timeout: Duration,
    ) -> GuestctlResult<SessionWaitResult> {
        if flags.is_empty() {
            return Err(GuestctlError::InvalidArgument("no wait flags given".into()));
        }
        let deadline = Deadline::after(timeout);
        let mut first = true;

        loop {
            let mut waiter = self
                .inner
                .events
                .register(self.inner.object_id, &[EventType::SessionStateChanged])?;

            let (status, rc) = {
                let state = self.inner.state.read();
                (state.status, state.rc)
            };
            if status == SessionStatus::Error {
                return Err(self.guest_error(rc));
            }
            let immediate = SessionWaitResult::immediate(flags, status);
            if immediate != SessionWaitResult::None {
                return Ok(immediate);
            }
            if first && self.inner.protocol < protocol::VERSION_SESSIONS {
                return Ok(SessionWaitResult::WaitFlagNotSupported);
            }
            first = false;

            let Some(remaining) = deadline.remaining() else {
                return Ok(SessionWaitResult::Timeout);
            };
            let signal = match waiter.wait(remaining).await {
                Ok(signal) => signal,
                Err(e) if e.is_timeout() => return Ok(SessionWaitResult::Timeout),
                Err(e) => return Err(e),
            };
            if let EventPayload::SessionStatus { status, rc } = signal.payload {
                match SessionWaitResult::after_change(flags, status) {
                    SessionWaitResult::None => continue,
                    SessionWaitResult::Error => return Err(self.guest_error(rc)),
                    result => return Ok(result),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Status Dispatch
    // ------------------------------------------------------------------------

    /// Apply a new status: objects first, then the stored status, then the
    /// session event. A terminal status cancels every remaining wait.
    pub(crate) fn set_status(&self, status: SessionStatus, rc: GuestRc) {
        let inner = &self.inner;
        let _transition = inner.transition.lock();
        let (old, processes, files, directories) = {
            let state = inner.state.read();
            if state.status == status {
                return;
            }
            if state.status.is_terminal() {
                tracing::debug!(
                    session_id = inner.id,
                    current = %state.status,
                    ignored = %status,
                    "Session already terminal, ignoring status"
                );
                return;
            }
            (
                state.status,
                state.processes.values().cloned().collect::<Vec<_>>(),
                state.files.values().cloned().collect::<Vec<_>>(),
                state.directories.values().cloned().collect::<Vec<_>>(),
            )
        };

        if !old.can_transition_to(status) {
            tracing::warn!(session_id = inner.id, from = %old, to = %status, "Unexpected session status transition");
        }
        let rc = match status {
            SessionStatus::Error if rc.is_success() => {
                tracing::error!(session_id = inner.id, "Session error without guest result code");
                GuestRc::INTERNAL_ERROR
            }
            SessionStatus::Error => rc,
            _ => GuestRc::SUCCESS,
        };

        for process in &processes {
            process.on_session_status(status);
        }
        for file in &files {
            file.on_session_status(status);
        }
        for directory in &directories {
            directory.on_session_status(status);
        }

        {
            let mut state = inner.state.write();
            state.status = status;
            state.rc = rc;
        }
        tracing::debug!(session_id = inner.id, from = %old, to = %status, rc = rc.0, "Session status changed");

        inner.events.signal_type(
            inner.object_id,
            EventType::SessionStateChanged,
            rc,
            EventPayload::SessionStatus { status, rc },
        );
        self.notify(SessionEvent::StateChanged {
            session_id: inner.id,
            status,
            rc,
        });

        if status.is_terminal() {
            let cancelled = inner.events.cancel_all(rc);
            if cancelled > 0 {
                tracing::debug!(session_id = inner.id, cancelled, "Cancelled pending waits of terminated session");
            }
        }
    }

    fn on_session_notify(&self, kind: SessionNotifyType, result: GuestRc) {
        let Some(status) = SessionStatus::from_notify(kind) else {
            tracing::warn!(session_id = self.inner.id, ?kind, "Ignoring undefined session notification");
            return;
        };
        let rc = if status == SessionStatus::Error && result.is_success() {
            GuestRc::GENERAL_FAILURE
        } else {
            result
        };
        self.set_status(status, rc);
    }

    /// Route a guest callback to the session or to one of its objects.
    pub(crate) fn dispatch(&self, callback: GuestCallback) -> GuestctlResult<()> {
        let cid = callback.cid();
        let object_id = cid.object_id();
        tracing::trace!(session_id = self.inner.id, %cid, "Dispatching guest callback");

        match callback {
            GuestCallback::Reply { cid, rc, payload } => {
                let payload = payload.map(EventPayload::Text).unwrap_or(EventPayload::None);
                self.inner.events.signal_cid(cid, GuestRc(rc), payload);
            }
            GuestCallback::SessionNotify { kind, result, .. } => {
                self.on_session_notify(kind, GuestRc(result));
            }
            GuestCallback::ExecStatus {
                pid, status, flags, ..
            } => self.process_for_callback(object_id, pid)?.on_exec_status(pid, status, flags),
            GuestCallback::ExecOutput {
                pid, handle, data, ..
            } => self.process_for_callback(object_id, pid)?.on_exec_output(pid, handle, data),
            GuestCallback::ExecInputStatus {
                pid,
                status,
                flags,
                processed,
                ..
            } => self
                .process_for_callback(object_id, pid)?
                .on_input_status(pid, status, flags, processed),
            GuestCallback::FileNotify { rc, event, .. } => {
                let file = self.inner.state.read().files.get(&object_id).cloned();
                file.ok_or_else(|| unknown_object("file", object_id))?
                    .on_notify(cid, GuestRc(rc), event);
            }
            GuestCallback::DirNotify { rc, event, .. } => {
                let directory = self.inner.state.read().directories.get(&object_id).cloned();
                directory
                    .ok_or_else(|| unknown_object("directory", object_id))?
                    .on_notify(cid, GuestRc(rc), event);
            }
        }
        Ok(())
    }

    /// By object ID, falling back to the guest PID for legacy guests.
    fn process_for_callback(&self, object_id: u32, pid: u32) -> GuestctlResult<GuestProcess> {
        let state = self.inner.state.read();
        if let Some(process) = state.processes.get(&object_id) {
            return Ok(process.clone());
        }
        if pid != 0 {
            if let Some(process) = state.processes.values().find(|p| p.pid() == pid) {
                return Ok(process.clone());
            }
        }
        Err(unknown_object("process", object_id))
    }

    // ------------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------------

    /// Schedule `name=value` for every process started from now on.
    pub fn environment_schedule_set(&self, name: &str, value: &str) -> GuestctlResult<()> {
        self.inner.state.write().environment.set(name, value)
    }

    /// Schedule removal of `name` for every process started from now on.
    pub fn environment_schedule_unset(&self, name: &str) -> GuestctlResult<()> {
        self.inner.state.write().environment.unset(name)
    }

    /// `None` if untouched, `Some(None)` if scheduled for removal.
    pub fn environment_get(&self, name: &str) -> Option<Option<String>> {
        self.inner
            .state
            .read()
            .environment
            .get(name)
            .map(|v| v.map(str::to_string))
    }

    pub fn environment_changes(&self) -> Vec<String> {
        self.inner.state.read().environment.to_putenv_list()
    }

    pub fn environment_clear(&self) {
        self.inner.state.write().environment.clear();
    }

    // ------------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------------

    fn register_object(&self, kind: ObjectKind) -> GuestctlResult<u32> {
        let object_id = self.inner.state.write().objects.register(kind)?;
        self.notify(SessionEvent::ObjectRegistered { kind, object_id });
        Ok(object_id)
    }

    fn unregister_object(&self, kind: ObjectKind, object_id: u32) -> bool {
        let removed = {
            let mut state = self.inner.state.write();
            let present = match kind {
                ObjectKind::Process => state.processes.remove(&object_id).is_some(),
                ObjectKind::File => state.files.remove(&object_id).is_some(),
                ObjectKind::Directory => state.directories.remove(&object_id).is_some(),
                ObjectKind::Session => false,
            };
            let registered = state.objects.lookup(object_id).is_some_and(|e| e.kind == kind);
            if registered {
                let _ = state.objects.unregister(object_id);
            }
            present || registered
        };
        if removed {
            self.inner.events.cancel_object(object_id, GuestRc::SUCCESS);
            self.notify(SessionEvent::ObjectUnregistered { kind, object_id });
        }
        removed
    }

    /// Create a process object. It is not started.
    pub fn process_create(&self, mut startup: ProcessStartupInfo) -> GuestctlResult<GuestProcess> {
        self.ensure_started()?;
        startup.validate()?;

        let mut environment = self.inner.state.read().environment.clone();
        for entry in &startup.environment {
            environment.apply_putenv(entry)?;
        }
        let legacy_credentials = (self.inner.protocol < protocol::VERSION_SESSIONS).then(|| {
            (
                self.inner.credentials.user.clone(),
                self.inner.credentials.password.clone(),
            )
        });

        let object_id = self.register_object(ObjectKind::Process)?;
        let process = GuestProcess::new(
            self.object_core(object_id),
            startup,
            environment.to_putenv_list(),
            legacy_credentials,
        );
        self.inner
            .state
            .write()
            .processes
            .insert(object_id, process.clone());

        tracing::debug!(
            session_id = self.inner.id,
            object_id,
            executable = %process.executable(),
            "Created guest process"
        );
        Ok(process)
    }

    /// Look up a process by its guest PID.
    pub fn process_get(&self, pid: u32) -> GuestctlResult<GuestProcess> {
        if pid == 0 {
            return Err(GuestctlError::InvalidArgument("PID 0 is not valid".into()));
        }
        self.inner
            .state
            .read()
            .processes
            .values()
            .find(|p| p.pid() == pid)
            .cloned()
            .ok_or_else(|| GuestctlError::NotFound(format!("No process with PID {} found", pid)))
    }

    pub fn processes(&self) -> Vec<GuestProcess> {
        self.inner.state.read().processes.values().cloned().collect()
    }

    /// Drop a process from the session's table, freeing its object slot.
    pub fn process_release(&self, process: &GuestProcess) -> GuestctlResult<()> {
        if !self.unregister_object(ObjectKind::Process, process.object_id()) {
            return Err(unknown_object("process", process.object_id()));
        }
        Ok(())
    }

    pub(crate) fn process_unregister(&self, object_id: u32) -> bool {
        self.unregister_object(ObjectKind::Process, object_id)
    }

    /// Open a guest file. The file shows up in [`Session::files`] only
    /// once the guest confirmed the open.
    pub async fn file_open(&self, info: FileOpenInfo) -> GuestctlResult<GuestFile> {
        self.ensure_started()?;
        info.validate(self.inner.protocol)?;

        let object_id = self.register_object(ObjectKind::File)?;
        let file = GuestFile::new(self.object_core(object_id), info);
        // Routable while opening.
        self.inner.state.write().files.insert(object_id, file.clone());

        if let Err(e) = file.open(self.inner.options.request_timeout()).await {
            self.file_unregister(object_id);
            return Err(e);
        }
        Ok(file)
    }

    pub fn files(&self) -> Vec<GuestFile> {
        self.inner
            .state
            .read()
            .files
            .values()
            .filter(|f| f.status() == FileStatus::Open)
            .cloned()
            .collect()
    }

    pub(crate) fn file_unregister(&self, object_id: u32) -> bool {
        self.unregister_object(ObjectKind::File, object_id)
    }

    pub async fn directory_open(&self, info: DirectoryOpenInfo) -> GuestctlResult<GuestDirectory> {
        self.ensure_started()?;
        info.validate(self.inner.protocol)?;

        let object_id = self.register_object(ObjectKind::Directory)?;
        let directory = GuestDirectory::new(self.object_core(object_id), info);
        self.inner
            .state
            .write()
            .directories
            .insert(object_id, directory.clone());

        if let Err(e) = directory.open(self.inner.options.request_timeout()).await {
            self.directory_unregister(object_id);
            return Err(e);
        }
        Ok(directory)
    }

    pub fn directories(&self) -> Vec<GuestDirectory> {
        self.inner
            .state
            .read()
            .directories
            .values()
            .filter(|d| d.status() == DirectoryStatus::Open)
            .cloned()
            .collect()
    }

    pub(crate) fn directory_unregister(&self, object_id: u32) -> bool {
        self.unregister_object(ObjectKind::Directory, object_id)
    }
}

fn unknown_object(kind: &str, object_id: u32) -> GuestctlError {
    tracing::warn!(kind, object_id, "Callback for unknown object");
    GuestctlError::NotFound(format!("no {} with object ID {}", kind, object_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullChannel;

    #[async_trait]
    impl GuestChannel for NullChannel {
        async fn send(&self, _message: HostMessage) -> GuestctlResult<()> {
            Ok(())
        }
    }

    fn test_session() -> Session {
        Session::new(SessionSetup {
            id: 1,
            name: "test".into(),
            credentials: SessionCredentials::new("alice", "secret"),
            protocol: protocol::VERSION_SESSIONS,
            os_type: GuestOsType::Linux,
            features: GuestFeatures::empty(),
            options: Arc::new(GuestctlOptions::default()),
            channel: Arc::new(NullChannel),
            parent: Weak::new(),
        })
        .unwrap()
    }

    fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let session = test_session();
        session.set_status(SessionStatus::Starting, GuestRc::SUCCESS);
        session.set_status(SessionStatus::Started, GuestRc::SUCCESS);
        session.set_status(SessionStatus::Terminated, GuestRc::SUCCESS);

        session.set_status(SessionStatus::Started, GuestRc::SUCCESS);
        session.set_status(SessionStatus::Error, GuestRc::GENERAL_FAILURE);
        assert_eq!(session.status(), SessionStatus::Terminated);
        assert_eq!(session.last_rc(), GuestRc::SUCCESS);
    }

    #[test]
    fn test_concurrent_terminal_status_wins() {
        for _ in 0..200 {
            let session = test_session();
            session.set_status(SessionStatus::Starting, GuestRc::SUCCESS);

            let started = {
                let session = session.clone();
                std::thread::spawn(move || session.set_status(SessionStatus::Started, GuestRc::SUCCESS))
            };
            let terminated = {
                let session = session.clone();
                std::thread::spawn(move || session.set_status(SessionStatus::Terminated, GuestRc::SUCCESS))
            };
            started.join().unwrap();
            terminated.join().unwrap();

            assert_eq!(session.status(), SessionStatus::Terminated);
        }
    }

    #[test]
    fn test_error_status_records_guest_rc() {
        let session = test_session();
        session.set_status(SessionStatus::Starting, GuestRc::SUCCESS);
        session.set_status(SessionStatus::Error, GuestRc::AUTHENTICATION_FAILURE);
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(session.last_rc(), GuestRc::AUTHENTICATION_FAILURE);

        // An error always carries a failure code.
        let session = test_session();
        session.set_status(SessionStatus::Error, GuestRc::SUCCESS);
        assert!(!session.last_rc().is_success());

        // Anything else never does.
        let session = test_session();
        session.set_status(SessionStatus::Started, GuestRc::GENERAL_FAILURE);
        assert_eq!(session.last_rc(), GuestRc::SUCCESS);
    }

    #[test]
    fn test_repeated_status_notifies_once() {
        let session = test_session();
        session.set_status(SessionStatus::Started, GuestRc::SUCCESS);
        let process = session
            .process_create(ProcessStartupInfo::new("/bin/true"))
            .unwrap();

        let mut events = session.subscribe();
        session.set_status(SessionStatus::Started, GuestRc::SUCCESS);
        assert!(drain(&mut events).is_empty());

        session.set_status(SessionStatus::Down, GuestRc::SUCCESS);
        session.set_status(SessionStatus::Down, GuestRc::SUCCESS);
        let events = drain(&mut events);
        let process_changes = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::ProcessStateChanged { .. }))
            .count();
        let session_changes = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::StateChanged { .. }))
            .count();
        assert_eq!(process_changes, 1);
        assert_eq!(session_changes, 1);
        assert_eq!(process.status(), ProcessStatus::Down);

        // Objects hear about it before the session event goes out.
        let first_process = events
            .iter()
            .position(|e| matches!(e, SessionEvent::ProcessStateChanged { .. }));
        let first_session = events
            .iter()
            .position(|e| matches!(e, SessionEvent::StateChanged { .. }));
        assert!(first_process < first_session);
    }
}
