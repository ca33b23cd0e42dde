//! Guest directories.

use crate::fs::info::FsObjData;
use crate::session::wait::{EventPayload, EventType};
use crate::session::{ObjectCore, SessionEvent, SessionStatus};
use guestctl_shared::constants::protocol;
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::protocol::{ContextId, DirEvent, HostMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryStatus {
    Undefined,
    Opening,
    Open,
    Closing,
    Closed,
    Down,
    Error,
}

impl DirectoryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DirectoryStatus::Closed | DirectoryStatus::Down | DirectoryStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryStatus::Undefined => "undefined",
            DirectoryStatus::Opening => "opening",
            DirectoryStatus::Open => "open",
            DirectoryStatus::Closing => "closing",
            DirectoryStatus::Closed => "closed",
            DirectoryStatus::Down => "down",
            DirectoryStatus::Error => "error",
        }
    }
}

impl fmt::Display for DirectoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryOpenInfo {
    pub path: String,
    /// Name filter. Not supported by guests yet, must be empty.
    pub filter: String,
    pub flags: u32,
}

impl DirectoryOpenInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self, protocol_version: u32) -> GuestctlResult<()> {
        if self.path.is_empty() {
            return Err(GuestctlError::InvalidArgument("No directory to open specified".into()));
        }
        if !self.filter.is_empty() {
            return Err(GuestctlError::NotImplemented(
                "Directory filters are not implemented yet".into(),
            ));
        }
        if self.flags != 0 {
            return Err(GuestctlError::InvalidArgument(format!(
                "Unknown directory open flags: {:#x}",
                self.flags
            )));
        }
        if protocol_version < protocol::VERSION_SESSIONS {
            return Err(GuestctlError::guest(
                GuestErrorKind::Directory,
                GuestRc::NOT_SUPPORTED,
                self.path.clone(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct DirectoryState {
    status: DirectoryStatus,
    rc: GuestRc,
    handle: u32,
}

struct DirectoryInner {
    core: ObjectCore,
    info: DirectoryOpenInfo,
    state: Mutex<DirectoryState>,
}

/// Handle to an open guest directory. Cheap to clone.
#[derive(Clone)]
pub struct GuestDirectory {
    inner: Arc<DirectoryInner>,
}

impl fmt::Debug for GuestDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestDirectory")
            .field("object_id", &self.inner.core.object_id)
            .field("path", &self.inner.info.path)
            .field("status", &self.inner.state.lock().status)
            .finish()
    }
}

impl GuestDirectory {
    pub(crate) fn new(core: ObjectCore, info: DirectoryOpenInfo) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                core,
                info,
                state: Mutex::new(DirectoryState {
                    status: DirectoryStatus::Undefined,
                    rc: GuestRc::SUCCESS,
                    handle: 0,
                }),
            }),
        }
    }

    pub fn object_id(&self) -> u32 {
        self.inner.core.object_id
    }

    pub fn path(&self) -> &str {
        &self.inner.info.path
    }

    pub fn status(&self) -> DirectoryStatus {
        self.inner.state.lock().status
    }

    /// Guest result code recorded with the last status.
    pub fn last_rc(&self) -> GuestRc {
        self.inner.state.lock().rc
    }

    fn guest_error(&self, rc: GuestRc) -> GuestctlError {
        GuestctlError::guest(GuestErrorKind::Directory, rc, self.inner.info.path.clone())
    }

    pub(crate) async fn open(&self, timeout: Duration) -> GuestctlResult<()> {
        let core = &self.inner.core;
        self.set_status(DirectoryStatus::Opening, GuestRc::SUCCESS);
        let mut waiter = core.register(&[EventType::DirectoryStateChanged])?;

        core.send(HostMessage::DirOpen {
            cid: waiter.cid(),
            path: self.inner.info.path.clone(),
            filter: self.inner.info.filter.clone(),
            flags: self.inner.info.flags,
        })
        .await?;

        let signal = waiter.wait(timeout).await?;
        match signal.payload {
            EventPayload::DirectoryStatus {
                status: DirectoryStatus::Open,
                ..
            } => Ok(()),
            EventPayload::DirectoryStatus { rc, .. } if rc.is_failure() => Err(self.guest_error(rc)),
            other => Err(GuestctlError::InvalidState(format!(
                "unexpected answer while opening directory \"{}\": {:?}",
                self.inner.info.path, other
            ))),
        }
    }

    /// Next entry, or `None` once the directory is exhausted.
    pub async fn read(&self) -> GuestctlResult<Option<FsObjData>> {
        let core = &self.inner.core;
        core.ensure_session_started()?;
        let mut waiter =
            core.register(&[EventType::DirectoryRead, EventType::DirectoryStateChanged])?;
        let handle = {
            let state = self.inner.state.lock();
            if state.status != DirectoryStatus::Open {
                return Err(GuestctlError::InvalidState(format!(
                    "directory \"{}\" is not open ({})",
                    self.inner.info.path, state.status
                )));
            }
            state.handle
        };

        core.send(HostMessage::DirRead {
            cid: waiter.cid(),
            handle,
        })
        .await?;
        let signal = waiter.wait(core.request_timeout).await?;

        if signal.rc == GuestRc::NO_MORE_FILES {
            return Ok(None);
        }
        if signal.rc.is_failure() {
            return Err(self.guest_error(signal.rc));
        }
        match signal.payload {
            EventPayload::DirectoryEntry(record) => Ok(Some(FsObjData::from_record(&record))),
            EventPayload::DirectoryStatus { status, .. } => Err(GuestctlError::InvalidState(format!(
                "directory \"{}\" changed to {} while reading",
                self.inner.info.path, status
            ))),
            other => Err(GuestctlError::Protocol(format!(
                "unexpected directory read answer: {:?}",
                other
            ))),
        }
    }

    /// Close on the guest and drop it from the session. Local state is
    /// released even when the guest fails the close.
    pub async fn close(&self) -> GuestctlResult<()> {
        let core = &self.inner.core;
        let result = self.close_on_guest().await;
        if let Ok(session) = core.session() {
            session.directory_unregister(core.object_id);
        }
        self.set_status(DirectoryStatus::Closed, GuestRc::SUCCESS);
        result
    }

    async fn close_on_guest(&self) -> GuestctlResult<()> {
        let core = &self.inner.core;
        let handle = {
            let state = self.inner.state.lock();
            if state.status != DirectoryStatus::Open {
                return Ok(());
            }
            state.handle
        };
        core.ensure_session_started()?;
        self.set_status(DirectoryStatus::Closing, GuestRc::SUCCESS);
        let mut waiter = core.register(&[EventType::DirectoryStateChanged])?;

        core.send(HostMessage::DirClose {
            cid: waiter.cid(),
            handle,
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

    fn set_status(&self, status: DirectoryStatus, rc: GuestRc) {
        let core = &self.inner.core;
        {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() || state.status == status {
                return;
            }
            state.status = status;
            state.rc = rc;
        }
        core.fire(
            EventType::DirectoryStateChanged,
            rc,
            EventPayload::DirectoryStatus { status, rc },
        );
        core.notify(SessionEvent::DirectoryStateChanged {
            object_id: core.object_id,
            status,
        });
    }

    pub(crate) fn on_notify(&self, cid: ContextId, rc: GuestRc, event: DirEvent) {
        match event {
            DirEvent::Opened { handle } => {
                self.inner.state.lock().handle = handle;
                self.set_status(DirectoryStatus::Open, GuestRc::SUCCESS);
            }
            DirEvent::Closed => self.set_status(DirectoryStatus::Closed, GuestRc::SUCCESS),
            DirEvent::Error => {
                let rc = if rc.is_failure() { rc } else { GuestRc::GENERAL_FAILURE };
                self.set_status(DirectoryStatus::Error, rc);
            }
            DirEvent::Read { entry } => {
                let payload = if rc.is_failure() {
                    EventPayload::None
                } else {
                    EventPayload::DirectoryEntry(entry)
                };
                self.inner.core.reply(cid, EventType::DirectoryRead, rc, payload);
            }
        }
    }

    pub(crate) fn on_session_status(&self, status: SessionStatus) {
        if status.is_terminal() {
            self.set_status(DirectoryStatus::Down, GuestRc::SUCCESS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_info_validation() {
        assert!(DirectoryOpenInfo::new("/tmp").validate(protocol::VERSION_SESSIONS).is_ok());

        let mut filtered = DirectoryOpenInfo::new("/tmp");
        filtered.filter = "*.txt".into();
        assert!(matches!(
            filtered.validate(protocol::VERSION_SESSIONS),
            Err(GuestctlError::NotImplemented(_))
        ));

        assert!(DirectoryOpenInfo::new("").validate(protocol::VERSION_SESSIONS).is_err());
        assert_eq!(
            DirectoryOpenInfo::new("/tmp")
                .validate(protocol::VERSION_LEGACY)
                .unwrap_err()
                .guest_rc(),
            Some(GuestRc::NOT_SUPPORTED)
        );
    }

    #[test]
    fn test_status_terminality() {
        assert!(DirectoryStatus::Down.is_terminal());
        assert!(!DirectoryStatus::Open.is_terminal());
        assert_eq!(DirectoryStatus::Closing.to_string(), "closing");
    }
}
