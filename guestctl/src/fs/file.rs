//! Guest files.

use crate::fs::info::FsObjData;
use crate::session::wait::{EventPayload, EventType, Signal};
use crate::session::{ObjectCore, SessionEvent, SessionStatus};
use guestctl_shared::constants::protocol;
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::protocol::{
    ContextId, FileAccessMode, FileEvent, FileOpenAction, FileSeekOrigin, FileSharingMode, HostMessage,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Undefined,
    Opening,
    Open,
    Closing,
    Closed,
    Down,
    Error,
}

impl FileStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Closed | FileStatus::Down | FileStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Undefined => "undefined",
            FileStatus::Opening => "opening",
            FileStatus::Open => "open",
            FileStatus::Closing => "closing",
            FileStatus::Closed => "closed",
            FileStatus::Down => "down",
            FileStatus::Error => "error",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How to open a guest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOpenInfo {
    pub path: String,
    pub access: FileAccessMode,
    pub action: FileOpenAction,
    pub sharing: FileSharingMode,
    /// Permission bits for newly created files.
    pub creation_mode: u32,
    /// Initial offset.
    pub offset: u64,
}

impl FileOpenInfo {
    pub fn new(path: impl Into<String>, access: FileAccessMode, action: FileOpenAction) -> Self {
        Self {
            path: path.into(),
            access,
            action,
            sharing: FileSharingMode::All,
            creation_mode: 0o644,
            offset: 0,
        }
    }

    pub fn sharing(mut self, sharing: FileSharingMode) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn creation_mode(mut self, mode: u32) -> Self {
        self.creation_mode = mode;
        self
    }

    /// Reject what the guest side does not implement before any round-trip.
    pub(crate) fn validate(&self, protocol_version: u32) -> GuestctlResult<()> {
        if self.path.is_empty() {
            return Err(GuestctlError::InvalidArgument("No file to open specified".into()));
        }
        if matches!(self.access, FileAccessMode::AppendOnly | FileAccessMode::AppendRead) {
            return Err(GuestctlError::NotImplemented(format!(
                "access mode {:?} is not implemented",
                self.access
            )));
        }
        if self.action == FileOpenAction::AppendOrCreate {
            return Err(GuestctlError::NotImplemented(
                "open action AppendOrCreate is not implemented".into(),
            ));
        }
        if self.sharing != FileSharingMode::All {
            return Err(GuestctlError::NotImplemented(format!(
                "sharing mode {:?} is not implemented",
                self.sharing
            )));
        }
        if self.creation_mode & !0o7777 != 0 {
            return Err(GuestctlError::InvalidArgument(format!(
                "invalid creation mode {:o}",
                self.creation_mode
            )));
        }
        if protocol_version < protocol::VERSION_SESSIONS {
            return Err(GuestctlError::guest(
                GuestErrorKind::File,
                GuestRc::NOT_SUPPORTED,
                self.path.clone(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FileState {
    status: FileStatus,
    rc: GuestRc,
    handle: u32,
    offset: u64,
}

struct FileInner {
    core: ObjectCore,
    info: FileOpenInfo,
    state: Mutex<FileState>,
}

/// Handle to an open guest file. Cheap to clone.
#[derive(Clone)]
pub struct GuestFile {
    inner: Arc<FileInner>,
}

impl fmt::Debug for GuestFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("GuestFile")
            .field("object_id", &self.inner.core.object_id)
            .field("path", &self.inner.info.path)
            .field("status", &state.status)
            .field("offset", &state.offset)
            .finish()
    }
}

impl GuestFile {
    pub(crate) fn new(core: ObjectCore, info: FileOpenInfo) -> Self {
        let offset = info.offset;
        Self {
            inner: Arc::new(FileInner {
                core,
                info,
                state: Mutex::new(FileState {
                    status: FileStatus::Undefined,
                    rc: GuestRc::SUCCESS,
                    handle: 0,
                    offset,
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

    pub fn open_info(&self) -> &FileOpenInfo {
        &self.inner.info
    }

    pub fn status(&self) -> FileStatus {
        self.inner.state.lock().status
    }

    /// Guest result code recorded with the last status.
    pub fn last_rc(&self) -> GuestRc {
        self.inner.state.lock().rc
    }

    pub fn offset(&self) -> u64 {
        self.inner.state.lock().offset
    }

    fn guest_error(&self, rc: GuestRc) -> GuestctlError {
        GuestctlError::guest(GuestErrorKind::File, rc, self.inner.info.path.clone())
    }

    /// Open on the guest. Called once by the session.
    pub(crate) async fn open(&self, timeout: Duration) -> GuestctlResult<()> {
        let core = &self.inner.core;
        self.set_status(FileStatus::Opening, GuestRc::SUCCESS);
        let mut waiter = core.register(&[EventType::FileStateChanged])?;

        let info = &self.inner.info;
        core.send(HostMessage::FileOpen {
            cid: waiter.cid(),
            path: info.path.clone(),
            access: info.access,
            action: info.action,
            sharing: info.sharing,
            creation_mode: info.creation_mode,
            offset: info.offset,
        })
        .await?;

        let signal = waiter.wait(timeout).await?;
        match signal.payload {
            EventPayload::FileStatus {
                status: FileStatus::Open,
                ..
            } => {
                tracing::debug!(object_id = core.object_id, path = %info.path, "Opened guest file");
                Ok(())
            }
            EventPayload::FileStatus { rc, .. } if rc.is_failure() => Err(self.guest_error(rc)),
            other => Err(GuestctlError::InvalidState(format!(
                "unexpected answer while opening \"{}\": {:?}",
                info.path, other
            ))),
        }
    }

    /// Handle of an open file, or the reason there is none.
    fn open_handle(&self) -> GuestctlResult<u32> {
        self.inner.core.ensure_session_started()?;
        let state = self.inner.state.lock();
        if state.status != FileStatus::Open {
            return Err(GuestctlError::InvalidState(format!(
                "file \"{}\" is not open ({})",
                self.inner.info.path, state.status
            )));
        }
        Ok(state.handle)
    }

    async fn request(
        &self,
        event: EventType,
        timeout: Duration,
        build: impl FnOnce(u32, ContextId) -> HostMessage,
    ) -> GuestctlResult<Signal> {
        let core = &self.inner.core;
        let mut waiter = core.register(&[event, EventType::FileStateChanged])?;
        let handle = self.open_handle()?;
        core.send(build(handle, waiter.cid())).await?;
        let signal = waiter.wait(timeout).await?;
        if let EventPayload::FileStatus { status, rc } = signal.payload {
            if rc.is_failure() {
                return Err(self.guest_error(rc));
            }
            return Err(GuestctlError::InvalidState(format!(
                "file \"{}\" changed to {} during the request",
                self.inner.info.path, status
            )));
        }
        Ok(signal)
    }

    fn read_result(&self, signal: Signal) -> GuestctlResult<Vec<u8>> {
        if signal.rc == GuestRc::EOF {
            return Ok(Vec::new());
        }
        if signal.rc.is_failure() {
            return Err(self.guest_error(signal.rc));
        }
        match signal.payload {
            EventPayload::FileData(data) => Ok(data),
            _ => Ok(Vec::new()),
        }
    }

    /// Read up to `size` bytes at the current offset. Empty at end of file.
    pub async fn read(&self, size: u32, timeout: Duration) -> GuestctlResult<Vec<u8>> {
        if size == 0 {
            return Err(GuestctlError::InvalidArgument("read size must not be zero".into()));
        }
        let signal = self
            .request(EventType::FileRead, timeout, |handle, cid| HostMessage::FileRead {
                cid,
                handle,
                size,
            })
            .await?;
        let data = self.read_result(signal)?;
        self.inner.state.lock().offset += data.len() as u64;
        Ok(data)
    }

    pub async fn read_at(&self, offset: u64, size: u32, timeout: Duration) -> GuestctlResult<Vec<u8>> {
        if size == 0 {
            return Err(GuestctlError::InvalidArgument("read size must not be zero".into()));
        }
        let signal = self
            .request(EventType::FileRead, timeout, |handle, cid| HostMessage::FileReadAt {
                cid,
                handle,
                offset,
                size,
            })
            .await?;
        let data = self.read_result(signal)?;
        self.inner.state.lock().offset = offset + data.len() as u64;
        Ok(data)
    }

    fn write_result(&self, signal: Signal) -> GuestctlResult<u32> {
        if signal.rc.is_failure() {
            return Err(self.guest_error(signal.rc));
        }
        match signal.payload {
            EventPayload::FileWritten(written) => Ok(written),
            other => Err(GuestctlError::Protocol(format!(
                "unexpected write answer for \"{}\": {:?}",
                self.inner.info.path, other
            ))),
        }
    }

    /// Write at the current offset; returns the bytes written.
    pub async fn write(&self, data: &[u8], timeout: Duration) -> GuestctlResult<u32> {
        if data.is_empty() {
            return Err(GuestctlError::InvalidArgument("nothing to write".into()));
        }
        let payload = data.to_vec();
        let signal = self
            .request(EventType::FileWrite, timeout, |handle, cid| HostMessage::FileWrite {
                cid,
                handle,
                data: payload,
            })
            .await?;
        let written = self.write_result(signal)?;
        self.inner.state.lock().offset += u64::from(written);
        Ok(written)
    }

    pub async fn write_at(&self, offset: u64, data: &[u8], timeout: Duration) -> GuestctlResult<u32> {
        if data.is_empty() {
            return Err(GuestctlError::InvalidArgument("nothing to write".into()));
        }
        let payload = data.to_vec();
        let signal = self
            .request(EventType::FileWrite, timeout, |handle, cid| HostMessage::FileWriteAt {
                cid,
                handle,
                offset,
                data: payload,
            })
            .await?;
        let written = self.write_result(signal)?;
        self.inner.state.lock().offset = offset + u64::from(written);
        Ok(written)
    }

    /// Move the file offset; returns the new absolute offset.
    pub async fn seek(&self, offset: i64, origin: FileSeekOrigin) -> GuestctlResult<u64> {
        let timeout = self.inner.core.request_timeout;
        let signal = self
            .request(EventType::FileOffsetChanged, timeout, |handle, cid| {
                HostMessage::FileSeek {
                    cid,
                    handle,
                    origin,
                    offset,
                }
            })
            .await?;
        if signal.rc.is_failure() {
            return Err(self.guest_error(signal.rc));
        }
        match signal.payload {
            EventPayload::FileOffset(new_offset) => {
                self.inner.state.lock().offset = new_offset;
                Ok(new_offset)
            }
            other => Err(GuestctlError::Protocol(format!(
                "unexpected seek answer for \"{}\": {:?}",
                self.inner.info.path, other
            ))),
        }
    }

    pub async fn query_info(&self) -> GuestctlResult<FsObjData> {
        let session = self.inner.core.session()?;
        session.file_query_info(&self.inner.info.path, false).await
    }

    pub async fn query_size(&self) -> GuestctlResult<u64> {
        Ok(self.query_info().await?.size)
    }

    /// Close on the guest and drop it from the session.
    ///
    /// Local bookkeeping is released even when the guest fails the close;
    /// that failure is still returned.
    pub async fn close(&self) -> GuestctlResult<()> {
        let core = &self.inner.core;
        let result = self.close_on_guest().await;

        if let Ok(session) = core.session() {
            session.file_unregister(core.object_id);
        }
        self.set_status(FileStatus::Closed, GuestRc::SUCCESS);
        if let Err(e) = &result {
            tracing::warn!(object_id = core.object_id, path = %self.inner.info.path, error = %e, "Closing guest file failed");
        }
        result
    }

    async fn close_on_guest(&self) -> GuestctlResult<()> {
        let core = &self.inner.core;
        let handle = {
            let state = self.inner.state.lock();
            if state.status != FileStatus::Open {
                return Ok(());
            }
            state.handle
        };
        core.ensure_session_started()?;
        self.set_status(FileStatus::Closing, GuestRc::SUCCESS);
        let mut waiter = core.register(&[EventType::FileStateChanged])?;

        core.send(HostMessage::FileClose {
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

    fn set_status(&self, status: FileStatus, rc: GuestRc) {
        let core = &self.inner.core;
        {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() || state.status == status {
                return;
            }
            state.status = status;
            state.rc = rc;
        }
        tracing::trace!(object_id = core.object_id, %status, rc = rc.0, "File status changed");
        core.fire(EventType::FileStateChanged, rc, EventPayload::FileStatus { status, rc });
        core.notify(SessionEvent::FileStateChanged {
            object_id: core.object_id,
            status,
        });
    }

    /// Data replies go to the request named by `cid`; status changes reach
    /// every waiter of the file.
    pub(crate) fn on_notify(&self, cid: ContextId, rc: GuestRc, event: FileEvent) {
        let core = &self.inner.core;
        match event {
            FileEvent::Opened { handle } => {
                self.inner.state.lock().handle = handle;
                self.set_status(FileStatus::Open, GuestRc::SUCCESS);
            }
            FileEvent::Closed => self.set_status(FileStatus::Closed, GuestRc::SUCCESS),
            FileEvent::Error => {
                let rc = if rc.is_failure() { rc } else { GuestRc::GENERAL_FAILURE };
                self.set_status(FileStatus::Error, rc);
            }
            FileEvent::Read { data } => {
                let payload = if rc.is_failure() {
                    EventPayload::None
                } else {
                    EventPayload::FileData(data)
                };
                core.reply(cid, EventType::FileRead, rc, payload);
            }
            FileEvent::Written { written } => {
                core.reply(cid, EventType::FileWrite, rc, EventPayload::FileWritten(written));
            }
            FileEvent::Seeked { offset } => {
                core.reply(cid, EventType::FileOffsetChanged, rc, EventPayload::FileOffset(offset));
            }
        }
    }

    pub(crate) fn on_session_status(&self, status: SessionStatus) {
        if status.is_terminal() {
            self.set_status(FileStatus::Down, GuestRc::SUCCESS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_info_validation() {
        let ok = FileOpenInfo::new("/tmp/x", FileAccessMode::ReadOnly, FileOpenAction::OpenExisting);
        assert!(ok.validate(protocol::VERSION_SESSIONS).is_ok());

        let append = FileOpenInfo::new("/tmp/x", FileAccessMode::AppendOnly, FileOpenAction::OpenExisting);
        assert!(matches!(
            append.validate(protocol::VERSION_SESSIONS),
            Err(GuestctlError::NotImplemented(_))
        ));

        let shared = ok.clone().sharing(FileSharingMode::Read);
        assert!(matches!(
            shared.validate(protocol::VERSION_SESSIONS),
            Err(GuestctlError::NotImplemented(_))
        ));

        let empty = FileOpenInfo::new("", FileAccessMode::ReadOnly, FileOpenAction::OpenExisting);
        assert!(matches!(
            empty.validate(protocol::VERSION_SESSIONS),
            Err(GuestctlError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_legacy_guests_cannot_open_files() {
        let info = FileOpenInfo::new("/tmp/x", FileAccessMode::ReadOnly, FileOpenAction::OpenExisting);
        let err = info.validate(protocol::VERSION_LEGACY).unwrap_err();
        assert_eq!(err.guest_rc(), Some(GuestRc::NOT_SUPPORTED));
    }
}
