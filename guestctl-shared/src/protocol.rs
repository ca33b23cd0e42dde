//! Host/guest message vocabulary.
//!
//! Outbound requests are [`HostMessage`]s, inbound notifications are
//! [`GuestCallback`]s. Every message carries a [`ContextId`] that lets the
//! host route a callback to the session, object and request it answers.
//! Byte layout is left to the transport.

use crate::constants::context::{COUNT_BITS, MAX_CONTEXTS, MAX_OBJECTS, MAX_SESSIONS, OBJECT_BITS};
use crate::flags::{
    DirectoryRemoveFlags, PathRenameFlags, ProcessCreateFlags, ProcessInputFlags,
    ProcessOutputFlags, ShutdownFlags,
};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Context ID
// ============================================================================

/// Composite request correlator: session ID, object ID and sequence count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(u32);

impl ContextId {
    /// Build a context ID. Out-of-range components are masked.
    pub const fn new(session_id: u32, object_id: u32, count: u32) -> Self {
        ContextId(
            ((session_id & (MAX_SESSIONS - 1)) << (OBJECT_BITS + COUNT_BITS))
                | ((object_id & (MAX_OBJECTS - 1)) << COUNT_BITS)
                | (count & (MAX_CONTEXTS - 1)),
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        ContextId(raw)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn session_id(&self) -> u32 {
        self.0 >> (OBJECT_BITS + COUNT_BITS)
    }

    pub const fn object_id(&self) -> u32 {
        (self.0 >> COUNT_BITS) & (MAX_OBJECTS - 1)
    }

    pub const fn count(&self) -> u32 {
        self.0 & (MAX_CONTEXTS - 1)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#010x}(s{}/o{}/c{})",
            self.0,
            self.session_id(),
            self.object_id(),
            self.count()
        )
    }
}

// ============================================================================
// File and Filesystem Vocabulary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileAccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    AppendOnly,
    AppendRead,
}

impl FileAccessMode {
    pub fn can_read(&self) -> bool {
        matches!(
            self,
            FileAccessMode::ReadOnly | FileAccessMode::ReadWrite | FileAccessMode::AppendRead
        )
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, FileAccessMode::ReadOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileOpenAction {
    OpenExisting,
    OpenOrCreate,
    CreateNew,
    CreateOrReplace,
    OpenExistingTruncated,
    AppendOrCreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileSharingMode {
    Read,
    Write,
    ReadWrite,
    Delete,
    ReadDelete,
    WriteDelete,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileSeekOrigin {
    Begin,
    Current,
    End,
}

/// Filesystem object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FsObjType {
    #[default]
    Unknown,
    Fifo,
    DevChar,
    Directory,
    DevBlock,
    File,
    Symlink,
    Socket,
    WhiteOut,
}

impl FsObjType {
    /// Parse the single-character type tag used in toolbox output.
    pub fn from_tag(tag: char) -> Self {
        match tag {
            '-' => FsObjType::File,
            'd' => FsObjType::Directory,
            'l' => FsObjType::Symlink,
            'p' => FsObjType::Fifo,
            'c' => FsObjType::DevChar,
            'b' => FsObjType::DevBlock,
            's' => FsObjType::Socket,
            'w' => FsObjType::WhiteOut,
            _ => FsObjType::Unknown,
        }
    }

    pub fn tag(&self) -> char {
        match self {
            FsObjType::File => '-',
            FsObjType::Directory => 'd',
            FsObjType::Symlink => 'l',
            FsObjType::Fifo => 'p',
            FsObjType::DevChar => 'c',
            FsObjType::DevBlock => 'b',
            FsObjType::Socket => 's',
            FsObjType::WhiteOut => 'w',
            FsObjType::Unknown => '?',
        }
    }
}

/// Filesystem object record as reported by the guest.
///
/// Times are nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsObjRecord {
    pub name: String,
    pub obj_type: FsObjType,
    pub size: u64,
    pub alloc_size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub node_id: u64,
    pub access_time_ns: i64,
    pub modification_time_ns: i64,
    pub change_time_ns: i64,
    pub birth_time_ns: i64,
}

// ============================================================================
// Host → Guest
// ============================================================================

/// Process start request.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExecCommand {
    pub cid: ContextId,
    pub executable: String,
    pub flags: ProcessCreateFlags,
    pub arguments: Vec<String>,
    /// `NAME=VALUE` entries; a bare `NAME` unsets the variable.
    pub environment: Vec<String>,
    /// Credentials travel with the command for legacy guests only.
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u32,
    pub priority: Option<u32>,
    pub affinity: Option<Vec<u64>>,
}

impl fmt::Debug for ExecCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecCommand")
            .field("cid", &self.cid)
            .field("executable", &self.executable)
            .field("flags", &self.flags)
            .field("arguments", &self.arguments)
            .field("environment", &self.environment.len())
            .field("user", &self.user)
            .field("timeout_ms", &self.timeout_ms)
            .field("priority", &self.priority)
            .field("affinity", &self.affinity)
            .finish()
    }
}

/// Outbound request to the in-guest service.
#[derive(Clone, Serialize, Deserialize)]
pub enum HostMessage {
    SessionCreate {
        cid: ContextId,
        protocol: u32,
        user: String,
        password: String,
        domain: String,
        flags: u32,
    },
    SessionClose {
        cid: ContextId,
        flags: u32,
    },
    PathRename {
        cid: ContextId,
        source: String,
        dest: String,
        flags: PathRenameFlags,
    },
    PathUserHome {
        cid: ContextId,
    },
    PathUserDocuments {
        cid: ContextId,
    },
    Shutdown {
        cid: ContextId,
        flags: ShutdownFlags,
    },
    DirRemove {
        cid: ContextId,
        path: String,
        flags: DirectoryRemoveFlags,
    },
    DirOpen {
        cid: ContextId,
        path: String,
        filter: String,
        flags: u32,
    },
    DirRead {
        cid: ContextId,
        handle: u32,
    },
    DirClose {
        cid: ContextId,
        handle: u32,
    },
    FileOpen {
        cid: ContextId,
        path: String,
        access: FileAccessMode,
        action: FileOpenAction,
        sharing: FileSharingMode,
        creation_mode: u32,
        offset: u64,
    },
    FileClose {
        cid: ContextId,
        handle: u32,
    },
    FileRead {
        cid: ContextId,
        handle: u32,
        size: u32,
    },
    FileReadAt {
        cid: ContextId,
        handle: u32,
        offset: u64,
        size: u32,
    },
    FileWrite {
        cid: ContextId,
        handle: u32,
        data: Vec<u8>,
    },
    FileWriteAt {
        cid: ContextId,
        handle: u32,
        offset: u64,
        data: Vec<u8>,
    },
    FileSeek {
        cid: ContextId,
        handle: u32,
        origin: FileSeekOrigin,
        offset: i64,
    },
    ExecCmd(ExecCommand),
    ExecTerminate {
        cid: ContextId,
        pid: u32,
    },
    ExecGetOutput {
        cid: ContextId,
        pid: u32,
        handle: u32,
        flags: ProcessOutputFlags,
        /// Upper bound of bytes to return.
        size: u32,
    },
    ExecSetInput {
        cid: ContextId,
        pid: u32,
        flags: ProcessInputFlags,
        data: Vec<u8>,
    },
}

impl HostMessage {
    pub fn cid(&self) -> ContextId {
        match self {
            HostMessage::SessionCreate { cid, .. }
            | HostMessage::SessionClose { cid, .. }
            | HostMessage::PathRename { cid, .. }
            | HostMessage::PathUserHome { cid }
            | HostMessage::PathUserDocuments { cid }
            | HostMessage::Shutdown { cid, .. }
            | HostMessage::DirRemove { cid, .. }
            | HostMessage::DirOpen { cid, .. }
            | HostMessage::DirRead { cid, .. }
            | HostMessage::DirClose { cid, .. }
            | HostMessage::FileOpen { cid, .. }
            | HostMessage::FileClose { cid, .. }
            | HostMessage::FileRead { cid, .. }
            | HostMessage::FileReadAt { cid, .. }
            | HostMessage::FileWrite { cid, .. }
            | HostMessage::FileWriteAt { cid, .. }
            | HostMessage::FileSeek { cid, .. }
            | HostMessage::ExecTerminate { cid, .. }
            | HostMessage::ExecGetOutput { cid, .. }
            | HostMessage::ExecSetInput { cid, .. } => *cid,
            HostMessage::ExecCmd(cmd) => cmd.cid,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostMessage::SessionCreate { .. } => "SESSION_CREATE",
            HostMessage::SessionClose { .. } => "SESSION_CLOSE",
            HostMessage::PathRename { .. } => "PATH_RENAME",
            HostMessage::PathUserHome { .. } => "PATH_USER_HOME",
            HostMessage::PathUserDocuments { .. } => "PATH_USER_DOCUMENTS",
            HostMessage::Shutdown { .. } => "SHUTDOWN",
            HostMessage::DirRemove { .. } => "DIR_REMOVE",
            HostMessage::DirOpen { .. } => "DIR_OPEN",
            HostMessage::DirRead { .. } => "DIR_READ",
            HostMessage::DirClose { .. } => "DIR_CLOSE",
            HostMessage::FileOpen { .. } => "FILE_OPEN",
            HostMessage::FileClose { .. } => "FILE_CLOSE",
            HostMessage::FileRead { .. } => "FILE_READ",
            HostMessage::FileReadAt { .. } => "FILE_READ_AT",
            HostMessage::FileWrite { .. } => "FILE_WRITE",
            HostMessage::FileWriteAt { .. } => "FILE_WRITE_AT",
            HostMessage::FileSeek { .. } => "FILE_SEEK",
            HostMessage::ExecCmd(_) => "EXEC_CMD",
            HostMessage::ExecTerminate { .. } => "EXEC_TERMINATE",
            HostMessage::ExecGetOutput { .. } => "EXEC_GET_OUTPUT",
            HostMessage::ExecSetInput { .. } => "EXEC_SET_INPUT",
        }
    }
}

impl fmt::Debug for HostMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Keep credentials out of logs.
            HostMessage::SessionCreate {
                cid,
                protocol,
                user,
                domain,
                flags,
                ..
            } => f
                .debug_struct("SessionCreate")
                .field("cid", cid)
                .field("protocol", protocol)
                .field("user", user)
                .field("domain", domain)
                .field("flags", flags)
                .finish(),
            HostMessage::ExecCmd(cmd) => cmd.fmt(f),
            HostMessage::FileWrite { cid, handle, data }
            | HostMessage::FileWriteAt {
                cid, handle, data, ..
            } => f
                .debug_struct(self.name())
                .field("cid", cid)
                .field("handle", handle)
                .field("len", &data.len())
                .finish(),
            HostMessage::ExecSetInput {
                cid,
                pid,
                flags,
                data,
            } => f
                .debug_struct("ExecSetInput")
                .field("cid", cid)
                .field("pid", pid)
                .field("flags", flags)
                .field("len", &data.len())
                .finish(),
            other => f
                .debug_struct(other.name())
                .field("cid", &other.cid())
                .finish_non_exhaustive(),
        }
    }
}

// ============================================================================
// Guest → Host
// ============================================================================

/// Session status notification type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionNotifyType {
    Undefined,
    Error,
    Started,
    TerminatedNormally,
    TerminatedSignal,
    TerminatedAbnormally,
    TimedOutKilled,
    TimedOutAbnormally,
    Down,
}

/// Process status reported by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecStatus {
    Undefined,
    Started,
    /// Exited; flags carry the exit code.
    TerminatedNormally,
    /// Killed by a signal; flags carry the signal number.
    TerminatedSignal,
    TerminatedAbnormally,
    TimedOutKilled,
    TimedOutAbnormally,
    Down,
    /// Could not start; flags carry the guest result code.
    Error,
}

/// Outcome of a stdin write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputStatus {
    Undefined,
    Written,
    Broken,
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEvent {
    Opened { handle: u32 },
    Closed,
    Read { data: Vec<u8> },
    Written { written: u32 },
    Seeked { offset: u64 },
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirEvent {
    Opened { handle: u32 },
    Closed,
    Read { entry: FsObjRecord },
    Error,
}

/// Inbound notification from the in-guest service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestCallback {
    /// Generic completion of a request; `payload` carries textual results.
    Reply {
        cid: ContextId,
        rc: i32,
        payload: Option<String>,
    },
    SessionNotify {
        cid: ContextId,
        kind: SessionNotifyType,
        result: i32,
    },
    ExecStatus {
        cid: ContextId,
        pid: u32,
        status: ExecStatus,
        flags: u32,
    },
    ExecOutput {
        cid: ContextId,
        pid: u32,
        handle: u32,
        flags: u32,
        data: Vec<u8>,
    },
    ExecInputStatus {
        cid: ContextId,
        pid: u32,
        status: InputStatus,
        flags: u32,
        processed: u32,
    },
    FileNotify {
        cid: ContextId,
        rc: i32,
        event: FileEvent,
    },
    DirNotify {
        cid: ContextId,
        rc: i32,
        event: DirEvent,
    },
}

impl GuestCallback {
    pub fn cid(&self) -> ContextId {
        match self {
            GuestCallback::Reply { cid, .. }
            | GuestCallback::SessionNotify { cid, .. }
            | GuestCallback::ExecStatus { cid, .. }
            | GuestCallback::ExecOutput { cid, .. }
            | GuestCallback::ExecInputStatus { cid, .. }
            | GuestCallback::FileNotify { cid, .. }
            | GuestCallback::DirNotify { cid, .. } => *cid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_context_id_layout() {
        let cid = ContextId::new(3, 17, 42);
        assert_eq!(cid.session_id(), 3);
        assert_eq!(cid.object_id(), 17);
        assert_eq!(cid.count(), 42);
        assert_eq!(ContextId::from_raw(cid.as_u32()), cid);
    }

    #[test]
    fn test_context_id_masks_overflow() {
        let cid = ContextId::new(MAX_SESSIONS + 1, MAX_OBJECTS + 2, MAX_CONTEXTS + 3);
        assert_eq!(cid.session_id(), 1);
        assert_eq!(cid.object_id(), 2);
        assert_eq!(cid.count(), 3);
    }

    #[test]
    fn test_fs_obj_type_tags() {
        for t in [
            FsObjType::File,
            FsObjType::Directory,
            FsObjType::Symlink,
            FsObjType::Socket,
        ] {
            assert_eq!(FsObjType::from_tag(t.tag()), t);
        }
        assert_eq!(FsObjType::from_tag('x'), FsObjType::Unknown);
    }

    #[test]
    fn test_debug_hides_password() {
        let msg = HostMessage::SessionCreate {
            cid: ContextId::new(1, 1, 1),
            protocol: 2,
            user: "alice".into(),
            password: "hunter2".into(),
            domain: String::new(),
            flags: 0,
        };
        let text = format!("{:?}", msg);
        assert!(text.contains("alice"));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_callback_json_uses_raw_context_id() {
        let cid = ContextId::new(2, 5, 9);
        let callback = GuestCallback::SessionNotify {
            cid,
            kind: SessionNotifyType::Down,
            result: 0,
        };
        let value = serde_json::to_value(&callback).unwrap();
        assert_eq!(value["SessionNotify"]["cid"], serde_json::json!(cid.as_u32()));

        let back: GuestCallback = serde_json::from_value(value).unwrap();
        assert_eq!(back, callback);
    }

    proptest! {
        #[test]
        fn prop_exec_output_survives_json(
            raw in any::<u32>(),
            pid in 1u32..,
            data in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let callback = GuestCallback::ExecOutput {
                cid: ContextId::from_raw(raw),
                pid,
                handle: 1,
                flags: 0,
                data,
            };
            let text = serde_json::to_string(&callback).unwrap();
            let back: GuestCallback = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(back, callback);
        }

        #[test]
        fn prop_context_id_components_survive(
            session in 0u32..MAX_SESSIONS,
            object in 0u32..MAX_OBJECTS,
            count in 0u32..MAX_CONTEXTS,
        ) {
            let cid = ContextId::new(session, object, count);
            prop_assert_eq!(cid.session_id(), session);
            prop_assert_eq!(cid.object_id(), object);
            prop_assert_eq!(cid.count(), count);
        }
    }
}
