//! Error types shared by the session engine and guest-side implementations.
//!
//! Local failures (transport, timeouts, bookkeeping) and guest-reported
//! failures are kept apart: the latter always carry the in-guest result
//! code together with the operation kind and subject that produced it.

use std::fmt;
use thiserror::Error;

// ============================================================================
// Guest Result Codes
// ============================================================================

/// Numeric status code reported by the in-guest service.
///
/// Negative values are failures, zero and positive values are success
/// (positive values are informational).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct GuestRc(pub i32);

impl GuestRc {
    pub const SUCCESS: GuestRc = GuestRc(0);
    pub const NO_MEMORY: GuestRc = GuestRc(-8);
    pub const INVALID_PARAMETER: GuestRc = GuestRc(-2);
    pub const NOT_A_DIRECTORY: GuestRc = GuestRc(-20);
    pub const IS_A_DIRECTORY: GuestRc = GuestRc(-21);
    pub const NOT_A_FILE: GuestRc = GuestRc(-22);
    pub const IS_A_FILE: GuestRc = GuestRc(-23);
    pub const IS_A_SYMLINK: GuestRc = GuestRc(-24);
    pub const GENERAL_FAILURE: GuestRc = GuestRc(-35);
    pub const NOT_SUPPORTED: GuestRc = GuestRc(-37);
    pub const ACCESS_DENIED: GuestRc = GuestRc(-38);
    pub const INTERRUPTED: GuestRc = GuestRc(-39);
    pub const TIMEOUT: GuestRc = GuestRc(-40);
    pub const CANCELLED: GuestRc = GuestRc(-70);
    pub const NOT_FOUND: GuestRc = GuestRc(-78);
    pub const FILE_NOT_FOUND: GuestRc = GuestRc(-102);
    pub const PATH_NOT_FOUND: GuestRc = GuestRc(-103);
    pub const INVALID_NAME: GuestRc = GuestRc(-104);
    pub const ALREADY_EXISTS: GuestRc = GuestRc(-105);
    pub const TOO_MANY_OPEN_FILES: GuestRc = GuestRc(-106);
    pub const SHARING_VIOLATION: GuestRc = GuestRc(-108);
    pub const EOF: GuestRc = GuestRc(-110);
    pub const NET_PATH_NOT_FOUND: GuestRc = GuestRc(-112);
    pub const NO_MORE_FILES: GuestRc = GuestRc(-201);
    pub const INTERNAL_ERROR: GuestRc = GuestRc(-225);
    pub const BROKEN_PIPE: GuestRc = GuestRc(-301);
    pub const CANT_CREATE: GuestRc = GuestRc(-613);
    pub const AUTHENTICATION_FAILURE: GuestRc = GuestRc(-5100);
    pub const ACCOUNT_RESTRICTED: GuestRc = GuestRc(-5101);
    pub const MAX_OBJECTS_REACHED: GuestRc = GuestRc(-6306);
    pub const PROCESS_EXIT_CODE: GuestRc = GuestRc(-6307);

    pub fn is_success(&self) -> bool {
        self.0 >= 0
    }

    pub fn is_failure(&self) -> bool {
        self.0 < 0
    }

    /// Short description of the code, independent of the operation.
    pub fn describe(&self) -> &'static str {
        match *self {
            GuestRc::SUCCESS => "success",
            GuestRc::NO_MEMORY => "out of memory",
            GuestRc::INVALID_PARAMETER => "invalid parameter",
            GuestRc::NOT_A_DIRECTORY => "not a directory",
            GuestRc::IS_A_DIRECTORY => "is a directory",
            GuestRc::NOT_A_FILE => "not a file",
            GuestRc::IS_A_FILE => "is a file",
            GuestRc::IS_A_SYMLINK => "is a symbolic link",
            GuestRc::GENERAL_FAILURE => "general failure",
            GuestRc::NOT_SUPPORTED => "not supported",
            GuestRc::ACCESS_DENIED => "access denied",
            GuestRc::INTERRUPTED => "interrupted",
            GuestRc::TIMEOUT => "timed out",
            GuestRc::CANCELLED => "cancelled",
            GuestRc::NOT_FOUND => "not found",
            GuestRc::FILE_NOT_FOUND => "file not found",
            GuestRc::PATH_NOT_FOUND => "path not found",
            GuestRc::INVALID_NAME => "invalid name",
            GuestRc::ALREADY_EXISTS => "already exists",
            GuestRc::TOO_MANY_OPEN_FILES => "too many open files",
            GuestRc::SHARING_VIOLATION => "sharing violation",
            GuestRc::EOF => "end of file",
            GuestRc::NET_PATH_NOT_FOUND => "network path not found",
            GuestRc::NO_MORE_FILES => "no more files",
            GuestRc::INTERNAL_ERROR => "internal error",
            GuestRc::BROKEN_PIPE => "broken pipe",
            GuestRc::CANT_CREATE => "cannot create",
            GuestRc::AUTHENTICATION_FAILURE => "authentication failure",
            GuestRc::ACCOUNT_RESTRICTED => "account restricted",
            GuestRc::MAX_OBJECTS_REACHED => "maximum number of objects reached",
            GuestRc::PROCESS_EXIT_CODE => "process exited with failure code",
            GuestRc(code) if code >= 0 => "success",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for GuestRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(), self.0)
    }
}

impl From<i32> for GuestRc {
    fn from(code: i32) -> Self {
        GuestRc(code)
    }
}

// ============================================================================
// Guest-Reported Errors
// ============================================================================

/// Operation family a guest error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestErrorKind {
    Session,
    Process,
    File,
    Directory,
    Filesystem,
    Toolbox,
}

/// A failure reported by the in-guest service.
///
/// `subject` names the path, executable or session involved so the
/// rendered message always points at what failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestError {
    pub kind: GuestErrorKind,
    pub rc: GuestRc,
    pub subject: String,
}

impl GuestError {
    pub fn new(kind: GuestErrorKind, rc: impl Into<GuestRc>, subject: impl Into<String>) -> Self {
        Self {
            kind,
            rc: rc.into(),
            subject: subject.into(),
        }
    }

    /// Human-readable message for this error.
    pub fn message(&self) -> String {
        let what = self.subject.as_str();
        match (self.kind, self.rc) {
            (GuestErrorKind::Session, GuestRc::AUTHENTICATION_FAILURE) => {
                "The specified user was not able to logon on guest".to_string()
            }
            (GuestErrorKind::Session, GuestRc::ACCOUNT_RESTRICTED) => {
                "The specified user is not allowed to logon on guest".to_string()
            }
            (GuestErrorKind::Session, GuestRc::TIMEOUT) => {
                "The guest did not respond within time".to_string()
            }
            (GuestErrorKind::Session, GuestRc::CANCELLED) => {
                "The session operation was canceled".to_string()
            }
            (GuestErrorKind::Session, GuestRc::MAX_OBJECTS_REACHED) => {
                "Maximum number of concurrent guest sessions reached".to_string()
            }
            (GuestErrorKind::Session, GuestRc::NOT_FOUND) => {
                "The guest execution service is not ready (yet)".to_string()
            }
            (GuestErrorKind::Process, GuestRc::FILE_NOT_FOUND) => {
                format!("The specified file \"{what}\" was not found on guest")
            }
            (GuestErrorKind::Process, GuestRc::PATH_NOT_FOUND) => {
                format!("Could not resolve path to specified file \"{what}\" on guest")
            }
            (GuestErrorKind::Process, GuestRc::NOT_SUPPORTED) => {
                format!("The guest does not support starting \"{what}\" this way")
            }
            (GuestErrorKind::Process, GuestRc::TOO_MANY_OPEN_FILES) => {
                "Maximum number of concurrent guest processes has been reached".to_string()
            }
            (GuestErrorKind::Process, GuestRc::AUTHENTICATION_FAILURE) => {
                "The specified user was not able to logon on guest".to_string()
            }
            (GuestErrorKind::Process, GuestRc::TIMEOUT) => {
                format!("The guest did not respond within time while starting \"{what}\"")
            }
            (GuestErrorKind::File | GuestErrorKind::Filesystem, GuestRc::FILE_NOT_FOUND) => {
                format!("The guest file \"{what}\" was not found")
            }
            (GuestErrorKind::Directory | GuestErrorKind::Filesystem, GuestRc::PATH_NOT_FOUND) => {
                format!("Path \"{what}\" was not found on guest")
            }
            (GuestErrorKind::Directory, GuestRc::FILE_NOT_FOUND) => {
                format!("The guest directory \"{what}\" was not found")
            }
            (_, GuestRc::ACCESS_DENIED) => format!("Access to \"{what}\" was denied on guest"),
            (_, GuestRc::ALREADY_EXISTS) => format!("\"{what}\" already exists on guest"),
            (_, GuestRc::SHARING_VIOLATION) => {
                format!("\"{what}\" is in use by another process on guest")
            }
            (_, GuestRc::NOT_A_DIRECTORY) => format!("\"{what}\" is not a directory on guest"),
            (_, GuestRc::IS_A_DIRECTORY) => format!("\"{what}\" is a directory on guest"),
            (_, GuestRc::IS_A_FILE) => format!("\"{what}\" is a file on guest"),
            (_, GuestRc::NOT_A_FILE) => format!("\"{what}\" is not a regular file on guest"),
            (_, GuestRc::CANT_CREATE) => format!("\"{what}\" could not be created on guest"),
            (GuestErrorKind::Toolbox, rc) => {
                format!("Guest tool failed on \"{what}\": {rc}")
            }
            (_, rc) => format!("Unhandled error for \"{what}\": {rc}"),
        }
    }
}

impl fmt::Display for GuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message(), self.rc.0)
    }
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Coarse category of a [`GuestctlError`], suitable for a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    InvalidArgument = 1,
    InvalidState = 2,
    NotFound = 3,
    AlreadyExists = 4,
    Unsupported = 5,
    Timeout = 6,
    Cancelled = 7,
    ResourceExhausted = 8,
    Transport = 9,
    Guest = 10,
    Io = 11,
    Internal = 12,
}

impl ErrorCategory {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

#[derive(Debug, Error)]
pub enum GuestctlError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("maximum number of objects ({0}) reached")]
    MaxObjectsReached(u32),

    #[error("transport: {0}")]
    Transport(String),

    #[error("guest: {0}")]
    Guest(GuestError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Guest output could not be parsed.
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GuestctlError {
    pub fn guest(kind: GuestErrorKind, rc: impl Into<GuestRc>, subject: impl Into<String>) -> Self {
        GuestctlError::Guest(GuestError::new(kind, rc, subject))
    }

    pub fn timeout(what: impl fmt::Display) -> Self {
        GuestctlError::Timeout(what.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            GuestctlError::InvalidArgument(_) => ErrorCategory::InvalidArgument,
            GuestctlError::InvalidState(_) => ErrorCategory::InvalidState,
            GuestctlError::NotFound(_) => ErrorCategory::NotFound,
            GuestctlError::AlreadyExists(_) => ErrorCategory::AlreadyExists,
            GuestctlError::Unsupported(_) | GuestctlError::NotImplemented(_) => {
                ErrorCategory::Unsupported
            }
            GuestctlError::Timeout(_) => ErrorCategory::Timeout,
            GuestctlError::Cancelled => ErrorCategory::Cancelled,
            GuestctlError::MaxObjectsReached(_) => ErrorCategory::ResourceExhausted,
            GuestctlError::Transport(_) => ErrorCategory::Transport,
            GuestctlError::Guest(_) => ErrorCategory::Guest,
            GuestctlError::Io(_) | GuestctlError::Protocol(_) => ErrorCategory::Io,
            GuestctlError::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GuestctlError::Timeout(_))
    }

    /// Guest result code, if this error was reported by the guest.
    pub fn guest_rc(&self) -> Option<GuestRc> {
        match self {
            GuestctlError::Guest(e) => Some(e.rc),
            _ => None,
        }
    }

    /// True if the guest reported one of `codes`.
    pub fn is_guest_rc(&self, codes: &[GuestRc]) -> bool {
        self.guest_rc().is_some_and(|rc| codes.contains(&rc))
    }
}

pub type GuestctlResult<T> = Result<T, GuestctlError>;
