//! Shared constants between host and guest
//!
//! These constants must be identical on both sides of the host-guest boundary.

/// Protocol versions negotiated from the reported Guest Additions version.
pub mod protocol {
    /// Legacy guests: no dedicated session concept.
    pub const VERSION_LEGACY: u32 = 1;

    /// Dedicated guest sessions with create/close/status messages.
    pub const VERSION_SESSIONS: u32 = 2;

    /// First Guest Additions version speaking [`VERSION_SESSIONS`].
    pub const SESSIONS_MIN_ADDITIONS: (u32, u32, u32) = (4, 3, 0);
}

/// Context ID layout and the limits it implies.
///
/// ```text
///  31      27 26             16 15                    0
/// +----------+-----------------+-----------------------+
/// | session  |     object      |         count         |
/// +----------+-----------------+-----------------------+
/// ```
pub mod context {
    pub const SESSION_BITS: u32 = 5;
    pub const OBJECT_BITS: u32 = 11;
    pub const COUNT_BITS: u32 = 16;

    /// Sessions per guest connection.
    pub const MAX_SESSIONS: u32 = 1 << SESSION_BITS;

    /// Object IDs per session. ID 0 and `MAX_OBJECTS - 1` are reserved.
    pub const MAX_OBJECTS: u32 = 1 << OBJECT_BITS;

    /// Distinct sequence numbers per object before wrapping.
    pub const MAX_CONTEXTS: u32 = 1 << COUNT_BITS;
}

/// Default timeouts, in milliseconds.
pub mod timeouts {
    /// Default budget for a single guest request/reply round-trip.
    pub const DEFAULT_MS: u64 = 30 * 1000;

    /// Budget for the session-start handshake.
    pub const SESSION_START_MS: u64 = 30 * 1000;

    /// First session-close attempt.
    pub const SESSION_CLOSE_BASE_MS: u64 = 10 * 1000;

    /// Added per session-close retry.
    pub const SESSION_CLOSE_STEP_MS: u64 = 5 * 1000;

    /// Session-close attempts on local timeout.
    pub const SESSION_CLOSE_ATTEMPTS: u32 = 3;

    /// Marker for "no timeout" in process startup info.
    pub const INFINITE_MS: u32 = u32::MAX;

    /// Installer run budget during an additions update.
    pub const ADDITIONS_INSTALLER_MS: u32 = 5 * 60 * 1000;
}

/// Data transfer sizes.
pub mod transfer {
    /// Chunk size for file copies and toolbox output reads.
    pub const CHUNK_SIZE: usize = 64 * 1024;
}

/// Process output handles.
pub mod handles {
    pub const STDIN: u32 = 0;
    pub const STDOUT: u32 = 1;
    pub const STDERR: u32 = 2;
}

/// Built-in guest helper tools used where no dedicated message exists.
pub mod toolbox {
    pub const CAT: &str = "vbox_cat";
    pub const LS: &str = "vbox_ls";
    pub const MKDIR: &str = "vbox_mkdir";
    pub const MKTEMP: &str = "vbox_mktemp";
    pub const RM: &str = "vbox_rm";
    pub const STAT: &str = "vbox_stat";

    /// Tool exit codes beyond the generic success/failure/syntax trio.
    pub mod exit {
        pub const SUCCESS: i32 = 0;
        pub const FAILURE: i32 = 1;
        pub const SYNTAX: i32 = 2;
        pub const ACCESS_DENIED: i32 = 3;
        pub const FILE_NOT_FOUND: i32 = 4;
        pub const PATH_NOT_FOUND: i32 = 5;
        pub const NET_PATH_NOT_FOUND: i32 = 6;
        pub const SHARING_VIOLATION: i32 = 7;
        pub const IS_A_DIRECTORY: i32 = 8;
    }
}

/// Guest property names published by the Guest Additions.
pub mod properties {
    pub const ADDITIONS_VERSION: &str = "/VirtualBox/GuestAdd/Version";
    pub const ADDITIONS_INSTALL_DIR: &str = "/VirtualBox/GuestAdd/InstallDir";
    pub const OS_PRODUCT: &str = "/VirtualBox/GuestInfo/OS/Product";
    pub const OS_RELEASE: &str = "/VirtualBox/GuestInfo/OS/Release";
}
