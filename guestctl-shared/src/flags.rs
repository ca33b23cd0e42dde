//! Flag sets carried inside host messages.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Process creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ProcessCreateFlags: u32 {
        /// Return as soon as the process was started.
        const WAIT_FOR_START_ONLY = 1 << 0;
        /// Keep orphaned child processes alive after exit.
        const IGNORE_ORPHANED = 1 << 1;
        /// Do not show a window for the process.
        const HIDDEN = 1 << 2;
        /// Load the user profile before running.
        const PROFILE = 1 << 3;
        /// Collect stdout for later reads.
        const WAIT_FOR_STDOUT = 1 << 4;
        /// Collect stderr for later reads.
        const WAIT_FOR_STDERR = 1 << 5;
        /// Expand environment variables in arguments.
        const EXPAND_ARGUMENTS = 1 << 6;
        /// Pass arguments without quoting.
        const UNQUOTED_ARGUMENTS = 1 << 7;
    }
}

bitflags! {
    /// Flags for a stdin write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ProcessInputFlags: u32 {
        /// Close stdin after this write.
        const END_OF_FILE = 1 << 0;
    }
}

bitflags! {
    /// Flags for a stdout/stderr read request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ProcessOutputFlags: u32 {
        const STDERR = 1 << 0;
    }
}

bitflags! {
    /// Flags for renaming a guest path.
    ///
    /// An empty set means "do not replace an existing destination".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PathRenameFlags: u32 {
        const REPLACE = 1 << 0;
        const NO_SYMLINKS = 1 << 1;
    }
}

bitflags! {
    /// Flags for removing a guest directory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DirectoryRemoveFlags: u32 {
        const RECURSIVE = 1 << 0;
        const CONTENT_AND_DIR = 1 << 1;
        const CONTENT_ONLY = 1 << 2;
    }
}

bitflags! {
    /// Flags for creating a guest directory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct DirectoryCreateFlags: u32 {
        const PARENTS = 1 << 0;
    }
}

bitflags! {
    /// Guest shutdown/reboot flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ShutdownFlags: u32 {
        const POWER_OFF = 1 << 0;
        const REBOOT = 1 << 1;
        const FORCE = 1 << 2;
    }
}

bitflags! {
    /// Optional features advertised by the in-guest service.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct GuestFeatures: u64 {
        const SHUTDOWN = 1 << 0;
        const PROCESS_ARGV0 = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_process_flag_bits_are_detectable() {
        let raw = ProcessCreateFlags::HIDDEN.bits() | (1 << 20);
        assert!(ProcessCreateFlags::from_bits(raw).is_none());
        assert_eq!(
            ProcessCreateFlags::from_bits_truncate(raw),
            ProcessCreateFlags::HIDDEN
        );
    }

    #[test]
    fn test_rename_default_is_no_replace() {
        assert!(!PathRenameFlags::default().contains(PathRenameFlags::REPLACE));
    }
}
