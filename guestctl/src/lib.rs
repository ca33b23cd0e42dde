//! Guest control from the host side.
//!
//! A [`Guest`] talks to the Guest Additions of one running VM through a
//! [`GuestChannel`]. Sessions opened on it run processes, access files and
//! directories, and copy whole trees between host and guest. Guest
//! callbacks are fed back in through [`Guest::dispatch`].

pub mod channel;
pub mod config;
pub mod fs;
pub mod guest;
pub mod logging;
pub mod process;
pub mod progress;
pub mod session;

pub use channel::GuestChannel;
pub use config::{CloseRetryOptions, GuestctlOptions, LogOptions};
pub use fs::{
    DirectoryCopyFlags, DirectoryOpenInfo, FileCopyFlags, FileOpenInfo, FsObjData, FsSourceSpec, GuestDirectory,
    GuestFile, PathStyle,
};
pub use guest::{AdditionsUpdateFlags, AdditionsVersion, Guest, GuestOsType};
pub use logging::init_logging;
pub use process::{GuestProcess, ProcessStartupInfo, ProcessStatus, ProcessWaitFlags, ProcessWaitResult};
pub use progress::{Progress, ProgressFailure, ProgressState};
pub use session::{Session, SessionCredentials, SessionEvent, SessionStatus, SessionWaitFlags, SessionWaitResult};

pub use guestctl_shared::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
