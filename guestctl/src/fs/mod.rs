//! Guest files, directories and host/guest copies.

pub(crate) mod copy;
pub mod directory;
pub mod file;
pub mod info;
pub mod list;
pub mod path;

pub use directory::{DirectoryOpenInfo, DirectoryStatus, GuestDirectory};
pub use file::{FileOpenInfo, FileStatus, GuestFile};
pub use info::FsObjData;
pub use list::{DirectoryCopyFlags, FileCopyFlags, FsEntry, FsList, FsSourceSpec};
pub use path::PathStyle;
