//! Filesystem and path operations of a session.
//!
//! Rename, remove, home lookups and shutdown have dedicated messages. Stat,
//! mkdir, rm and mktemp run guest tools.

use super::Session;
use crate::fs::copy;
use crate::fs::info::FsObjData;
use crate::fs::list::{DirectoryCopyFlags, FileCopyFlags, FsSourceSpec};
use crate::fs::path::PathStyle;
use crate::process::toolbox::ProcessTool;
use crate::progress::Progress;
use crate::session::wait::EventPayload;
use guestctl_shared::constants::toolbox;
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::flags::{
    DirectoryCreateFlags, DirectoryRemoveFlags, GuestFeatures, PathRenameFlags, ShutdownFlags,
};
use guestctl_shared::protocol::{ContextId, HostMessage};

/// Guest results meaning "nothing there" for existence checks.
const NOT_FOUND_CODES: &[GuestRc] = &[
    GuestRc::NOT_A_FILE,
    GuestRc::NOT_A_DIRECTORY,
    GuestRc::PATH_NOT_FOUND,
    GuestRc::FILE_NOT_FOUND,
    GuestRc::INVALID_NAME,
];

impl Session {
    fn require_path(path: &str, what: &str) -> GuestctlResult<()> {
        if path.is_empty() {
            return Err(GuestctlError::InvalidArgument(format!("No {} specified", what)));
        }
        Ok(())
    }

    pub async fn path_rename(
        &self,
        source: &str,
        dest: &str,
        flags: PathRenameFlags,
    ) -> GuestctlResult<()> {
        Self::require_path(source, "source")?;
        Self::require_path(dest, "destination")?;

        tracing::debug!(session_id = self.id(), source, dest, ?flags, "Renaming guest path");
        self.request(|cid| HostMessage::PathRename {
            cid,
            source: source.to_string(),
            dest: dest.to_string(),
            flags,
        })
        .await?
        .into_result(GuestErrorKind::Filesystem, source)?;
        Ok(())
    }

    async fn path_query(&self, build: fn(ContextId) -> HostMessage) -> GuestctlResult<String> {
        let signal = self
            .request(build)
            .await?
            .into_result(GuestErrorKind::Session, self.name())?;
        match signal.payload {
            EventPayload::Text(path) => Ok(path),
            other => Err(GuestctlError::Protocol(format!(
                "expected a path from the guest, got {:?}",
                other
            ))),
        }
    }

    /// Home directory of the session user.
    pub async fn path_user_home(&self) -> GuestctlResult<String> {
        self.path_query(|cid| HostMessage::PathUserHome { cid }).await
    }

    /// Documents directory of the session user.
    pub async fn path_user_documents(&self) -> GuestctlResult<String> {
        self.path_query(|cid| HostMessage::PathUserDocuments { cid }).await
    }

    /// Power off or reboot the guest.
    pub async fn shutdown(&self, flags: ShutdownFlags) -> GuestctlResult<()> {
        if !self.features().contains(GuestFeatures::SHUTDOWN) {
            return Err(GuestctlError::Unsupported(
                "Guest Additions do not support shutting down the guest".into(),
            ));
        }
        let action = flags & (ShutdownFlags::POWER_OFF | ShutdownFlags::REBOOT);
        if action != ShutdownFlags::POWER_OFF && action != ShutdownFlags::REBOOT {
            return Err(GuestctlError::InvalidArgument(
                "exactly one of power off and reboot must be given".into(),
            ));
        }

        tracing::info!(session_id = self.id(), ?flags, "Shutting down guest");
        self.request(|cid| HostMessage::Shutdown { cid, flags })
            .await?
            .into_result(GuestErrorKind::Session, self.name())?;
        Ok(())
    }

    pub async fn directory_remove(&self, path: &str, flags: DirectoryRemoveFlags) -> GuestctlResult<()> {
        Self::require_path(path, "directory to remove")?;
        tracing::debug!(session_id = self.id(), path, ?flags, "Removing guest directory");
        self.request(|cid| HostMessage::DirRemove {
            cid,
            path: path.to_string(),
            flags,
        })
        .await?
        .into_result(GuestErrorKind::Directory, path)?;
        Ok(())
    }

    /// Create a directory. A `mode` of zero leaves the guest default.
    pub async fn directory_create(
        &self,
        path: &str,
        mode: u32,
        flags: DirectoryCreateFlags,
    ) -> GuestctlResult<()> {
        Self::require_path(path, "directory to create")?;
        self.ensure_started()?;

        let mut tool = ProcessTool::new(toolbox::MKDIR, path);
        if flags.contains(DirectoryCreateFlags::PARENTS) {
            tool = tool.arg("--parents");
        }
        if mode != 0 {
            tool = tool.arg("--mode").arg(format!("{:o}", mode));
        }
        tool.arg("--")
            .arg(path)
            .run(self, self.options().request_timeout())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Stat a guest path. With `follow`, symlinks are resolved.
    pub async fn fs_query_info(&self, path: &str, follow: bool) -> GuestctlResult<FsObjData> {
        Self::require_path(path, "path")?;
        self.ensure_started()?;

        let mut tool = ProcessTool::new(toolbox::STAT, path).arg("--machinereadable");
        if follow {
            tool = tool.arg("-L");
        }
        let blocks = tool
            .arg("--")
            .arg(path)
            .run(self, self.options().request_timeout())
            .await?;
        let block = blocks.first().ok_or_else(|| {
            GuestctlError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("no stat output for \"{}\"", path),
            ))
        })?;
        FsObjData::from_stat_block(block)
    }

    async fn exists_as(
        &self,
        path: &str,
        follow: bool,
        check: fn(&FsObjData) -> bool,
    ) -> GuestctlResult<bool> {
        match self.fs_query_info(path, follow).await {
            Ok(info) => Ok(check(&info)),
            Err(e) if e.is_guest_rc(NOT_FOUND_CODES) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn fs_obj_exists(&self, path: &str, follow: bool) -> GuestctlResult<bool> {
        self.exists_as(path, follow, |_| true).await
    }

    pub async fn file_exists(&self, path: &str, follow: bool) -> GuestctlResult<bool> {
        self.exists_as(path, follow, FsObjData::is_file).await
    }

    pub async fn directory_exists(&self, path: &str, follow: bool) -> GuestctlResult<bool> {
        self.exists_as(path, follow, FsObjData::is_directory).await
    }

    /// Like [`Session::fs_query_info`], but the object must be a file.
    pub async fn file_query_info(&self, path: &str, follow: bool) -> GuestctlResult<FsObjData> {
        let info = self.fs_query_info(path, follow).await?;
        if !info.is_file() {
            return Err(GuestctlError::guest(GuestErrorKind::File, GuestRc::NOT_A_FILE, path));
        }
        Ok(info)
    }

    pub async fn file_query_size(&self, path: &str, follow: bool) -> GuestctlResult<u64> {
        Ok(self.file_query_info(path, follow).await?.size)
    }

    pub async fn file_remove(&self, path: &str) -> GuestctlResult<()> {
        Self::require_path(path, "file to remove")?;
        self.ensure_started()?;

        let blocks = ProcessTool::new(toolbox::RM, path)
            .arg("--machinereadable")
            .arg("--")
            .arg(path)
            .run(self, self.options().request_timeout())
            .await?;
        for block in &blocks {
            if let Some(rc) = block.rc().map(GuestRc) {
                if rc.is_failure() {
                    let subject = block.get("fname").unwrap_or(path);
                    return Err(GuestctlError::guest(GuestErrorKind::File, rc, subject));
                }
            }
        }
        Ok(())
    }

    /// Create a temporary file or directory from `template` (`XXX` marks
    /// the random part) and return its path.
    ///
    /// `secure` restricts access to the owner and ignores `mode`.
    pub async fn fs_create_temp(
        &self,
        template: &str,
        mode: u32,
        temp_dir: Option<&str>,
        directory: bool,
        secure: bool,
    ) -> GuestctlResult<String> {
        Self::require_path(template, "template")?;
        self.ensure_started()?;

        let mut tool = ProcessTool::new(toolbox::MKTEMP, template).arg("--machinereadable");
        if directory {
            tool = tool.arg("-d");
        }
        if let Some(dir) = temp_dir.filter(|d| !d.is_empty()) {
            tool = tool.arg("-t").arg(dir);
        }
        tool = if secure {
            tool.arg("--secure")
        } else {
            tool.arg("--mode").arg(format!("{:o}", mode))
        };
        let blocks = tool
            .arg("--")
            .arg(template)
            .run(self, self.options().request_timeout())
            .await?;

        let block = blocks.first().ok_or_else(|| {
            GuestctlError::Protocol(format!("no temporary name created from \"{}\"", template))
        })?;
        if let Some(rc) = block.rc().map(GuestRc) {
            if rc.is_failure() {
                return Err(GuestctlError::guest(GuestErrorKind::Filesystem, rc, template));
            }
        }
        block
            .get("name")
            .map(str::to_string)
            .ok_or_else(|| GuestctlError::Protocol("temporary name missing in guest output".into()))
    }

    // ------------------------------------------------------------------------
    // Copy
    // ------------------------------------------------------------------------

    /// Copy guest files or directory trees to the host.
    pub async fn copy_from_guest(&self, sources: Vec<FsSourceSpec>, dest: &str) -> GuestctlResult<Progress> {
        copy::copy_from_guest(self, sources, dest).await
    }

    /// Copy host files or directory trees into the guest.
    pub async fn copy_to_guest(&self, sources: Vec<FsSourceSpec>, dest: &str) -> GuestctlResult<Progress> {
        copy::copy_to_guest(self, sources, dest).await
    }

    pub async fn file_copy_from_guest(
        &self,
        source: &str,
        dest: &str,
        flags: FileCopyFlags,
    ) -> GuestctlResult<Progress> {
        let spec = FsSourceSpec::file(source, self.path_style()).file_flags(flags);
        self.copy_from_guest(vec![spec], dest).await
    }

    pub async fn file_copy_to_guest(
        &self,
        source: &str,
        dest: &str,
        flags: FileCopyFlags,
    ) -> GuestctlResult<Progress> {
        let spec = FsSourceSpec::file(source, PathStyle::native()).file_flags(flags);
        self.copy_to_guest(vec![spec], dest).await
    }

    pub async fn directory_copy_from_guest(
        &self,
        source: &str,
        dest: &str,
        flags: DirectoryCopyFlags,
    ) -> GuestctlResult<Progress> {
        let spec = FsSourceSpec::directory(source, self.path_style()).directory_flags(flags);
        self.copy_from_guest(vec![spec], dest).await
    }

    pub async fn directory_copy_to_guest(
        &self,
        source: &str,
        dest: &str,
        flags: DirectoryCopyFlags,
    ) -> GuestctlResult<Progress> {
        let spec = FsSourceSpec::directory(source, PathStyle::native()).directory_flags(flags);
        self.copy_to_guest(vec![spec], dest).await
    }
}
