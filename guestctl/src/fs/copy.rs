//! Copy engine between host and guest.
//!
//! Sources are enumerated up front, on the caller's task, so that invalid
//! sources fail the call itself. Replay then runs in the background and
//! reports through the returned [`Progress`].

use crate::fs::file::{FileOpenInfo, GuestFile};
use crate::fs::info::FsObjData;
use crate::fs::list::{DirectoryCopyFlags, FileCopyFlags, FsEntry, FsList, FsSourceSpec};
use crate::fs::path::PathStyle;
use crate::progress::Progress;
use crate::session::Session;
use chrono::{DateTime, Utc};
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::flags::DirectoryCreateFlags;
use guestctl_shared::protocol::{FileAccessMode, FileOpenAction, FileSharingMode, FsObjType};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    FromGuest,
    ToGuest,
}

impl Direction {
    fn target(&self) -> &'static str {
        match self {
            Direction::FromGuest => "host",
            Direction::ToGuest => "guest",
        }
    }
}

/// What happened to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Copied(u64),
    Skipped,
}

/// What the destination already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Existing {
    Nothing,
    File(Option<DateTime<Utc>>),
    Directory,
    Other,
}

pub(crate) async fn copy_from_guest(
    session: &Session,
    sources: Vec<FsSourceSpec>,
    dest: &str,
) -> GuestctlResult<Progress> {
    start(session, Direction::FromGuest, sources, dest).await
}

pub(crate) async fn copy_to_guest(
    session: &Session,
    sources: Vec<FsSourceSpec>,
    dest: &str,
) -> GuestctlResult<Progress> {
    start(session, Direction::ToGuest, sources, dest).await
}

async fn start(
    session: &Session,
    direction: Direction,
    sources: Vec<FsSourceSpec>,
    dest: &str,
) -> GuestctlResult<Progress> {
    session.ensure_started()?;
    if sources.is_empty() {
        return Err(GuestctlError::InvalidArgument("No sources specified".into()));
    }
    if dest.is_empty() {
        return Err(GuestctlError::InvalidArgument("No destination specified".into()));
    }

    let mut lists = Vec::with_capacity(sources.len());
    for spec in sources {
        if spec.source.is_empty() {
            return Err(GuestctlError::InvalidArgument("Empty source specified".into()));
        }
        let list = match direction {
            Direction::FromGuest => FsList::from_guest(session, spec).await?,
            Direction::ToGuest => {
                tokio::task::spawn_blocking(move || FsList::from_host(spec))
                    .await
                    .map_err(|e| GuestctlError::Internal(e.to_string()))??
            }
        };
        lists.push(list);
    }

    let description = match lists.as_slice() {
        [single] if !single.spec.is_directory() => format!(
            "Copying \"{}\" to \"{}\" on {}",
            single.root,
            dest,
            direction.target()
        ),
        [single] => format!(
            "Copying \"{}\" ({} entries) to \"{}\" on {}",
            single.root,
            single.entries.len(),
            dest,
            direction.target()
        ),
        many => format!(
            "Copying {} sources to \"{}\" on {}",
            many.len(),
            dest,
            direction.target()
        ),
    };
    tracing::info!(session_id = session.id(), %description, "Starting copy");

    // One operation per copied entry, plus the preparation step.
    let operations: usize = lists
        .iter()
        .map(|list| if list.spec.is_directory() { list.entries.len() } else { 1 })
        .sum::<usize>()
        + 1;
    let operations = u32::try_from(operations).unwrap_or(u32::MAX);
    let progress = Progress::new(description, operations, "Preparing copy");
    let task = CopyTask {
        session: session.clone(),
        direction,
        dest: dest.to_string(),
        progress: progress.clone(),
        chunk_size: session.options().copy_chunk_size.max(1),
    };
    progress.run_in_background(async move { task.run(lists).await });
    Ok(progress)
}

struct CopyTask {
    session: Session,
    direction: Direction,
    dest: String,
    progress: Progress,
    chunk_size: usize,
}

impl CopyTask {
    fn source_style(&self, list: &FsList) -> PathStyle {
        list.spec.path_style
    }

    fn dest_style(&self) -> PathStyle {
        match self.direction {
            Direction::FromGuest => PathStyle::native(),
            Direction::ToGuest => self.session.path_style(),
        }
    }

    async fn run(self, lists: Vec<FsList>) -> GuestctlResult<()> {
        for list in &lists {
            let result = if list.spec.is_directory() {
                self.copy_tree(list).await
            } else {
                let dest_root = self.dest_root(list);
                match self.progress.set_next_operation(format!("Copying \"{}\"", list.root)) {
                    Ok(()) => self
                        .copy_file(&list.root, &dest_root, list.spec.file_flags, list.spec.dry_run)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(()) => {}
                // Aborted by the user: stop quietly.
                Err(GuestctlError::Cancelled) => {
                    tracing::info!(session_id = self.session.id(), "Copy cancelled");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(source = %list.root, error = %e, "Copy failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Destination for a source root. A destination ending in a separator
    /// names the directory to copy into.
    fn dest_root(&self, list: &FsList) -> String {
        let dest_style = self.dest_style();
        let src_style = self.source_style(list);
        if dest_style.ends_with_separator(&self.dest) {
            dest_style.join(&self.dest, src_style.file_name(&list.root))
        } else {
            self.dest.clone()
        }
    }

    async fn copy_tree(&self, list: &FsList) -> GuestctlResult<()> {
        let src_style = self.source_style(list);
        let dest_style = self.dest_style();
        let dest_root = self.dest_root(list);
        let flags = list.spec.dir_flags;
        let dry_run = list.spec.dry_run;

        match self.query_dest(&dest_root).await? {
            Existing::Directory if flags.contains(DirectoryCopyFlags::COPY_INTO_EXISTING) => {}
            Existing::Directory => {
                return Err(GuestctlError::AlreadyExists(format!(
                    "Destination directory \"{}\" exists",
                    dest_root
                )));
            }
            Existing::File(_) | Existing::Other => {
                return Err(self.is_a_file(&dest_root));
            }
            Existing::Nothing => {
                if !dry_run {
                    self.create_dir(&dest_root, 0o700).await?;
                }
            }
        }

        for entry in &list.entries {
            let src = src_style.join(&list.root, &entry.path);
            let dst = dest_style.join(&dest_root, &dest_style.translate(&entry.path, src_style));
            self.progress.set_next_operation(format!("Copying \"{}\"", src))?;
            self.replay_entry(entry, &src, &dst, list, dry_run).await?;
            self.progress.set_progress(100)?;
        }
        Ok(())
    }

    async fn replay_entry(
        &self,
        entry: &FsEntry,
        src: &str,
        dst: &str,
        list: &FsList,
        dry_run: bool,
    ) -> GuestctlResult<()> {
        match entry.obj_type {
            FsObjType::Directory => {
                tracing::trace!(src, dst, "Replaying directory entry");
                match self.query_dest(dst).await? {
                    Existing::Nothing => {
                        if !dry_run {
                            self.create_dir(dst, entry.mode).await?;
                        }
                        Ok(())
                    }
                    Existing::Directory
                        if list.spec.dir_flags.contains(DirectoryCopyFlags::COPY_INTO_EXISTING) =>
                    {
                        Ok(())
                    }
                    Existing::Directory => Err(GuestctlError::AlreadyExists(format!(
                        "Destination directory \"{}\" exists",
                        dst
                    ))),
                    Existing::File(_) | Existing::Other => Err(self.is_a_file(dst)),
                }
            }
            FsObjType::File => {
                // Files inside a tree are always followed as enumerated.
                let flags = list.spec.file_flags | FileCopyFlags::FOLLOW_LINKS;
                if let FileOutcome::Copied(bytes) = self.copy_file(src, dst, flags, dry_run).await? {
                    tracing::trace!(src, dst, bytes, "Copied tree file");
                }
                Ok(())
            }
            other => {
                tracing::debug!(src, ?other, "Skipping entry of unsupported type");
                Ok(())
            }
        }
    }

    fn is_a_file(&self, path: &str) -> GuestctlError {
        match self.direction {
            Direction::FromGuest => {
                GuestctlError::InvalidArgument(format!("Destination \"{}\" is a file", path))
            }
            Direction::ToGuest => {
                GuestctlError::guest(GuestErrorKind::Directory, GuestRc::IS_A_FILE, path)
            }
        }
    }

    fn is_a_directory(&self, path: &str) -> GuestctlError {
        match self.direction {
            Direction::FromGuest => GuestctlError::Io(std::io::Error::new(
                ErrorKind::IsADirectory,
                format!("Destination \"{}\" is a directory", path),
            )),
            Direction::ToGuest => {
                GuestctlError::guest(GuestErrorKind::File, GuestRc::IS_A_DIRECTORY, path)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Destination Side
    // ------------------------------------------------------------------------

    async fn query_dest(&self, path: &str) -> GuestctlResult<Existing> {
        match self.direction {
            Direction::FromGuest => match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_dir() => Ok(Existing::Directory),
                Ok(meta) if meta.is_file() => {
                    Ok(Existing::File(meta.modified().ok().map(DateTime::<Utc>::from)))
                }
                Ok(_) => Ok(Existing::Other),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(Existing::Nothing),
                Err(e) => Err(e.into()),
            },
            Direction::ToGuest => match self.session.fs_query_info(path, true).await {
                Ok(info) if info.is_directory() => Ok(Existing::Directory),
                Ok(info) if info.is_file() => Ok(Existing::File(Some(info.modification_time))),
                Ok(_) => Ok(Existing::Other),
                Err(e)
                    if e.is_guest_rc(&[
                        GuestRc::FILE_NOT_FOUND,
                        GuestRc::PATH_NOT_FOUND,
                        GuestRc::NOT_A_DIRECTORY,
                    ]) =>
                {
                    Ok(Existing::Nothing)
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn create_dir(&self, path: &str, mode: u32) -> GuestctlResult<()> {
        tracing::debug!(path, mode = format_args!("{:o}", mode), "Creating destination directory");
        match self.direction {
            Direction::FromGuest => {
                tokio::fs::create_dir_all(path).await?;
                #[cfg(unix)]
                if mode != 0 {
                    use std::os::unix::fs::PermissionsExt;
                    // Owner keeps full access so the tree can be filled.
                    let perms = std::fs::Permissions::from_mode((mode | 0o700) & 0o7777);
                    tokio::fs::set_permissions(path, perms).await?;
                }
                Ok(())
            }
            Direction::ToGuest => {
                self.session
                    .directory_create(path, mode | 0o700, DirectoryCreateFlags::PARENTS)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------------

    /// Size, mode and modification time of a source file.
    async fn source_info(
        &self,
        src: &str,
        flags: FileCopyFlags,
    ) -> GuestctlResult<(u64, u32, Option<DateTime<Utc>>)> {
        let follow = flags.contains(FileCopyFlags::FOLLOW_LINKS);
        match self.direction {
            Direction::FromGuest => {
                let info: FsObjData = self.session.file_query_info(src, follow).await?;
                Ok((info.size, info.mode, Some(info.modification_time)))
            }
            Direction::ToGuest => {
                let meta = if follow {
                    tokio::fs::metadata(src).await?
                } else {
                    tokio::fs::symlink_metadata(src).await?
                };
                if !meta.is_file() {
                    return Err(GuestctlError::InvalidArgument(format!(
                        "Source \"{}\" is not a regular file",
                        src
                    )));
                }
                let info = FsObjData::from_metadata(src, &meta);
                Ok((meta.len(), info.mode, Some(info.modification_time)))
            }
        }
    }

    async fn copy_file(
        &self,
        src: &str,
        dst: &str,
        flags: FileCopyFlags,
        dry_run: bool,
    ) -> GuestctlResult<FileOutcome> {
        let (size, mode, src_mtime) = self.source_info(src, flags).await?;

        match self.query_dest(dst).await? {
            Existing::Directory => return Err(self.is_a_directory(dst)),
            Existing::File(_) if flags.contains(FileCopyFlags::NO_REPLACE) => {
                tracing::info!(dst, "Destination file exists, skipping");
                self.progress.set_progress(100)?;
                return Ok(FileOutcome::Skipped);
            }
            Existing::File(Some(dst_mtime)) if flags.contains(FileCopyFlags::UPDATE) => {
                if src_mtime.is_some_and(|src_mtime| dst_mtime >= src_mtime) {
                    tracing::info!(dst, "Destination file exists and is newer, skipping");
                    self.progress.set_progress(100)?;
                    return Ok(FileOutcome::Skipped);
                }
            }
            _ => {}
        }
        if dry_run {
            self.progress.set_progress(100)?;
            return Ok(FileOutcome::Skipped);
        }

        tracing::debug!(src, dst, size, "Copying file");
        self.progress.set_progress(0)?;
        let written = match self.direction {
            Direction::FromGuest => self.file_from_guest(src, dst, size).await?,
            Direction::ToGuest => self.file_to_guest(src, dst, size, mode).await?,
        };

        match written {
            Some(written) => {
                check_written(src, written, size)?;
                Ok(FileOutcome::Copied(written))
            }
            None => Err(GuestctlError::Cancelled),
        }
    }

    fn report(&self, written: u64, size: u64) -> GuestctlResult<()> {
        let percent = if size == 0 { 100 } else { written.saturating_mul(100) / size };
        self.progress.set_progress(percent.min(100) as u32)
    }

    async fn file_from_guest(&self, src: &str, dst: &str, size: u64) -> GuestctlResult<Option<u64>> {
        let file = self
            .session
            .file_open(FileOpenInfo::new(src, FileAccessMode::ReadOnly, FileOpenAction::OpenExisting))
            .await?;
        let result = self.pump_from_guest(&file, dst, size).await;
        close_quietly(&file).await;
        result
    }

    /// Bytes written, `None` when cancelled.
    async fn pump_from_guest(&self, file: &GuestFile, dst: &str, size: u64) -> GuestctlResult<Option<u64>> {
        let timeout = self.session.options().request_timeout();
        let chunk = u32::try_from(self.chunk_size).unwrap_or(u32::MAX);
        let mut out = tokio::fs::File::create(dst).await?;
        let result = self.read_chunks(file, &mut out, chunk, size, timeout).await;
        if !matches!(result, Ok(Some(written)) if written >= size) {
            drop(out);
            if let Err(e) = tokio::fs::remove_file(dst).await {
                tracing::debug!(dst, error = %e, "Removing partial destination file failed");
            }
        }
        result
    }

    async fn read_chunks(
        &self,
        file: &GuestFile,
        out: &mut tokio::fs::File,
        chunk: u32,
        size: u64,
        timeout: Duration,
    ) -> GuestctlResult<Option<u64>> {
        let mut written = 0u64;
        while written < size {
            let data = file.read(chunk, timeout).await?;
            if data.is_empty() {
                break;
            }
            out.write_all(&data).await?;
            written += data.len() as u64;
            match self.report(written, size) {
                Err(GuestctlError::Cancelled) => return Ok(None),
                other => other?,
            }
        }
        out.flush().await?;
        Ok(Some(written))
    }

    async fn file_to_guest(&self, src: &str, dst: &str, size: u64, mode: u32) -> GuestctlResult<Option<u64>> {
        let mut input = tokio::fs::File::open(Path::new(src)).await?;
        let file = self
            .session
            .file_open(
                FileOpenInfo::new(dst, FileAccessMode::WriteOnly, FileOpenAction::CreateOrReplace)
                    .sharing(FileSharingMode::All)
                    .creation_mode(if mode == 0 { 0o644 } else { mode }),
            )
            .await?;
        let result = self.pump_to_guest(&mut input, &file, size).await;
        close_quietly(&file).await;
        result
    }

    /// Bytes written, `None` when cancelled.
    async fn pump_to_guest(
        &self,
        input: &mut tokio::fs::File,
        file: &GuestFile,
        size: u64,
    ) -> GuestctlResult<Option<u64>> {
        let timeout = self.session.options().request_timeout();
        let mut buf = vec![0u8; self.chunk_size];
        let mut written = 0u64;

        'copy: while written < size {
            let read = input.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            let mut pending = &buf[..read];
            while !pending.is_empty() {
                let n = file.write(pending, timeout).await? as usize;
                if n == 0 {
                    break 'copy;
                }
                written += n as u64;
                pending = &pending[n.min(pending.len())..];
            }
            match self.report(written, size) {
                Err(GuestctlError::Cancelled) => return Ok(None),
                other => other?,
            }
        }
        Ok(Some(written))
    }
}

async fn close_quietly(file: &GuestFile) {
    if let Err(e) = file.close().await {
        tracing::debug!(path = file.path(), error = %e, "Closing copied guest file failed");
    }
}

/// Nothing written usually means no permission, a shortfall an interrupted
/// transfer.
fn check_written(src: &str, written: u64, size: u64) -> GuestctlResult<()> {
    if size > 0 && written == 0 {
        return Err(GuestctlError::guest(GuestErrorKind::File, GuestRc::ACCESS_DENIED, src));
    }
    if written < size {
        tracing::warn!(src, written, size, "Short copy");
        return Err(GuestctlError::guest(GuestErrorKind::File, GuestRc::INTERRUPTED, src));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_classification() {
        assert!(check_written("/a", 10, 10).is_ok());
        assert!(check_written("/a", 0, 0).is_ok());
        assert_eq!(
            check_written("/a", 0, 10).unwrap_err().guest_rc(),
            Some(GuestRc::ACCESS_DENIED)
        );
        assert_eq!(
            check_written("/a", 4, 10).unwrap_err().guest_rc(),
            Some(GuestRc::INTERRUPTED)
        );
    }

    #[test]
    fn test_direction_target_names() {
        assert_eq!(Direction::FromGuest.target(), "host");
        assert_eq!(Direction::ToGuest.target(), "guest");
    }
}
