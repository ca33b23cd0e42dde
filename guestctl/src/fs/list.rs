//! Source enumeration for copy operations.
//!
//! A directory source becomes an [`FsList`]: its root plus every entry
//! below it, relative to the root, in the order replay must create them
//! (a directory always precedes its contents). A file source is its own
//! root and has no entries.

use crate::fs::directory::DirectoryOpenInfo;
use crate::fs::path::PathStyle;
use crate::session::Session;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::protocol::FsObjType;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

bitflags! {
    /// How single files are copied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileCopyFlags: u32 {
        /// Leave existing destination files alone.
        const NO_REPLACE = 1 << 0;
        /// Copy the target of a symlink instead of skipping it.
        const FOLLOW_LINKS = 1 << 1;
        /// Only copy when the source is newer than the destination.
        const UPDATE = 1 << 2;
    }
}

bitflags! {
    /// How directory trees are copied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DirectoryCopyFlags: u32 {
        const RECURSIVE = 1 << 0;
        /// Descend into symlinked directories.
        const FOLLOW_LINKS = 1 << 1;
        /// Accept an already existing destination directory.
        const COPY_INTO_EXISTING = 1 << 2;
    }
}

/// One copy source.
#[derive(Debug, Clone)]
pub struct FsSourceSpec {
    pub source: String,
    /// Name pattern (`*`, `?`) applied to files. Empty matches everything.
    pub filter: String,
    /// [`FsObjType::File`] or [`FsObjType::Directory`].
    pub obj_type: FsObjType,
    /// Path style of `source`.
    pub path_style: PathStyle,
    pub dir_flags: DirectoryCopyFlags,
    pub file_flags: FileCopyFlags,
    /// Walk and check, but do not create or write anything.
    pub dry_run: bool,
}

impl FsSourceSpec {
    pub fn file(source: impl Into<String>, path_style: PathStyle) -> Self {
        Self::new(source.into(), FsObjType::File, path_style)
    }

    pub fn directory(source: impl Into<String>, path_style: PathStyle) -> Self {
        Self::new(source.into(), FsObjType::Directory, path_style)
    }

    fn new(source: String, obj_type: FsObjType, path_style: PathStyle) -> Self {
        Self {
            source,
            filter: String::new(),
            obj_type,
            path_style,
            dir_flags: DirectoryCopyFlags::empty(),
            file_flags: FileCopyFlags::empty(),
            dry_run: false,
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn directory_flags(mut self, flags: DirectoryCopyFlags) -> Self {
        self.dir_flags = flags;
        self
    }

    pub fn file_flags(mut self, flags: FileCopyFlags) -> Self {
        self.file_flags = flags;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_directory(&self) -> bool {
        self.obj_type == FsObjType::Directory
    }
}

/// An enumerated object below a source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Path relative to the root, in the source's path style.
    pub path: String,
    pub obj_type: FsObjType,
    pub mode: u32,
    pub size: u64,
    pub modification_time: Option<DateTime<Utc>>,
}

/// An enumerated source.
#[derive(Debug, Clone)]
pub struct FsList {
    pub root: String,
    pub spec: FsSourceSpec,
    /// Empty for file sources and for empty directories.
    pub entries: Vec<FsEntry>,
}

impl FsList {
    /// Total bytes of all file entries.
    pub fn total_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.obj_type == FsObjType::File)
            .map(|e| e.size)
            .sum()
    }

    /// Enumerate a host source.
    pub fn from_host(spec: FsSourceSpec) -> GuestctlResult<Self> {
        let root = spec.source.clone();
        let root_path = Path::new(&root);
        let meta = std::fs::symlink_metadata(root_path)?;

        if !spec.is_directory() {
            let resolved = if meta.file_type().is_symlink() {
                if !spec.file_flags.contains(FileCopyFlags::FOLLOW_LINKS) {
                    return Err(GuestctlError::InvalidArgument(format!(
                        "\"{}\" is a symbolic link",
                        root
                    )));
                }
                std::fs::metadata(root_path)?
            } else {
                meta
            };
            if resolved.is_dir() {
                return Err(GuestctlError::Io(std::io::Error::new(
                    std::io::ErrorKind::IsADirectory,
                    format!("\"{}\" is a directory", root),
                )));
            }
            return Ok(Self {
                root,
                spec,
                entries: Vec::new(),
            });
        }

        if meta.file_type().is_symlink() && !spec.dir_flags.contains(DirectoryCopyFlags::FOLLOW_LINKS) {
            return Err(GuestctlError::InvalidArgument(format!(
                "\"{}\" is a symbolic link",
                root
            )));
        }
        if !std::fs::metadata(root_path)?.is_dir() {
            return Err(GuestctlError::InvalidArgument(format!("\"{}\" is a file", root)));
        }

        let entries = walk_host(root_path, &spec)?;
        tracing::debug!(root = %root, count = entries.len(), "Enumerated host directory");
        Ok(Self { root, spec, entries })
    }

    /// Enumerate a guest source through `session`.
    pub async fn from_guest(session: &Session, spec: FsSourceSpec) -> GuestctlResult<Self> {
        let root = spec.source.clone();
        let follow = if spec.is_directory() {
            spec.dir_flags.contains(DirectoryCopyFlags::FOLLOW_LINKS)
        } else {
            spec.file_flags.contains(FileCopyFlags::FOLLOW_LINKS)
        };
        let info = session.fs_query_info(&root, follow).await?;

        if !spec.is_directory() {
            if info.is_directory() {
                return Err(GuestctlError::guest(
                    GuestErrorKind::File,
                    GuestRc::IS_A_DIRECTORY,
                    root,
                ));
            }
            return Ok(Self {
                root,
                spec,
                entries: Vec::new(),
            });
        }
        if info.is_symlink() {
            return Err(GuestctlError::guest(
                GuestErrorKind::Directory,
                GuestRc::IS_A_SYMLINK,
                root,
            ));
        }
        if !info.is_directory() {
            return Err(GuestctlError::guest(GuestErrorKind::Directory, GuestRc::IS_A_FILE, root));
        }

        let entries = walk_guest(session, &root, &spec).await?;
        tracing::debug!(root = %root, count = entries.len(), "Enumerated guest directory");
        Ok(Self { root, spec, entries })
    }
}

/// Shell-style name match supporting `*` and `?`.
pub fn matches_filter(filter: &str, name: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    let pattern: Vec<char> = filter.chars().collect();
    let text: Vec<char> = name.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    p = bp + 1;
                    t = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

fn modification_time(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

fn host_mode(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if meta.permissions().readonly() { 0o444 } else { 0o644 }
    }
}

fn walk_host(root: &Path, spec: &FsSourceSpec) -> GuestctlResult<Vec<FsEntry>> {
    let style = spec.path_style;
    let recursive = spec.dir_flags.contains(DirectoryCopyFlags::RECURSIVE);
    let mut entries = Vec::new();
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut pending: VecDeque<(PathBuf, String)> = VecDeque::new();

    if let Ok(canonical) = root.canonicalize() {
        visited.insert(canonical);
    }
    pending.push_back((root.to_path_buf(), String::new()));

    while let Some((dir, rel_dir)) = pending.pop_front() {
        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for item in walker {
            let item = item.map_err(|e| {
                GuestctlError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
                )
            })?;
            let name = item.file_name().to_string_lossy().into_owned();
            let rel = style.join(&rel_dir, &name);
            let path = item.path().to_path_buf();
            let meta = item.metadata().map_err(|e| {
                GuestctlError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata query failed")),
                )
            })?;

            let file_type = item.file_type();
            if file_type.is_dir() {
                entries.push(dir_entry(rel.clone(), &meta));
                if recursive {
                    pending.push_back((path, rel));
                }
            } else if file_type.is_file() {
                if matches_filter(&spec.filter, &name) {
                    entries.push(file_entry(rel, &meta));
                }
            } else if file_type.is_symlink() {
                // Dangling links resolve to nothing and are skipped.
                let Ok(target) = path.canonicalize() else {
                    tracing::debug!(path = %path.display(), "Skipping dangling symlink");
                    continue;
                };
                let resolved = std::fs::metadata(&target)?;
                if resolved.is_dir() {
                    if !spec.dir_flags.contains(DirectoryCopyFlags::FOLLOW_LINKS) {
                        tracing::debug!(path = %path.display(), "Not following directory symlink");
                        continue;
                    }
                    if !visited.insert(target) {
                        tracing::warn!(path = %path.display(), "Symlink loop, skipping");
                        continue;
                    }
                    entries.push(dir_entry(rel.clone(), &resolved));
                    if recursive {
                        pending.push_back((path, rel));
                    }
                } else if resolved.is_file() {
                    if !spec.file_flags.contains(FileCopyFlags::FOLLOW_LINKS) {
                        tracing::debug!(path = %path.display(), "Not following file symlink");
                        continue;
                    }
                    if matches_filter(&spec.filter, &name) {
                        entries.push(file_entry(rel, &resolved));
                    }
                } else {
                    return Err(GuestctlError::Unsupported(format!(
                        "symlink \"{}\" points to an unsupported object type",
                        path.display()
                    )));
                }
            } else {
                tracing::warn!(path = %path.display(), "Skipping special file");
            }
        }
    }
    Ok(entries)
}

fn dir_entry(path: String, meta: &std::fs::Metadata) -> FsEntry {
    FsEntry {
        path,
        obj_type: FsObjType::Directory,
        mode: host_mode(meta),
        size: 0,
        modification_time: modification_time(meta),
    }
}

fn file_entry(path: String, meta: &std::fs::Metadata) -> FsEntry {
    FsEntry {
        path,
        obj_type: FsObjType::File,
        mode: host_mode(meta),
        size: meta.len(),
        modification_time: modification_time(meta),
    }
}

async fn walk_guest(session: &Session, root: &str, spec: &FsSourceSpec) -> GuestctlResult<Vec<FsEntry>> {
    let style = spec.path_style;
    let recursive = spec.dir_flags.contains(DirectoryCopyFlags::RECURSIVE);
    let mut entries = Vec::new();
    let mut pending: VecDeque<String> = VecDeque::new();
    pending.push_back(String::new());

    while let Some(rel_dir) = pending.pop_front() {
        let dir_path = style.join(root, &rel_dir);
        let directory = session.directory_open(DirectoryOpenInfo::new(dir_path.clone())).await?;

        let mut listed = Vec::new();
        let read_result = loop {
            match directory.read().await {
                Ok(Some(obj)) => listed.push(obj),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = directory.close().await {
            tracing::debug!(path = %dir_path, error = %e, "Closing enumerated directory failed");
        }
        read_result?;

        for obj in listed {
            if obj.name == "." || obj.name == ".." {
                continue;
            }
            let rel = style.join(&rel_dir, &obj.name);
            match obj.obj_type {
                FsObjType::Directory => {
                    entries.push(FsEntry {
                        path: rel.clone(),
                        obj_type: FsObjType::Directory,
                        mode: obj.mode,
                        size: 0,
                        modification_time: Some(obj.modification_time),
                    });
                    if recursive {
                        pending.push_back(rel);
                    }
                }
                FsObjType::File => {
                    if matches_filter(&spec.filter, &obj.name) {
                        entries.push(FsEntry {
                            path: rel,
                            obj_type: FsObjType::File,
                            mode: obj.mode,
                            size: obj.size,
                            modification_time: Some(obj.modification_time),
                        });
                    }
                }
                FsObjType::Symlink => {
                    tracing::warn!(path = %style.join(root, &rel), "Guest symlinks are not resolved, skipping");
                }
                other => {
                    tracing::debug!(path = %style.join(root, &rel), ?other, "Skipping guest object");
                }
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_filter_matching() {
        assert!(matches_filter("", "anything"));
        assert!(matches_filter("*.txt", "a.txt"));
        assert!(!matches_filter("*.txt", "a.txt.bak"));
        assert!(matches_filter("a?c*", "abcdef"));
        assert!(matches_filter("*b*b*", "abxxb"));
        assert!(!matches_filter("a?c", "ac"));
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.bin"), b"xyz").unwrap();
        fs::create_dir(dir.path().join("sub").join("deep")).unwrap();
        dir
    }

    #[test]
    fn test_host_walk_recursive_lists_every_entry_after_its_parent() {
        let dir = tree();
        let spec = FsSourceSpec::directory(dir.path().to_string_lossy(), PathStyle::Unix)
            .directory_flags(DirectoryCopyFlags::RECURSIVE);
        let list = FsList::from_host(spec).unwrap();

        let paths: Vec<&str> = list.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "sub", "sub/b.bin", "sub/deep"]);
        assert_eq!(list.total_size(), 13);
    }

    #[test]
    fn test_host_walk_non_recursive_stays_at_top() {
        let dir = tree();
        let spec = FsSourceSpec::directory(dir.path().to_string_lossy(), PathStyle::Unix);
        let list = FsList::from_host(spec).unwrap();
        assert_eq!(list.entries.len(), 2);
    }

    #[test]
    fn test_host_file_source_has_no_entries() {
        let dir = tree();
        let file = dir.path().join("a.txt");
        let list = FsList::from_host(FsSourceSpec::file(file.to_string_lossy(), PathStyle::Unix)).unwrap();
        assert!(list.entries.is_empty());

        let err = FsList::from_host(FsSourceSpec::directory(file.to_string_lossy(), PathStyle::Unix))
            .unwrap_err();
        assert!(matches!(err, GuestctlError::InvalidArgument(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_host_symlinks_follow_only_when_asked() {
        let dir = tree();
        std::os::unix::fs::symlink(dir.path().join("a.txt"), dir.path().join("link.txt")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("missing"), dir.path().join("dangling")).unwrap();

        let base = FsSourceSpec::directory(dir.path().to_string_lossy(), PathStyle::Unix);
        let plain = FsList::from_host(base.clone()).unwrap();
        assert!(!plain.entries.iter().any(|e| e.path == "link.txt"));

        let followed = FsList::from_host(base.file_flags(FileCopyFlags::FOLLOW_LINKS)).unwrap();
        let link = followed.entries.iter().find(|e| e.path == "link.txt").unwrap();
        assert_eq!(link.obj_type, FsObjType::File);
        assert_eq!(link.size, 10);
        assert!(!followed.entries.iter().any(|e| e.path == "dangling"));
    }
}
