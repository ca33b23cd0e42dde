//! Integration tests for guest files, directories and toolbox-backed
//! filesystem operations.

use guestctl::fs::{DirectoryStatus, FileStatus};
use guestctl::{
    DirectoryOpenInfo, FileOpenInfo, GuestOsType, GuestRc, GuestctlError, GuestctlOptions, Session,
};
use guestctl_shared::flags::{DirectoryCreateFlags, DirectoryRemoveFlags};
use guestctl_shared::protocol::{FileAccessMode, FileOpenAction, FileSeekOrigin};
use guestctl_test_utils::TestGuest;
use std::fs;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Names in `path`, without the self and parent entries.
async fn list_names(session: &Session, path: &str) -> Vec<String> {
    let directory = session.directory_open(DirectoryOpenInfo::new(path)).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = directory.read().await.unwrap() {
        if entry.name != "." && entry.name != ".." {
            names.push(entry.name);
        }
    }
    directory.close().await.unwrap();
    names
}

// ============================================================================
// FILE TESTS
// ============================================================================

#[tokio::test]
async fn write_seek_and_read_file() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    fs::create_dir_all(ctx.host_path("/data")).unwrap();

    let file = session
        .file_open(FileOpenInfo::new(
            "/data/notes.txt",
            FileAccessMode::ReadWrite,
            FileOpenAction::CreateOrReplace,
        ))
        .await
        .unwrap();
    assert_eq!(file.status(), FileStatus::Open);
    assert_eq!(session.files().len(), 1);

    assert_eq!(file.write(b"hello world", WAIT).await.unwrap(), 11);
    assert_eq!(file.offset(), 11);

    assert_eq!(file.seek(0, FileSeekOrigin::Begin).await.unwrap(), 0);
    assert_eq!(file.read(5, WAIT).await.unwrap(), b"hello");
    assert_eq!(file.offset(), 5);
    assert_eq!(file.read_at(6, 100, WAIT).await.unwrap(), b"world");
    assert_eq!(file.offset(), 11);

    // End of file reads as empty.
    assert!(file.read(16, WAIT).await.unwrap().is_empty());

    assert_eq!(file.write_at(0, b"J", WAIT).await.unwrap(), 1);
    assert_eq!(file.query_size().await.unwrap(), 11);

    file.close().await.unwrap();
    assert_eq!(file.status(), FileStatus::Closed);
    assert!(session.files().is_empty());
    assert_eq!(fs::read(ctx.host_path("/data/notes.txt")).unwrap(), b"Jello world");

    let err = file.read(1, WAIT).await.unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidState(_)));
}

#[tokio::test]
async fn concurrent_reads_get_their_own_data() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    ctx.write_guest_file("/data/alphabet.txt", b"abcdefghijklmnopqrstuvwxyz");

    let file = session
        .file_open(FileOpenInfo::new(
            "/data/alphabet.txt",
            FileAccessMode::ReadOnly,
            FileOpenAction::OpenExisting,
        ))
        .await
        .unwrap();

    let (head, tail) = tokio::join!(file.read_at(0, 3, WAIT), file.read_at(23, 3, WAIT));
    assert_eq!(head.unwrap(), b"abc");
    assert_eq!(tail.unwrap(), b"xyz");
    file.close().await.unwrap();
}

#[tokio::test]
async fn open_failures_carry_guest_codes() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    ctx.write_guest_file("/data/existing.txt", b"x");

    let err = session
        .file_open(FileOpenInfo::new(
            "/nowhere/file.txt",
            FileAccessMode::WriteOnly,
            FileOpenAction::CreateOrReplace,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::PATH_NOT_FOUND));

    let err = session
        .file_open(FileOpenInfo::new("/data", FileAccessMode::ReadOnly, FileOpenAction::OpenExisting))
        .await
        .unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::IS_A_DIRECTORY));

    let err = session
        .file_open(FileOpenInfo::new(
            "/data/existing.txt",
            FileAccessMode::WriteOnly,
            FileOpenAction::CreateNew,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::ALREADY_EXISTS));

    // Failed opens leave nothing behind.
    assert!(session.files().is_empty());
    assert_eq!(session.object_count(), 1);
}

#[tokio::test]
async fn unsupported_open_modes_are_rejected_locally() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let err = session
        .file_open(FileOpenInfo::new(
            "/data/log.txt",
            FileAccessMode::AppendOnly,
            FileOpenAction::OpenOrCreate,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, GuestctlError::NotImplemented(_)));

    let err = session
        .file_open(FileOpenInfo::new("", FileAccessMode::ReadOnly, FileOpenAction::OpenExisting))
        .await
        .unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
    assert_eq!(ctx.mock.count_sent("FILE_OPEN"), 0);
}

#[tokio::test]
async fn legacy_guest_has_no_file_access() {
    let ctx = TestGuest::with_guest(
        guestctl::GuestOsType::Linux,
        "4.2.0",
        guestctl::GuestctlOptions::default(),
    );
    let session = ctx.session("alice").await;

    let err = session
        .file_open(FileOpenInfo::new("/etc/hosts", FileAccessMode::ReadOnly, FileOpenAction::OpenExisting))
        .await
        .unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::NOT_SUPPORTED));
}

#[tokio::test]
async fn session_close_closes_open_files() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    ctx.write_guest_file("/data/a.txt", b"a");

    let file = session
        .file_open(FileOpenInfo::new("/data/a.txt", FileAccessMode::ReadOnly, FileOpenAction::OpenExisting))
        .await
        .unwrap();
    session.close().await.unwrap();

    assert!(file.status().is_terminal());
    assert_eq!(ctx.mock.count_sent("FILE_CLOSE"), 1);
}

// ============================================================================
// DIRECTORY TESTS
// ============================================================================

#[tokio::test]
async fn read_directory_entries() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    ctx.write_guest_file("/data/dir/a.txt", b"aaa");
    ctx.write_guest_file("/data/dir/b", b"");
    fs::create_dir_all(ctx.host_path("/data/dir/sub")).unwrap();

    let directory = session
        .directory_open(DirectoryOpenInfo::new("/data/dir"))
        .await
        .unwrap();
    assert_eq!(directory.status(), DirectoryStatus::Open);
    assert_eq!(session.directories().len(), 1);

    let mut entries = Vec::new();
    while let Some(entry) = directory.read().await.unwrap() {
        entries.push(entry);
    }
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, [".", "..", "a.txt", "b", "sub"]);
    assert_eq!(entries[2].size, 3);
    assert!(entries[2].is_file());
    assert!(entries[4].is_directory());

    // Exhausted stays exhausted.
    assert!(directory.read().await.unwrap().is_none());

    directory.close().await.unwrap();
    assert!(session.directories().is_empty());
}

#[tokio::test]
async fn directory_open_failures() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let err = session
        .directory_open(DirectoryOpenInfo::new("/missing"))
        .await
        .unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::PATH_NOT_FOUND));

    let mut filtered = DirectoryOpenInfo::new("/data");
    filtered.filter = "*.txt".into();
    let err = session.directory_open(filtered).await.unwrap_err();
    assert!(matches!(err, GuestctlError::NotImplemented(_)));
    assert!(session.directories().is_empty());
}

#[tokio::test]
async fn create_and_remove_directories() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    session
        .directory_create("/data/x/y", 0o755, DirectoryCreateFlags::PARENTS)
        .await
        .unwrap();
    assert!(ctx.host_path("/data/x/y").is_dir());
    assert!(session.directory_exists("/data/x/y", true).await.unwrap());

    let err = session
        .directory_create("/other/p/q", 0, DirectoryCreateFlags::empty())
        .await;
    assert!(err.is_err());
    assert!(!ctx.host_path("/other").exists());

    ctx.write_guest_file("/data/x/y/file.txt", b"content");
    let err = session
        .directory_remove("/data/x", DirectoryRemoveFlags::empty())
        .await
        .unwrap_err();
    assert!(err.guest_rc().is_some());

    session
        .directory_remove("/data/x", DirectoryRemoveFlags::RECURSIVE)
        .await
        .unwrap();
    assert!(!ctx.host_path("/data/x").exists());
    assert_eq!(list_names(&session, "/data").await, Vec::<String>::new());
}

// ============================================================================
// QUERY TESTS
// ============================================================================

#[tokio::test]
async fn query_info_and_existence() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    ctx.write_guest_file("/data/a.txt", b"12345");

    let info = session.fs_query_info("/data/a.txt", false).await.unwrap();
    assert!(info.is_file());
    assert_eq!(info.size, 5);
    assert_eq!(session.file_query_size("/data/a.txt", true).await.unwrap(), 5);

    assert!(session.file_exists("/data/a.txt", false).await.unwrap());
    assert!(!session.file_exists("/data", false).await.unwrap());
    assert!(session.directory_exists("/data", false).await.unwrap());
    assert!(!session.fs_obj_exists("/data/missing", false).await.unwrap());
    assert!(!session.fs_obj_exists("/missing/deeper", false).await.unwrap());

    let err = session.file_query_info("/data", false).await.unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::NOT_A_FILE));

    let err = session.fs_query_info("/data/missing", false).await.unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::FILE_NOT_FOUND));

    // Toolbox processes are released after each query.
    assert!(session.processes().is_empty());
    assert!(ctx.mock.count_sent("EXEC_CMD") >= 8);
}

#[tokio::test]
async fn busy_tool_still_times_out() {
    let options = GuestctlOptions {
        request_timeout_ms: 300,
        ..Default::default()
    };
    let ctx = TestGuest::with_guest(GuestOsType::Linux, "7.0.10r161000", options);
    let session = ctx.session("alice").await;
    ctx.write_guest_file("/data/a.txt", b"12345");
    ctx.mock.keep_talking("vbox_stat");

    let started = std::time::Instant::now();
    let err = tokio::time::timeout(WAIT, session.fs_query_info("/data/a.txt", false))
        .await
        .expect("query gave up on its own")
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(session.processes().is_empty());
}

#[tokio::test]
async fn remove_file() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    ctx.write_guest_file("/data/a.txt", b"a");

    session.file_remove("/data/a.txt").await.unwrap();
    assert!(!ctx.host_path("/data/a.txt").exists());

    assert!(session.file_remove("/data/a.txt").await.is_err());
    let err = session.file_remove("").await.unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
}

#[tokio::test]
async fn create_temporary_objects() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    fs::create_dir_all(ctx.host_path("/tmp")).unwrap();

    let file = session
        .fs_create_temp("upload.XXXX", 0o600, Some("/tmp"), false, false)
        .await
        .unwrap();
    assert!(file.starts_with("/tmp/upload."));
    assert!(ctx.host_path(&file).is_file());

    let dir = session
        .fs_create_temp("work.XXXX", 0, Some("/tmp"), true, true)
        .await
        .unwrap();
    assert_ne!(dir, file);
    assert!(ctx.host_path(&dir).is_dir());

    // Too few placeholders.
    assert!(session.fs_create_temp("bad.XX", 0o600, Some("/tmp"), false, false).await.is_err());
}
