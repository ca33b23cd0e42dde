//! Integration tests for guest processes: start, output, input, termination
//! and object bookkeeping.

use guestctl::{
    GuestOsType, GuestctlError, GuestctlOptions, ProcessStartupInfo, ProcessStatus, ProcessWaitFlags,
    ProcessWaitResult,
};
use guestctl_shared::constants::handles;
use guestctl_shared::flags::{ProcessCreateFlags, ProcessInputFlags};
use guestctl_shared::protocol::InputStatus;
use guestctl_test_utils::TestGuest;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// OUTPUT TESTS
// ============================================================================

#[tokio::test]
async fn echo_output_is_read_from_stdout() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let process = session
        .process_create(
            ProcessStartupInfo::new("mock_echo")
                .args(["hello", "world"])
                .flags(ProcessCreateFlags::WAIT_FOR_STDOUT),
        )
        .unwrap();
    assert_eq!(process.status(), ProcessStatus::Undefined);
    assert_eq!(process.arguments(), ["mock_echo", "hello", "world"]);

    process.start().await.unwrap();
    assert_eq!(process.status(), ProcessStatus::Started);
    assert!(process.started_at().is_some());
    assert_eq!(session.process_get(process.pid()).unwrap().object_id(), process.object_id());

    // Output readiness is not signalled; the caller polls.
    let waited = process
        .wait_for(ProcessWaitFlags::TERMINATE | ProcessWaitFlags::STDOUT, WAIT)
        .await
        .unwrap();
    assert_eq!(waited, ProcessWaitResult::WaitFlagNotSupported);

    let output = process.read(handles::STDOUT, 1024, WAIT).await.unwrap();
    assert_eq!(output, b"hello world\n");

    let waited = process.wait_for(ProcessWaitFlags::TERMINATE, WAIT).await.unwrap();
    assert_eq!(waited, ProcessWaitResult::Terminate);
    assert_eq!(process.status(), ProcessStatus::TerminatedNormally);
    assert_eq!(process.exit_code(), Some(0));
    assert!(process.ended_at().is_some());

    // Nothing more to read once it is gone.
    assert!(process.read(handles::STDOUT, 1024, WAIT).await.unwrap().is_empty());
}

#[tokio::test]
async fn stdout_not_requested_reads_nothing() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let process = session
        .process_create(ProcessStartupInfo::new("mock_sleep"))
        .unwrap();
    process.start().await.unwrap();

    assert!(process.read(handles::STDOUT, 64, WAIT).await.unwrap().is_empty());
    assert_eq!(ctx.mock.count_sent("EXEC_GET_OUTPUT"), 0);

    let err = process.read(handles::STDIN, 64, WAIT).await.unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
    let err = process.read(handles::STDOUT, 0, WAIT).await.unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
}

#[tokio::test]
async fn exit_code_is_recorded() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    ctx.mock.set_exit_code("/usr/bin/false", 3);

    let process = session
        .process_create(ProcessStartupInfo::new("/usr/bin/false"))
        .unwrap();
    process.start().await.unwrap();

    let waited = process.wait_for(ProcessWaitFlags::TERMINATE, WAIT).await.unwrap();
    assert_eq!(waited, ProcessWaitResult::Terminate);
    assert_eq!(process.exit_code(), Some(3));
}

// ============================================================================
// INPUT TESTS
// ============================================================================

#[tokio::test]
async fn cat_echoes_stdin_after_end_of_file() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let process = session
        .process_create(ProcessStartupInfo::new("mock_cat").flags(ProcessCreateFlags::WAIT_FOR_STDOUT))
        .unwrap();
    process.start().await.unwrap();

    let written = process
        .write(handles::STDIN, ProcessInputFlags::empty(), b"ping ", WAIT)
        .await
        .unwrap();
    assert_eq!(written.status, InputStatus::Written);
    assert_eq!(written.processed, 5);
    let written = process
        .write(handles::STDIN, ProcessInputFlags::END_OF_FILE, b"pong", WAIT)
        .await
        .unwrap();
    assert_eq!(written.processed, 4);

    let output = process.read(handles::STDOUT, 1024, WAIT).await.unwrap();
    assert_eq!(output, b"ping pong");
    let waited = process.wait_for(ProcessWaitFlags::TERMINATE, WAIT).await.unwrap();
    assert_eq!(waited, ProcessWaitResult::Terminate);

    // Stdin of a finished process is closed.
    let err = process
        .write(handles::STDIN, ProcessInputFlags::empty(), b"late", WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidState(_)));
}

#[tokio::test]
async fn write_to_output_handle_is_rejected() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    let process = session
        .process_create(ProcessStartupInfo::new("mock_sleep"))
        .unwrap();
    process.start().await.unwrap();

    let err = process
        .write(handles::STDOUT, ProcessInputFlags::empty(), b"x", WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
}

// ============================================================================
// TERMINATION TESTS
// ============================================================================

#[tokio::test]
async fn terminate_running_process() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let process = session
        .process_create(ProcessStartupInfo::new("mock_sleep"))
        .unwrap();
    process.start().await.unwrap();
    assert_eq!(ctx.mock.running_processes(), 1);

    process.terminate().await.unwrap();
    assert_eq!(process.status(), ProcessStatus::TerminatedSignal);
    assert_eq!(process.exit_code(), Some(15));
    assert_eq!(ctx.mock.running_processes(), 0);

    // Terminating again is a no-op.
    process.terminate().await.unwrap();
    assert_eq!(ctx.mock.count_sent("EXEC_TERMINATE"), 1);
}

#[tokio::test]
async fn wait_times_out_on_running_process() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    let process = session
        .process_create(ProcessStartupInfo::new("mock_sleep"))
        .unwrap();
    process.start().await.unwrap();

    let waited = process
        .wait_for(ProcessWaitFlags::TERMINATE, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(waited, ProcessWaitResult::Timeout);
    assert_eq!(process.status(), ProcessStatus::Started);
}

#[tokio::test]
async fn session_close_ends_pending_wait() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    let process = session
        .process_create(ProcessStartupInfo::new("mock_sleep"))
        .unwrap();
    process.start().await.unwrap();

    let waiter = {
        let process = process.clone();
        tokio::spawn(async move { process.wait_for(ProcessWaitFlags::TERMINATE, WAIT).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.close().await.unwrap();

    let waited = waiter.await.unwrap().unwrap();
    assert_eq!(waited, ProcessWaitResult::Terminate);
    assert_eq!(process.status(), ProcessStatus::Down);
    assert!(session.processes().is_empty());
}

#[tokio::test]
async fn start_only_flag_ends_wait_on_start() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    let process = session
        .process_create(ProcessStartupInfo::new("mock_sleep").flags(ProcessCreateFlags::WAIT_FOR_START_ONLY))
        .unwrap();
    process.start_async().await.unwrap();

    let waited = process.wait_for(ProcessWaitFlags::TERMINATE, WAIT).await.unwrap();
    assert_eq!(waited, ProcessWaitResult::Start);
    assert_eq!(process.status(), ProcessStatus::Started);
}

// ============================================================================
// CREATION AND LOOKUP TESTS
// ============================================================================

#[tokio::test]
async fn invalid_startup_info_is_rejected() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let err = session.process_create(ProcessStartupInfo::default()).unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));

    let err = session
        .process_create(
            ProcessStartupInfo::new("/bin/ls")
                .flags(ProcessCreateFlags::WAIT_FOR_START_ONLY | ProcessCreateFlags::WAIT_FOR_STDOUT),
        )
        .unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
    assert!(session.processes().is_empty());
}

#[tokio::test]
async fn process_lookup_by_pid() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let err = session.process_get(0).unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
    let err = session.process_get(4242).unwrap_err();
    assert!(matches!(err, GuestctlError::NotFound(_)));
}

#[tokio::test]
async fn object_limit_is_enforced() {
    let options = GuestctlOptions {
        max_objects: 4,
        ..Default::default()
    };
    let ctx = TestGuest::with_guest(GuestOsType::Linux, "7.0.10r161000", options);
    let session = ctx.session("alice").await;

    let first = session
        .process_create(ProcessStartupInfo::new("/bin/true"))
        .unwrap();
    // The session holds one of the two usable IDs.
    assert_eq!(session.object_count(), 2);
    let err = session
        .process_create(ProcessStartupInfo::new("/bin/true"))
        .unwrap_err();
    assert!(matches!(err, GuestctlError::MaxObjectsReached(4)));

    session.process_release(&first).unwrap();
    assert_eq!(session.object_count(), 1);
    assert!(session.process_release(&first).is_err());
    session
        .process_create(ProcessStartupInfo::new("/bin/true"))
        .unwrap();
}

#[tokio::test]
async fn legacy_guest_sends_credentials_with_command() {
    let ctx = TestGuest::with_guest(GuestOsType::Linux, "4.2.0", GuestctlOptions::default());
    let session = ctx.session("alice").await;

    let process = session
        .process_create(ProcessStartupInfo::new("mock_sleep"))
        .unwrap();
    process.start().await.unwrap();

    let executed = ctx.mock.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].user.as_deref(), Some("alice"));
    assert_eq!(executed[0].password.as_deref(), Some("secret"));
    assert!(executed[0].priority.is_none());

    // Termination needs session support in the guest.
    let err = process.terminate().await.unwrap_err();
    assert!(matches!(err, GuestctlError::Unsupported(_)));
}
