//! Integration tests for session lifecycle, session-level requests and
//! guest-wide session bookkeeping.

use guestctl::{
    CloseRetryOptions, GuestErrorKind, GuestOsType, GuestRc, GuestctlError, GuestctlOptions, SessionCredentials,
    SessionEvent, SessionStatus, SessionWaitFlags, SessionWaitResult,
};
use guestctl_shared::flags::{GuestFeatures, PathRenameFlags, ShutdownFlags};
use guestctl_shared::protocol::{ContextId, GuestCallback, SessionNotifyType};
use guestctl_test_utils::TestGuest;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// LIFECYCLE TESTS
// ============================================================================

#[tokio::test]
async fn start_and_close_session() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    assert_eq!(session.status(), SessionStatus::Started);
    assert_eq!(session.user(), "alice");
    assert_eq!(session.protocol_version(), 2);
    assert_eq!(ctx.guest.sessions().len(), 1);
    assert_eq!(ctx.mock.count_sent("SESSION_CREATE"), 1);

    session.close().await.unwrap();

    assert_eq!(session.status(), SessionStatus::Terminated);
    assert!(ctx.guest.sessions().is_empty());
    assert!(ctx.guest.session(session.id()).is_none());
    assert_eq!(ctx.mock.count_sent("SESSION_CLOSE"), 1);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidState(_)));
}

#[tokio::test]
async fn authentication_failure_sets_error_status() {
    let ctx = TestGuest::new();
    let session = ctx
        .guest
        .create_session(SessionCredentials::new("baduser", "wrong"), "bad")
        .unwrap();

    let err = session.start().await.unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::AUTHENTICATION_FAILURE));
    assert_eq!(session.status(), SessionStatus::Error);
    assert_eq!(session.last_rc(), GuestRc::AUTHENTICATION_FAILURE);

    // Waiting on a failed session reports the recorded error.
    let err = session.wait_for(SessionWaitFlags::START, WAIT).await.unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::AUTHENTICATION_FAILURE));
}

#[tokio::test]
async fn start_async_completes_progress() {
    let ctx = TestGuest::new();
    let session = ctx
        .guest
        .create_session(SessionCredentials::new("alice", "secret"), "async")
        .unwrap();

    let progress = session.start_async();
    progress.wait().await.unwrap();
    assert!(progress.is_completed());
    assert_eq!(session.status(), SessionStatus::Started);
}

#[tokio::test]
async fn legacy_guest_starts_implicitly() {
    let ctx = TestGuest::with_guest(GuestOsType::Linux, "4.2.0", GuestctlOptions::default());
    let session = ctx.session("alice").await;

    assert_eq!(session.protocol_version(), 1);
    assert_eq!(session.status(), SessionStatus::Started);
    assert_eq!(ctx.mock.count_sent("SESSION_CREATE"), 0);

    let result = session.wait_for(SessionWaitFlags::START, WAIT).await.unwrap();
    assert_eq!(result, SessionWaitResult::Start);

    // No close handshake on legacy guests either.
    session.close().await.unwrap();
    assert_eq!(ctx.mock.count_sent("SESSION_CLOSE"), 0);
    assert!(ctx.guest.sessions().is_empty());
}

#[tokio::test]
async fn close_gives_up_after_retries() {
    let options = GuestctlOptions {
        close_retry: CloseRetryOptions {
            attempts: 2,
            base_ms: 50,
            step_ms: 10,
        },
        ..Default::default()
    };
    let ctx = TestGuest::with_guest(GuestOsType::Linux, "7.0.10r161000", options);
    let session = ctx.session("alice").await;
    ctx.mock.drop_messages("SESSION_CLOSE");

    let err = session.close().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(ctx.mock.count_sent("SESSION_CLOSE"), 2);

    // The session is gone regardless.
    assert!(ctx.guest.sessions().is_empty());
    assert!(session.status().is_terminal());
}

#[tokio::test]
async fn close_sessions_removes_all() {
    let ctx = TestGuest::new();
    ctx.session("alice").await;
    ctx.session("bob").await;
    assert_eq!(ctx.guest.sessions().len(), 2);
    assert_eq!(ctx.guest.find_sessions("bob session").len(), 1);

    ctx.guest.close_sessions().await;
    assert!(ctx.guest.sessions().is_empty());
}

// ============================================================================
// WAIT TESTS
// ============================================================================

#[tokio::test]
async fn guest_down_ends_session() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    let mut events = session.subscribe();

    ctx.mock.inject(GuestCallback::SessionNotify {
        cid: ContextId::new(session.id(), 0, 0),
        kind: SessionNotifyType::Down,
        result: 0,
    });
    loop {
        match tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            SessionEvent::StateChanged { status, .. } if status == SessionStatus::Down => break,
            _ => continue,
        }
    }

    let result = session.wait_for(SessionWaitFlags::TERMINATE, WAIT).await.unwrap();
    assert_eq!(result, SessionWaitResult::Terminate);
    let err = session.path_user_home().await.unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidState(_)));
}

#[tokio::test]
async fn wait_times_out_without_error() {
    let ctx = TestGuest::new();
    let session = ctx
        .guest
        .create_session(SessionCredentials::new("alice", "secret"), "idle")
        .unwrap();

    let result = session
        .wait_for(SessionWaitFlags::START, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(result, SessionWaitResult::Timeout);
}

#[tokio::test]
async fn wait_without_flags_is_rejected() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let err = session
        .wait_for(SessionWaitFlags::empty(), WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
}

// ============================================================================
// GUEST BOOKKEEPING TESTS
// ============================================================================

#[tokio::test]
async fn session_ids_are_exhausted_at_limit() {
    let options = GuestctlOptions {
        max_sessions: 2,
        ..Default::default()
    };
    let ctx = TestGuest::with_guest(GuestOsType::Linux, "7.0.10r161000", options);
    let first = ctx.session("alice").await;
    ctx.session("bob").await;

    let err = ctx
        .guest
        .create_session(SessionCredentials::new("carol", "secret"), "third")
        .unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::MAX_OBJECTS_REACHED));
    match &err {
        GuestctlError::Guest(e) => assert_eq!(e.kind, GuestErrorKind::Session),
        other => panic!("unexpected error: {:?}", other),
    }

    // Closing one frees its ID.
    first.close().await.unwrap();
    ctx.guest
        .create_session(SessionCredentials::new("carol", "secret"), "third")
        .unwrap();
}

#[tokio::test]
async fn dispatch_to_unknown_session_fails() {
    let ctx = TestGuest::new();
    let err = ctx
        .guest
        .dispatch(GuestCallback::Reply {
            cid: ContextId::new(17, 3, 1),
            rc: 0,
            payload: None,
        })
        .unwrap_err();
    assert!(matches!(err, GuestctlError::NotFound(_)));
}

// ============================================================================
// SESSION REQUEST TESTS
// ============================================================================

#[tokio::test]
async fn user_directories_come_from_guest() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    assert_eq!(session.path_user_home().await.unwrap(), "/home/alice");
    assert_eq!(session.path_user_documents().await.unwrap(), "/home/alice/Documents");
}

#[tokio::test]
async fn rename_respects_replace_flag() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;
    ctx.write_guest_file("/work/a.txt", b"a");
    ctx.write_guest_file("/work/b.txt", b"b");

    let err = session
        .path_rename("/work/a.txt", "/work/b.txt", PathRenameFlags::empty())
        .await
        .unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::ALREADY_EXISTS));

    session
        .path_rename("/work/a.txt", "/work/b.txt", PathRenameFlags::REPLACE)
        .await
        .unwrap();
    assert!(!ctx.host_path("/work/a.txt").exists());
    assert_eq!(std::fs::read(ctx.host_path("/work/b.txt")).unwrap(), b"a");

    let err = session
        .path_rename("/work/missing", "/work/c.txt", PathRenameFlags::empty())
        .await
        .unwrap_err();
    assert_eq!(err.guest_rc(), Some(GuestRc::PATH_NOT_FOUND));

    let err = session
        .path_rename("", "/work/c.txt", PathRenameFlags::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
}

#[tokio::test]
async fn shutdown_needs_feature_and_single_action() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    let err = session
        .shutdown(ShutdownFlags::POWER_OFF | ShutdownFlags::REBOOT)
        .await
        .unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));
    let err = session.shutdown(ShutdownFlags::FORCE).await.unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidArgument(_)));

    session
        .shutdown(ShutdownFlags::REBOOT | ShutdownFlags::FORCE)
        .await
        .unwrap();
    assert_eq!(ctx.mock.shutdowns().len(), 1);

    // Feature flags are captured when the session is created.
    ctx.guest.set_features(GuestFeatures::empty());
    let other = ctx.session("bob").await;
    let err = other.shutdown(ShutdownFlags::POWER_OFF).await.unwrap_err();
    assert!(matches!(err, GuestctlError::Unsupported(_)));
}

#[tokio::test]
async fn requests_need_started_session() {
    let ctx = TestGuest::new();
    let session = ctx
        .guest
        .create_session(SessionCredentials::new("alice", "secret"), "idle")
        .unwrap();

    let err = session.path_user_home().await.unwrap_err();
    assert!(matches!(err, GuestctlError::InvalidState(_)));
    assert_eq!(ctx.mock.count_sent("PATH_USER_HOME"), 0);
}

// ============================================================================
// ENVIRONMENT TESTS
// ============================================================================

#[tokio::test]
async fn environment_changes_reach_processes() {
    let ctx = TestGuest::new();
    let session = ctx.session("alice").await;

    session.environment_schedule_set("LANG", "C").unwrap();
    session.environment_schedule_unset("HOME").unwrap();
    assert_eq!(session.environment_get("LANG"), Some(Some("C".to_string())));
    assert_eq!(session.environment_get("HOME"), Some(None));
    assert_eq!(session.environment_get("PATH"), None);
    assert!(session.environment_schedule_set("", "x").is_err());

    let process = session
        .process_create(guestctl::ProcessStartupInfo::new("/bin/true").env("EXTRA=1"))
        .unwrap();
    let environment = process.environment().to_vec();
    assert!(environment.contains(&"LANG=C".to_string()));
    assert!(environment.contains(&"HOME".to_string()));
    assert!(environment.contains(&"EXTRA=1".to_string()));

    session.environment_clear();
    assert!(session.environment_changes().is_empty());
}
