//! Wait-event registry: correlates outstanding requests with guest replies.
//!
//! A caller registers interest before sending a request, then awaits the
//! returned [`WaitHandle`]. The dispatcher resolves it either by context ID
//! (direct reply) or by event type (state change fired by an object). Each
//! registration resolves at most once; dropping the handle unregisters it.

use crate::fs::directory::DirectoryStatus;
use crate::fs::file::FileStatus;
use crate::process::ProcessStatus;
use crate::session::state::SessionStatus;
use guestctl_shared::constants::context::MAX_CONTEXTS;
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::protocol::{ContextId, FsObjRecord, InputStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Kinds of events a waiter can be interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum EventType {
    /// Direct reply to a request, matched by context ID only.
    Reply,
    SessionStateChanged,
    ProcessStateChanged,
    ProcessOutput,
    ProcessInputNotify,
    FileStateChanged,
    FileRead,
    FileWrite,
    FileOffsetChanged,
    DirectoryStateChanged,
    DirectoryRead,
}

/// Data delivered with a signalled event.
#[derive(Debug, Clone)]
pub(crate) enum EventPayload {
    None,
    Text(String),
    SessionStatus {
        status: SessionStatus,
        rc: GuestRc,
    },
    ProcessStatus {
        status: ProcessStatus,
        rc: GuestRc,
    },
    ProcessOutput {
        handle: u32,
        data: Vec<u8>,
    },
    ProcessInput {
        status: InputStatus,
        processed: u32,
    },
    FileStatus {
        status: FileStatus,
        rc: GuestRc,
    },
    FileData(Vec<u8>),
    FileWritten(u32),
    FileOffset(u64),
    DirectoryStatus {
        status: DirectoryStatus,
        rc: GuestRc,
    },
    DirectoryEntry(FsObjRecord),
}

/// A resolved wait.
#[derive(Debug, Clone)]
pub(crate) struct Signal {
    pub event: EventType,
    pub rc: GuestRc,
    pub payload: EventPayload,
}

impl Signal {
    /// Turn a guest failure code into an error attributed to `subject`.
    pub fn into_result(self, kind: GuestErrorKind, subject: &str) -> GuestctlResult<Signal> {
        if self.rc.is_failure() {
            return Err(GuestctlError::guest(kind, self.rc, subject));
        }
        Ok(self)
    }
}

#[derive(Debug)]
enum WaitOutcome {
    Signaled(Signal),
    /// Owner went away (session terminated, object closed).
    Cancelled(GuestRc),
}

struct PendingEvent {
    object_id: u32,
    types: Vec<EventType>,
    tx: oneshot::Sender<WaitOutcome>,
}

#[derive(Default)]
struct WaitTable {
    next_count: HashMap<u32, u32>,
    pending: HashMap<ContextId, PendingEvent>,
}

pub(crate) struct WaitEventRegistry {
    session_id: u32,
    session_name: String,
    table: Mutex<WaitTable>,
}

impl WaitEventRegistry {
    pub fn new(session_id: u32, session_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            session_name: session_name.into(),
            table: Mutex::new(WaitTable::default()),
        })
    }

    /// Register interest in `types` for `object_id` under a fresh context ID.
    pub fn register(
        self: &Arc<Self>,
        object_id: u32,
        types: &[EventType],
    ) -> GuestctlResult<WaitHandle> {
        let mut table = self.table.lock();

        let mut cid = None;
        for _ in 0..MAX_CONTEXTS {
            let counter = table.next_count.entry(object_id).or_insert(0);
            let candidate = ContextId::new(self.session_id, object_id, *counter);
            *counter = (*counter + 1) % MAX_CONTEXTS;
            if !table.pending.contains_key(&candidate) {
                cid = Some(candidate);
                break;
            }
        }
        let cid = cid.ok_or_else(|| {
            GuestctlError::Internal(format!("no free context ID for object {}", object_id))
        })?;

        let (tx, rx) = oneshot::channel();
        table.pending.insert(
            cid,
            PendingEvent {
                object_id,
                types: types.to_vec(),
                tx,
            },
        );
        tracing::trace!(%cid, ?types, "Registered wait event");

        Ok(WaitHandle {
            cid,
            rx: Some(rx),
            registry: Arc::downgrade(self),
        })
    }

    /// Allocate a context ID for a message nobody waits on directly.
    pub fn next_cid(&self, object_id: u32) -> ContextId {
        let mut table = self.table.lock();
        let counter = table.next_count.entry(object_id).or_insert(0);
        let cid = ContextId::new(self.session_id, object_id, *counter);
        *counter = (*counter + 1) % MAX_CONTEXTS;
        cid
    }

    fn unregister(&self, cid: ContextId) {
        if self.table.lock().pending.remove(&cid).is_some() {
            tracing::trace!(%cid, "Unregistered wait event");
        }
    }

    /// Resolve the waiter registered under `cid`.
    ///
    /// Returns false when nobody waits for it any more; such replies are
    /// dropped.
    pub fn signal_cid(&self, cid: ContextId, rc: GuestRc, payload: EventPayload) -> bool {
        let pending = self.table.lock().pending.remove(&cid);
        match pending {
            Some(event) => {
                let signal = Signal {
                    event: EventType::Reply,
                    rc,
                    payload,
                };
                let _ = event.tx.send(WaitOutcome::Signaled(signal));
                true
            }
            None => {
                tracing::warn!(%cid, rc = rc.0, "Dropping reply without a pending waiter");
                false
            }
        }
    }

    /// Resolve the waiter registered under `cid` if it waits for `event`.
    ///
    /// Replies to one request go to that request only, so concurrent
    /// requests of the same type on one object each get their own data.
    pub fn signal_reply(&self, cid: ContextId, event: EventType, rc: GuestRc, payload: EventPayload) -> bool {
        let pending = {
            let mut table = self.table.lock();
            match table.pending.get(&cid) {
                Some(p) if p.types.contains(&event) => table.pending.remove(&cid),
                _ => None,
            }
        };
        match pending {
            Some(pending) => {
                let _ = pending.tx.send(WaitOutcome::Signaled(Signal { event, rc, payload }));
                true
            }
            None => {
                tracing::debug!(%cid, ?event, rc = rc.0, "Dropping reply without a matching waiter");
                false
            }
        }
    }

    /// Resolve every waiter of `object_id` interested in `event`.
    pub fn signal_type(
        &self,
        object_id: u32,
        event: EventType,
        rc: GuestRc,
        payload: EventPayload,
    ) -> usize {
        let matched: Vec<PendingEvent> = {
            let mut table = self.table.lock();
            let cids: Vec<ContextId> = table
                .pending
                .iter()
                .filter(|(_, p)| p.object_id == object_id && p.types.contains(&event))
                .map(|(cid, _)| *cid)
                .collect();
            cids.iter()
                .filter_map(|cid| table.pending.remove(cid))
                .collect()
        };

        let count = matched.len();
        for pending in matched {
            let _ = pending.tx.send(WaitOutcome::Signaled(Signal {
                event,
                rc,
                payload: payload.clone(),
            }));
        }
        tracing::trace!(object_id, ?event, count, "Signalled wait events");
        count
    }

    /// Cancel all waiters of `object_id`, reporting `rc` to them.
    pub fn cancel_object(&self, object_id: u32, rc: GuestRc) -> usize {
        let cancelled: Vec<PendingEvent> = {
            let mut table = self.table.lock();
            let cids: Vec<ContextId> = table
                .pending
                .iter()
                .filter(|(_, p)| p.object_id == object_id)
                .map(|(cid, _)| *cid)
                .collect();
            cids.iter()
                .filter_map(|cid| table.pending.remove(cid))
                .collect()
        };
        let count = cancelled.len();
        for pending in cancelled {
            let _ = pending.tx.send(WaitOutcome::Cancelled(rc));
        }
        if count > 0 {
            tracing::debug!(object_id, count, "Cancelled wait events");
        }
        count
    }

    /// Cancel every waiter of the session.
    pub fn cancel_all(&self, rc: GuestRc) -> usize {
        let drained: Vec<PendingEvent> = self.table.lock().pending.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(WaitOutcome::Cancelled(rc));
        }
        count
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }
}

/// Overall time budget of a multi-step wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now().checked_add(timeout))
    }

    /// Time left, `None` once the budget is used up.
    pub fn remaining(&self) -> Option<Duration> {
        match self.0 {
            None => Some(Duration::MAX),
            Some(deadline) => {
                let now = Instant::now();
                (now < deadline).then(|| deadline - now)
            }
        }
    }
}

/// Registered interest in a guest event.
pub(crate) struct WaitHandle {
    cid: ContextId,
    rx: Option<oneshot::Receiver<WaitOutcome>>,
    registry: Weak<WaitEventRegistry>,
}

impl WaitHandle {
    pub fn cid(&self) -> ContextId {
        self.cid
    }

    /// Wait for the event, at most `timeout`.
    ///
    /// A guest failure code does not fail the wait itself; use
    /// [`Signal::into_result`] for that.
    pub async fn wait(&mut self, timeout: Duration) -> GuestctlResult<Signal> {
        let rx = self
            .rx
            .as_mut()
            .ok_or_else(|| GuestctlError::InvalidState("wait event already consumed".into()))?;

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.rx = None;
                return Err(GuestctlError::InvalidState(
                    "wait event dropped by its registry".into(),
                ));
            }
            Err(_) => {
                return Err(GuestctlError::timeout(format_args!(
                    "no reply for {} within {:?}",
                    self.cid, timeout
                )));
            }
        };
        self.rx = None;

        match outcome {
            WaitOutcome::Signaled(signal) => Ok(signal),
            WaitOutcome::Cancelled(rc) => {
                let name = self
                    .registry
                    .upgrade()
                    .map(|r| r.session_name.clone())
                    .unwrap_or_default();
                if rc.is_failure() {
                    Err(GuestctlError::guest(GuestErrorKind::Session, rc, name))
                } else {
                    Err(GuestctlError::InvalidState(format!(
                        "session \"{}\" terminated while waiting",
                        name
                    )))
                }
            }
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.cid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_by_cid_resolves_once() {
        let reg = WaitEventRegistry::new(1, "s");
        let mut handle = reg.register(7, &[EventType::Reply]).unwrap();
        assert_eq!(handle.cid().object_id(), 7);
        assert_eq!(handle.cid().session_id(), 1);

        assert!(reg.signal_cid(handle.cid(), GuestRc::SUCCESS, EventPayload::Text("x".into())));
        // Second reply has nobody to go to.
        assert!(!reg.signal_cid(handle.cid(), GuestRc::SUCCESS, EventPayload::None));

        let signal = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(signal.payload, EventPayload::Text(ref t) if t == "x"));
    }

    #[tokio::test]
    async fn test_reply_reaches_only_its_request() {
        let reg = WaitEventRegistry::new(0, "s");
        let mut first = reg.register(4, &[EventType::FileRead, EventType::FileStateChanged]).unwrap();
        let mut second = reg.register(4, &[EventType::FileRead, EventType::FileStateChanged]).unwrap();

        // Wrong event type for that request.
        assert!(!reg.signal_reply(first.cid(), EventType::FileWrite, GuestRc::SUCCESS, EventPayload::None));

        assert!(reg.signal_reply(
            second.cid(),
            EventType::FileRead,
            GuestRc::SUCCESS,
            EventPayload::FileData(b"second".to_vec())
        ));
        assert!(reg.signal_reply(
            first.cid(),
            EventType::FileRead,
            GuestRc::SUCCESS,
            EventPayload::FileData(b"first".to_vec())
        ));

        let signal = first.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(signal.payload, EventPayload::FileData(ref d) if d == b"first"));
        let signal = second.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(signal.payload, EventPayload::FileData(ref d) if d == b"second"));
        assert_eq!(reg.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_drop_unregisters() {
        let reg = WaitEventRegistry::new(0, "s");
        let mut handle = reg.register(3, &[EventType::FileRead]).unwrap();
        let err = handle.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(reg.pending_count(), 1);
        drop(handle);
        assert_eq!(reg.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_signal_type_hits_only_matching_object_and_type() {
        let reg = WaitEventRegistry::new(0, "s");
        let mut a = reg
            .register(5, &[EventType::ProcessStateChanged, EventType::ProcessOutput])
            .unwrap();
        let _b = reg.register(6, &[EventType::ProcessStateChanged]).unwrap();
        let _c = reg.register(5, &[EventType::FileRead]).unwrap();

        let n = reg.signal_type(5, EventType::ProcessOutput, GuestRc::SUCCESS, EventPayload::None);
        assert_eq!(n, 1);
        let signal = a.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(signal.event, EventType::ProcessOutput);
        assert_eq!(reg.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_guest_failure_is_reported_via_into_result() {
        let reg = WaitEventRegistry::new(0, "s");
        let mut h = reg.register(2, &[EventType::Reply]).unwrap();
        reg.signal_cid(h.cid(), GuestRc::ACCESS_DENIED, EventPayload::None);
        let err = h
            .wait(Duration::from_secs(1))
            .await
            .unwrap()
            .into_result(GuestErrorKind::File, "/etc/shadow")
            .unwrap_err();
        assert_eq!(err.guest_rc(), Some(GuestRc::ACCESS_DENIED));
    }

    #[tokio::test]
    async fn test_cancel_object_unblocks_waiters() {
        let reg = WaitEventRegistry::new(0, "sess");
        let mut h = reg.register(9, &[EventType::ProcessStateChanged]).unwrap();
        let waiter = tokio::spawn(async move { h.wait(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;
        assert_eq!(reg.cancel_object(9, GuestRc::SUCCESS), 1);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, GuestctlError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_cancel_all_with_failure_code() {
        let reg = WaitEventRegistry::new(0, "sess");
        let mut h = reg.register(1, &[EventType::Reply]).unwrap();
        assert_eq!(reg.cancel_all(GuestRc::GENERAL_FAILURE), 1);
        let err = h.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.guest_rc(), Some(GuestRc::GENERAL_FAILURE));
    }

    #[test]
    fn test_deadline_budget() {
        assert!(Deadline::after(Duration::from_secs(60)).remaining().is_some());
        assert!(Deadline::after(Duration::ZERO).remaining().is_none());
        assert_eq!(Deadline::after(Duration::MAX).remaining(), Some(Duration::MAX));
    }

    #[test]
    fn test_context_counter_skips_pending_ids() {
        let reg = WaitEventRegistry::new(0, "s");
        let first = reg.register(4, &[EventType::Reply]).unwrap();
        let second = reg.register(4, &[EventType::Reply]).unwrap();
        assert_ne!(first.cid(), second.cid());
        assert_eq!(second.cid().count(), first.cid().count() + 1);
    }
}
