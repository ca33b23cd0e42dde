//! Cancellable progress handles for long-running background operations.
//!
//! A [`Progress`] is shared between the worker task that drives an
//! operation and any number of observers. Cancellation is cooperative: the
//! worker polls [`Progress::set_progress`] or [`Progress::is_cancelled`] at
//! safe points. Completion happens exactly once.

use guestctl_shared::errors::{ErrorCategory, GuestRc, GuestctlError, GuestctlResult};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Failure recorded on a completed progress handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressFailure {
    pub category: ErrorCategory,
    pub message: String,
    pub guest_rc: Option<GuestRc>,
}

impl fmt::Display for ProgressFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProgressFailure {}

impl From<&GuestctlError> for ProgressFailure {
    fn from(err: &GuestctlError) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
            guest_rc: err.guest_rc(),
        }
    }
}

/// Snapshot of a progress handle.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub description: String,
    /// Zero-based index of the current operation.
    pub operation: u32,
    pub operation_count: u32,
    pub operation_description: String,
    /// Percent of the current operation.
    pub operation_percent: u32,
    pub cancelled: bool,
    pub completed: bool,
    pub result: Option<Result<(), ProgressFailure>>,
}

impl ProgressState {
    /// Overall percent across all operations.
    pub fn percent(&self) -> u32 {
        if self.completed {
            return 100;
        }
        let count = self.operation_count.max(1) as u64;
        let done = self.operation.min(self.operation_count) as u64 * 100 + self.operation_percent as u64;
        (done / count).min(100) as u32
    }
}

#[derive(Clone)]
pub struct Progress {
    state: Arc<watch::Sender<ProgressState>>,
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Progress").field(&*self.state.borrow()).finish()
    }
}

impl Progress {
    pub fn new(
        description: impl Into<String>,
        operation_count: u32,
        first_operation: impl Into<String>,
    ) -> Self {
        let (tx, _rx) = watch::channel(ProgressState {
            description: description.into(),
            operation: 0,
            operation_count: operation_count.max(1),
            operation_description: first_operation.into(),
            operation_percent: 0,
            cancelled: false,
            completed: false,
            result: None,
        });
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn state(&self) -> ProgressState {
        self.state.borrow().clone()
    }

    pub fn description(&self) -> String {
        self.state.borrow().description.clone()
    }

    pub fn percent(&self) -> u32 {
        self.state.borrow().percent()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().cancelled
    }

    pub fn is_completed(&self) -> bool {
        self.state.borrow().completed
    }

    /// Watch every state change.
    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.state.subscribe()
    }

    /// Request cancellation. Has no effect once completed.
    pub fn cancel(&self) {
        self.state.send_if_modified(|s| {
            if s.completed || s.cancelled {
                return false;
            }
            s.cancelled = true;
            true
        });
    }

    /// Update the current operation's percent.
    ///
    /// Fails with [`GuestctlError::Cancelled`] once cancellation was
    /// requested, so workers can bail out at this point.
    pub fn set_progress(&self, percent: u32) -> GuestctlResult<()> {
        let mut cancelled = false;
        self.state.send_if_modified(|s| {
            if s.cancelled {
                cancelled = true;
                return false;
            }
            if s.completed || s.operation_percent == percent.min(100) {
                return false;
            }
            s.operation_percent = percent.min(100);
            true
        });
        if cancelled {
            return Err(GuestctlError::Cancelled);
        }
        Ok(())
    }

    /// Move on to the next operation.
    pub fn set_next_operation(&self, description: impl Into<String>) -> GuestctlResult<()> {
        let description = description.into();
        let mut cancelled = false;
        self.state.send_if_modified(|s| {
            if s.cancelled {
                cancelled = true;
                return false;
            }
            if s.completed {
                return false;
            }
            if s.operation + 1 < s.operation_count {
                s.operation += 1;
            }
            s.operation_description = description;
            s.operation_percent = 0;
            true
        });
        if cancelled {
            return Err(GuestctlError::Cancelled);
        }
        Ok(())
    }

    /// Complete successfully. Returns false if already completed.
    pub fn complete_ok(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Complete with `err`.
    ///
    /// Ignored when already completed. A cancelled handle completes with a
    /// cancellation failure instead of `err`.
    pub fn complete_error(&self, err: &GuestctlError) -> bool {
        let failure = if self.is_cancelled() {
            ProgressFailure::from(&GuestctlError::Cancelled)
        } else {
            ProgressFailure::from(err)
        };
        self.complete(Err(failure))
    }

    fn complete(&self, result: Result<(), ProgressFailure>) -> bool {
        self.state.send_if_modified(|s| {
            if s.completed {
                return false;
            }
            if result.is_ok() {
                s.operation = s.operation_count.saturating_sub(1);
                s.operation_percent = 100;
            }
            s.completed = true;
            s.result = Some(result);
            true
        })
    }

    /// Wait until the handle is completed and return its outcome.
    pub async fn wait(&self) -> Result<(), ProgressFailure> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.completed)
            .await
            .map(|s| s.result.clone())
            .unwrap_or_else(|_| self.state.borrow().result.clone());
        state.unwrap_or_else(|| {
            Err(ProgressFailure::from(&GuestctlError::Internal(
                "progress dropped before completion".into(),
            )))
        })
    }

    /// Drive `work` on a background task and complete this handle with its
    /// result, including when the task panics.
    pub fn run_in_background<F>(&self, work: F)
    where
        F: Future<Output = GuestctlResult<()>> + Send + 'static,
    {
        let progress = self.clone();
        let worker = tokio::spawn(work);
        tokio::spawn(async move {
            match worker.await {
                Ok(Ok(())) => {
                    progress.complete_ok();
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Background operation failed");
                    progress.complete_error(&e);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "Background operation aborted");
                    progress.complete_error(&GuestctlError::Internal(join_err.to_string()));
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_exactly_once() {
        let p = Progress::new("copy", 2, "first");
        assert!(p.complete_ok());
        assert!(!p.complete_error(&GuestctlError::Internal("late".into())));
        assert_eq!(p.state().result, Some(Ok(())));
        assert_eq!(p.percent(), 100);
    }

    #[test]
    fn test_cancel_rejects_progress_updates() {
        let p = Progress::new("copy", 1, "op");
        p.set_progress(10).unwrap();
        p.cancel();
        assert!(matches!(p.set_progress(20), Err(GuestctlError::Cancelled)));
        assert!(p.set_next_operation("next").is_err());
    }

    #[test]
    fn test_error_on_cancelled_handle_reports_cancellation() {
        let p = Progress::new("copy", 1, "op");
        p.cancel();
        p.complete_error(&GuestctlError::NotFound("x".into()));
        let failure = p.state().result.unwrap().unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Cancelled);
    }

    #[test]
    fn test_overall_percent_spans_operations() {
        let p = Progress::new("copy", 4, "op0");
        p.set_progress(100).unwrap();
        p.set_next_operation("op1").unwrap();
        p.set_progress(50).unwrap();
        assert_eq!(p.percent(), 37);
    }

    #[tokio::test]
    async fn test_background_completion() {
        let p = Progress::new("work", 1, "op");
        p.run_in_background(async { Err(GuestctlError::NotFound("gone".into())) });
        let failure = p.wait().await.unwrap_err();
        assert_eq!(failure.category, ErrorCategory::NotFound);
        assert!(p.is_completed());
    }

    #[tokio::test]
    async fn test_background_panic_still_completes() {
        let p = Progress::new("work", 1, "op");
        let explode = true;
        p.run_in_background(async move {
            if explode {
                panic!("worker blew up");
            }
            Ok(())
        });
        let failure = p.wait().await.unwrap_err();
        assert_eq!(failure.category, ErrorCategory::Internal);
    }
}
