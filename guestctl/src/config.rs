//! Configuration for the guest control engine.

use guestctl_shared::constants::{context, timeouts, transfer};
use guestctl_shared::errors::{GuestctlError, GuestctlResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Engine Options
// ============================================================================

/// Tunables shared by every session of a [`Guest`](crate::Guest).
///
/// All fields have defaults, so a partial JSON document is enough:
/// ```json
/// { "request_timeout_ms": 60000, "log": { "level": "debug" } }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuestctlOptions {
    /// Budget for a single request/reply round-trip.
    ///
    /// Default: 30000
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Budget for the session-start handshake.
    ///
    /// Default: 30000
    #[serde(default = "default_session_start_timeout_ms")]
    pub session_start_timeout_ms: u64,

    /// Retry policy for closing a session on local timeouts.
    #[serde(default)]
    pub close_retry: CloseRetryOptions,

    /// Chunk size for file copies and toolbox output reads.
    ///
    /// Default: 65536
    #[serde(default = "default_copy_chunk_size")]
    pub copy_chunk_size: usize,

    /// Live objects (directories, files, processes) allowed per session,
    /// including the two reserved IDs.
    ///
    /// Default: 2048
    #[serde(default = "default_max_objects")]
    pub max_objects: u32,

    /// Concurrent sessions per guest.
    ///
    /// Default: 32
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,

    /// Distinct facilities tracked per guest.
    ///
    /// Default: 64
    #[serde(default = "default_max_facilities")]
    pub max_facilities: usize,

    #[serde(default)]
    pub log: LogOptions,
}

fn default_request_timeout_ms() -> u64 {
    timeouts::DEFAULT_MS
}

fn default_session_start_timeout_ms() -> u64 {
    timeouts::SESSION_START_MS
}

fn default_copy_chunk_size() -> usize {
    transfer::CHUNK_SIZE
}

fn default_max_objects() -> u32 {
    context::MAX_OBJECTS
}

fn default_max_sessions() -> u32 {
    context::MAX_SESSIONS
}

fn default_max_facilities() -> usize {
    64
}

impl Default for GuestctlOptions {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            session_start_timeout_ms: default_session_start_timeout_ms(),
            close_retry: CloseRetryOptions::default(),
            copy_chunk_size: default_copy_chunk_size(),
            max_objects: default_max_objects(),
            max_sessions: default_max_sessions(),
            max_facilities: default_max_facilities(),
            log: LogOptions::default(),
        }
    }
}

impl GuestctlOptions {
    pub fn from_json_str(json: &str) -> GuestctlResult<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| GuestctlError::InvalidArgument(format!("invalid options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: &Path) -> GuestctlResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check limits against what the context ID layout can encode.
    pub fn validate(&self) -> GuestctlResult<()> {
        if self.max_objects < 3 || self.max_objects > context::MAX_OBJECTS {
            return Err(GuestctlError::InvalidArgument(format!(
                "max_objects must be within 3..={}, got {}",
                context::MAX_OBJECTS,
                self.max_objects
            )));
        }
        if self.max_sessions == 0 || self.max_sessions > context::MAX_SESSIONS {
            return Err(GuestctlError::InvalidArgument(format!(
                "max_sessions must be within 1..={}, got {}",
                context::MAX_SESSIONS,
                self.max_sessions
            )));
        }
        if self.copy_chunk_size == 0 {
            return Err(GuestctlError::InvalidArgument(
                "copy_chunk_size must not be zero".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn session_start_timeout(&self) -> Duration {
        Duration::from_millis(self.session_start_timeout_ms)
    }
}

/// Session-close retry policy.
///
/// Attempt `n` (0-based) waits `base_ms + n * step_ms`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseRetryOptions {
    #[serde(default = "default_close_attempts")]
    pub attempts: u32,
    #[serde(default = "default_close_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_close_step_ms")]
    pub step_ms: u64,
}

fn default_close_attempts() -> u32 {
    timeouts::SESSION_CLOSE_ATTEMPTS
}

fn default_close_base_ms() -> u64 {
    timeouts::SESSION_CLOSE_BASE_MS
}

fn default_close_step_ms() -> u64 {
    timeouts::SESSION_CLOSE_STEP_MS
}

impl Default for CloseRetryOptions {
    fn default() -> Self {
        Self {
            attempts: default_close_attempts(),
            base_ms: default_close_base_ms(),
            step_ms: default_close_step_ms(),
        }
    }
}

impl CloseRetryOptions {
    pub fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_ms + self.step_ms * attempt as u64)
    }
}

// ============================================================================
// Logging Options
// ============================================================================

/// Where and how much to log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogOptions {
    /// Filter used when `RUST_LOG` is unset.
    ///
    /// Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rolling log files. Logs go to stderr when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Log file name prefix inside `directory`.
    ///
    /// Default: "guestctl.log"
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub ansi: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file_prefix() -> String {
    "guestctl.log".to_string()
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            file_prefix: default_log_file_prefix(),
            ansi: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let opts = GuestctlOptions::default();
        assert_eq!(opts.request_timeout(), Duration::from_secs(30));
        assert_eq!(opts.copy_chunk_size, 64 * 1024);
        assert_eq!(opts.max_objects, 2048);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let opts =
            GuestctlOptions::from_json_str(r#"{"request_timeout_ms": 500, "log": {"level": "debug"}}"#)
                .unwrap();
        assert_eq!(opts.request_timeout_ms, 500);
        assert_eq!(opts.log.level, "debug");
        assert_eq!(opts.log.file_prefix, "guestctl.log");
        assert_eq!(opts.close_retry.attempts, 3);
    }

    #[test]
    fn test_close_retry_timeouts_grow() {
        let retry = CloseRetryOptions::default();
        assert_eq!(retry.timeout_for_attempt(0), Duration::from_secs(10));
        assert_eq!(retry.timeout_for_attempt(2), Duration::from_secs(20));
    }

    #[test]
    fn test_validate_rejects_unencodable_limits() {
        let opts = GuestctlOptions {
            max_objects: 4096,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let err = GuestctlOptions::from_json_str(r#"{"max_sessions": 0}"#).unwrap_err();
        assert!(matches!(err, GuestctlError::InvalidArgument(_)));
    }
}
