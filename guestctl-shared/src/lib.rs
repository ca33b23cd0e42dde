//! Guest control shared vocabulary
//!
//! This crate contains the error type, result codes, protocol constants and
//! message definitions used by the host-side session engine (guestctl) and
//! by anything that speaks for the guest side, such as test doubles.

pub mod constants;
pub mod errors;
pub mod flags;
pub mod protocol;

pub use errors::{ErrorCategory, GuestError, GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
pub use flags::*;
pub use protocol::*;
