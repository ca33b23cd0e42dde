//! Message transport seam.
//!
//! The session engine never touches bytes on a wire. It hands
//! [`HostMessage`]s to a [`GuestChannel`] and receives replies through
//! [`Guest::dispatch`](crate::Guest::dispatch).

use async_trait::async_trait;
use guestctl_shared::errors::GuestctlResult;
use guestctl_shared::protocol::HostMessage;

/// Outbound half of the host/guest transport.
///
/// Implementations deliver the message to the in-guest service and return
/// once it has been queued. A send failure is a local transport error;
/// guest-side failures arrive later as callbacks.
#[async_trait]
pub trait GuestChannel: Send + Sync {
    async fn send(&self, message: HostMessage) -> GuestctlResult<()>;
}
