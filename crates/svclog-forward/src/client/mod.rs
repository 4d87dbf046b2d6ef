pub mod buffer;
pub mod loki;
pub mod otel;
pub mod syslog;

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::error::ForwardError;
use crate::puller::PulledEntry;

/// A stateful, single-threaded object specific to one target.
///
/// Only the owning gatherer's main loop ever calls into a client, so
/// implementations need no internal synchronisation of their own — the
/// `Send` bound exists only so the gatherer's task can hold one across
/// `.await` points.
#[async_trait::async_trait]
pub trait Client: Send {
    /// Enqueues one entry. Implementations may flush implicitly, though
    /// none of the ones in this crate do: batching timing is entirely the
    /// gatherer's call.
    fn add(&mut self, entry: PulledEntry);

    /// Attempts to deliver buffered entries, respecting `cancel` promptly.
    /// Returns the first non-recoverable error, or `Ok(())` if nothing
    /// needed delivering or everything was delivered.
    async fn flush(&mut self, cancel: &CancellationToken) -> Result<(), ForwardError>;

    /// Installs (`Some`) or drops (`None`) the labels this client tags
    /// `service`'s entries with.
    fn set_labels(&mut self, service: &str, labels: Option<HashMap<String, String>>);

    /// Releases transport resources. Most clients have nothing to do here;
    /// the syslog client drops its persistent connection.
    async fn close(&mut self) {}
}
