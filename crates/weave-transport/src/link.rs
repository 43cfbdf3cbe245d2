//! Link trait

use weave_core::SyncResult;
use weave_wire::Request;

/// The boundary between the sync engine and a concrete connection
///
/// All three operations are non-blocking; the tick loop calls them once
/// per tick and never waits on the network.
pub trait Link: Send {
    /// Whether the link is usable right now
    ///
    /// When it is not, the implementation starts (rate-limited)
    /// reconnection in the background and returns `false`; a later tick
    /// observes the recovered connection.
    fn ensure_connected(&mut self) -> bool;

    /// Queue one request for transmission
    fn send(&mut self, request: &Request) -> SyncResult<()>;

    /// Drain the requests received since the previous poll
    fn poll(&mut self) -> Vec<Request>;
}
