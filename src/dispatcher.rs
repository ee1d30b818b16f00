use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

/// Identifies one transport socket within its engine.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SocketId(pub(crate) u64);

impl Display for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Asynchronous conditions surfaced to the application.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RudpEvent {
    /// A peer exhausted the retransmission budget. The session is left in
    ///  place - it is the application's call whether to keep the socket.
    Timeout,
    /// The socket completed its close handshake with every peer and is
    ///  released. No packets are sent on it afterwards.
    Closed,
}

/// Application-facing callbacks, invoked synchronously from the engine's
///  event loop. Implementations must not block; an `Err` from either method
///  aborts the event loop with that error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RudpDispatcher: Send + Sync + 'static {
    /// Called exactly once per application payload, in send order per peer.
    async fn on_message(&self, socket: SocketId, from: SocketAddr, payload: &[u8]) -> anyhow::Result<()>;

    /// `peer` is `None` for a `Closed` event on a socket without a surviving
    ///  session.
    async fn on_event(&self, socket: SocketId, event: RudpEvent, peer: Option<SocketAddr>) -> anyhow::Result<()>;
}
