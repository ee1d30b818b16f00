use crate::dispatcher::{RudpDispatcher, RudpEvent, SocketId};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::Mutex;

/// Dispatcher that parks received payloads in per-peer FIFO queues for the
///  application to poll, for callers that prefer a `recvfrom`-style workflow
///  over callbacks. Events are recorded for inspection the same way.
#[derive(Default)]
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
}

#[derive(Default)]
struct MailboxInner {
    messages: FxHashMap<(SocketId, SocketAddr), VecDeque<Vec<u8>>>,
    events: Vec<(SocketId, RudpEvent, Option<SocketAddr>)>,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox::default()
    }

    /// The oldest undelivered payload from `from`, if any.
    pub async fn try_recv(&self, socket: SocketId, from: SocketAddr) -> Option<Vec<u8>> {
        self.inner.lock().await
            .messages.get_mut(&(socket, from))
            .and_then(|queue| queue.pop_front())
    }

    pub async fn events(&self) -> Vec<(SocketId, RudpEvent, Option<SocketAddr>)> {
        self.inner.lock().await.events.clone()
    }
}

#[async_trait]
impl RudpDispatcher for Mailbox {
    async fn on_message(&self, socket: SocketId, from: SocketAddr, payload: &[u8]) -> anyhow::Result<()> {
        self.inner.lock().await
            .messages.entry((socket, from))
            .or_default()
            .push_back(payload.to_vec());
        Ok(())
    }

    async fn on_event(&self, socket: SocketId, event: RudpEvent, peer: Option<SocketAddr>) -> anyhow::Result<()> {
        self.inner.lock().await
            .events.push((socket, event, peer));
        Ok(())
    }
}
