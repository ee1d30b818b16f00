use crate::config::RudpConfig;
use crate::dispatcher::{RudpDispatcher, SocketId};
use crate::engine::{Command, EngineInput};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Cloneable entry point for creating sockets on a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) tx: mpsc::Sender<EngineInput>,
    pub(crate) config: Arc<RudpConfig>,
}

impl EngineHandle {
    /// Binds an IPv6 UDP socket to `[::]:port` (port `0` for an ephemeral
    ///  port) and registers it with the engine. The dispatcher receives this
    ///  socket's payloads and events.
    pub async fn create_socket(&self, port: u16, dispatcher: Arc<dyn RudpDispatcher>) -> anyhow::Result<RudpSocket> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(EngineInput::Command(Command::CreateSocket { port, dispatcher, reply: reply_tx })).await
            .map_err(|_| anyhow!("transport engine is shut down"))?;

        let (id, local_addr) = reply_rx.await
            .map_err(|_| anyhow!("transport engine is shut down"))??;

        Ok(RudpSocket {
            id,
            local_addr,
            tx: self.tx.clone(),
            config: self.config.clone(),
        })
    }
}

/// Handle to one reliable socket. Payloads to the same peer arrive there in
///  send order, without duplicates.
#[derive(Clone)]
pub struct RudpSocket {
    id: SocketId,
    local_addr: SocketAddr,
    tx: mpsc::Sender<EngineInput>,
    config: Arc<RudpConfig>,
}

impl RudpSocket {
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hands one payload to the engine for reliable delivery. Success means
    ///  the payload is accepted, not that the peer received it - delivery
    ///  failures surface as a `Timeout` event.
    pub async fn send_to(&self, payload: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        if payload.len() > self.config.max_payload {
            bail!("payload of {} bytes exceeds the per-packet cap of {}", payload.len(), self.config.max_payload);
        }

        self.tx.send(EngineInput::Command(Command::Send {
            socket: self.id,
            to,
            payload: Bytes::copy_from_slice(payload),
        })).await
            .map_err(|_| anyhow!("transport engine is shut down"))
    }

    /// Requests an orderly shutdown: queued payloads drain, every peer gets a
    ///  FIN, and once all conversations are finished the socket is released
    ///  and a `Closed` event is raised. Returns immediately.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.tx.send(EngineInput::Command(Command::Close { socket: self.id })).await
            .map_err(|_| anyhow!("transport engine is shut down"))
    }
}
