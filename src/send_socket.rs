use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Abstraction for pushing one finished wire record out of a UDP socket,
///  introduced to facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", packet_buf.len(), to);

        // a send failure is indistinguishable from loss on the wire, and the
        //  retransmission timer covers both
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}
