//! A reliable, connection-oriented datagram transport on top of plain UDP,
//!  designed for peer-to-peer applications on overlay IPv6 networks where raw
//!  datagram delivery works but is lossy.
//!
//! ## Design goals
//!
//! * One UDP socket per endpoint multiplexes independent reliable
//!   conversations with many remote peers
//!   * peers are symmetric - there is no dedicated server vs. client role
//!   * a conversation is identified by the remote address; its two halves
//!     (send and receive) exist independently and are created lazily
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data as opposed to streams of bytes)
//!   * messages fit into a single packet; fragmentation above the per-packet
//!     cap is the application's business
//! * Per peer, messages are delivered in send order and at most once
//!   * a sliding window of unacknowledged packets, each with its own
//!     retransmission timer and a bounded retry budget
//!   * the receive side tracks one expected sequence number and re-ACKs
//!     recently acknowledged packets whose ACK was presumably lost
//! * Conversations open with a SYN handshake and end with a FIN handshake;
//!   closing a socket completes every conversation before releasing it
//! * A single task owns all protocol state and drives it off one in-queue
//!   (commands and received datagrams) plus a deadline-ordered timer queue -
//!   no locks, no shared mutation
//! * Failures surface as events: a peer that exhausts its retry budget raises
//!   `Timeout`, a completed shutdown raises `Closed`
//!
//! ## Wire format
//!
//! A datagram is one fixed-size record - header, then the payload area padded
//!  with zeros up to the configured cap. Multi-byte fields are big-endian:
//!
//! ```ascii
//! 0:  protocol version (u8)
//! 1:  packet type (u8): 1 DATA, 2 ACK, 4 SYN, 5 FIN
//! 2:  sequence number (u32 BE), wrap-around
//! 6:  payload length (i32 BE) - explicit, not inferred from datagram length
//! 10: payload (zero-padded to the configured per-packet cap)
//! ```
//!
//! The SYN carries a random initial sequence number; every DATA and the final
//!  FIN increment it before transmission. An ACK always carries the sequence
//!  number it expects next.
//!
//! ## Protocol phases
//!
//! Send half: `SYN_SENT` (handshake in flight) -> `OPEN` (window in use) ->
//!  `FIN_SENT` (goodbye in flight) -> finished once the FIN is acknowledged.
//!
//! Receive half: `OPENING` (SYN accepted, nothing delivered yet) -> `OPEN`
//!  (delivering in sequence) -> finished once the peer's FIN is acknowledged.

mod config;
mod dispatcher;
mod engine;
mod mailbox;
mod packet;
mod send_socket;
mod seqno;
mod session;
mod socket;
mod timer_queue;

pub use config::RudpConfig;
pub use dispatcher::{RudpDispatcher, RudpEvent, SocketId};
pub use engine::TransportEngine;
pub use mailbox::Mailbox;
pub use send_socket::SendSocket;
pub use socket::{EngineHandle, RudpSocket};
