use crate::packet::Packet;
use crate::seqno::SeqNo;
use crate::timer_queue::TimerHandle;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SenderStatus {
    /// SYN transmitted, waiting for the peer to acknowledge it
    SynSent,
    /// handshake complete, window in use
    Open,
    /// FIN transmitted, waiting for the peer to acknowledge it
    FinSent,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReceiverStatus {
    /// SYN acknowledged, no in-order DATA seen yet
    Opening,
    Open,
}

/// One in-flight packet: the retransmittable copy, its retry count, and the
///  armed retransmission timer.
pub struct WindowSlot {
    pub packet: Packet,
    pub retries: u32,
    pub timer: Option<TimerHandle>,
}

/// Send half of a conversation with one peer.
///
/// The window is a packed prefix: slot 0 holds the oldest unacknowledged
///  packet, and a vacant slot implies all higher slots are vacant too. All
///  mutation goes through the accessors below, which preserve that shape.
pub struct SenderSession {
    pub status: SenderStatus,
    /// The last transmitted sequence number. The SYN stores its initial
    ///  random value as-is; every DATA and the FIN increment before
    ///  transmission.
    pub seqno: SeqNo,
    window: Vec<Option<WindowSlot>>,
    pub data_queue: VecDeque<Bytes>,
    pub syn_retries: u32,
    pub fin_retries: u32,
    pub syn_timer: Option<TimerHandle>,
    pub fin_timer: Option<TimerHandle>,
    /// true once our FIN has been acknowledged
    pub finished: bool,
}

impl SenderSession {
    pub fn new(initial_seqno: SeqNo, window_size: usize) -> SenderSession {
        SenderSession {
            status: SenderStatus::SynSent,
            seqno: initial_seqno,
            window: (0..window_size).map(|_| None).collect(),
            data_queue: VecDeque::new(),
            syn_retries: 0,
            fin_retries: 0,
            syn_timer: None,
            fin_timer: None,
            finished: false,
        }
    }

    pub fn window_is_empty(&self) -> bool {
        self.window[0].is_none()
    }

    pub fn window_is_full(&self) -> bool {
        self.window[self.window.len() - 1].is_some()
    }

    /// Index of the lowest vacant slot.
    pub fn first_free_slot(&self) -> Option<usize> {
        self.window.iter().position(|slot| slot.is_none())
    }

    pub fn occupy_slot(&mut self, index: usize, slot: WindowSlot) {
        debug_assert!(index == 0 || self.window[index - 1].is_some());
        debug_assert!(self.window[index].is_none());
        self.window[index] = Some(slot);
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut WindowSlot> {
        self.window.get_mut(index).and_then(|slot| slot.as_mut())
    }

    /// Sequence number of the oldest unacknowledged packet.
    pub fn oldest_seqno(&self) -> Option<SeqNo> {
        self.window[0].as_ref().map(|slot| slot.packet.seqno)
    }

    /// Detaches slot 0 and closes the gap, keeping the window a packed
    ///  prefix. The caller cancels the detached slot's timer.
    pub fn shift_window(&mut self) -> Option<WindowSlot> {
        let acked = self.window[0].take()?;
        self.window.rotate_left(1);
        Some(acked)
    }

    /// Slot holding the packet with the given sequence number.
    pub fn slot_index_for(&self, seqno: SeqNo) -> Option<usize> {
        self.window.iter().position(|slot|
            matches!(slot, Some(s) if s.packet.seqno == seqno)
        )
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.data_queue.is_empty() && self.window_is_empty()
    }

    pub fn armed_timers(&self) -> Vec<TimerHandle> {
        self.syn_timer.iter()
            .chain(self.fin_timer.iter())
            .copied()
            .chain(self.window.iter().flatten().filter_map(|slot| slot.timer))
            .collect()
    }
}

/// Receive half of a conversation with one peer.
pub struct ReceiverSession {
    pub status: ReceiverStatus,
    pub expected_seqno: SeqNo,
    /// true once the peer's FIN has been acknowledged
    pub finished: bool,
}

/// What to do with an arriving DATA packet.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DataDisposition {
    /// in sequence: deliver to the application and acknowledge
    Deliver,
    /// recently acknowledged - the ACK was presumably lost, refresh it
    ///  without delivering again
    AckOnly,
    /// outside the window, drop silently
    Drop,
}

impl ReceiverSession {
    pub fn new(expected_seqno: SeqNo) -> ReceiverSession {
        ReceiverSession {
            status: ReceiverStatus::Opening,
            expected_seqno,
            finished: false,
        }
    }

    pub fn classify_data(&self, seqno: SeqNo, window: u32) -> DataDisposition {
        if seqno == self.expected_seqno {
            DataDisposition::Deliver
        }
        else if seqno.is_at_or_after(self.expected_seqno.minus(window))
            && seqno.is_before(self.expected_seqno)
        {
            DataDisposition::AckOnly
        }
        else {
            DataDisposition::Drop
        }
    }
}

/// Conversation with one peer. Either half may be absent: the send half
///  exists once we first send to the peer, the receive half once we accept
///  its SYN.
pub struct Session {
    pub peer: SocketAddr,
    pub sender: Option<SenderSession>,
    pub receiver: Option<ReceiverSession>,
}

impl Session {
    pub fn for_peer(peer: SocketAddr) -> Session {
        Session { peer, sender: None, receiver: None }
    }

    /// Both halves have completed their close handshake; a half that was
    ///  never created has nothing left to do.
    pub fn is_finished(&self) -> bool {
        self.sender.as_ref().map_or(true, |s| s.finished)
            && self.receiver.as_ref().map_or(true, |r| r.finished)
    }
}
