use crate::config::RudpConfig;
use crate::dispatcher::{RudpDispatcher, RudpEvent, SocketId};
use crate::packet::{Packet, PacketType};
use crate::send_socket::SendSocket;
use crate::seqno::SeqNo;
use crate::session::{
    DataDisposition, ReceiverSession, ReceiverStatus, SenderSession, SenderStatus, Session,
    WindowSlot,
};
use crate::socket::EngineHandle;
use crate::timer_queue::{TimerHandle, TimerQueue};
use bytes::{Bytes, BytesMut};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Capacity of the engine's in-queue. Senders briefly block when the loop
///  falls behind, which doubles as backpressure.
const IN_QUEUE_DEPTH: usize = 256;

pub(crate) enum EngineInput {
    Command(Command),
    Datagram { socket: SocketId, from: SocketAddr, data: Bytes },
}

pub(crate) enum Command {
    CreateSocket {
        port: u16,
        dispatcher: Arc<dyn RudpDispatcher>,
        reply: oneshot::Sender<anyhow::Result<(SocketId, SocketAddr)>>,
    },
    Send {
        socket: SocketId,
        to: SocketAddr,
        payload: Bytes,
    },
    Close {
        socket: SocketId,
    },
}

/// Which retransmittable packet a timer belongs to. Resolved against the
///  registry when the timer fires; an entry whose socket or session is gone
///  by then is a no-op.
#[derive(Copy, Clone, Debug)]
enum RetransmitTarget {
    Syn { socket: SocketId, peer: SocketAddr },
    Fin { socket: SocketId, peer: SocketAddr },
    Data { socket: SocketId, peer: SocketAddr, seqno: SeqNo },
}

struct SocketState {
    send_socket: Arc<dyn SendSocket>,
    reader: Option<JoinHandle<()>>,
    close_requested: bool,
    sessions: FxHashMap<SocketAddr, Session>,
    dispatcher: Arc<dyn RudpDispatcher>,
}

/// The place where all other parts of the protocol come together: the engine
///  owns every socket, session, timer and the RNG, and `run` is the event
///  loop that exclusively drives them.
///
/// Cross-thread entry points (socket creation, send, close) are marshaled
///  through an in-queue; per-socket reader tasks feed received datagrams into
///  the same queue. State is therefore never shared and never locked.
pub struct TransportEngine {
    config: Arc<RudpConfig>,
    rx: mpsc::Receiver<EngineInput>,
    tx: mpsc::Sender<EngineInput>,
    sockets: FxHashMap<SocketId, SocketState>,
    timers: TimerQueue<RetransmitTarget>,
    rng: SmallRng,
    next_socket_id: u64,
}

impl TransportEngine {
    pub fn new(config: RudpConfig) -> anyhow::Result<(TransportEngine, EngineHandle)> {
        config.validate()?;
        let config = Arc::new(config);

        let (tx, rx) = mpsc::channel(IN_QUEUE_DEPTH);
        let handle = EngineHandle { tx: tx.clone(), config: config.clone() };

        let engine = TransportEngine {
            config,
            rx,
            tx,
            sockets: FxHashMap::default(),
            timers: TimerQueue::new(),
            rng: SmallRng::from_os_rng(),
            next_socket_id: 0,
        };
        Ok((engine, handle))
    }

    /// Drives the engine until nothing can wake it again: every socket has
    ///  been released by the close cascade and the last `EngineHandle` is
    ///  dropped. Awaiting the returned future before process exit guarantees
    ///  that pending close handshakes have flushed.
    ///
    /// Returns early with an error when an application callback fails.
    pub async fn run(mut self) -> anyhow::Result<()> {
        debug!("starting transport event loop");
        loop {
            let next_deadline = self.timers.next_deadline();
            tokio::select! {
                input = self.rx.recv() => {
                    match input {
                        Some(EngineInput::Command(command)) => self.on_command(command).await?,
                        Some(EngineInput::Datagram { socket, from, data }) => self.on_datagram(socket, from, data).await?,
                        None => {
                            debug!("all sockets released and all handles dropped, stopping transport event loop");
                            return Ok(());
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    self.on_timer().await?;
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::CreateSocket { port, dispatcher, reply } => {
                let result = self.create_socket(port, dispatcher).await;
                // the caller may have given up waiting
                let _ = reply.send(result);
                Ok(())
            }
            Command::Send { socket, to, payload } => self.on_send(socket, to, payload).await,
            Command::Close { socket } => self.on_close(socket).await,
        }
    }

    async fn create_socket(
        &mut self,
        port: u16,
        dispatcher: Arc<dyn RudpDispatcher>,
    ) -> anyhow::Result<(SocketId, SocketAddr)> {
        let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)).await?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let id = self.allocate_socket_id();
        let reader = self.spawn_reader(id, socket.clone());
        self.sockets.insert(id, SocketState {
            send_socket: Arc::new(socket),
            reader: Some(reader),
            close_requested: false,
            sessions: FxHashMap::default(),
            dispatcher,
        });

        info!("bound socket {} to {:?}", id, local_addr);
        Ok((id, local_addr))
    }

    fn allocate_socket_id(&mut self) -> SocketId {
        let id = SocketId(self.next_socket_id);
        self.next_socket_id += 1;
        id
    }

    fn spawn_reader(&self, id: SocketId, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let tx = self.tx.clone();
        let record_len = self.config.record_len();
        tokio::spawn(async move {
            let mut buf = vec![0u8; record_len];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((num_read, from)) => {
                        let data = Bytes::copy_from_slice(&buf[..num_read]);
                        if tx.send(EngineInput::Datagram { socket: id, from, data }).await.is_err() {
                            // the engine is gone
                            break;
                        }
                    }
                    Err(e) => {
                        error!("socket error on {}: {}", id, e);
                        continue;
                    }
                }
            }
        })
    }

    /// Send-path classification: a fresh peer gets a SYN, an open idle window
    ///  slot gets the payload immediately, everything else queues.
    async fn on_send(&mut self, socket_id: SocketId, to: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        enum Staged {
            Syn(SeqNo),
            Data(usize, Packet),
            Queued,
        }

        let staged = {
            let Some(state) = self.sockets.get_mut(&socket_id) else {
                warn!("send on unknown socket {}, ignoring", socket_id);
                return Ok(());
            };
            let session = state.sessions.entry(to).or_insert_with(|| Session::for_peer(to));

            match &mut session.sender {
                None => {
                    // first payload for this peer: open the conversation
                    let initial_seqno = SeqNo::from_raw(self.rng.random());
                    let mut sender = SenderSession::new(initial_seqno, self.config.window);
                    sender.data_queue.push_back(payload);
                    session.sender = Some(sender);
                    Staged::Syn(initial_seqno)
                }
                Some(sender) => {
                    if sender.status == SenderStatus::Open
                        && sender.data_queue.is_empty()
                        && !sender.window_is_full()
                    {
                        sender.seqno = sender.seqno.next();
                        let packet = Packet::data(sender.seqno, payload);
                        let index = sender.first_free_slot().expect("window was just checked to have room");
                        sender.occupy_slot(index, WindowSlot { packet: packet.clone(), retries: 0, timer: None });
                        Staged::Data(index, packet)
                    }
                    else {
                        sender.data_queue.push_back(payload);
                        Staged::Queued
                    }
                }
            }
        };

        match staged {
            Staged::Syn(seqno) => {
                debug!("opening conversation with {:?} on socket {}", to, socket_id);
                let timer = self.transmit(socket_id, to, &Packet::syn(seqno)).await;
                if let Some(sender) = self.sender_mut(socket_id, to) {
                    sender.syn_timer = timer;
                }
            }
            Staged::Data(index, packet) => {
                let timer = self.transmit(socket_id, to, &packet).await;
                if let Some(sender) = self.sender_mut(socket_id, to) {
                    if let Some(slot) = sender.slot_mut(index) {
                        slot.timer = timer;
                    }
                }
            }
            Staged::Queued => {
                trace!("queueing payload for {:?} on socket {}", to, socket_id);
            }
        }
        Ok(())
    }

    async fn on_close(&mut self, socket_id: SocketId) -> anyhow::Result<()> {
        let Some(state) = self.sockets.get_mut(&socket_id) else {
            warn!("close on unknown socket {}, ignoring", socket_id);
            return Ok(());
        };
        state.close_requested = true;
        debug!("close requested for socket {}", socket_id);

        self.send_pending_fins(socket_id).await;
        self.try_close_cascade(socket_id, None).await
    }

    async fn on_datagram(&mut self, socket_id: SocketId, from: SocketAddr, data: Bytes) -> anyhow::Result<()> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "packet_received", ?correlation_id);
        self.process_datagram(socket_id, from, data).instrument(span).await
    }

    async fn process_datagram(&mut self, socket_id: SocketId, from: SocketAddr, data: Bytes) -> anyhow::Result<()> {
        if !self.sockets.contains_key(&socket_id) {
            // the reader task raced with the close cascade
            return Ok(());
        }

        let packet = match Packet::deser(&data[..], self.config.max_payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("received unparsable packet from {:?}, dropping: {}", from, e);
                return Ok(());
            }
        };

        trace!("received {:?} packet from {:?} seqno={} on socket {}", packet.packet_type, from, packet.seqno, socket_id);

        match packet.packet_type {
            PacketType::Syn => self.on_syn(socket_id, from, packet.seqno).await,
            PacketType::Ack => self.on_ack(socket_id, from, packet.seqno).await,
            PacketType::Data => self.on_data(socket_id, from, packet).await,
            PacketType::Fin => self.on_fin(socket_id, from, packet.seqno).await,
        }
    }

    async fn on_syn(&mut self, socket_id: SocketId, from: SocketAddr, seqno: SeqNo) -> anyhow::Result<()> {
        let expected_seqno = seqno.next();

        let accepted = {
            let Some(state) = self.sockets.get_mut(&socket_id) else { return Ok(()); };
            let session = state.sessions.entry(from).or_insert_with(|| Session::for_peer(from));

            match &session.receiver {
                // fresh peer, or a SYN retransmit while the handshake is
                //  still settling: (re)initialize the receive half
                None => {
                    debug!("accepting conversation from {:?} on socket {}", from, socket_id);
                    session.receiver = Some(ReceiverSession::new(expected_seqno));
                    true
                }
                Some(receiver) if receiver.status == ReceiverStatus::Opening => {
                    session.receiver = Some(ReceiverSession::new(expected_seqno));
                    true
                }
                Some(_) => {
                    trace!("SYN from {:?} on an established receive side, ignoring", from);
                    false
                }
            }
        };

        if accepted {
            self.transmit(socket_id, from, &Packet::ack(expected_seqno)).await;
        }
        Ok(())
    }

    async fn on_ack(&mut self, socket_id: SocketId, from: SocketAddr, ack_seqno: SeqNo) -> anyhow::Result<()> {
        let mut window_advanced = false;
        let mut fin_acked = false;
        {
            let Some(state) = self.sockets.get_mut(&socket_id) else { return Ok(()); };
            let Some(sender) = state.sessions.get_mut(&from).and_then(|s| s.sender.as_mut()) else {
                trace!("ACK from {:?} without a send session, dropping", from);
                return Ok(());
            };

            match sender.status {
                SenderStatus::SynSent => {
                    if ack_seqno == sender.seqno.next() {
                        if let Some(timer) = sender.syn_timer.take() {
                            self.timers.cancel(timer);
                        }
                        sender.status = SenderStatus::Open;
                        debug!("SYN to {:?} acknowledged, session open", from);
                        window_advanced = true;
                    }
                    else {
                        trace!("ACK {} does not match the SYN in flight, ignoring", ack_seqno);
                    }
                }
                SenderStatus::Open => {
                    match sender.oldest_seqno() {
                        Some(oldest) if ack_seqno == oldest.next() => {
                            let acked = sender.shift_window().expect("window head was just checked");
                            if let Some(timer) = acked.timer {
                                self.timers.cancel(timer);
                            }
                            trace!("ACK {} advances the window for {:?}", ack_seqno, from);
                            window_advanced = true;
                        }
                        _ => {
                            trace!("ACK {} does not match the oldest unacknowledged packet, ignoring", ack_seqno);
                        }
                    }
                }
                SenderStatus::FinSent => {
                    if ack_seqno == sender.seqno.next() {
                        if let Some(timer) = sender.fin_timer.take() {
                            self.timers.cancel(timer);
                        }
                        sender.finished = true;
                        debug!("FIN to {:?} acknowledged", from);
                        fin_acked = true;
                    }
                    else {
                        trace!("ACK {} does not match the FIN in flight, ignoring", ack_seqno);
                    }
                }
            }
        }

        if window_advanced {
            self.fill_window(socket_id, from).await;
            self.send_pending_fins(socket_id).await;
        }
        if fin_acked {
            self.try_close_cascade(socket_id, Some(from)).await?;
        }
        Ok(())
    }

    async fn on_data(&mut self, socket_id: SocketId, from: SocketAddr, packet: Packet) -> anyhow::Result<()> {
        enum Staged {
            Deliver(SeqNo),
            AckOnly(SeqNo),
            Drop,
        }

        let staged = {
            let Some(state) = self.sockets.get_mut(&socket_id) else { return Ok(()); };
            let Some(receiver) = state.sessions.get_mut(&from).and_then(|s| s.receiver.as_mut()) else {
                trace!("DATA from {:?} without a receive session, dropping", from);
                return Ok(());
            };

            if receiver.status == ReceiverStatus::Opening && packet.seqno == receiver.expected_seqno {
                receiver.status = ReceiverStatus::Open;
            }

            match receiver.classify_data(packet.seqno, self.config.window as u32) {
                DataDisposition::Deliver => {
                    receiver.expected_seqno = packet.seqno.next();
                    Staged::Deliver(receiver.expected_seqno)
                }
                DataDisposition::AckOnly => Staged::AckOnly(packet.seqno.next()),
                DataDisposition::Drop => Staged::Drop,
            }
        };

        match staged {
            Staged::Deliver(ack_seqno) => {
                self.transmit(socket_id, from, &Packet::ack(ack_seqno)).await;
                let dispatcher = self.sockets.get(&socket_id).map(|state| state.dispatcher.clone());
                if let Some(dispatcher) = dispatcher {
                    dispatcher.on_message(socket_id, from, &packet.payload).await?;
                }
            }
            Staged::AckOnly(ack_seqno) => {
                trace!("repeated DATA from {:?}, refreshing the lost ACK", from);
                self.transmit(socket_id, from, &Packet::ack(ack_seqno)).await;
            }
            Staged::Drop => {
                trace!("DATA from {:?} outside the receive window, dropping", from);
            }
        }
        Ok(())
    }

    async fn on_fin(&mut self, socket_id: SocketId, from: SocketAddr, seqno: SeqNo) -> anyhow::Result<()> {
        let acknowledged = {
            let Some(state) = self.sockets.get_mut(&socket_id) else { return Ok(()); };
            let Some(receiver) = state.sessions.get_mut(&from).and_then(|s| s.receiver.as_mut()) else {
                trace!("FIN from {:?} without a receive session, dropping", from);
                return Ok(());
            };

            if receiver.status != ReceiverStatus::Open {
                trace!("FIN from {:?} before the session opened, ignoring", from);
                false
            }
            else if seqno != receiver.expected_seqno {
                trace!("FIN {} does not match the expected sequence number, ignoring", seqno);
                false
            }
            else {
                debug!("FIN from {:?} acknowledged, receive side finished", from);
                receiver.finished = true;
                true
            }
        };

        if acknowledged {
            self.transmit(socket_id, from, &Packet::ack(seqno.next())).await;
            self.try_close_cascade(socket_id, Some(from)).await?;
        }
        Ok(())
    }

    /// Moves queued payloads into free window slots, transmitting each as
    ///  DATA. Always targets the lowest free slot, keeping the window a
    ///  packed prefix.
    async fn fill_window(&mut self, socket_id: SocketId, peer: SocketAddr) {
        loop {
            let staged = {
                let Some(state) = self.sockets.get_mut(&socket_id) else { return; };
                let Some(sender) = state.sessions.get_mut(&peer).and_then(|s| s.sender.as_mut()) else { return; };
                if sender.status != SenderStatus::Open {
                    return;
                }
                match (sender.first_free_slot(), sender.data_queue.front()) {
                    (Some(index), Some(_)) => {
                        let payload = sender.data_queue.pop_front().expect("queue head was just checked");
                        sender.seqno = sender.seqno.next();
                        let packet = Packet::data(sender.seqno, payload);
                        sender.occupy_slot(index, WindowSlot { packet: packet.clone(), retries: 0, timer: None });
                        Some((index, packet))
                    }
                    _ => None,
                }
            };

            let Some((index, packet)) = staged else { return; };
            let timer = self.transmit(socket_id, peer, &packet).await;
            if let Some(sender) = self.sender_mut(socket_id, peer) {
                if let Some(slot) = sender.slot_mut(index) {
                    slot.timer = timer;
                }
            }
        }
    }

    /// While a close is pending, every sender that has drained its queue and
    ///  window says goodbye with a FIN.
    async fn send_pending_fins(&mut self, socket_id: SocketId) {
        let peers: Vec<SocketAddr> = {
            let Some(state) = self.sockets.get(&socket_id) else { return; };
            if !state.close_requested {
                return;
            }
            state.sessions.values()
                .filter(|session| matches!(
                    &session.sender,
                    Some(sender) if sender.status == SenderStatus::Open && !sender.finished && sender.is_idle()
                ))
                .map(|session| session.peer)
                .collect()
        };

        for peer in peers {
            let seqno = {
                let Some(sender) = self.sender_mut(socket_id, peer) else { continue; };
                sender.seqno = sender.seqno.next();
                sender.status = SenderStatus::FinSent;
                sender.seqno
            };
            debug!("sending FIN to {:?} on socket {}", peer, socket_id);
            let timer = self.transmit(socket_id, peer, &Packet::fin(seqno)).await;
            if let Some(sender) = self.sender_mut(socket_id, peer) {
                sender.fin_timer = timer;
            }
        }
    }

    /// Tears the socket down once a close is pending and every session half
    ///  has completed its handshake. A no-op otherwise - it is re-attempted
    ///  on every finishing event.
    async fn try_close_cascade(&mut self, socket_id: SocketId, peer: Option<SocketAddr>) -> anyhow::Result<()> {
        let all_done = {
            let Some(state) = self.sockets.get(&socket_id) else { return Ok(()); };
            state.close_requested && state.sessions.values().all(|session| session.is_finished())
        };
        if !all_done {
            return Ok(());
        }

        let Some(mut state) = self.sockets.remove(&socket_id) else { return Ok(()); };
        debug!("all sessions finished, releasing socket {}", socket_id);

        // sweep any timer that is somehow still armed
        for session in state.sessions.values() {
            if let Some(sender) = &session.sender {
                for timer in sender.armed_timers() {
                    self.timers.cancel(timer);
                }
            }
        }
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        let dispatcher = state.dispatcher.clone();
        // dropping the state closes the underlying descriptor
        drop(state);

        dispatcher.on_event(socket_id, RudpEvent::Closed, peer).await
    }

    async fn on_timer(&mut self) -> anyhow::Result<()> {
        let Some(target) = self.timers.pop_due(Instant::now()) else { return Ok(()); };
        match target {
            RetransmitTarget::Syn { socket, peer } => self.on_syn_timer(socket, peer).await,
            RetransmitTarget::Fin { socket, peer } => self.on_fin_timer(socket, peer).await,
            RetransmitTarget::Data { socket, peer, seqno } => self.on_data_timer(socket, peer, seqno).await,
        }
    }

    async fn on_syn_timer(&mut self, socket_id: SocketId, peer: SocketAddr) -> anyhow::Result<()> {
        let max_retransmissions = self.config.max_retransmissions;
        let seqno = {
            let Some(sender) = self.sender_mut(socket_id, peer) else { return Ok(()); };
            if sender.status != SenderStatus::SynSent {
                return Ok(());
            }
            sender.syn_timer = None;

            if sender.syn_retries >= max_retransmissions {
                debug!("SYN to {:?} exhausted the retransmission budget", peer);
                return self.report_timeout(socket_id, peer).await;
            }
            sender.syn_retries += 1;
            trace!("retransmitting SYN to {:?} (attempt {})", peer, sender.syn_retries);
            sender.seqno
        };

        let timer = self.transmit(socket_id, peer, &Packet::syn(seqno)).await;
        if let Some(sender) = self.sender_mut(socket_id, peer) {
            sender.syn_timer = timer;
        }
        Ok(())
    }

    async fn on_fin_timer(&mut self, socket_id: SocketId, peer: SocketAddr) -> anyhow::Result<()> {
        let max_retransmissions = self.config.max_retransmissions;
        let seqno = {
            let Some(sender) = self.sender_mut(socket_id, peer) else { return Ok(()); };
            if sender.status != SenderStatus::FinSent || sender.finished {
                return Ok(());
            }
            sender.fin_timer = None;

            if sender.fin_retries >= max_retransmissions {
                debug!("FIN to {:?} exhausted the retransmission budget", peer);
                return self.report_timeout(socket_id, peer).await;
            }
            sender.fin_retries += 1;
            trace!("retransmitting FIN to {:?} (attempt {})", peer, sender.fin_retries);
            sender.seqno
        };

        let timer = self.transmit(socket_id, peer, &Packet::fin(seqno)).await;
        if let Some(sender) = self.sender_mut(socket_id, peer) {
            sender.fin_timer = timer;
        }
        Ok(())
    }

    async fn on_data_timer(&mut self, socket_id: SocketId, peer: SocketAddr, seqno: SeqNo) -> anyhow::Result<()> {
        let max_retransmissions = self.config.max_retransmissions;
        let staged = {
            let Some(sender) = self.sender_mut(socket_id, peer) else { return Ok(()); };
            // the packet may have been acknowledged in the meantime
            let Some(index) = sender.slot_index_for(seqno) else { return Ok(()); };
            let slot = sender.slot_mut(index).expect("slot index was just resolved");
            slot.timer = None;

            if slot.retries >= max_retransmissions {
                None
            }
            else {
                slot.retries += 1;
                trace!("retransmitting DATA {} to {:?} (attempt {})", seqno, peer, slot.retries);
                Some(slot.packet.clone())
            }
        };

        match staged {
            None => {
                debug!("DATA {} to {:?} exhausted the retransmission budget", seqno, peer);
                self.report_timeout(socket_id, peer).await
            }
            Some(packet) => {
                let timer = self.transmit(socket_id, peer, &packet).await;
                if let Some(sender) = self.sender_mut(socket_id, peer) {
                    if let Some(index) = sender.slot_index_for(seqno) {
                        if let Some(slot) = sender.slot_mut(index) {
                            slot.timer = timer;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    async fn report_timeout(&mut self, socket_id: SocketId, peer: SocketAddr) -> anyhow::Result<()> {
        let Some(state) = self.sockets.get(&socket_id) else { return Ok(()); };
        let dispatcher = state.dispatcher.clone();
        dispatcher.on_event(socket_id, RudpEvent::Timeout, Some(peer)).await
    }

    /// Serializes and transmits one packet. ACKs are fire-and-forget; every
    ///  other type gets a retransmission timer whose handle the caller stores
    ///  in the owning session slot. The debug loss hook swallows the
    ///  transmission but still arms the timer.
    async fn transmit(&mut self, socket_id: SocketId, to: SocketAddr, packet: &Packet) -> Option<TimerHandle> {
        let Some(state) = self.sockets.get(&socket_id) else { return None; };
        let send_socket = state.send_socket.clone();

        trace!("sending {:?} packet to {:?} seqno={} on socket {}", packet.packet_type, to, packet.seqno, socket_id);

        if self.config.drop_one_in != 0 && self.rng.random_range(0..self.config.drop_one_in) == 0 {
            debug!("loss hook: dropping outgoing {:?} packet to {:?}", packet.packet_type, to);
        }
        else {
            let mut buf = BytesMut::with_capacity(self.config.record_len());
            packet.ser(&mut buf, self.config.max_payload);
            send_socket.do_send_packet(to, &buf).await;
        }

        let target = match packet.packet_type {
            PacketType::Ack => return None,
            PacketType::Syn => RetransmitTarget::Syn { socket: socket_id, peer: to },
            PacketType::Fin => RetransmitTarget::Fin { socket: socket_id, peer: to },
            PacketType::Data => RetransmitTarget::Data { socket: socket_id, peer: to, seqno: packet.seqno },
        };
        Some(self.timers.schedule(Instant::now() + self.config.retransmission_timeout, target))
    }

    fn sender_mut(&mut self, socket_id: SocketId, peer: SocketAddr) -> Option<&mut SenderSession> {
        self.sockets.get_mut(&socket_id)
            .and_then(|state| state.sessions.get_mut(&peer))
            .and_then(|session| session.sender.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MockRudpDispatcher;
    use crate::send_socket::MockSendSocket;
    use rstest::*;
    use tokio::runtime::Builder;
    use tokio::time;

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap()
    }

    fn peer_b() -> SocketAddr {
        "[::1]:9001".parse().unwrap()
    }

    fn peer_c() -> SocketAddr {
        "[::1]:9002".parse().unwrap()
    }

    fn engine_with_mock(
        config: RudpConfig,
        send_socket: MockSendSocket,
        dispatcher: MockRudpDispatcher,
    ) -> (TransportEngine, EngineHandle, SocketId) {
        let (mut engine, handle) = TransportEngine::new(config).unwrap();
        let id = engine.allocate_socket_id();
        engine.sockets.insert(id, SocketState {
            send_socket: Arc::new(send_socket),
            reader: None,
            close_requested: false,
            sessions: FxHashMap::default(),
            dispatcher: Arc::new(dispatcher),
        });
        (engine, handle, id)
    }

    fn parsed(buf: &[u8]) -> Packet {
        Packet::deser(buf, 1000).expect("test packets should parse")
    }

    fn expect_send(send_socket: &mut MockSendSocket, to: SocketAddr, packet_type: PacketType, seqno: u32) {
        send_socket.expect_do_send_packet()
            .withf(move |actual_to, buf| {
                let packet = parsed(buf);
                *actual_to == to && packet.packet_type == packet_type && packet.seqno == SeqNo::from_raw(seqno)
            })
            .times(1)
            .return_const(());
    }

    fn seed_sender(engine: &mut TransportEngine, socket: SocketId, peer: SocketAddr, status: SenderStatus, seqno: u32) {
        let window = engine.config.window;
        let state = engine.sockets.get_mut(&socket).unwrap();
        let session = state.sessions.entry(peer).or_insert_with(|| Session::for_peer(peer));
        let mut sender = SenderSession::new(SeqNo::from_raw(seqno), window);
        sender.status = status;
        session.sender = Some(sender);
    }

    fn seed_receiver(engine: &mut TransportEngine, socket: SocketId, peer: SocketAddr, status: ReceiverStatus, expected_seqno: u32) {
        let state = engine.sockets.get_mut(&socket).unwrap();
        let session = state.sessions.entry(peer).or_insert_with(|| Session::for_peer(peer));
        let mut receiver = ReceiverSession::new(SeqNo::from_raw(expected_seqno));
        receiver.status = status;
        session.receiver = Some(receiver);
    }

    fn seed_window_packet(engine: &mut TransportEngine, socket: SocketId, peer: SocketAddr, seqno: u32, retries: u32) {
        let deadline = Instant::now() + engine.config.retransmission_timeout;
        let timer = engine.timers.schedule(deadline, RetransmitTarget::Data { socket, peer, seqno: SeqNo::from_raw(seqno) });
        let sender = engine.sender_mut(socket, peer).unwrap();
        let index = sender.first_free_slot().unwrap();
        sender.occupy_slot(index, WindowSlot {
            packet: Packet::data(SeqNo::from_raw(seqno), Bytes::from_static(b"payload")),
            retries,
            timer: Some(timer),
        });
        sender.seqno = SeqNo::from_raw(seqno);
    }

    fn sender<'a>(engine: &'a TransportEngine, socket: SocketId, peer: SocketAddr) -> &'a SenderSession {
        engine.sockets.get(&socket).unwrap()
            .sessions.get(&peer).unwrap()
            .sender.as_ref().unwrap()
    }

    fn receiver<'a>(engine: &'a TransportEngine, socket: SocketId, peer: SocketAddr) -> &'a ReceiverSession {
        engine.sockets.get(&socket).unwrap()
            .sessions.get(&peer).unwrap()
            .receiver.as_ref().unwrap()
    }

    #[test]
    fn test_send_to_new_peer_sends_syn_and_queues() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            send_socket.expect_do_send_packet()
                .withf(|to, buf| {
                    let packet = parsed(buf);
                    *to == peer_b() && packet.packet_type == PacketType::Syn && buf.len() == 1010
                })
                .times(1)
                .return_const(());

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, MockRudpDispatcher::new());

            engine.on_send(socket, peer_b(), Bytes::from_static(b"hello")).await.unwrap();

            let sender = sender(&engine, socket, peer_b());
            assert_eq!(sender.status, SenderStatus::SynSent);
            assert_eq!(sender.data_queue.len(), 1);
            assert!(sender.syn_timer.is_some());
            assert!(sender.window_is_empty());
        });
    }

    #[test]
    fn test_second_send_while_handshaking_queues() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            send_socket.expect_do_send_packet()
                .times(1)
                .return_const(());

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, MockRudpDispatcher::new());

            engine.on_send(socket, peer_b(), Bytes::from_static(b"one")).await.unwrap();
            engine.on_send(socket, peer_b(), Bytes::from_static(b"two")).await.unwrap();

            assert_eq!(sender(&engine, socket, peer_b()).data_queue.len(), 2);
        });
    }

    #[test]
    fn test_syn_ack_opens_session_and_drains_queue() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Data, 101);
            expect_send(&mut send_socket, peer_b(), PacketType::Data, 102);

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, MockRudpDispatcher::new());
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::SynSent, 100);
            engine.sender_mut(socket, peer_b()).unwrap()
                .data_queue.extend([Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

            engine.on_ack(socket, peer_b(), SeqNo::from_raw(101)).await.unwrap();

            let sender = sender(&engine, socket, peer_b());
            assert_eq!(sender.status, SenderStatus::Open);
            assert!(sender.data_queue.is_empty());
            assert_eq!(sender.oldest_seqno(), Some(SeqNo::from_raw(101)));
            assert_eq!(sender.slot_index_for(SeqNo::from_raw(102)), Some(1));
            assert_eq!(sender.first_free_slot(), Some(2));
            assert_eq!(sender.seqno, SeqNo::from_raw(102));
        });
    }

    #[rstest]
    #[case::too_low(100)]
    #[case::the_syn_itself(99)]
    #[case::too_high(102)]
    fn test_mismatched_ack_in_syn_sent_ignored(#[case] ack: u32) {
        paused_rt().block_on(async {
            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::SynSent, 100);

            engine.on_ack(socket, peer_b(), SeqNo::from_raw(ack)).await.unwrap();

            assert_eq!(sender(&engine, socket, peer_b()).status, SenderStatus::SynSent);
        });
    }

    #[test]
    fn test_ack_advances_window_and_refills() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Data, 104);

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, MockRudpDispatcher::new());
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::Open, 100);
            seed_window_packet(&mut engine, socket, peer_b(), 101, 1);
            seed_window_packet(&mut engine, socket, peer_b(), 102, 0);
            seed_window_packet(&mut engine, socket, peer_b(), 103, 0);
            let slot0_timer = sender(&engine, socket, peer_b()).armed_timers()[0];
            engine.sender_mut(socket, peer_b()).unwrap()
                .data_queue.push_back(Bytes::from_static(b"four"));

            engine.on_ack(socket, peer_b(), SeqNo::from_raw(102)).await.unwrap();

            // the acknowledged packet's timer is gone
            assert!(!engine.timers.cancel(slot0_timer));

            let sender = sender(&engine, socket, peer_b());
            assert_eq!(sender.oldest_seqno(), Some(SeqNo::from_raw(102)));
            assert_eq!(sender.slot_index_for(SeqNo::from_raw(103)), Some(1));
            assert_eq!(sender.slot_index_for(SeqNo::from_raw(104)), Some(2));
            assert!(sender.data_queue.is_empty());
        });
    }

    #[rstest]
    #[case::not_the_oldest(103)]
    #[case::unknown(200)]
    #[case::below_window(101)]
    fn test_ack_not_for_oldest_ignored(#[case] ack: u32) {
        paused_rt().block_on(async {
            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::Open, 100);
            seed_window_packet(&mut engine, socket, peer_b(), 101, 0);
            seed_window_packet(&mut engine, socket, peer_b(), 102, 0);

            engine.on_ack(socket, peer_b(), SeqNo::from_raw(ack)).await.unwrap();

            let sender = sender(&engine, socket, peer_b());
            assert_eq!(sender.oldest_seqno(), Some(SeqNo::from_raw(101)));
            assert_eq!(sender.slot_index_for(SeqNo::from_raw(102)), Some(1));
        });
    }

    #[test]
    fn test_ack_without_send_session_dropped() {
        paused_rt().block_on(async {
            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());

            engine.on_ack(socket, peer_b(), SeqNo::from_raw(7)).await.unwrap();
        });
    }

    #[test]
    fn test_syn_creates_receiver_and_acks() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Ack, 100);

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, MockRudpDispatcher::new());

            engine.on_syn(socket, peer_b(), SeqNo::from_raw(99)).await.unwrap();

            let receiver = receiver(&engine, socket, peer_b());
            assert_eq!(receiver.status, ReceiverStatus::Opening);
            assert_eq!(receiver.expected_seqno, SeqNo::from_raw(100));
            assert!(!receiver.finished);
        });
    }

    #[test]
    fn test_syn_retransmit_resets_opening_receiver() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Ack, 100);

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, MockRudpDispatcher::new());
            seed_receiver(&mut engine, socket, peer_b(), ReceiverStatus::Opening, 100);

            engine.on_syn(socket, peer_b(), SeqNo::from_raw(99)).await.unwrap();

            assert_eq!(receiver(&engine, socket, peer_b()).expected_seqno, SeqNo::from_raw(100));
        });
    }

    #[test]
    fn test_syn_on_established_receiver_ignored() {
        paused_rt().block_on(async {
            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());
            seed_receiver(&mut engine, socket, peer_b(), ReceiverStatus::Open, 55);

            engine.on_syn(socket, peer_b(), SeqNo::from_raw(99)).await.unwrap();

            assert_eq!(receiver(&engine, socket, peer_b()).expected_seqno, SeqNo::from_raw(55));
        });
    }

    #[test]
    fn test_data_in_sequence_delivered_and_acked() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Ack, 51);

            let mut dispatcher = MockRudpDispatcher::new();
            dispatcher.expect_on_message()
                .withf(|_, from, payload| *from == peer_b() && payload == b"hello\0")
                .times(1)
                .returning(|_, _, _| Ok(()));

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, dispatcher);
            seed_receiver(&mut engine, socket, peer_b(), ReceiverStatus::Opening, 50);

            engine.on_data(socket, peer_b(), Packet::data(SeqNo::from_raw(50), Bytes::from_static(b"hello\0"))).await.unwrap();

            let receiver = receiver(&engine, socket, peer_b());
            assert_eq!(receiver.status, ReceiverStatus::Open);
            assert_eq!(receiver.expected_seqno, SeqNo::from_raw(51));
        });
    }

    #[test]
    fn test_duplicate_data_reacked_without_second_delivery() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            send_socket.expect_do_send_packet()
                .withf(|to, buf| {
                    let packet = parsed(buf);
                    *to == peer_b() && packet.packet_type == PacketType::Ack && packet.seqno == SeqNo::from_raw(51)
                })
                .times(2)
                .return_const(());

            let mut dispatcher = MockRudpDispatcher::new();
            dispatcher.expect_on_message()
                .times(1)
                .returning(|_, _, _| Ok(()));

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, dispatcher);
            seed_receiver(&mut engine, socket, peer_b(), ReceiverStatus::Open, 50);

            let packet = Packet::data(SeqNo::from_raw(50), Bytes::from_static(b"once"));
            engine.on_data(socket, peer_b(), packet.clone()).await.unwrap();
            // the ACK got lost, the peer retransmits
            engine.on_data(socket, peer_b(), packet).await.unwrap();

            assert_eq!(receiver(&engine, socket, peer_b()).expected_seqno, SeqNo::from_raw(51));
        });
    }

    #[rstest]
    #[case::below_dup_window(46)]
    #[case::ahead(51)]
    #[case::far_ahead(1050)]
    fn test_data_outside_window_dropped(#[case] seqno: u32) {
        paused_rt().block_on(async {
            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());
            seed_receiver(&mut engine, socket, peer_b(), ReceiverStatus::Open, 50);

            engine.on_data(socket, peer_b(), Packet::data(SeqNo::from_raw(seqno), Bytes::from_static(b"x"))).await.unwrap();

            assert_eq!(receiver(&engine, socket, peer_b()).expected_seqno, SeqNo::from_raw(50));
        });
    }

    #[test]
    fn test_data_without_receive_session_dropped() {
        paused_rt().block_on(async {
            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());
            // a send half exists, but the peer never SYN'ed us
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::Open, 100);

            engine.on_data(socket, peer_b(), Packet::data(SeqNo::from_raw(5), Bytes::from_static(b"x"))).await.unwrap();
        });
    }

    #[test]
    fn test_data_timer_retransmits_within_budget() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Data, 101);

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, MockRudpDispatcher::new());
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::Open, 100);
            seed_window_packet(&mut engine, socket, peer_b(), 101, 0);

            engine.on_data_timer(socket, peer_b(), SeqNo::from_raw(101)).await.unwrap();

            let sender = sender(&engine, socket, peer_b());
            let slot_index = sender.slot_index_for(SeqNo::from_raw(101)).unwrap();
            assert_eq!(slot_index, 0);
            assert_eq!(sender.armed_timers().len(), 1);
        });
    }

    #[test]
    fn test_data_timer_exhaustion_raises_timeout() {
        paused_rt().block_on(async {
            let mut dispatcher = MockRudpDispatcher::new();
            dispatcher.expect_on_event()
                .withf(|_, event, peer| *event == RudpEvent::Timeout && *peer == Some(peer_b()))
                .times(1)
                .returning(|_, _, _| Ok(()));

            let config = RudpConfig { max_retransmissions: 2, ..RudpConfig::default() };
            let (mut engine, _handle, socket) = engine_with_mock(config, MockSendSocket::new(), dispatcher);
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::Open, 100);
            seed_window_packet(&mut engine, socket, peer_b(), 101, 2);

            engine.on_data_timer(socket, peer_b(), SeqNo::from_raw(101)).await.unwrap();

            // no retransmission, no re-armed timer
            assert!(sender(&engine, socket, peer_b()).armed_timers().is_empty());
        });
    }

    #[test]
    fn test_stale_data_timer_is_a_no_op() {
        paused_rt().block_on(async {
            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::Open, 100);

            // the packet was acknowledged before the timer fired
            engine.on_data_timer(socket, peer_b(), SeqNo::from_raw(101)).await.unwrap();
        });
    }

    #[test]
    fn test_syn_retransmission_until_timeout() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            send_socket.expect_do_send_packet()
                .withf(|to, buf| *to == peer_b() && parsed(buf).packet_type == PacketType::Syn)
                .times(4)
                .return_const(());

            let mut dispatcher = MockRudpDispatcher::new();
            dispatcher.expect_on_event()
                .withf(|_, event, peer| *event == RudpEvent::Timeout && *peer == Some(peer_b()))
                .times(1)
                .returning(|_, _, _| Ok(()));

            let config = RudpConfig { max_retransmissions: 3, ..RudpConfig::default() };
            let timeout = config.retransmission_timeout;
            let (mut engine, _handle, socket) = engine_with_mock(config, send_socket, dispatcher);

            // initial SYN plus three retransmissions, then the budget is spent
            engine.on_send(socket, peer_b(), Bytes::from_static(b"unreachable")).await.unwrap();
            for _ in 0..4 {
                time::advance(timeout).await;
                engine.on_timer().await.unwrap();
            }

            // the exhausted timer is not re-armed
            assert!(engine.timers.is_empty());
            assert!(sender(&engine, socket, peer_b()).syn_timer.is_none());
        });
    }

    #[test]
    fn test_close_with_no_sessions_releases_immediately() {
        paused_rt().block_on(async {
            let mut dispatcher = MockRudpDispatcher::new();
            dispatcher.expect_on_event()
                .withf(|_, event, peer| *event == RudpEvent::Closed && peer.is_none())
                .times(1)
                .returning(|_, _, _| Ok(()));

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), dispatcher);

            engine.on_close(socket).await.unwrap();

            assert!(engine.sockets.is_empty());
        });
    }

    #[test]
    fn test_ordered_close_drains_queue_before_fin() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Data, 102);
            expect_send(&mut send_socket, peer_b(), PacketType::Data, 103);
            expect_send(&mut send_socket, peer_b(), PacketType::Fin, 104);

            let mut dispatcher = MockRudpDispatcher::new();
            dispatcher.expect_on_event()
                .withf(|_, event, peer| *event == RudpEvent::Closed && *peer == Some(peer_b()))
                .times(1)
                .returning(|_, _, _| Ok(()));

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, dispatcher);
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::Open, 101);
            seed_window_packet(&mut engine, socket, peer_b(), 101, 0);
            engine.sender_mut(socket, peer_b()).unwrap()
                .data_queue.extend([Bytes::from_static(b"two"), Bytes::from_static(b"three")]);

            // close while data is still in flight: no FIN yet
            engine.on_close(socket).await.unwrap();
            assert_eq!(sender(&engine, socket, peer_b()).status, SenderStatus::Open);

            // draining the window triggers the FIN after the last ACK
            engine.on_ack(socket, peer_b(), SeqNo::from_raw(102)).await.unwrap();
            engine.on_ack(socket, peer_b(), SeqNo::from_raw(103)).await.unwrap();
            engine.on_ack(socket, peer_b(), SeqNo::from_raw(104)).await.unwrap();
            assert_eq!(sender(&engine, socket, peer_b()).status, SenderStatus::FinSent);

            // the FIN's ACK completes the cascade
            engine.on_ack(socket, peer_b(), SeqNo::from_raw(105)).await.unwrap();
            assert!(engine.sockets.is_empty());
            assert!(engine.timers.is_empty());
        });
    }

    #[test]
    fn test_fin_from_peer_acked_and_finishes_receive_half() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Ack, 61);

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, MockRudpDispatcher::new());
            seed_receiver(&mut engine, socket, peer_b(), ReceiverStatus::Open, 60);

            engine.on_fin(socket, peer_b(), SeqNo::from_raw(60)).await.unwrap();

            assert!(receiver(&engine, socket, peer_b()).finished);
            // no close was requested, so the socket stays
            assert!(engine.sockets.contains_key(&socket));
        });
    }

    #[rstest]
    #[case::wrong_seqno(ReceiverStatus::Open, 59)]
    #[case::still_opening(ReceiverStatus::Opening, 60)]
    fn test_fin_ignored(#[case] status: ReceiverStatus, #[case] seqno: u32) {
        paused_rt().block_on(async {
            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());
            seed_receiver(&mut engine, socket, peer_b(), status, 60);

            engine.on_fin(socket, peer_b(), SeqNo::from_raw(seqno)).await.unwrap();

            assert!(!receiver(&engine, socket, peer_b()).finished);
        });
    }

    #[test]
    fn test_close_cascade_waits_for_receive_half() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Ack, 61);

            let mut dispatcher = MockRudpDispatcher::new();
            dispatcher.expect_on_event()
                .withf(|_, event, peer| *event == RudpEvent::Closed && *peer == Some(peer_b()))
                .times(1)
                .returning(|_, _, _| Ok(()));

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, dispatcher);
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::FinSent, 104);
            engine.sender_mut(socket, peer_b()).unwrap().finished = true;
            seed_receiver(&mut engine, socket, peer_b(), ReceiverStatus::Open, 60);

            // our send half is finished, but the peer has not said goodbye yet
            engine.on_close(socket).await.unwrap();
            assert!(engine.sockets.contains_key(&socket));

            engine.on_fin(socket, peer_b(), SeqNo::from_raw(60)).await.unwrap();
            assert!(engine.sockets.is_empty());
        });
    }

    #[test]
    fn test_stop_and_wait_with_window_one() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_b(), PacketType::Data, 11);
            expect_send(&mut send_socket, peer_b(), PacketType::Data, 12);

            let config = RudpConfig { window: 1, ..RudpConfig::default() };
            let (mut engine, _handle, socket) = engine_with_mock(config, send_socket, MockRudpDispatcher::new());
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::Open, 10);

            engine.on_send(socket, peer_b(), Bytes::from_static(b"one")).await.unwrap();
            // the window is a single slot, so the second payload waits
            engine.on_send(socket, peer_b(), Bytes::from_static(b"two")).await.unwrap();
            assert_eq!(sender(&engine, socket, peer_b()).data_queue.len(), 1);

            engine.on_ack(socket, peer_b(), SeqNo::from_raw(12)).await.unwrap();
            let sender = sender(&engine, socket, peer_b());
            assert_eq!(sender.oldest_seqno(), Some(SeqNo::from_raw(12)));
            assert!(sender.data_queue.is_empty());
        });
    }

    #[test]
    fn test_interleaved_peers_do_not_interfere() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_send(&mut send_socket, peer_c(), PacketType::Data, 301);

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, MockRudpDispatcher::new());
            // B's window is stuck with an unacknowledged packet
            seed_sender(&mut engine, socket, peer_b(), SenderStatus::Open, 200);
            seed_window_packet(&mut engine, socket, peer_b(), 201, 3);
            seed_sender(&mut engine, socket, peer_c(), SenderStatus::Open, 300);

            // C makes progress regardless
            engine.on_send(socket, peer_c(), Bytes::from_static(b"to c")).await.unwrap();
            engine.on_ack(socket, peer_c(), SeqNo::from_raw(302)).await.unwrap();

            assert!(sender(&engine, socket, peer_c()).window_is_empty());
            assert_eq!(sender(&engine, socket, peer_b()).oldest_seqno(), Some(SeqNo::from_raw(201)));
        });
    }

    #[test]
    fn test_dispatcher_error_aborts_processing() {
        paused_rt().block_on(async {
            let mut send_socket = MockSendSocket::new();
            send_socket.expect_do_send_packet()
                .return_const(());

            let mut dispatcher = MockRudpDispatcher::new();
            dispatcher.expect_on_message()
                .returning(|_, _, _| Err(anyhow::anyhow!("application failure")));

            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), send_socket, dispatcher);
            seed_receiver(&mut engine, socket, peer_b(), ReceiverStatus::Open, 50);

            let result = engine.on_data(socket, peer_b(), Packet::data(SeqNo::from_raw(50), Bytes::from_static(b"x"))).await;
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_unparsable_datagram_dropped() {
        paused_rt().block_on(async {
            let (mut engine, _handle, socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());

            engine.on_datagram(socket, peer_b(), Bytes::from_static(&[9, 9, 9])).await.unwrap();

            assert!(engine.sockets.get(&socket).unwrap().sessions.is_empty());
        });
    }

    #[test]
    fn test_datagram_for_released_socket_dropped() {
        paused_rt().block_on(async {
            let (mut engine, _handle, _socket) = engine_with_mock(RudpConfig::default(), MockSendSocket::new(), MockRudpDispatcher::new());

            engine.on_datagram(SocketId(77), peer_b(), Bytes::from_static(&[1, 2, 0, 0, 0, 5, 0, 0, 0, 0])).await.unwrap();
        });
    }
}
