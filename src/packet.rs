use crate::seqno::SeqNo;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use num_enum::TryFromPrimitive;

pub const PROTOCOL_VERSION: u8 = 1;

/// Serialized length of the header fields in front of the payload area.
pub const HEADER_LEN: usize = 10;

/// On-wire packet type byte. `3` is unassigned.
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Data = 1,
    Ack = 2,
    Syn = 4,
    Fin = 5,
}

/// One wire record.
///
/// A datagram always has the full record length (header plus the complete
/// payload area), with the unused payload tail zero-padded - the payload
/// length is carried explicitly rather than inferred from the datagram
/// length. All multi-byte header fields are big-endian on the wire, so
/// peers on heterogeneous architectures interoperate.
///
/// ```ascii
/// 0:  protocol version (u8)
/// 1:  packet type (u8): 1 DATA, 2 ACK, 4 SYN, 5 FIN
/// 2:  sequence number (u32 BE)
/// 6:  payload length (i32 BE)
/// 10: payload, zero-padded up to the configured per-packet cap
/// ```
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Packet {
    pub packet_type: PacketType,
    pub seqno: SeqNo,
    pub payload: Bytes,
}

impl Packet {
    pub fn syn(seqno: SeqNo) -> Packet {
        Packet { packet_type: PacketType::Syn, seqno, payload: Bytes::new() }
    }

    pub fn ack(seqno: SeqNo) -> Packet {
        Packet { packet_type: PacketType::Ack, seqno, payload: Bytes::new() }
    }

    pub fn fin(seqno: SeqNo) -> Packet {
        Packet { packet_type: PacketType::Fin, seqno, payload: Bytes::new() }
    }

    pub fn data(seqno: SeqNo, payload: Bytes) -> Packet {
        Packet { packet_type: PacketType::Data, seqno, payload }
    }

    /// Writes the full wire record, padding the payload area with zeros up to
    ///  `max_payload`.
    pub fn ser(&self, buf: &mut impl BufMut, max_payload: usize) {
        debug_assert!(self.payload.len() <= max_payload);

        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.packet_type as u8);
        buf.put_u32(self.seqno.to_raw());
        buf.put_i32(self.payload.len() as i32);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, max_payload - self.payload.len());
    }

    /// Parses a received datagram. The padding tail is tolerated but not
    ///  required, so a substrate that truncates trailing zeros still
    ///  interoperates.
    pub fn deser(mut buf: impl Buf, max_payload: usize) -> anyhow::Result<Packet> {
        if buf.remaining() < HEADER_LEN {
            bail!("datagram of {} bytes is shorter than the packet header", buf.remaining());
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        let raw_type = buf.get_u8();
        let packet_type = match PacketType::try_from(raw_type) {
            Ok(t) => t,
            Err(_) => bail!("unknown packet type {}", raw_type),
        };

        let seqno = SeqNo::from_raw(buf.get_u32());

        let payload_length = buf.get_i32();
        if payload_length < 0 {
            bail!("negative payload length {}", payload_length);
        }
        let payload_length = payload_length as usize;
        if payload_length > max_payload {
            bail!("payload length {} exceeds the per-packet cap of {}", payload_length, max_payload);
        }
        if payload_length > buf.remaining() {
            bail!("payload length {} exceeds the datagram's {} remaining bytes", payload_length, buf.remaining());
        }

        let payload = buf.copy_to_bytes(payload_length);
        Ok(Packet { packet_type, seqno, payload })
    }
}
