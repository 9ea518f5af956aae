use crate::config::{MAX_PACKET_SIZE, UDP_IPV4_HEADER_SIZE};
use crate::sequence_number::SequenceNumber;
use anyhow::bail;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use std::fmt::Debug;

const CONTROL_BIT: u32 = 1;
const TYPE_SHIFT: u32 = 1;
const TYPE_MASK: u32 = 0x7fff;

/// A control packet: the first header word packs the control bit (1), a 15-bit type and
///  16 reserved bits (zero on send, ignored on receive), followed by the type-specific
///  control data.
///
/// All words are little-endian; the least significant bit of the first byte on the wire is
///  the control bit.
#[derive(Clone, Eq, PartialEq)]
pub enum ControlPacket {
    /// Positive acknowledgement carrying the next-expected sequence number.
    Ack { sequence_number: SequenceNumber },
    /// Sent by the data sender until acknowledged; carries the sender's initial sequence
    ///  number.
    Handshake { initial_sequence_number: SequenceNumber },
    /// Acknowledges a Handshake, echoing the initial sequence number.
    HandshakeAck { initial_sequence_number: SequenceNumber },
    /// Sent by a data receiver to ask the sender to (re-)handshake.
    HandshakeRequest,
    /// Loss report for the inclusive range `[lo, hi]` of missing sequence numbers.
    Nak { lo: SequenceNumber, hi: SequenceNumber },
}

impl Debug for ControlPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlPacket::Ack { sequence_number } => write!(f, "ACK({})", sequence_number),
            ControlPacket::Handshake { initial_sequence_number } => write!(f, "HANDSHAKE({})", initial_sequence_number),
            ControlPacket::HandshakeAck { initial_sequence_number } => write!(f, "HANDSHAKE_ACK({})", initial_sequence_number),
            ControlPacket::HandshakeRequest => write!(f, "HANDSHAKE_REQUEST"),
            ControlPacket::Nak { lo, hi } => write!(f, "NAK({}..={})", lo, hi),
        }
    }
}

impl ControlPacket {
    const TYPE_ACK: u32 = 0;
    const TYPE_HANDSHAKE: u32 = 1;
    const TYPE_HANDSHAKE_ACK: u32 = 2;
    const TYPE_HANDSHAKE_REQUEST: u32 = 3;
    const TYPE_NAK: u32 = 4;

    pub const fn local_header_size() -> usize {
        size_of::<u32>()
    }

    pub const fn total_header_size() -> usize {
        Self::local_header_size()
    }

    pub const fn max_payload_size() -> usize {
        MAX_PACKET_SIZE - Self::total_header_size()
    }

    fn type_bits(&self) -> u32 {
        match self {
            ControlPacket::Ack { .. } => Self::TYPE_ACK,
            ControlPacket::Handshake { .. } => Self::TYPE_HANDSHAKE,
            ControlPacket::HandshakeAck { .. } => Self::TYPE_HANDSHAKE_ACK,
            ControlPacket::HandshakeRequest => Self::TYPE_HANDSHAKE_REQUEST,
            ControlPacket::Nak { .. } => Self::TYPE_NAK,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(CONTROL_BIT | (self.type_bits() << TYPE_SHIFT));

        match self {
            ControlPacket::Ack { sequence_number } => {
                buf.put_u32_le(sequence_number.to_raw());
            }
            ControlPacket::Handshake { initial_sequence_number }
            | ControlPacket::HandshakeAck { initial_sequence_number } => {
                buf.put_u32_le(initial_sequence_number.to_raw());
            }
            ControlPacket::HandshakeRequest => {}
            ControlPacket::Nak { lo, hi } => {
                buf.put_u32_le(lo.to_raw());
                buf.put_u32_le(hi.to_raw());
            }
        }
    }

    /// Serialize into a fresh wire image.
    pub fn to_wire_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::local_header_size() + 2 * size_of::<u32>());
        self.ser(&mut buf);
        buf
    }

    pub fn deser(buf: &mut &[u8]) -> anyhow::Result<ControlPacket> {
        let word = buf.try_get_u32_le()?;
        if word & CONTROL_BIT == 0 {
            bail!("data packet routed to the control packet codec");
        }
        // bits 16..31 are reserved and deliberately ignored

        match (word >> TYPE_SHIFT) & TYPE_MASK {
            Self::TYPE_ACK => Ok(ControlPacket::Ack {
                sequence_number: SequenceNumber::new(buf.try_get_u32_le()?),
            }),
            Self::TYPE_HANDSHAKE => Ok(ControlPacket::Handshake {
                initial_sequence_number: SequenceNumber::new(buf.try_get_u32_le()?),
            }),
            Self::TYPE_HANDSHAKE_ACK => Ok(ControlPacket::HandshakeAck {
                initial_sequence_number: SequenceNumber::new(buf.try_get_u32_le()?),
            }),
            Self::TYPE_HANDSHAKE_REQUEST => Ok(ControlPacket::HandshakeRequest),
            Self::TYPE_NAK => {
                let lo = SequenceNumber::new(buf.try_get_u32_le()?);
                let hi = SequenceNumber::new(buf.try_get_u32_le()?);
                if hi.is_before(lo) {
                    bail!("NAK range end {} is before its start {}", hi, lo);
                }
                Ok(ControlPacket::Nak { lo, hi })
            }
            unknown => bail!("unknown control packet type {}", unknown),
        }
    }

    pub fn wire_size(&self) -> usize {
        self.to_wire_bytes().len() + UDP_IPV4_HEADER_SIZE
    }
}
