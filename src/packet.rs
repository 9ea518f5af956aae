use crate::config::{MAX_PACKET_SIZE, UDP_IPV4_HEADER_SIZE};
use crate::payload::PayloadIo;
use crate::sequence_number::{MessageNumber, MessagePartNumber, SequenceNumber};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Instant;

/// Unstructured datagram content, for control traffic above or beside the ARQ engine.
///
/// This type deliberately cannot be built from a [Packet] or a
///  [crate::control_packet::ControlPacket]: framed packets must go through the socket's
///  packet paths, which is what `write_base_packet`'s original precondition guarded.
pub struct BasePacket {
    payload: BytesMut,
    sender_addr: Option<SocketAddr>,
    receive_time: Option<Instant>,
}

impl BasePacket {
    pub fn new(payload: &[u8]) -> BasePacket {
        BasePacket {
            payload: BytesMut::from(payload),
            sender_addr: None,
            receive_time: None,
        }
    }

    pub fn from_received(payload: BytesMut, sender_addr: SocketAddr, receive_time: Instant) -> BasePacket {
        BasePacket {
            payload,
            sender_addr: Some(sender_addr),
            receive_time: Some(receive_time),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn sender_addr(&self) -> Option<SocketAddr> {
        self.sender_addr
    }

    pub fn receive_time(&self) -> Option<Instant> {
        self.receive_time
    }
}


bitflags! {
    /// The three single-bit flags in the low bits of a packet's first header word. The
    ///  obfuscation level and the sequence number share the same word above them.
    #[derive(Copy, Clone, Eq, PartialEq)]
    struct HeaderFlags: u32 {
        const CONTROL  = 0b001;
        const RELIABLE = 0b010;
        const MESSAGE  = 0b100;
    }
}

const OBFUSCATION_SHIFT: u32 = 3;
const OBFUSCATION_MASK: u32 = 0b11 << OBFUSCATION_SHIFT;
const SEQUENCE_SHIFT: u32 = 5;

const POSITION_MASK: u32 = 0b11;
const MESSAGE_NUMBER_SHIFT: u32 = 2;

/// Where a packet belongs within its message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketPosition {
    Only = 0b00,
    First = 0b10,
    Middle = 0b11,
    Last = 0b01,
}

impl PacketPosition {
    fn from_bits(bits: u32) -> PacketPosition {
        match bits & POSITION_MASK {
            0b00 => PacketPosition::Only,
            0b10 => PacketPosition::First,
            0b11 => PacketPosition::Middle,
            _ => PacketPosition::Last,
        }
    }
}

/// Payload obfuscation level. This is a reversible XOR and explicitly not a security
///  mechanism - its purpose is to make retransmitted payloads look different on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum ObfuscationLevel {
    #[default]
    None = 0,
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
}

impl ObfuscationLevel {
    /// Repeating 8-byte XOR key per level; level 0 is the zero key.
    const KEYS: [u64; 4] = [
        0x0,
        0x4e8d_9c21_f3a6_075b,
        0xb17f_2ec8_5d93_40ea,
        0x8325_61fd_0b9c_ae47,
    ];

    pub fn from_bits(bits: u32) -> ObfuscationLevel {
        match bits & 0b11 {
            0 => ObfuscationLevel::None,
            1 => ObfuscationLevel::Level1,
            2 => ObfuscationLevel::Level2,
            3 => ObfuscationLevel::Level3,
            _ => unreachable!(),
        }
    }

    fn key(self) -> u64 {
        Self::KEYS[self as usize]
    }
}

/// XOR `buf` in place with the repeating 8-byte key.
fn xor_with_key(buf: &mut [u8], key: u64) {
    if key == 0 {
        return;
    }
    let key_bytes = key.to_le_bytes();
    for (idx, b) in buf.iter_mut().enumerate() {
        *b ^= key_bytes[idx % 8];
    }
}


/// A data packet: the first header word packs control bit (0), reliable bit, message bit,
///  obfuscation level and the 27-bit sequence number; two more words with message number /
///  position and message part number follow iff the message bit is set; then the payload.
///
/// The full wire image is kept in one buffer so a retransmission can rewrite header fields
///  in place without copying the payload.
///
/// All header words are little-endian: the least significant bit of the first byte on the
///  wire is the control bit.
pub struct Packet {
    buffer: BytesMut,
    header_size: usize,
    payload_capacity: usize,
    cursor: usize,

    is_reliable: bool,
    is_part_of_message: bool,
    obfuscation_level: ObfuscationLevel,
    sequence_number: SequenceNumber,
    message_number: MessageNumber,
    packet_position: PacketPosition,
    message_part_number: MessagePartNumber,

    sender_addr: Option<SocketAddr>,
    receive_time: Option<Instant>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PKT{{{:?} R:{} M:{} len:{}}}",
               self.sequence_number, self.is_reliable, self.is_part_of_message, self.payload_size())
    }
}

impl Packet {
    /// Header size of this layer for a packet with / without message framing.
    pub const fn local_header_size(is_part_of_message: bool) -> usize {
        if is_part_of_message {
            3 * size_of::<u32>()
        }
        else {
            size_of::<u32>()
        }
    }

    /// Cumulative header size across all layers. This layer sits directly on the datagram,
    ///  so there is nothing to add; an extended header written by a higher layer travels
    ///  inside the payload and is opaque here.
    pub const fn total_header_size(is_part_of_message: bool) -> usize {
        Self::local_header_size(is_part_of_message)
    }

    /// The largest payload that still fits the datagram budget.
    pub const fn max_payload_size(is_part_of_message: bool) -> usize {
        MAX_PACKET_SIZE - Self::total_header_size(is_part_of_message)
    }

    /// Create an empty packet with the given payload capacity (the maximum payload size if
    ///  `None`).
    pub fn new(size: Option<usize>, is_reliable: bool, is_part_of_message: bool) -> Packet {
        let payload_capacity = size.unwrap_or(Self::max_payload_size(is_part_of_message));
        assert!(payload_capacity <= Self::max_payload_size(is_part_of_message),
                "requested payload capacity exceeds the datagram budget");

        let header_size = Self::local_header_size(is_part_of_message);
        let mut buffer = BytesMut::with_capacity(header_size + payload_capacity);
        buffer.put_bytes(0, header_size);

        let mut packet = Packet {
            buffer,
            header_size,
            payload_capacity,
            cursor: 0,
            is_reliable,
            is_part_of_message,
            obfuscation_level: ObfuscationLevel::None,
            sequence_number: SequenceNumber::ZERO,
            message_number: MessageNumber::ZERO,
            packet_position: PacketPosition::Only,
            message_part_number: 0,
            sender_addr: None,
            receive_time: None,
        };
        packet.write_header();
        packet
    }

    /// Parse a received datagram into a packet. The caller has already established that
    ///  the control bit is clear.
    pub fn from_received(
        data: BytesMut,
        sender_addr: SocketAddr,
        receive_time: Instant,
    ) -> anyhow::Result<Packet> {
        let mut parse = &data[..];
        let word = parse.try_get_u32_le()?;

        let flags = HeaderFlags::from_bits_truncate(word);
        if flags.contains(HeaderFlags::CONTROL) {
            bail!("control packet routed to the data packet codec");
        }
        let is_reliable = flags.contains(HeaderFlags::RELIABLE);
        let is_part_of_message = flags.contains(HeaderFlags::MESSAGE);
        let obfuscation_level = ObfuscationLevel::from_bits((word & OBFUSCATION_MASK) >> OBFUSCATION_SHIFT);
        let sequence_number = SequenceNumber::new(word >> SEQUENCE_SHIFT);

        let (message_number, packet_position, message_part_number) = if is_part_of_message {
            let message_word = parse.try_get_u32_le()?;
            let part_number = parse.try_get_u32_le()?;
            (
                MessageNumber::new(message_word >> MESSAGE_NUMBER_SHIFT),
                PacketPosition::from_bits(message_word),
                part_number,
            )
        }
        else {
            (MessageNumber::ZERO, PacketPosition::Only, 0)
        };

        let header_size = Self::local_header_size(is_part_of_message);
        let payload_size = data.len() - header_size;

        Ok(Packet {
            buffer: data,
            header_size,
            payload_capacity: payload_size,
            cursor: 0,
            is_reliable,
            is_part_of_message,
            obfuscation_level,
            sequence_number,
            message_number,
            packet_position,
            message_part_number,
            sender_addr: Some(sender_addr),
            receive_time: Some(receive_time),
        })
    }

    fn write_header(&mut self) {
        let mut flags = HeaderFlags::empty();
        if self.is_reliable {
            flags |= HeaderFlags::RELIABLE;
        }
        if self.is_part_of_message {
            flags |= HeaderFlags::MESSAGE;
        }
        let word = flags.bits()
            | ((self.obfuscation_level as u32) << OBFUSCATION_SHIFT)
            | (self.sequence_number.to_raw() << SEQUENCE_SHIFT);
        self.buffer[0..4].copy_from_slice(&word.to_le_bytes());

        if self.is_part_of_message {
            let message_word = (self.packet_position as u32)
                | (self.message_number.to_raw() << MESSAGE_NUMBER_SHIFT);
            self.buffer[4..8].copy_from_slice(&message_word.to_le_bytes());
            self.buffer[8..12].copy_from_slice(&self.message_part_number.to_le_bytes());
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.is_reliable
    }

    pub fn set_reliable(&mut self, reliable: bool) {
        self.is_reliable = reliable;
        self.write_header();
    }

    pub fn is_part_of_message(&self) -> bool {
        self.is_part_of_message
    }

    pub fn obfuscation_level(&self) -> ObfuscationLevel {
        self.obfuscation_level
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn message_number(&self) -> MessageNumber {
        self.message_number
    }

    pub fn packet_position(&self) -> PacketPosition {
        self.packet_position
    }

    pub fn message_part_number(&self) -> MessagePartNumber {
        self.message_part_number
    }

    pub fn sender_addr(&self) -> Option<SocketAddr> {
        self.sender_addr
    }

    pub fn receive_time(&self) -> Option<Instant> {
        self.receive_time
    }

    /// Rewrite the sequence-number field in place. Used both when the sender stamps a
    ///  freshly dequeued packet and when a retransmission goes out (a retransmitted packet
    ///  keeps its original sequence number).
    pub fn write_sequence_number(&mut self, sequence_number: SequenceNumber) {
        self.sequence_number = sequence_number;
        self.write_header();
    }

    /// Stamp all message-related header fields. The packet must have been created with
    ///  message framing so the header words exist.
    pub fn write_message_number(
        &mut self,
        message_number: MessageNumber,
        position: PacketPosition,
        message_part_number: MessagePartNumber,
    ) {
        assert!(self.is_part_of_message, "packet has no message header words");
        self.message_number = message_number;
        self.packet_position = position;
        self.message_part_number = message_part_number;
        self.write_header();
    }

    /// Re-code the payload to the given obfuscation level: the XOR of the current level is
    ///  removed, the XOR of the new level applied, and the header bits updated. Decoding a
    ///  received packet is `obfuscate(ObfuscationLevel::None)`.
    pub fn obfuscate(&mut self, level: ObfuscationLevel) {
        let current_key = self.obfuscation_level.key();
        let header_size = self.header_size;
        xor_with_key(&mut self.buffer[header_size..], current_key);
        xor_with_key(&mut self.buffer[header_size..], level.key());

        self.obfuscation_level = level;
        self.write_header();
    }

    /// Size of the packet on the wire including the UDP/IPv4 headers.
    pub fn wire_size(&self) -> usize {
        self.data_size() + UDP_IPV4_HEADER_SIZE
    }

    /// Size of the packet including this protocol's headers.
    pub fn data_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn payload_size(&self) -> usize {
        self.buffer.len() - self.header_size
    }

    /// The full wire image, for handing to the datagram socket.
    pub fn wire_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl PayloadIo for Packet {
    fn payload(&self) -> &[u8] {
        &self.buffer[self.header_size..]
    }

    fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    fn cursor(&self) -> usize {
        self.cursor
    }

    fn set_cursor(&mut self, pos: usize) {
        debug_assert!(pos <= self.payload_capacity);
        self.cursor = pos;
    }

    fn write_payload_at_cursor(&mut self, src: &[u8]) -> usize {
        let writable = self.payload_capacity.saturating_sub(self.cursor);
        let num_written = src.len().min(writable);

        let overwrite_end = (self.cursor + num_written).min(self.payload_size());
        let num_overwritten = overwrite_end.saturating_sub(self.cursor);

        let start = self.header_size + self.cursor;
        self.buffer[start..start + num_overwritten].copy_from_slice(&src[..num_overwritten]);
        self.buffer.put_slice(&src[num_overwritten..num_written]);

        self.cursor += num_written;
        num_written
    }

    fn truncate_payload(&mut self, len: usize) {
        debug_assert!(len <= self.payload_size());
        self.buffer.truncate(self.header_size + len);
        self.cursor = self.cursor.min(len);
    }
}
