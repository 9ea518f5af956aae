use crate::packet::{Packet, PacketPosition};
use crate::payload::PayloadIo;
use crate::sequence_number::MessageNumber;
use anyhow::bail;
use bytes::Bytes;
use std::collections::VecDeque;

/// A user-level message built from one or more packets.
///
/// Bytes are appended into an in-progress "current" packet which is finalized and replaced
///  once full. A packet-type tag byte and an optional extended-header byte string - both
///  opaque to this layer - are prepended to every packet's payload so each packet stays
///  independently routable at the layer above.
///
/// For `ordered` lists an atomic segment can be opened with [PacketList::start_segment]:
///  a segment never straddles a packet boundary - if the current packet fills up
///  mid-segment, the segment written so far is rolled back and replayed into the next
///  packet.
pub struct PacketList {
    packet_type: u8,
    extended_header: Bytes,
    is_reliable: bool,
    is_ordered: bool,
    message_number: Option<MessageNumber>,

    packets: VecDeque<Packet>,
    current_packet: Option<Packet>,
    segment_start: Option<usize>,
}

impl PacketList {
    pub fn new(packet_type: u8, extended_header: Bytes, is_reliable: bool, is_ordered: bool) -> PacketList {
        PacketList {
            packet_type,
            extended_header,
            is_reliable,
            is_ordered,
            message_number: None,
            packets: VecDeque::new(),
            current_packet: None,
            segment_start: None,
        }
    }

    /// Wrap packets received from the network back into a list, e.g. to hand a completed
    ///  message to application code as one unit. Flags are taken from the first packet.
    pub fn from_received_packets(packets: Vec<Packet>) -> PacketList {
        let (is_reliable, is_ordered, message_number) = packets.first()
            .map(|p| (p.is_reliable(), p.is_part_of_message(), Some(p.message_number())))
            .unwrap_or((false, false, None));

        PacketList {
            packet_type: 0,
            extended_header: Bytes::new(),
            is_reliable,
            is_ordered,
            message_number,
            packets: packets.into(),
            current_packet: None,
            segment_start: None,
        }
    }

    pub fn packet_type(&self) -> u8 {
        self.packet_type
    }

    pub fn is_reliable(&self) -> bool {
        self.is_reliable
    }

    pub fn is_ordered(&self) -> bool {
        self.is_ordered
    }

    pub fn message_number(&self) -> Option<MessageNumber> {
        self.message_number
    }

    pub fn extended_header(&self) -> &Bytes {
        &self.extended_header
    }

    /// Bytes of tag and extended header at the start of every packet's payload.
    fn per_packet_overhead(&self) -> usize {
        size_of::<u8>() + self.extended_header.len()
    }

    fn create_packet(&self) -> Packet {
        let mut packet = Packet::new(None, self.is_reliable, self.is_ordered);
        packet.write_payload_at_cursor(&[self.packet_type]);
        packet.write_payload_at_cursor(&self.extended_header);
        packet
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len() + self.current_packet.is_some() as usize
    }

    /// Sum of all packets' sizes including protocol headers.
    pub fn data_size(&self) -> usize {
        self.packets.iter().map(|p| p.data_size()).sum::<usize>()
            + self.current_packet.as_ref().map(|p| p.data_size()).unwrap_or(0)
    }

    /// Sum of all packets' payload sizes.
    pub fn message_size(&self) -> usize {
        self.packets.iter().map(|p| p.payload_size()).sum::<usize>()
            + self.current_packet.as_ref().map(|p| p.payload_size()).unwrap_or(0)
    }

    /// All payloads concatenated in list order.
    pub fn message(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.message_size());
        for packet in &self.packets {
            result.extend_from_slice(packet.payload());
        }
        if let Some(current) = &self.current_packet {
            result.extend_from_slice(current.payload());
        }
        result
    }

    /// Append bytes to the message, spilling into fresh packets as needed.
    pub fn write_bytes(&mut self, mut data: &[u8]) -> anyhow::Result<usize> {
        let total = data.len();

        while !data.is_empty() {
            if self.current_packet.is_none() {
                self.current_packet = Some(self.create_packet());
            }
            let current = self.current_packet.as_mut().unwrap();

            let available = current.bytes_available_for_write();
            if available >= data.len() {
                current.write_payload_at_cursor(data);
                break;
            }

            if self.is_ordered && self.segment_start.is_some() {
                self.roll_segment_into_fresh_packet(data.len())?;
                continue;
            }

            current.write_payload_at_cursor(&data[..available]);
            data = &data[available..];
            self.close_current_packet(false);
        }

        Ok(total)
    }

    /// The open segment does not fit the current packet: move its bytes into a fresh
    ///  packet and retire the current one. Fails if segment plus remaining write can never
    ///  fit a single packet.
    fn roll_segment_into_fresh_packet(&mut self, bytes_still_to_write: usize) -> anyhow::Result<()> {
        let segment_start = self.segment_start.unwrap();
        let segment_bytes = self.current_packet.as_ref().unwrap()
            .payload()[segment_start..]
            .to_vec();

        let mut fresh = self.create_packet();
        if segment_bytes.len() + bytes_still_to_write > fresh.bytes_available_for_write() {
            bail!(
                "atomic segment of {} bytes cannot fit a single packet",
                segment_bytes.len() + bytes_still_to_write
            );
        }

        self.current_packet.as_mut().unwrap().truncate_payload(segment_start);
        self.segment_start = Some(fresh.cursor());
        fresh.write_payload_at_cursor(&segment_bytes);

        self.close_current_packet(false);
        self.current_packet = Some(fresh);
        Ok(())
    }

    /// Convenience for string fields: length-prefixed UTF-8, written as one atomic segment
    ///  for ordered lists so a string never straddles packets.
    pub fn write_string(&mut self, s: &str) -> anyhow::Result<usize> {
        self.start_segment();
        let mut written = self.write_bytes(&(s.len() as u32).to_le_bytes())?;
        written += self.write_bytes(s.as_bytes())?;
        self.end_segment();
        Ok(written)
    }

    /// Mark the start of an atomic region that must stay within one packet.
    pub fn start_segment(&mut self) {
        let cursor = match &self.current_packet {
            Some(current) => current.cursor(),
            None => {
                self.current_packet = Some(self.create_packet());
                self.current_packet.as_ref().unwrap().cursor()
            }
        };
        self.segment_start = Some(cursor);
    }

    pub fn end_segment(&mut self) {
        self.segment_start = None;
    }

    /// Finalize the in-progress packet. A packet that carries nothing beyond its tag and
    ///  extended header only counts as worth sending when `send_empty` is set.
    pub fn close_current_packet(&mut self, send_empty: bool) {
        if let Some(current) = self.current_packet.take() {
            if send_empty || current.payload_size() > self.per_packet_overhead() {
                self.packets.push_back(current);
            }
        }
        self.segment_start = None;
    }

    /// Stamp message headers across all packets on handoff to the sender: a single packet
    ///  is ONLY, longer lists run FIRST, MIDDLE..., LAST; part numbers count from zero.
    ///  Only ordered lists carry message framing.
    pub fn prepare_packets(&mut self, message_number: MessageNumber) {
        self.close_current_packet(false);

        if !self.is_ordered {
            return;
        }
        self.message_number = Some(message_number);

        let num_packets = self.packets.len();
        for (idx, packet) in self.packets.iter_mut().enumerate() {
            let position = match (num_packets, idx) {
                (1, _) => PacketPosition::Only,
                (_, 0) => PacketPosition::First,
                (n, i) if i == n - 1 => PacketPosition::Last,
                _ => PacketPosition::Middle,
            };
            packet.write_message_number(message_number, position, idx as u32);
        }
    }

    /// Move all finalized packets out, e.g. into a send channel.
    pub(crate) fn take_packets(&mut self) -> VecDeque<Packet> {
        std::mem::take(&mut self.packets)
    }

    pub(crate) fn take_front(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }
}
