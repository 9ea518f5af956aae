use crate::packet::Packet;
use crate::packet_list::PacketList;
use crate::sequence_number::MessageNumber;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Round-robin rotation is bounded to this many channels so a huge backlog of packet
///  lists cannot starve the main channel indefinitely.
const MAX_CHANNELS: usize = 16;

/// A multi-channel fair queue feeding the reliable sender.
///
/// Channel 0 ("main") holds individual packets; every queued [PacketList] gets its own
///  channel appended at the end. [PacketQueue::take_packet] pops one packet per channel in
///  rotation across the first [MAX_CHANNELS] channels, so concurrently queued messages
///  interleave on the wire instead of being serialized one after the other.
pub struct PacketQueue {
    inner: Mutex<PacketQueueInner>,
}

struct PacketQueueInner {
    current_message_number: MessageNumber,
    /// index 0 is the main channel and is never removed
    channels: Vec<VecDeque<Packet>>,
    current_channel: usize,
    channels_visited: usize,
}

impl PacketQueue {
    pub fn new(initial_message_number: MessageNumber) -> PacketQueue {
        PacketQueue {
            inner: Mutex::new(PacketQueueInner {
                current_message_number: initial_message_number,
                channels: vec![VecDeque::new()],
                current_channel: 0,
                channels_visited: 0,
            }),
        }
    }

    pub fn queue_packet(&self, packet: Packet) {
        let mut inner = self.inner.lock().unwrap();
        inner.channels[0].push_back(packet);
    }

    pub fn queue_packet_list(&self, mut packet_list: PacketList) {
        let mut inner = self.inner.lock().unwrap();

        // only ordered lists consume a message number; unordered ones carry no framing
        let message_number = if packet_list.is_ordered() {
            inner.next_message_number()
        }
        else {
            inner.current_message_number
        };
        packet_list.prepare_packets(message_number);

        let channel = packet_list.take_packets();
        if !channel.is_empty() {
            inner.channels.push(channel);
        }
    }

    /// True iff only the main channel remains and it is empty.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.channels.len() == 1 && inner.channels[0].is_empty()
    }

    pub fn take_packet(&self) -> Option<Packet> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_packet()
    }

    /// The message number most recently used to stamp a queued list.
    pub fn current_message_number(&self) -> MessageNumber {
        self.inner.lock().unwrap().current_message_number
    }
}

impl PacketQueueInner {
    fn next_message_number(&mut self) -> MessageNumber {
        self.current_message_number = self.current_message_number.next();
        self.current_message_number
    }

    fn take_packet(&mut self) -> Option<Packet> {
        let non_empty = self.channels.iter().any(|c| !c.is_empty());
        if !non_empty {
            return None;
        }

        // find the next channel with something to give - the emptiness check above
        //  guarantees termination
        while self.channels[self.current_channel].is_empty() {
            self.advance_channel();
        }

        let taken_from = self.current_channel;
        let packet = self.channels[taken_from].pop_front();

        if self.channels[taken_from].is_empty() && taken_from != 0 {
            // a drained list channel is retired; the cursor now points at the successor
            self.channels.remove(taken_from);
            if self.current_channel >= self.channels.len() {
                self.current_channel = 0;
            }
        }
        else {
            self.advance_channel();
        }

        packet
    }

    fn advance_channel(&mut self) {
        self.channels_visited += 1;
        if self.channels_visited >= MAX_CHANNELS {
            // rotation bound reached: snap back to the main channel
            self.channels_visited = 0;
            self.current_channel = 0;
            return;
        }
        self.current_channel = (self.current_channel + 1) % self.channels.len();
    }
}
