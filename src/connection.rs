use crate::congestion::CongestionControl;
use crate::control_packet::ControlPacket;
use crate::loss_list::LossList;
use crate::packet::{Packet, PacketPosition};
use crate::packet_list::PacketList;
use crate::send_pipeline::DatagramSender;
use crate::send_queue::{SendQueue, SendQueueConfig, SendQueueEvent};
use crate::sequence_number::{MessageNumber, MessagePartNumber, SequenceNumber};
use crate::stats::{ConnectionStats, Stats};
use rustc_hash::FxHashMap;
use std::cmp::min;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Out-of-order buffer for one partially received message: packets sorted by part number,
///  a cursor for the next part to hand to the application.
#[derive(Default)]
pub struct PendingReceivedMessage {
    packets: VecDeque<Packet>,
    next_part_number: MessagePartNumber,
}

impl PendingReceivedMessage {
    fn enqueue_packet(&mut self, packet: Packet) {
        let part = packet.message_part_number();
        if part < self.next_part_number {
            return;
        }

        let insert_at = self.packets
            .partition_point(|p| p.message_part_number() < part);
        if self.packets.get(insert_at).map(|p| p.message_part_number()) == Some(part) {
            return;
        }
        self.packets.insert(insert_at, packet);
    }

    fn has_available_packets(&self) -> bool {
        self.packets
            .front()
            .map(|p| p.message_part_number() == self.next_part_number)
            .unwrap_or(false)
    }

    fn remove_next_packet(&mut self) -> Option<Packet> {
        if !self.has_available_packets() {
            return None;
        }
        self.next_part_number += 1;
        self.packets.pop_front()
    }
}

/// Notification for the application surface, raised by control processing and handed back
///  to the socket loop for delivery (never invoked with connection state locked).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionNotification {
    /// Our HandshakeRequest was answered: the peer's Handshake arrived and the receive
    ///  side is established.
    ClientHandshakeRequestComplete,
    /// A handshake the peer requested ran to completion: its HandshakeACK arrived.
    ReceiverHandshakeRequestComplete,
}

/// What came out of processing one control packet.
#[derive(Default)]
pub struct ControlProcessResult {
    pub notifications: Vec<ConnectionNotification>,
    /// reassemblies dropped by a receive-state reset; each is reported to the
    ///  message-failure handler
    pub failed_messages: Vec<MessageNumber>,
}

/// Per-peer state: the handshake state machine, the reliable sender, all receive-side
///  bookkeeping (loss list, ACK emission, message reassembly) and statistics.
///
/// The handshake runs in three steps: a client sends HandshakeRequest, the data sender
///  answers with Handshake (carrying its initial sequence number) until the client's
///  HandshakeACK arrives. Data packets are ignored on the receive side and withheld on the
///  send side until the respective handshake completed.
pub struct Connection {
    destination: SocketAddr,
    sender: Arc<dyn DatagramSender>,
    congestion: Box<dyn CongestionControl>,
    stats: ConnectionStats,

    send_queue: Option<SendQueue>,
    send_queue_events: mpsc::UnboundedSender<(SocketAddr, SendQueueEvent)>,
    handshake_resend_interval: Duration,
    inactivity_timeout: Duration,

    has_received_handshake: bool,
    has_received_handshake_ack: bool,
    did_request_handshake: bool,
    peer_requested_handshake: bool,
    handshake_request_sent_at: Option<Instant>,

    /// random at creation; doubles as this connection's identity during re-handshakes
    initial_sequence_number: SequenceNumber,
    initial_receive_sequence_number: SequenceNumber,
    last_received_sequence_number: SequenceNumber,
    last_sent_ack: Option<SequenceNumber>,

    /// survive a send queue that deactivated, so a re-created queue continues the
    ///  sequence and message numbering
    last_sequence_number: SequenceNumber,
    last_message_number: MessageNumber,

    loss_list: LossList,
    pending_received_messages: FxHashMap<u32, PendingReceivedMessage>,
}

impl Connection {
    pub fn new(
        sender: Arc<dyn DatagramSender>,
        destination: SocketAddr,
        congestion: Box<dyn CongestionControl>,
        send_queue_events: mpsc::UnboundedSender<(SocketAddr, SendQueueEvent)>,
        handshake_resend_interval: Duration,
        inactivity_timeout: Duration,
    ) -> Connection {
        let initial_sequence_number = SequenceNumber::random();

        Connection {
            destination,
            sender,
            congestion,
            stats: ConnectionStats::default(),
            send_queue: None,
            send_queue_events,
            handshake_resend_interval,
            inactivity_timeout,
            has_received_handshake: false,
            has_received_handshake_ack: false,
            did_request_handshake: false,
            peer_requested_handshake: false,
            handshake_request_sent_at: None,
            initial_sequence_number,
            initial_receive_sequence_number: SequenceNumber::ZERO,
            last_received_sequence_number: SequenceNumber::ZERO,
            last_sent_ack: None,
            last_sequence_number: initial_sequence_number,
            last_message_number: MessageNumber::ZERO,
            loss_list: LossList::new(),
            pending_received_messages: FxHashMap::default(),
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Point all subsequent traffic at a new peer address.
    pub fn set_destination(&mut self, destination: SocketAddr) {
        self.destination = destination;
        if let Some(queue) = &self.send_queue {
            queue.update_destination_address(destination);
        }
    }

    pub fn initial_sequence_number(&self) -> SequenceNumber {
        self.initial_sequence_number
    }

    pub fn has_received_handshake(&self) -> bool {
        self.has_received_handshake
    }

    pub fn has_received_handshake_ack(&self) -> bool {
        self.has_received_handshake_ack
    }

    pub fn sample_stats(&mut self) -> Stats {
        self.stats.sample()
    }

    pub fn set_max_bandwidth(&mut self, bits_per_second: Option<u64>) {
        self.update_congestion_control_and_send_queue(|cc| cc.set_max_bandwidth(bits_per_second));
    }

    fn get_send_queue(&mut self) -> &SendQueue {
        if self.send_queue.is_none() {
            debug!("creating send queue for {:?}", self.destination);
            let queue = SendQueue::new(
                self.sender.clone(),
                self.destination,
                self.last_sequence_number,
                self.last_message_number,
                self.has_received_handshake_ack,
                self.send_queue_events.clone(),
                SendQueueConfig {
                    handshake_resend_interval: self.handshake_resend_interval,
                    inactivity_timeout: self.inactivity_timeout,
                },
            );
            self.send_queue = Some(queue);
            self.apply_congestion_outputs();
        }
        self.send_queue.as_ref().unwrap()
    }

    pub fn send_reliable_packet(&mut self, packet: Packet) {
        debug_assert!(packet.is_reliable());
        self.get_send_queue().queue_packet(packet);
    }

    pub fn send_reliable_packet_list(&mut self, packet_list: PacketList) {
        debug_assert!(packet_list.is_reliable());
        self.get_send_queue().queue_packet_list(packet_list);
    }

    /// Begin the client side of the handshake: ask the peer to send its Handshake. The
    ///  request is re-sent from [Connection::sync] until the Handshake arrives.
    pub async fn send_handshake_request(&mut self) {
        self.did_request_handshake = true;
        self.handshake_request_sent_at = Some(Instant::now());
        let request = ControlPacket::HandshakeRequest;
        trace!("sending {:?} to {:?}", request, self.destination);
        self.sender.send_datagram(self.destination, &request.to_wire_bytes()).await;
    }

    /// Send a HandshakeRequest unless one went out within the resend interval.
    async fn request_handshake_if_due(&mut self) {
        let due = self.handshake_request_sent_at
            .map(|sent_at| sent_at.elapsed() >= self.handshake_resend_interval)
            .unwrap_or(true);
        if due {
            self.send_handshake_request().await;
        }
    }

    /// Rate-control hook, fired by the socket for every connection on the SYN interval:
    ///  lets the congestion controller run its periodic update, emits the pending ACK and
    ///  keeps an unanswered HandshakeRequest alive.
    pub async fn sync(&mut self) {
        self.update_congestion_control_and_send_queue(|cc| cc.on_syn());
        self.send_ack().await;

        if self.did_request_handshake && !self.has_received_handshake {
            self.request_handshake_if_due().await;
        }
    }

    /// The next-expected sequence number: the smallest missing one, or one past the last
    ///  received if nothing is missing.
    fn next_ack(&self) -> SequenceNumber {
        self.loss_list.first()
            .unwrap_or_else(|| self.last_received_sequence_number.next())
    }

    async fn send_ack(&mut self) {
        if !self.has_received_handshake {
            return;
        }

        let next_ack = self.next_ack();
        // ACKs are monotonic: emit only when the next-expected number advanced
        if let Some(last_sent) = self.last_sent_ack {
            if !next_ack.is_after(last_sent) {
                return;
            }
        }

        let ack = ControlPacket::Ack { sequence_number: next_ack };
        trace!("sending {:?} to {:?}", ack, self.destination);
        self.sender.send_datagram(self.destination, &ack.to_wire_bytes()).await;

        self.last_sent_ack = Some(next_ack);
        self.stats.record_ack_sent();
    }

    /// Per received data packet: duplicate / reorder / gap handling.
    ///
    /// Returns whether the packet should be processed further; duplicates and pre-handshake
    ///  data answer `false`.
    pub async fn process_received_sequence_number(
        &mut self,
        sequence_number: SequenceNumber,
        packet_size: usize,
        payload_size: usize,
    ) -> bool {
        if !self.has_received_handshake {
            // data from a peer whose stream we cannot place - ask it to handshake
            trace!("data packet {} before handshake from {:?} - requesting handshake", sequence_number, self.destination);
            self.request_handshake_if_due().await;
            return false;
        }

        let next_expected = self.last_received_sequence_number.next();
        if sequence_number == next_expected {
            self.last_received_sequence_number = sequence_number;
        }
        else if sequence_number.is_after(next_expected) {
            // everything between the previous high mark and this packet is missing
            let lo = next_expected;
            let hi = sequence_number.prev();
            self.loss_list.append_range(lo, hi);
            self.stats.record_losses_detected(lo.span_to(hi));
            self.last_received_sequence_number = sequence_number;

            let nak = ControlPacket::Nak { lo, hi };
            trace!("gap detected - sending {:?} to {:?}", nak, self.destination);
            self.sender.send_datagram(self.destination, &nak.to_wire_bytes()).await;
        }
        else {
            // at or below the high mark: either fills a hole or is a duplicate
            if self.loss_list.remove(sequence_number) {
                self.stats.record_loss_recovered();
            }
            else {
                trace!("duplicate packet {} from {:?}", sequence_number, self.destination);
                self.stats.record_duplicate();
                return false;
            }
        }

        self.stats.record_received_reliable(packet_size, payload_size);
        true
    }

    /// Route a control packet through the handshake state machine / the sender.
    pub async fn process_control(&mut self, control: ControlPacket) -> ControlProcessResult {
        let mut result = ControlProcessResult::default();

        match control {
            ControlPacket::Ack { sequence_number } => {
                if !self.has_received_handshake_ack {
                    trace!("ACK {} before handshake completed - ignoring", sequence_number);
                    return result;
                }
                self.stats.record_ack_received();

                if let Some(queue) = &self.send_queue {
                    let rtt = queue.ack(sequence_number);
                    let packets_in_flight = queue.packets_in_flight();
                    if let Some(rtt) = rtt {
                        self.stats.record_rtt(rtt);
                    }
                    self.update_congestion_control_and_send_queue(|cc| {
                        cc.on_ack(sequence_number, rtt, packets_in_flight)
                    });
                }
            }

            ControlPacket::Handshake { initial_sequence_number } => {
                if !self.has_received_handshake
                    || initial_sequence_number != self.initial_receive_sequence_number
                {
                    if self.has_received_handshake {
                        debug!("peer {:?} re-handshakes with a new initial sequence number - resetting receive state", self.destination);
                        result.failed_messages = self.reset_receive_state();
                    }
                    self.initial_receive_sequence_number = initial_sequence_number;
                    self.last_received_sequence_number = initial_sequence_number;
                    self.has_received_handshake = true;
                }

                let ack = ControlPacket::HandshakeAck { initial_sequence_number };
                trace!("sending {:?} to {:?}", ack, self.destination);
                self.sender.send_datagram(self.destination, &ack.to_wire_bytes()).await;

                if self.did_request_handshake {
                    self.did_request_handshake = false;
                    result.notifications.push(ConnectionNotification::ClientHandshakeRequestComplete);
                }
            }

            ControlPacket::HandshakeAck { initial_sequence_number } => {
                // a HandshakeACK for any other initial number belongs to a stale exchange
                if initial_sequence_number == self.initial_sequence_number
                    && !self.has_received_handshake_ack
                {
                    debug!("handshake with {:?} complete - data may flow", self.destination);
                    self.has_received_handshake_ack = true;
                    if let Some(queue) = &self.send_queue {
                        queue.handshake_ack();
                    }
                    if self.peer_requested_handshake {
                        self.peer_requested_handshake = false;
                        result.notifications.push(ConnectionNotification::ReceiverHandshakeRequestComplete);
                    }
                }
            }

            ControlPacket::HandshakeRequest => {
                self.peer_requested_handshake = true;
                if self.has_received_handshake_ack {
                    debug!("peer {:?} requested a fresh handshake - resetting", self.destination);
                    self.has_received_handshake_ack = false;
                    self.has_received_handshake = false;
                    if let Some(queue) = &self.send_queue {
                        queue.reset_handshake();
                    }
                    result.failed_messages = self.reset_receive_state();
                }
                // get Handshake packets flowing even before any data is queued
                self.get_send_queue().start();
            }

            ControlPacket::Nak { lo, hi } => {
                if !self.has_received_handshake_ack {
                    trace!("NAK before handshake completed - ignoring");
                    return result;
                }
                if let Some(queue) = &self.send_queue {
                    queue.fast_retransmit_range(lo, hi);
                }
                self.update_congestion_control_and_send_queue(|cc| cc.on_loss(lo, hi));
            }
        }

        result
    }

    /// Clear the loss list and all reassembly state; returns the message numbers whose
    ///  reassembly is abandoned.
    fn reset_receive_state(&mut self) -> Vec<MessageNumber> {
        self.loss_list.clear();
        self.last_received_sequence_number = self.initial_receive_sequence_number;
        self.last_sent_ack = None;

        self.pending_received_messages
            .drain()
            .map(|(raw, _)| MessageNumber::new(raw))
            .collect()
    }

    /// Slot a message packet into its reassembly buffer; returns any packets that became
    ///  deliverable in order. The reassembly entry is dropped once its LAST (or ONLY) part
    ///  has been drained.
    pub fn queue_received_message_packet(&mut self, packet: Packet) -> Vec<Packet> {
        debug_assert!(packet.is_part_of_message());

        let message_number = packet.message_number().to_raw();
        let pending = self.pending_received_messages
            .entry(message_number)
            .or_default();
        pending.enqueue_packet(packet);

        let mut deliverable = Vec::new();
        let mut message_complete = false;
        while let Some(next) = pending.remove_next_packet() {
            message_complete |= matches!(
                next.packet_position(),
                PacketPosition::Last | PacketPosition::Only
            );
            deliverable.push(next);
        }

        if message_complete {
            self.pending_received_messages.remove(&message_number);
        }
        deliverable
    }

    /// Statistics bookkeeping for unreliable traffic sent to this peer. Does not send
    ///  anything itself.
    pub fn record_sent_unreliable_packets(&mut self, wire_size: usize, payload_size: usize) {
        self.stats.record_sent_unreliable(wire_size, payload_size);
    }

    /// Statistics bookkeeping for unreliable traffic received from this peer. Does not
    ///  process anything itself.
    pub fn record_received_unreliable_packets(&mut self, wire_size: usize, payload_size: usize) {
        self.stats.record_received_unreliable(wire_size, payload_size);
    }

    /// Bookkeeping for send-queue notifications, invoked from the socket loop.
    pub fn handle_send_queue_event(&mut self, event: &SendQueueEvent) {
        match *event {
            SendQueueEvent::PacketSent { wire_size, payload_size, sequence_number } => {
                self.stats.record_sent_reliable(wire_size, payload_size);
                self.update_congestion_control_and_send_queue(|cc| {
                    cc.on_packet_sent(wire_size, sequence_number)
                });
            }
            SendQueueEvent::PacketRetransmitted { wire_size, payload_size, .. } => {
                self.stats.record_retransmission(wire_size, payload_size);
            }
            SendQueueEvent::QueueInactive => {
                debug!("send queue for {:?} went inactive", self.destination);
                self.stop_send_queue();
            }
            SendQueueEvent::Timeout => {
                debug!("send queue for {:?} timed out", self.destination);
                self.update_congestion_control_and_send_queue(|cc| cc.on_timeout());
                self.stop_send_queue();
            }
        }
    }

    /// Run a congestion-control update and immediately push the resulting knobs into the
    ///  send queue so period, windows and timeout stay coherent.
    pub fn update_congestion_control_and_send_queue(
        &mut self,
        congestion_callback: impl FnOnce(&mut dyn CongestionControl),
    ) {
        congestion_callback(self.congestion.as_mut());
        self.apply_congestion_outputs();
    }

    fn apply_congestion_outputs(&mut self) {
        let Some(queue) = &self.send_queue else {
            return;
        };

        let send_period = self.congestion.packet_send_period();
        let congestion_window = self.congestion.congestion_window_size();
        let flow_window = min(self.congestion.flow_window_size(), congestion_window);

        queue.set_packet_send_period(send_period);
        queue.set_estimated_timeout(self.congestion.estimated_timeout());
        queue.set_flow_window_size(flow_window);

        self.stats.record_packet_send_period(send_period);
        self.stats.record_flow_window_size(flow_window);
        self.stats.record_congestion_window_size(congestion_window);
    }

    fn stop_send_queue(&mut self) {
        if let Some(queue) = self.send_queue.take() {
            // keep the numbering so a future queue continues the sequence
            self.last_sequence_number = queue.current_sequence_number();
            self.last_message_number = queue.current_message_number();
            queue.stop();
        }
    }

    /// Tear the connection down: stop the sender and abandon pending reassemblies,
    ///  returning their message numbers so each can be reported as failed.
    pub fn shutdown(&mut self) -> Vec<MessageNumber> {
        self.stop_send_queue();
        self.pending_received_messages
            .drain()
            .map(|(raw, _)| MessageNumber::new(raw))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::FixedRateCongestionControl;
    use crate::payload::PayloadIo;
    use crate::send_pipeline::MockDatagramSender;
    use std::sync::Mutex;
    use tokio::runtime::Builder;

    fn destination() -> SocketAddr {
        SocketAddr::from(([1, 2, 3, 4], 9))
    }

    /// records every outgoing control packet for assertions
    fn recording_sender() -> (MockDatagramSender, Arc<Mutex<Vec<ControlPacket>>>) {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let recorded_clone = recorded.clone();

        let mut sender = MockDatagramSender::new();
        sender.expect_send_datagram()
            .returning(move |_, datagram| {
                let mut parse = datagram;
                if let Ok(control) = ControlPacket::deser(&mut parse) {
                    recorded_clone.lock().unwrap().push(control);
                }
            });
        (sender, recorded)
    }

    fn new_connection(sender: MockDatagramSender) -> Connection {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        Connection::new(
            Arc::new(sender),
            destination(),
            Box::new(FixedRateCongestionControl::default()),
            events_tx,
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
    }

    /// a connection whose receive side is established with the given initial number
    async fn established_connection(
        sender: MockDatagramSender,
        initial_receive: u32,
    ) -> Connection {
        let mut connection = new_connection(sender);
        connection.process_control(ControlPacket::Handshake {
            initial_sequence_number: SequenceNumber::new(initial_receive),
        }).await;
        connection
    }

    fn message_packet(message_number: u32, part: u32, position: PacketPosition, payload: &[u8]) -> Packet {
        let mut packet = Packet::new(None, true, true);
        packet.write_message_number(MessageNumber::new(message_number), position, part);
        packet.write_payload_at_cursor(payload);
        packet
    }

    fn rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap()
    }

    #[test]
    fn test_handshake_records_initial_and_acks_back() {
        rt().block_on(async {
            let (sender, recorded) = recording_sender();
            let mut connection = new_connection(sender);
            assert!(!connection.has_received_handshake());

            let result = connection.process_control(ControlPacket::Handshake {
                initial_sequence_number: SequenceNumber::new(500),
            }).await;

            assert!(connection.has_received_handshake());
            assert!(result.notifications.is_empty());
            assert_eq!(*recorded.lock().unwrap(), vec![
                ControlPacket::HandshakeAck { initial_sequence_number: SequenceNumber::new(500) },
            ]);
        });
    }

    #[test]
    fn test_handshake_after_request_notifies_client_completion() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = new_connection(sender);
            connection.send_handshake_request().await;

            let result = connection.process_control(ControlPacket::Handshake {
                initial_sequence_number: SequenceNumber::new(500),
            }).await;
            assert_eq!(result.notifications, vec![ConnectionNotification::ClientHandshakeRequestComplete]);

            // a repeated Handshake with the same number does not notify again
            let result = connection.process_control(ControlPacket::Handshake {
                initial_sequence_number: SequenceNumber::new(500),
            }).await;
            assert!(result.notifications.is_empty());
        });
    }

    #[test]
    fn test_in_order_sequence_numbers_accepted() {
        rt().block_on(async {
            let (sender, recorded) = recording_sender();
            let mut connection = established_connection(sender, 100).await;

            assert!(connection.process_received_sequence_number(SequenceNumber::new(101), 50, 20).await);
            assert!(connection.process_received_sequence_number(SequenceNumber::new(102), 50, 20).await);

            // no NAK was emitted
            assert_eq!(recorded.lock().unwrap().len(), 1); // just the HandshakeACK
        });
    }

    #[test]
    fn test_data_before_handshake_requests_handshake() {
        rt().block_on(async {
            let (sender, recorded) = recording_sender();
            let mut connection = new_connection(sender);

            assert!(!connection.process_received_sequence_number(SequenceNumber::new(5), 50, 20).await);
            assert_eq!(*recorded.lock().unwrap(), vec![ControlPacket::HandshakeRequest]);
        });
    }

    #[test]
    fn test_gap_inserts_loss_list_and_sends_nak() {
        rt().block_on(async {
            let (sender, recorded) = recording_sender();
            let mut connection = established_connection(sender, 100).await;

            assert!(connection.process_received_sequence_number(SequenceNumber::new(101), 50, 20).await);
            // 102 and 103 go missing
            assert!(connection.process_received_sequence_number(SequenceNumber::new(104), 50, 20).await);

            let recorded = recorded.lock().unwrap();
            assert_eq!(recorded[1], ControlPacket::Nak {
                lo: SequenceNumber::new(102),
                hi: SequenceNumber::new(103),
            });
        });
    }

    #[test]
    fn test_gap_fill_and_duplicate() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = established_connection(sender, 100).await;

            // arrival order: 101, 103, 104, 102 - the straggler fills the hole
            for seq in [101u32, 103, 104] {
                assert!(connection.process_received_sequence_number(SequenceNumber::new(seq), 50, 20).await);
            }
            assert!(connection.process_received_sequence_number(SequenceNumber::new(102), 50, 20).await);

            // a second copy of 102 is a duplicate now
            assert!(!connection.process_received_sequence_number(SequenceNumber::new(102), 50, 20).await);

            let stats = connection.sample_stats();
            assert_eq!(stats.losses_detected, 1);
            assert_eq!(stats.losses_recovered, 1);
            assert_eq!(stats.duplicate_packets, 1);
            assert_eq!(stats.received_reliable.packets, 4);
        });
    }

    #[test]
    fn test_ack_emission_on_sync() {
        rt().block_on(async {
            let (sender, recorded) = recording_sender();
            let mut connection = established_connection(sender, 100).await;

            // nothing received yet: the first sync sends the initial next-expected ACK
            connection.sync().await;
            assert_eq!(recorded.lock().unwrap().last(), Some(&ControlPacket::Ack {
                sequence_number: SequenceNumber::new(101),
            }));

            connection.process_received_sequence_number(SequenceNumber::new(101), 50, 20).await;
            connection.sync().await;
            assert_eq!(recorded.lock().unwrap().last(), Some(&ControlPacket::Ack {
                sequence_number: SequenceNumber::new(102),
            }));

            // no progress, no ACK
            let count_before = recorded.lock().unwrap().len();
            connection.sync().await;
            assert_eq!(recorded.lock().unwrap().len(), count_before);
        });
    }

    #[test]
    fn test_ack_points_at_smallest_missing() {
        rt().block_on(async {
            let (sender, recorded) = recording_sender();
            let mut connection = established_connection(sender, 100).await;

            connection.process_received_sequence_number(SequenceNumber::new(101), 50, 20).await;
            connection.process_received_sequence_number(SequenceNumber::new(103), 50, 20).await;

            connection.sync().await;
            assert_eq!(recorded.lock().unwrap().last(), Some(&ControlPacket::Ack {
                sequence_number: SequenceNumber::new(102),
            }));

            // the hole fills: next ACK advances past everything received
            connection.process_received_sequence_number(SequenceNumber::new(102), 50, 20).await;
            connection.sync().await;
            assert_eq!(recorded.lock().unwrap().last(), Some(&ControlPacket::Ack {
                sequence_number: SequenceNumber::new(104),
            }));
        });
    }

    #[test]
    fn test_handshake_request_while_established_resets_once() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = established_connection(sender, 100).await;

            // complete the sender-side handshake so the connection is fully established
            connection.send_reliable_packet(Packet::new(Some(16), true, false));
            connection.process_control(ControlPacket::HandshakeAck {
                initial_sequence_number: connection.initial_sequence_number(),
            }).await;
            assert!(connection.has_received_handshake_ack());

            // an unfinished reassembly is pending
            connection.queue_received_message_packet(
                message_packet(7, 0, PacketPosition::First, &[1]),
            );

            let result = connection.process_control(ControlPacket::HandshakeRequest).await;
            assert!(!connection.has_received_handshake_ack());
            assert_eq!(result.failed_messages, vec![MessageNumber::new(7)]);

            // while not established, further requests reset nothing more
            let result = connection.process_control(ControlPacket::HandshakeRequest).await;
            assert!(result.failed_messages.is_empty());
            assert!(result.notifications.is_empty());

            // the re-handshake completes when the fresh HandshakeACK arrives
            let result = connection.process_control(ControlPacket::HandshakeAck {
                initial_sequence_number: connection.initial_sequence_number(),
            }).await;
            assert!(connection.has_received_handshake_ack());
            assert_eq!(result.notifications, vec![ConnectionNotification::ReceiverHandshakeRequestComplete]);
        });
    }

    #[test]
    fn test_spurious_handshake_ack_is_noop() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = new_connection(sender);

            // wrong initial sequence number: not our handshake
            connection.process_control(ControlPacket::HandshakeAck {
                initial_sequence_number: connection.initial_sequence_number() + 1,
            }).await;
            assert!(!connection.has_received_handshake_ack());

            connection.process_control(ControlPacket::HandshakeAck {
                initial_sequence_number: connection.initial_sequence_number(),
            }).await;
            assert!(connection.has_received_handshake_ack());
        });
    }

    #[test]
    fn test_ack_before_handshake_is_ignored() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = new_connection(sender);

            connection.process_control(ControlPacket::Ack {
                sequence_number: SequenceNumber::new(5),
            }).await;
            assert_eq!(connection.sample_stats().acks_received, 0);
        });
    }

    #[test]
    fn test_message_reassembly_in_order() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = new_connection(sender);

            let delivered = connection.queue_received_message_packet(
                message_packet(1, 0, PacketPosition::First, &[1]),
            );
            assert_eq!(delivered.len(), 1);

            let delivered = connection.queue_received_message_packet(
                message_packet(1, 1, PacketPosition::Middle, &[2]),
            );
            assert_eq!(delivered.len(), 1);

            let delivered = connection.queue_received_message_packet(
                message_packet(1, 2, PacketPosition::Last, &[3]),
            );
            assert_eq!(delivered.len(), 1);
            assert!(connection.pending_received_messages.is_empty());
        });
    }

    #[test]
    fn test_message_reassembly_buffers_out_of_order_parts() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = new_connection(sender);

            // parts 1 and 2 arrive before part 0
            assert!(connection.queue_received_message_packet(
                message_packet(1, 1, PacketPosition::Middle, &[2]),
            ).is_empty());
            assert!(connection.queue_received_message_packet(
                message_packet(1, 2, PacketPosition::Last, &[3]),
            ).is_empty());

            let delivered = connection.queue_received_message_packet(
                message_packet(1, 0, PacketPosition::First, &[1]),
            );
            let parts = delivered.iter().map(|p| p.message_part_number()).collect::<Vec<_>>();
            assert_eq!(parts, vec![0, 1, 2]);
            let payloads = delivered.iter().map(|p| p.payload()[0]).collect::<Vec<_>>();
            assert_eq!(payloads, vec![1, 2, 3]);
            assert!(connection.pending_received_messages.is_empty());
        });
    }

    #[test]
    fn test_message_reassembly_interleaved_messages() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = new_connection(sender);

            assert_eq!(connection.queue_received_message_packet(
                message_packet(1, 0, PacketPosition::First, &[1]),
            ).len(), 1);
            assert_eq!(connection.queue_received_message_packet(
                message_packet(2, 0, PacketPosition::Only, &[9]),
            ).len(), 1);
            assert_eq!(connection.queue_received_message_packet(
                message_packet(1, 1, PacketPosition::Last, &[2]),
            ).len(), 1);

            assert!(connection.pending_received_messages.is_empty());
        });
    }

    #[test]
    fn test_duplicate_message_part_ignored() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = new_connection(sender);

            assert!(connection.queue_received_message_packet(
                message_packet(1, 1, PacketPosition::Last, &[2]),
            ).is_empty());
            // the same part again changes nothing
            assert!(connection.queue_received_message_packet(
                message_packet(1, 1, PacketPosition::Last, &[2]),
            ).is_empty());

            let delivered = connection.queue_received_message_packet(
                message_packet(1, 0, PacketPosition::First, &[1]),
            );
            assert_eq!(delivered.len(), 2);
        });
    }

    #[test]
    fn test_shutdown_fails_pending_reassemblies() {
        rt().block_on(async {
            let (sender, _recorded) = recording_sender();
            let mut connection = new_connection(sender);

            connection.queue_received_message_packet(
                message_packet(3, 0, PacketPosition::First, &[1]),
            );
            connection.queue_received_message_packet(
                message_packet(8, 0, PacketPosition::First, &[1]),
            );

            let mut failed = connection.shutdown();
            failed.sort_by_key(|mn| mn.to_raw());
            assert_eq!(failed, vec![MessageNumber::new(3), MessageNumber::new(8)]);
        });
    }

    #[test]
    fn test_nak_forwards_to_send_queue_and_congestion() {
        rt().block_on(async {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let sent_clone = sent.clone();
            let mut sender = MockDatagramSender::new();
            sender.expect_send_datagram()
                .returning(move |_, datagram| {
                    sent_clone.lock().unwrap().push(datagram.to_vec());
                });

            let mut connection = new_connection(sender);
            let mut packet = Packet::new(Some(16), true, false);
            packet.write_payload_at_cursor(&[42]);
            connection.send_reliable_packet(packet);
            connection.process_control(ControlPacket::HandshakeAck {
                initial_sequence_number: connection.initial_sequence_number(),
            }).await;

            tokio::time::sleep(Duration::from_millis(50)).await;
            let sent_before = sent.lock().unwrap().len();

            let first_data_seq = connection.initial_sequence_number() + 1;
            connection.process_control(ControlPacket::Nak {
                lo: first_data_seq,
                hi: first_data_seq,
            }).await;
            tokio::time::sleep(Duration::from_millis(50)).await;

            // one retransmission went out
            assert_eq!(sent.lock().unwrap().len(), sent_before + 1);
        });
    }

    #[test]
    fn test_set_destination_updates_send_queue() {
        rt().block_on(async {
            let destinations = Arc::new(Mutex::new(Vec::new()));
            let destinations_clone = destinations.clone();
            let mut sender = MockDatagramSender::new();
            sender.expect_send_datagram()
                .returning(move |to, _| {
                    destinations_clone.lock().unwrap().push(to);
                });

            let mut connection = new_connection(sender);
            connection.send_reliable_packet(Packet::new(Some(16), true, false));
            connection.process_control(ControlPacket::HandshakeAck {
                initial_sequence_number: connection.initial_sequence_number(),
            }).await;
            tokio::time::sleep(Duration::from_millis(30)).await;

            let new_destination = SocketAddr::from(([9, 9, 9, 9], 1));
            connection.set_destination(new_destination);
            assert_eq!(connection.destination(), new_destination);

            let mut another = Packet::new(Some(16), true, false);
            another.write_payload_at_cursor(&[1]);
            connection.send_reliable_packet(another);
            tokio::time::sleep(Duration::from_millis(30)).await;

            assert_eq!(destinations.lock().unwrap().last(), Some(&new_destination));
        });
    }
}
