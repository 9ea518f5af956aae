use crate::config::{MAXIMUM_ESTIMATED_TIMEOUT, MINIMUM_ESTIMATED_TIMEOUT};
use crate::loss_list::LossList;
use crate::packet::{ObfuscationLevel, Packet};
use crate::packet_list::PacketList;
use crate::packet_queue::PacketQueue;
use crate::send_pipeline::DatagramSender;
use crate::sequence_number::{MessageNumber, SequenceNumber};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, trace};

/// Lifecycle of a send queue's loop task.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum State {
    NotStarted,
    Running,
    Stopped,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::NotStarted,
            1 => State::Running,
            _ => State::Stopped,
        }
    }
}

/// Notifications out of a send queue, delivered to the socket loop so stats and teardown
///  happen there rather than inside a loop iteration with locks held.
#[derive(Debug, Clone)]
pub enum SendQueueEvent {
    PacketSent {
        wire_size: usize,
        payload_size: usize,
        sequence_number: SequenceNumber,
    },
    PacketRetransmitted {
        wire_size: usize,
        payload_size: usize,
        sequence_number: SequenceNumber,
    },
    /// Nothing queued, nothing in flight for the inactivity period; the queue stopped
    ///  itself. This is a normal shutdown, not an error.
    QueueInactive,
    /// No receiver response within the estimated timeout while packets were in flight.
    Timeout,
}

pub struct SendQueueConfig {
    pub handshake_resend_interval: Duration,
    pub inactivity_timeout: Duration,
}

struct SentPacketEntry {
    resend_count: u8,
    first_sent_at: Instant,
    packet: Packet,
}

/// The reliable sender for one connection.
///
/// The loop runs on its own tokio task, spawned on the first enqueue. Each iteration is
///  one send slot: wait out the pacing period, prefer a retransmission from the NAK list,
///  otherwise send a fresh packet unless the flow window is saturated. No data flows until
///  the peer has acknowledged our Handshake.
///
/// Shared state is partitioned into individually locked pieces with strictly short
///  critical sections; where two are taken the order is sent-packets before NAKs.
pub struct SendQueue {
    shared: Arc<SendQueueShared>,
}

struct SendQueueShared {
    packets: PacketQueue,
    sender: Arc<dyn DatagramSender>,
    events: mpsc::UnboundedSender<(SocketAddr, SendQueueEvent)>,
    config: SendQueueConfig,

    destination: Mutex<SocketAddr>,
    state: AtomicU8,

    initial_sequence_number: SequenceNumber,
    /// raw value of the last sequence number handed out
    current_sequence_number: AtomicU32,
    /// raw value of the newest ACK received (next-expected semantics)
    last_ack_sequence_number: AtomicU32,

    has_received_handshake_ack: AtomicBool,

    sent_packets: RwLock<FxHashMap<SequenceNumber, SentPacketEntry>>,
    naks: Mutex<LossList>,

    packet_send_period_micros: AtomicU64,
    estimated_timeout_micros: AtomicU64,
    flow_window_size: AtomicU32,

    last_receiver_response: Mutex<Instant>,

    /// wakes the loop out of its idle / pacing waits
    wake: Notify,
    /// wakes the handshake wait
    handshake_notify: Notify,
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SendQueue {
    pub fn new(
        sender: Arc<dyn DatagramSender>,
        destination: SocketAddr,
        initial_sequence_number: SequenceNumber,
        initial_message_number: MessageNumber,
        has_received_handshake_ack: bool,
        events: mpsc::UnboundedSender<(SocketAddr, SendQueueEvent)>,
        config: SendQueueConfig,
    ) -> SendQueue {
        SendQueue {
            shared: Arc::new(SendQueueShared {
                packets: PacketQueue::new(initial_message_number),
                sender,
                events,
                config,
                destination: Mutex::new(destination),
                state: AtomicU8::new(State::NotStarted as u8),
                initial_sequence_number,
                current_sequence_number: AtomicU32::new(initial_sequence_number.to_raw()),
                last_ack_sequence_number: AtomicU32::new(initial_sequence_number.to_raw()),
                has_received_handshake_ack: AtomicBool::new(has_received_handshake_ack),
                sent_packets: RwLock::new(FxHashMap::default()),
                naks: Mutex::new(LossList::new()),
                packet_send_period_micros: AtomicU64::new(0),
                estimated_timeout_micros: AtomicU64::new(MAXIMUM_ESTIMATED_TIMEOUT.as_micros() as u64),
                flow_window_size: AtomicU32::new(crate::config::DEFAULT_FLOW_WINDOW_SIZE),
                last_receiver_response: Mutex::new(Instant::now()),
                wake: Notify::new(),
                handshake_notify: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn current_sequence_number(&self) -> SequenceNumber {
        SequenceNumber::new(self.shared.current_sequence_number.load(Ordering::SeqCst))
    }

    pub fn current_message_number(&self) -> MessageNumber {
        self.shared.packets.current_message_number()
    }

    /// Number of packets awaiting acknowledgement.
    pub fn packets_in_flight(&self) -> u32 {
        self.shared.sent_packets.read().unwrap().len() as u32
    }

    /// Enqueue a single packet; starts the loop task if this is the first enqueue.
    pub fn queue_packet(&self, packet: Packet) {
        self.shared.packets.queue_packet(packet);
        self.ensure_running();
        self.shared.wake.notify_one();
    }

    /// Enqueue a packet list into its own fair-queue channel; starts the loop task if this
    ///  is the first enqueue.
    pub fn queue_packet_list(&self, packet_list: PacketList) {
        self.shared.packets.queue_packet_list(packet_list);
        self.ensure_running();
        self.shared.wake.notify_one();
    }

    /// Start the loop task without enqueueing anything - used to get Handshake packets
    ///  flowing in response to a peer's HandshakeRequest.
    pub fn start(&self) {
        self.ensure_running();
        self.shared.wake.notify_one();
    }

    fn ensure_running(&self) {
        let flipped = self.shared.state.compare_exchange(
            State::NotStarted as u8,
            State::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ).is_ok();

        if flipped {
            debug!("starting send queue for {:?}", *self.shared.destination.lock().unwrap());
            tokio::spawn(SendQueueShared::run(self.shared.clone()));
        }
    }

    /// Process a received ACK. Returns the RTT inferred from the newest acknowledged
    ///  packet, if a clean sample is available.
    pub fn ack(&self, ack: SequenceNumber) -> Option<Duration> {
        let shared = &self.shared;

        let last = SequenceNumber::new(shared.last_ack_sequence_number.load(Ordering::SeqCst));
        if !ack.is_after(last) {
            trace!("ignoring stale ACK {} (last was {})", ack, last);
            return None;
        }

        let now = Instant::now();
        let mut rtt_sample: Option<(SequenceNumber, Instant)> = None;
        {
            let mut sent = shared.sent_packets.write().unwrap();
            sent.retain(|&seq, entry| {
                if seq.is_before(ack) {
                    // no RTT sample from retransmitted packets: the ACK could refer to
                    //  either transmission
                    if entry.resend_count == 0 {
                        let newer = rtt_sample.map(|(s, _)| seq.is_after(s)).unwrap_or(true);
                        if newer {
                            rtt_sample = Some((seq, entry.first_sent_at));
                        }
                    }
                    false
                }
                else {
                    true
                }
            });
        }
        shared.naks.lock().unwrap().remove_up_to(ack);

        shared.last_ack_sequence_number.store(ack.to_raw(), Ordering::SeqCst);
        *shared.last_receiver_response.lock().unwrap() = now;
        shared.wake.notify_one();

        rtt_sample.map(|(_, sent_at)| now - sent_at)
    }

    /// Hint that a single sequence number needs retransmission.
    pub fn fast_retransmit(&self, seq: SequenceNumber) {
        self.fast_retransmit_range(seq, seq);
    }

    /// A NAK reported the inclusive range `[lo, hi]` as missing.
    pub fn fast_retransmit_range(&self, lo: SequenceNumber, hi: SequenceNumber) {
        self.shared.naks.lock().unwrap().append_range(lo, hi);
        self.shared.wake.notify_one();
    }

    /// The peer acknowledged our Handshake; data may flow.
    pub fn handshake_ack(&self) {
        self.shared.has_received_handshake_ack.store(true, Ordering::SeqCst);
        *self.shared.last_receiver_response.lock().unwrap() = Instant::now();
        self.shared.handshake_notify.notify_one();
        self.shared.wake.notify_one();
    }

    /// The peer asked for a fresh handshake; stop sending data until it is acknowledged
    ///  again.
    pub fn reset_handshake(&self) {
        self.shared.has_received_handshake_ack.store(false, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    pub fn has_received_handshake_ack(&self) -> bool {
        self.shared.has_received_handshake_ack.load(Ordering::SeqCst)
    }

    /// Atomically swap the destination; subsequent sends use the new address.
    pub fn update_destination_address(&self, new_address: SocketAddr) {
        let mut destination = self.shared.destination.lock().unwrap();
        if *destination != new_address {
            debug!("send queue destination changes from {:?} to {:?}", *destination, new_address);
            *destination = new_address;
            self.shared.handshake_notify.notify_one();
            self.shared.wake.notify_one();
        }
    }

    pub fn set_packet_send_period(&self, period: Duration) {
        self.shared.packet_send_period_micros.store(period.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set_estimated_timeout(&self, timeout: Duration) {
        self.shared.estimated_timeout_micros.store(timeout.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set_flow_window_size(&self, flow_window_size: u32) {
        self.shared.flow_window_size.store(flow_window_size, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Transition to `Stopped` and wake every wait; the loop exits at its next safe point
    ///  without sending queued data.
    pub fn stop(&self) {
        self.shared.state.store(State::Stopped as u8, Ordering::SeqCst);
        self.shared.wake.notify_one();
        self.shared.handshake_notify.notify_one();
    }
}

impl SendQueueShared {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn destination(&self) -> SocketAddr {
        *self.destination.lock().unwrap()
    }

    fn estimated_timeout(&self) -> Duration {
        Duration::from_micros(self.estimated_timeout_micros.load(Ordering::SeqCst))
            .clamp(MINIMUM_ESTIMATED_TIMEOUT, MAXIMUM_ESTIMATED_TIMEOUT)
    }

    fn emit(&self, event: SendQueueEvent) {
        let _ = self.events.send((self.destination(), event));
    }

    fn next_sequence_number(&self) -> SequenceNumber {
        let raw = self.current_sequence_number
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                Some(SequenceNumber::new(raw).next().to_raw())
            })
            .unwrap();
        SequenceNumber::new(raw).next()
    }

    fn is_flow_window_full(&self) -> bool {
        let current = SequenceNumber::new(self.current_sequence_number.load(Ordering::SeqCst));
        let last_ack = SequenceNumber::new(self.last_ack_sequence_number.load(Ordering::SeqCst));
        last_ack.distance_to(current) >= self.flow_window_size.load(Ordering::SeqCst)
    }

    async fn send_handshake(&self) {
        let handshake = crate::control_packet::ControlPacket::Handshake {
            initial_sequence_number: self.initial_sequence_number,
        };
        trace!("sending {:?} to {:?}", handshake, self.destination());
        self.sender.send_datagram(self.destination(), &handshake.to_wire_bytes()).await;
    }

    /// One packet from the NAK list, if any is still unacknowledged. Entries that left the
    ///  sent-packet table were acknowledged while queued for resend and are skipped.
    async fn maybe_resend_packet(&self) -> bool {
        loop {
            let seq = self.naks.lock().unwrap().pop_front();
            let Some(seq) = seq else {
                return false;
            };

            let resend = {
                let mut sent = self.sent_packets.write().unwrap();
                match sent.get_mut(&seq) {
                    None => {
                        trace!("NAK'd packet {} already acknowledged - skipping", seq);
                        continue;
                    }
                    Some(entry) => {
                        entry.resend_count += 1;
                        if entry.resend_count >= 2 {
                            // from the second resend onward, rotate the payload through the
                            //  obfuscation levels so repeated copies differ on the wire
                            let level = ObfuscationLevel::from_bits(((entry.resend_count - 2) % 4) as u32);
                            entry.packet.obfuscate(level);
                        }
                        entry.packet.write_sequence_number(seq);
                        (
                            entry.packet.wire_bytes().to_vec(),
                            entry.packet.wire_size(),
                            entry.packet.payload_size(),
                        )
                    }
                }
            };

            let (wire, wire_size, payload_size) = resend;
            self.sender.send_datagram(self.destination(), &wire).await;
            self.emit(SendQueueEvent::PacketRetransmitted {
                wire_size,
                payload_size,
                sequence_number: seq,
            });
            return true;
        }
    }

    /// Take one packet from the fair queue, stamp it with the next sequence number,
    ///  remember it for retransmission and send it.
    async fn maybe_send_new_packet(&self) -> bool {
        let Some(mut packet) = self.packets.take_packet() else {
            return false;
        };

        let seq = self.next_sequence_number();
        packet.write_sequence_number(seq);

        let wire = packet.wire_bytes().to_vec();
        let wire_size = packet.wire_size();
        let payload_size = packet.payload_size();

        self.sent_packets.write().unwrap().insert(seq, SentPacketEntry {
            resend_count: 0,
            first_sent_at: Instant::now(),
            packet,
        });

        self.sender.send_datagram(self.destination(), &wire).await;
        self.emit(SendQueueEvent::PacketSent {
            wire_size,
            payload_size,
            sequence_number: seq,
        });
        true
    }

    fn has_packets_in_flight(&self) -> bool {
        !self.sent_packets.read().unwrap().is_empty()
    }

    fn is_fully_idle(&self) -> bool {
        self.packets.is_empty()
            && self.naks.lock().unwrap().is_empty()
            && !self.has_packets_in_flight()
    }

    async fn run(shared: Arc<SendQueueShared>) {
        let mut last_packet_sent_at: Option<Instant> = None;

        loop {
            if shared.state() == State::Stopped {
                break;
            }

            // no data flows until the peer acknowledged our Handshake
            if !shared.has_received_handshake_ack.load(Ordering::SeqCst) {
                shared.send_handshake().await;
                let _ = time::timeout(
                    shared.config.handshake_resend_interval,
                    shared.handshake_notify.notified(),
                ).await;
                continue;
            }

            // pacing
            let period = Duration::from_micros(shared.packet_send_period_micros.load(Ordering::SeqCst));
            if let Some(last) = last_packet_sent_at {
                let elapsed = last.elapsed();
                if elapsed < period {
                    time::sleep(period - elapsed).await;
                }
            }
            if shared.state() == State::Stopped {
                break;
            }
            if !shared.has_received_handshake_ack.load(Ordering::SeqCst) {
                continue;
            }

            // a receiver that went silent with packets in flight is a dead peer
            if shared.has_packets_in_flight() {
                let silent_for = shared.last_receiver_response.lock().unwrap().elapsed();
                if silent_for > shared.estimated_timeout() {
                    debug!("no receiver response for {:?} - send queue times out", silent_for);
                    shared.emit(SendQueueEvent::Timeout);
                    shared.state.store(State::Stopped as u8, Ordering::SeqCst);
                    break;
                }
            }

            let mut attempted = shared.maybe_resend_packet().await;
            if !attempted && !shared.is_flow_window_full() {
                attempted = shared.maybe_send_new_packet().await;
            }

            if attempted {
                last_packet_sent_at = Some(Instant::now());
                continue;
            }

            // nothing to do this slot: sleep until woken, but never past the point where
            //  the timeout / inactivity checks are due
            if shared.is_fully_idle() {
                if time::timeout(shared.config.inactivity_timeout, shared.wake.notified()).await.is_err()
                    && shared.is_fully_idle()
                    && shared.state() == State::Running
                {
                    debug!("send queue idle for {:?} - deactivating", shared.config.inactivity_timeout);
                    shared.emit(SendQueueEvent::QueueInactive);
                    shared.state.store(State::Stopped as u8, Ordering::SeqCst);
                    break;
                }
            }
            else {
                let _ = time::timeout(shared.estimated_timeout(), shared.wake.notified()).await;
            }
        }

        trace!("send queue loop for {:?} exited", shared.destination());
    }
}
