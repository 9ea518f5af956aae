use crate::config::SocketConfig;
use crate::congestion::{CongestionControlFactory, HighSpeedCongestionControlFactory};
use crate::connection::{Connection, ConnectionNotification};
use crate::control_packet::ControlPacket;
use crate::packet::{BasePacket, ObfuscationLevel, Packet};
use crate::packet_list::PacketList;
use crate::send_pipeline::DatagramSender;
use crate::send_queue::SendQueueEvent;
use crate::sequence_number::{MessageNumber, SequenceNumber};
use crate::stats::Stats;
use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// Inspects every incoming data packet before routing; `false` drops it.
pub type PacketFilter = Box<dyn Fn(&Packet) -> bool + Send + Sync>;

/// Gates on-demand connection creation per peer address; `false` refuses the peer.
pub type ConnectionCreationFilter = Box<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

/// Receives data packets that are not part of a message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn handle_packet(&self, packet: Packet);
}

/// Receives message packets, in part-number order per message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_message_packet(&self, packet: Packet);
}

/// Told about reassemblies that were abandoned when their connection went away.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageFailureHandler: Send + Sync + 'static {
    async fn handle_message_failure(&self, addr: SocketAddr, message_number: MessageNumber);
}

/// Receives raw datagrams from peers registered via [Socket::add_unfiltered_handler],
///  bypassing all parsing and filtering.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BasePacketHandler: Send + Sync + 'static {
    async fn handle_base_packet(&self, packet: BasePacket);
}

/// Out-of-band notifications, always delivered from the socket loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    PacketSent { addr: SocketAddr, sequence_number: SequenceNumber, wire_size: usize },
    ClientHandshakeRequestComplete { addr: SocketAddr },
    ReceiverHandshakeRequestComplete { addr: SocketAddr },
    DestinationAddressChange { previous: SocketAddr, current: SocketAddr },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SocketEventHandler: Send + Sync + 'static {
    async fn on_socket_event(&self, event: SocketEvent);
}

#[derive(Default)]
struct Handlers {
    packet_filter: Option<PacketFilter>,
    packet_handler: Option<Arc<dyn PacketHandler>>,
    message_handler: Option<Arc<dyn MessageHandler>>,
    message_failure_handler: Option<Arc<dyn MessageFailureHandler>>,
    connection_creation_filter: Option<ConnectionCreationFilter>,
    event_handler: Option<Arc<dyn SocketEventHandler>>,
    unfiltered_handlers: FxHashMap<SocketAddr, Arc<dyn BasePacketHandler>>,
}

/// The socket is swappable under `rebind`; senders always read the current one.
struct SharedUdpSocket {
    current: StdRwLock<Arc<UdpSocket>>,
}

#[async_trait]
impl DatagramSender for Arc<SharedUdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        let socket = self.current.read().unwrap().clone();
        socket.send_datagram(to, datagram).await;
    }

    fn local_addr(&self) -> SocketAddr {
        self.current.read().unwrap().local_addr()
    }
}

/// The shared UDP endpoint: demultiplexes incoming datagrams onto per-peer
///  [Connection]s (creating them on demand), runs the periodic SYN tick that drives ACK
///  emission and congestion updates, and exposes the datagram / reliable-send surfaces to
///  the application.
///
/// All handler callbacks run on the socket's loop task, never from inside a send queue
///  iteration.
pub struct Socket {
    inner: Arc<SocketInner>,
    loop_handle: StdMutex<Option<JoinHandle<()>>>,
}

struct SocketInner {
    config: SocketConfig,
    socket: Arc<SharedUdpSocket>,
    connections: Mutex<FxHashMap<SocketAddr, Arc<Mutex<Connection>>>>,
    unreliable_sequence_numbers: StdMutex<FxHashMap<SocketAddr, SequenceNumber>>,
    unreliable_message_number: StdMutex<MessageNumber>,
    handlers: StdRwLock<Handlers>,
    congestion_control_factory: StdRwLock<Arc<dyn CongestionControlFactory>>,
    max_bandwidth: StdMutex<Option<u64>>,
    send_queue_events: mpsc::UnboundedSender<(SocketAddr, SendQueueEvent)>,
    /// wakes the receive loop so it picks up a swapped socket
    rebound: tokio::sync::Notify,
    malformed_packet_count: AtomicU64,
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(handle) = self.loop_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Socket {
    /// Bind the shared UDP endpoint and start the socket loop.
    pub async fn bind(bind_addr: SocketAddr, config: SocketConfig) -> anyhow::Result<Socket> {
        config.validate()?;

        let udp_socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound socket to {:?}", udp_socket.local_addr());

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SocketInner {
            config,
            socket: Arc::new(SharedUdpSocket {
                current: StdRwLock::new(udp_socket),
            }),
            connections: Mutex::new(FxHashMap::default()),
            unreliable_sequence_numbers: StdMutex::new(FxHashMap::default()),
            unreliable_message_number: StdMutex::new(MessageNumber::ZERO),
            handlers: StdRwLock::new(Handlers::default()),
            congestion_control_factory: StdRwLock::new(Arc::new(HighSpeedCongestionControlFactory::default())),
            max_bandwidth: StdMutex::new(None),
            send_queue_events: events_tx,
            rebound: tokio::sync::Notify::new(),
            malformed_packet_count: AtomicU64::new(0),
        });

        let loop_handle = tokio::spawn(SocketInner::run(inner.clone(), events_rx));

        Ok(Socket {
            inner,
            loop_handle: StdMutex::new(Some(loop_handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        Arc::clone(&self.inner.socket).local_addr()
    }

    /// Bind a fresh OS socket on the given port and swap it in; connections keep their
    ///  state and continue over the new socket.
    pub async fn rebind(&self, port: u16) -> anyhow::Result<()> {
        let mut addr = self.local_addr();
        addr.set_port(port);

        let fresh = Arc::new(UdpSocket::bind(addr).await?);
        info!("rebound socket to {:?}", fresh.local_addr());

        *self.inner.socket.current.write().unwrap() = fresh;
        self.inner.rebound.notify_one();
        Ok(())
    }

    pub fn set_packet_filter(&self, filter: PacketFilter) {
        self.inner.handlers.write().unwrap().packet_filter = Some(filter);
    }

    pub fn set_packet_handler(&self, handler: Arc<dyn PacketHandler>) {
        self.inner.handlers.write().unwrap().packet_handler = Some(handler);
    }

    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.write().unwrap().message_handler = Some(handler);
    }

    pub fn set_message_failure_handler(&self, handler: Arc<dyn MessageFailureHandler>) {
        self.inner.handlers.write().unwrap().message_failure_handler = Some(handler);
    }

    pub fn set_connection_creation_filter(&self, filter: ConnectionCreationFilter) {
        self.inner.handlers.write().unwrap().connection_creation_filter = Some(filter);
    }

    pub fn set_event_handler(&self, handler: Arc<dyn SocketEventHandler>) {
        self.inner.handlers.write().unwrap().event_handler = Some(handler);
    }

    /// Datagrams from this sender bypass parsing and filtering and go straight to the
    ///  given handler.
    pub fn add_unfiltered_handler(&self, sender_addr: SocketAddr, handler: Arc<dyn BasePacketHandler>) {
        self.inner.handlers.write().unwrap().unfiltered_handlers.insert(sender_addr, handler);
    }

    pub fn set_congestion_control_factory(&self, factory: Arc<dyn CongestionControlFactory>) {
        *self.inner.congestion_control_factory.write().unwrap() = factory;
    }

    /// Caps the send rate of every current and future connection.
    pub async fn set_connection_max_bandwidth(&self, bits_per_second: Option<u64>) {
        *self.inner.max_bandwidth.lock().unwrap() = bits_per_second;

        for connection in self.inner.all_connections().await {
            connection.lock().await.set_max_bandwidth(bits_per_second);
        }
    }

    /// Send one packet: reliable packets go through the peer's connection and ARQ,
    ///  unreliable ones are stamped with the per-destination unreliable sequence number
    ///  and written out directly.
    pub async fn write_packet(&self, mut packet: Packet, addr: SocketAddr) -> anyhow::Result<()> {
        if packet.is_reliable() {
            let Some(connection) = self.inner.find_or_create_connection(addr).await else {
                bail!("connection creation to {:?} was refused", addr);
            };
            connection.lock().await.send_reliable_packet(packet);
            return Ok(());
        }

        let sequence_number = self.inner.next_unreliable_sequence_number(addr);
        packet.write_sequence_number(sequence_number);
        Arc::clone(&self.inner.socket).send_datagram(addr, packet.wire_bytes()).await;

        if let Some(connection) = self.inner.find_connection(addr).await {
            connection.lock().await
                .record_sent_unreliable_packets(packet.wire_size(), packet.payload_size());
        }
        Ok(())
    }

    /// Send a whole message. Reliable lists are handed to the connection's send queue as
    ///  one fair-queue channel; unreliable lists are stamped and written out packet by
    ///  packet.
    pub async fn write_packet_list(&self, mut packet_list: PacketList, addr: SocketAddr) -> anyhow::Result<()> {
        if packet_list.is_reliable() {
            let Some(connection) = self.inner.find_or_create_connection(addr).await else {
                bail!("connection creation to {:?} was refused", addr);
            };
            connection.lock().await.send_reliable_packet_list(packet_list);
            return Ok(());
        }

        let message_number = self.inner.next_unreliable_message_number();
        packet_list.prepare_packets(message_number);

        while let Some(mut packet) = packet_list.take_front() {
            let sequence_number = self.inner.next_unreliable_sequence_number(addr);
            packet.write_sequence_number(sequence_number);
            Arc::clone(&self.inner.socket).send_datagram(addr, packet.wire_bytes()).await;

            if let Some(connection) = self.inner.find_connection(addr).await {
                connection.lock().await
                    .record_sent_unreliable_packets(packet.wire_size(), packet.payload_size());
            }
        }
        Ok(())
    }

    /// Write raw bytes as one datagram. Returns the number of bytes written.
    pub async fn write_datagram(&self, datagram: &[u8], addr: SocketAddr) -> anyhow::Result<usize> {
        let socket = self.inner.socket.current.read().unwrap().clone();
        let num_written = socket.send_to(datagram, addr).await?;
        Ok(num_written)
    }

    /// Write an unstructured packet. Framed packets cannot reach this by construction -
    ///  [BasePacket] is not buildable from a [Packet] or [ControlPacket].
    pub async fn write_base_packet(&self, packet: &BasePacket, addr: SocketAddr) -> anyhow::Result<usize> {
        self.write_datagram(packet.payload(), addr).await
    }

    /// Begin the client side of the handshake with the given peer.
    pub async fn send_handshake_request(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let Some(connection) = self.inner.find_or_create_connection(addr).await else {
            bail!("connection creation to {:?} was refused", addr);
        };
        connection.lock().await.send_handshake_request().await;
        Ok(())
    }

    /// Tear down the connection to this peer, failing its pending reassemblies.
    pub async fn cleanup_connection(&self, addr: SocketAddr) {
        self.inner.cleanup_connection(addr).await;
    }

    pub async fn clear_connections(&self) {
        let addrs = {
            let connections = self.inner.connections.lock().await;
            connections.keys().cloned().collect::<Vec<_>>()
        };
        for addr in addrs {
            self.inner.cleanup_connection(addr).await;
        }
    }

    /// A peer moved: re-key its connection and point its sender at the new address.
    pub async fn handle_remote_address_change(&self, previous: SocketAddr, current: SocketAddr) {
        let moved = {
            let mut connections = self.inner.connections.lock().await;
            if connections.contains_key(&current) {
                // the new address already has a connection - the old one is stale
                connections.remove(&previous)
            }
            else {
                match connections.remove(&previous) {
                    Some(connection) => {
                        connections.insert(current, connection.clone());
                        Some(connection)
                    }
                    None => None,
                }
            }
        };

        if let Some(connection) = moved {
            connection.lock().await.set_destination(current);
            self.inner.dispatch_event(SocketEvent::DestinationAddressChange { previous, current }).await;
        }
    }

    pub async fn sample_stats_for_all_connections(&self) -> Vec<(SocketAddr, Stats)> {
        let connections = {
            let map = self.inner.connections.lock().await;
            map.iter().map(|(addr, c)| (*addr, c.clone())).collect::<Vec<_>>()
        };

        let mut result = Vec::with_capacity(connections.len());
        for (addr, connection) in connections {
            result.push((addr, connection.lock().await.sample_stats()));
        }
        result
    }

    /// Datagrams that failed header parsing and were dropped.
    pub fn malformed_packet_count(&self) -> u64 {
        self.inner.malformed_packet_count.load(Ordering::Relaxed)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }
}

impl SocketInner {
    fn next_unreliable_sequence_number(&self, addr: SocketAddr) -> SequenceNumber {
        let mut map = self.unreliable_sequence_numbers.lock().unwrap();
        let entry = map.entry(addr).or_insert(SequenceNumber::ZERO);
        *entry = entry.next();
        *entry
    }

    fn next_unreliable_message_number(&self) -> MessageNumber {
        let mut current = self.unreliable_message_number.lock().unwrap();
        *current = current.next();
        *current
    }

    async fn all_connections(&self) -> Vec<Arc<Mutex<Connection>>> {
        self.connections.lock().await.values().cloned().collect()
    }

    async fn find_connection(&self, addr: SocketAddr) -> Option<Arc<Mutex<Connection>>> {
        self.connections.lock().await.get(&addr).cloned()
    }

    /// Atomic find-or-create, gated by the connection-creation filter.
    async fn find_or_create_connection(self: &Arc<Self>, addr: SocketAddr) -> Option<Arc<Mutex<Connection>>> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(&addr) {
            return Some(connection.clone());
        }

        {
            let handlers = self.handlers.read().unwrap();
            if let Some(filter) = &handlers.connection_creation_filter {
                if !filter(&addr) {
                    debug!("connection creation to {:?} refused by filter", addr);
                    return None;
                }
            }
        }

        debug!("creating connection for {:?}", addr);
        let congestion = self.congestion_control_factory.read().unwrap().create();
        let mut connection = Connection::new(
            Arc::new(self.socket.clone()),
            addr,
            congestion,
            self.send_queue_events.clone(),
            self.config.handshake_resend_interval,
            self.config.inactivity_timeout,
        );
        if let Some(max_bandwidth) = *self.max_bandwidth.lock().unwrap() {
            connection.set_max_bandwidth(Some(max_bandwidth));
        }

        let connection = Arc::new(Mutex::new(connection));
        connections.insert(addr, connection.clone());
        Some(connection)
    }

    async fn cleanup_connection(&self, addr: SocketAddr) {
        let removed = self.connections.lock().await.remove(&addr);
        let Some(connection) = removed else {
            return;
        };
        debug!("cleaning up connection to {:?}", addr);

        let failed_messages = connection.lock().await.shutdown();
        self.dispatch_message_failures(addr, failed_messages).await;
    }

    async fn dispatch_message_failures(&self, addr: SocketAddr, failed: Vec<MessageNumber>) {
        if failed.is_empty() {
            return;
        }
        let handler = self.handlers.read().unwrap().message_failure_handler.clone();
        if let Some(handler) = handler {
            for message_number in failed {
                handler.handle_message_failure(addr, message_number).await;
            }
        }
    }

    async fn dispatch_event(&self, event: SocketEvent) {
        let handler = self.handlers.read().unwrap().event_handler.clone();
        if let Some(handler) = handler {
            handler.on_socket_event(event).await;
        }
    }

    async fn dispatch_notifications(&self, addr: SocketAddr, notifications: Vec<ConnectionNotification>) {
        for notification in notifications {
            let event = match notification {
                ConnectionNotification::ClientHandshakeRequestComplete => {
                    SocketEvent::ClientHandshakeRequestComplete { addr }
                }
                ConnectionNotification::ReceiverHandshakeRequestComplete => {
                    SocketEvent::ReceiverHandshakeRequestComplete { addr }
                }
            };
            self.dispatch_event(event).await;
        }
    }

    /// The socket loop: datagram intake, send-queue notifications and the SYN tick, all
    ///  on one task so handlers see a single-threaded world.
    async fn run(
        inner: Arc<SocketInner>,
        mut events_rx: mpsc::UnboundedReceiver<(SocketAddr, SendQueueEvent)>,
    ) {
        info!("starting socket loop");
        let mut syn_interval = interval(inner.config.syn_interval);
        let mut buf = vec![0u8; 65536];

        loop {
            let socket = inner.socket.current.read().unwrap().clone();
            select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((num_read, from)) => {
                            let data = BytesMut::from(&buf[..num_read]);
                            let correlation_id = Uuid::new_v4();
                            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
                            inner.process_datagram(data, from).instrument(span).await;
                        }
                        Err(e) => {
                            warn!("socket receive error: {}", e);
                        }
                    }
                }
                event = events_rx.recv() => {
                    let Some((addr, event)) = event else {
                        break;
                    };
                    inner.process_send_queue_event(addr, event).await;
                }
                _ = syn_interval.tick() => {
                    for connection in inner.all_connections().await {
                        connection.lock().await.sync().await;
                    }
                }
                _ = inner.rebound.notified() => {
                    // re-read the swapped socket on the next iteration
                }
            }
        }
    }

    async fn process_datagram(self: &Arc<Self>, data: BytesMut, from: SocketAddr) {
        trace!("received datagram of {} bytes from {:?}", data.len(), from);

        // a registered unfiltered handler intercepts everything from its peer
        let unfiltered = self.handlers.read().unwrap().unfiltered_handlers.get(&from).cloned();
        if let Some(handler) = unfiltered {
            handler.handle_base_packet(BasePacket::from_received(data, from, Instant::now())).await;
            return;
        }

        if data.len() < size_of::<u32>() {
            debug!("datagram from {:?} too short for a header - dropping", from);
            self.malformed_packet_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let first_word = u32::from_le_bytes(data[..4].try_into().unwrap());
        if first_word & 1 == 1 {
            self.process_control_datagram(data, from).await;
        }
        else {
            self.process_data_datagram(data, from).await;
        }
    }

    async fn process_control_datagram(self: &Arc<Self>, data: BytesMut, from: SocketAddr) {
        let control = match ControlPacket::deser(&mut &data[..]) {
            Ok(control) => control,
            Err(e) => {
                debug!("unparsable control packet from {:?} - dropping: {}", from, e);
                self.malformed_packet_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        trace!("received {:?} from {:?}", control, from);

        let Some(connection) = self.find_or_create_connection(from).await else {
            return;
        };
        let result = connection.lock().await.process_control(control).await;

        self.dispatch_notifications(from, result.notifications).await;
        self.dispatch_message_failures(from, result.failed_messages).await;
    }

    async fn process_data_datagram(self: &Arc<Self>, data: BytesMut, from: SocketAddr) {
        let mut packet = match Packet::from_received(data, from, Instant::now()) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("unparsable data packet from {:?} - dropping: {}", from, e);
                self.malformed_packet_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if packet.obfuscation_level() != ObfuscationLevel::None {
            packet.obfuscate(ObfuscationLevel::None);
        }

        {
            let handlers = self.handlers.read().unwrap();
            if let Some(filter) = &handlers.packet_filter {
                if !filter(&packet) {
                    trace!("packet {:?} from {:?} dropped by filter", packet, from);
                    return;
                }
            }
        }

        if packet.is_reliable() {
            let Some(connection) = self.find_or_create_connection(from).await else {
                return;
            };
            let accepted = connection.lock().await
                .process_received_sequence_number(
                    packet.sequence_number(),
                    packet.wire_size(),
                    packet.payload_size(),
                )
                .await;
            if !accepted {
                return;
            }
        }
        else if let Some(connection) = self.find_connection(from).await {
            connection.lock().await
                .record_received_unreliable_packets(packet.wire_size(), packet.payload_size());
        }

        if packet.is_part_of_message() {
            let Some(connection) = self.find_or_create_connection(from).await else {
                return;
            };
            let deliverable = connection.lock().await.queue_received_message_packet(packet);

            let handler = self.handlers.read().unwrap().message_handler.clone();
            if let Some(handler) = handler {
                for next in deliverable {
                    handler.handle_message_packet(next).await;
                }
            }
        }
        else {
            let handler = self.handlers.read().unwrap().packet_handler.clone();
            if let Some(handler) = handler {
                handler.handle_packet(packet).await;
            }
        }
    }

    async fn process_send_queue_event(self: &Arc<Self>, addr: SocketAddr, event: SendQueueEvent) {
        let Some(connection) = self.find_connection(addr).await else {
            return;
        };
        connection.lock().await.handle_send_queue_event(&event);

        match event {
            SendQueueEvent::PacketSent { wire_size, sequence_number, .. } => {
                self.dispatch_event(SocketEvent::PacketSent {
                    addr,
                    sequence_number,
                    wire_size,
                }).await;
            }
            SendQueueEvent::Timeout => {
                // a timed-out peer is gone; drop the connection and fail its reassemblies
                self.cleanup_connection(addr).await;
            }
            SendQueueEvent::PacketRetransmitted { .. } | SendQueueEvent::QueueInactive => {}
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadIo;
    use bytes::Bytes;
    use std::time::Duration;

    async fn bound_socket() -> Socket {
        Socket::bind(SocketAddr::from(([127, 0, 0, 1], 0)), SocketConfig::default())
            .await
            .unwrap()
    }

    fn reliable_packet(payload: &[u8]) -> Packet {
        let mut packet = Packet::new(None, true, false);
        packet.write_payload_at_cursor(payload);
        packet
    }

    fn unreliable_packet(payload: &[u8]) -> Packet {
        let mut packet = Packet::new(None, false, false);
        packet.write_payload_at_cursor(payload);
        packet
    }

    /// records packets delivered through the packet handler
    struct RecordingPacketHandler {
        received: std::sync::Mutex<Vec<Vec<u8>>>,
        notify: tokio::sync::Notify,
    }

    impl RecordingPacketHandler {
        fn new() -> Arc<RecordingPacketHandler> {
            Arc::new(RecordingPacketHandler {
                received: std::sync::Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }

        async fn wait_for(&self, count: usize) {
            while self.received.lock().unwrap().len() < count {
                self.notify.notified().await;
            }
        }
    }

    #[async_trait]
    impl PacketHandler for RecordingPacketHandler {
        async fn handle_packet(&self, packet: Packet) {
            self.received.lock().unwrap().push(packet.payload().to_vec());
            self.notify.notify_waiters();
        }
    }

    /// records message packets in delivery order
    struct RecordingMessageHandler {
        received: std::sync::Mutex<Vec<(u32, u32, Vec<u8>)>>,
        notify: tokio::sync::Notify,
    }

    impl RecordingMessageHandler {
        fn new() -> Arc<RecordingMessageHandler> {
            Arc::new(RecordingMessageHandler {
                received: std::sync::Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }

        async fn wait_for(&self, count: usize) {
            while self.received.lock().unwrap().len() < count {
                self.notify.notified().await;
            }
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingMessageHandler {
        async fn handle_message_packet(&self, packet: Packet) {
            self.received.lock().unwrap().push((
                packet.message_number().to_raw(),
                packet.message_part_number(),
                packet.payload().to_vec(),
            ));
            self.notify.notify_waiters();
        }
    }

    #[tokio::test]
    async fn test_unreliable_packet_roundtrip() {
        let server = bound_socket().await;
        let client = bound_socket().await;

        let handler = RecordingPacketHandler::new();
        server.set_packet_handler(handler.clone());

        client.write_packet(unreliable_packet(&[1, 2, 3]), server.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler.wait_for(1)).await.unwrap();

        assert_eq!(*handler.received.lock().unwrap(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_reliable_packet_roundtrip() {
        let server = bound_socket().await;
        let client = bound_socket().await;

        let handler = RecordingPacketHandler::new();
        server.set_packet_handler(handler.clone());

        client.write_packet(reliable_packet(&[42; 100]), server.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler.wait_for(1)).await.unwrap();

        assert_eq!(*handler.received.lock().unwrap(), vec![vec![42; 100]]);
        // the handshake created a connection on both ends
        assert_eq!(server.connection_count().await, 1);
        assert_eq!(client.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_ordered_message_roundtrip() {
        let server = bound_socket().await;
        let client = bound_socket().await;

        let handler = RecordingMessageHandler::new();
        server.set_message_handler(handler.clone());

        // 5000 bytes: four parts at the message-framed payload capacity
        let message = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let mut list = PacketList::new(0, Bytes::new(), true, true);
        list.write_bytes(&message).unwrap();
        let expected_parts = 4;

        client.write_packet_list(list, server.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler.wait_for(expected_parts)).await.unwrap();

        let received = handler.received.lock().unwrap();
        let parts = received.iter().map(|(_, part, _)| *part).collect::<Vec<_>>();
        assert_eq!(parts, vec![0, 1, 2, 3]);
        assert!(received.iter().all(|(mn, _, _)| *mn == received[0].0));

        // strip the per-packet tag byte and compare the reassembled bytes
        let reassembled = received.iter()
            .flat_map(|(_, _, payload)| payload[1..].iter().cloned())
            .collect::<Vec<_>>();
        assert_eq!(reassembled, message);
    }

    #[tokio::test]
    async fn test_lost_packet_recovered_via_nak_and_retransmit() {
        let server = bound_socket().await;
        let client = bound_socket().await;

        let handler = RecordingMessageHandler::new();
        server.set_message_handler(handler.clone());

        // drop the third data packet exactly once; its retransmission passes
        let dropped_once = Arc::new(std::sync::Mutex::new(None::<SequenceNumber>));
        server.set_packet_filter(Box::new(move |packet| {
            let mut dropped = dropped_once.lock().unwrap();
            match *dropped {
                None if packet.message_part_number() == 2 => {
                    *dropped = Some(packet.sequence_number());
                    false
                }
                _ => true,
            }
        }));

        let message = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let mut list = PacketList::new(0, Bytes::new(), true, true);
        list.write_bytes(&message).unwrap();

        client.write_packet_list(list, server.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler.wait_for(4)).await.unwrap();

        // despite the loss, the four parts arrive in order with no duplicates
        let received = handler.received.lock().unwrap();
        let parts = received.iter().map(|(_, part, _)| *part).collect::<Vec<_>>();
        assert_eq!(parts, vec![0, 1, 2, 3]);

        let reassembled = received.iter()
            .flat_map(|(_, _, payload)| payload[1..].iter().cloned())
            .collect::<Vec<_>>();
        assert_eq!(reassembled, message);

        drop(received);
        // give the client loop a moment to drain its send-queue event channel
        tokio::time::sleep(Duration::from_millis(100)).await;
        let client_stats = client.sample_stats_for_all_connections().await;
        assert_eq!(client_stats[0].1.retransmitted.packets, 1);
    }

    #[tokio::test]
    async fn test_packet_filter_drops() {
        let server = bound_socket().await;
        let client = bound_socket().await;

        let handler = RecordingPacketHandler::new();
        server.set_packet_handler(handler.clone());
        server.set_packet_filter(Box::new(|packet| packet.payload_size() > 2));

        client.write_packet(unreliable_packet(&[1]), server.local_addr()).await.unwrap();
        client.write_packet(unreliable_packet(&[1, 2, 3]), server.local_addr()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handler.wait_for(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // only the packet that passed the filter arrived
        assert_eq!(*handler.received.lock().unwrap(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_connection_creation_filter_refuses_reliable_send() {
        let client = bound_socket().await;
        client.set_connection_creation_filter(Box::new(|_| false));

        let result = client
            .write_packet(reliable_packet(&[1]), SocketAddr::from(([127, 0, 0, 1], 1)))
            .await;
        assert!(result.is_err());
        assert_eq!(client.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreliable_sequence_numbers_are_per_destination() {
        let socket = bound_socket().await;
        let a = SocketAddr::from(([127, 0, 0, 1], 1111));
        let b = SocketAddr::from(([127, 0, 0, 1], 2222));

        assert_eq!(socket.inner.next_unreliable_sequence_number(a), SequenceNumber::new(1));
        assert_eq!(socket.inner.next_unreliable_sequence_number(a), SequenceNumber::new(2));
        assert_eq!(socket.inner.next_unreliable_sequence_number(b), SequenceNumber::new(1));
    }

    #[tokio::test]
    async fn test_malformed_datagram_counted_and_dropped() {
        let server = bound_socket().await;
        let client = bound_socket().await;

        client.write_datagram(&[0xff], server.local_addr()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.malformed_packet_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        assert_eq!(server.malformed_packet_count(), 1);
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_unfiltered_handler_intercepts() {
        struct Recorder {
            received: std::sync::Mutex<Vec<Vec<u8>>>,
            notify: tokio::sync::Notify,
        }
        #[async_trait]
        impl BasePacketHandler for Recorder {
            async fn handle_base_packet(&self, packet: BasePacket) {
                self.received.lock().unwrap().push(packet.payload().to_vec());
                self.notify.notify_waiters();
            }
        }

        let server = bound_socket().await;
        let client = bound_socket().await;

        let recorder = Arc::new(Recorder {
            received: std::sync::Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });
        server.add_unfiltered_handler(client.local_addr(), recorder.clone());

        // even an otherwise-malformed datagram goes to the unfiltered handler verbatim
        client.write_datagram(&[0xab], server.local_addr()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.received.lock().unwrap().is_empty() {
                recorder.notify.notified().await;
            }
        }).await.unwrap();

        assert_eq!(*recorder.received.lock().unwrap(), vec![vec![0xab]]);
        assert_eq!(server.malformed_packet_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_events_are_dispatched() {
        struct Recorder {
            events: std::sync::Mutex<Vec<SocketEvent>>,
            notify: tokio::sync::Notify,
        }
        #[async_trait]
        impl SocketEventHandler for Recorder {
            async fn on_socket_event(&self, event: SocketEvent) {
                self.events.lock().unwrap().push(event);
                self.notify.notify_waiters();
            }
        }

        let server = bound_socket().await;
        let client = bound_socket().await;

        let recorder = Arc::new(Recorder {
            events: std::sync::Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });
        client.set_event_handler(recorder.clone());

        // the client asks the server to handshake; completion surfaces as an event
        client.send_handshake_request(server.local_addr()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let events = recorder.events.lock().unwrap();
                    if events.iter().any(|e| matches!(e, SocketEvent::ClientHandshakeRequestComplete { .. })) {
                        break;
                    }
                }
                recorder.notify.notified().await;
            }
        }).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_connection_fails_pending_reassemblies() {
        struct FailureRecorder {
            failed: std::sync::Mutex<Vec<(SocketAddr, u32)>>,
            notify: tokio::sync::Notify,
        }
        #[async_trait]
        impl MessageFailureHandler for FailureRecorder {
            async fn handle_message_failure(&self, addr: SocketAddr, message_number: MessageNumber) {
                self.failed.lock().unwrap().push((addr, message_number.to_raw()));
                self.notify.notify_waiters();
            }
        }

        let server = bound_socket().await;
        let client = bound_socket().await;

        let recorder = Arc::new(FailureRecorder {
            failed: std::sync::Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });
        server.set_message_failure_handler(recorder.clone());

        // deliver only the FIRST part of an unreliable two-part message, then tear down
        let mut first_part = Packet::new(None, false, true);
        first_part.write_message_number(
            MessageNumber::new(77),
            crate::packet::PacketPosition::First,
            0,
        );
        first_part.write_payload_at_cursor(&[1]);
        client.write_packet(first_part, server.local_addr()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connection_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        server.cleanup_connection(client.local_addr()).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.failed.lock().unwrap().is_empty() {
                recorder.notify.notified().await;
            }
        }).await.unwrap();

        assert_eq!(recorder.failed.lock().unwrap()[0].1, 77);
        assert_eq!(server.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_remote_address_change_rekeys_connection() {
        let socket = bound_socket().await;
        let previous = SocketAddr::from(([127, 0, 0, 1], 1111));
        let current = SocketAddr::from(([127, 0, 0, 1], 2222));

        socket.inner.find_or_create_connection(previous).await.unwrap();
        socket.handle_remote_address_change(previous, current).await;

        let connections = socket.inner.connections.lock().await;
        assert!(connections.contains_key(&current));
        assert!(!connections.contains_key(&previous));
    }

    #[tokio::test]
    async fn test_stats_sampling() {
        let server = bound_socket().await;
        let client = bound_socket().await;

        let handler = RecordingPacketHandler::new();
        server.set_packet_handler(handler.clone());

        client.write_packet(reliable_packet(&[1; 50]), server.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler.wait_for(1)).await.unwrap();

        let client_stats = client.sample_stats_for_all_connections().await;
        assert_eq!(client_stats.len(), 1);
        assert_eq!(client_stats[0].0, server.local_addr());
        assert_eq!(client_stats[0].1.sent_reliable.packets, 1);

        let server_stats = server.sample_stats_for_all_connections().await;
        assert_eq!(server_stats[0].1.received_reliable.packets, 1);
    }
}
