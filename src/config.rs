use anyhow::bail;
use std::time::Duration;

/// Datagram budget per packet, including the UDP/IPv4 header. The engine never fragments
///  above this and never attempts path-MTU discovery; routes that cannot carry 1492-byte
///  datagrams end-to-end will silently drop traffic.
pub const MAX_PACKET_SIZE_WITH_UDP_HEADER: usize = 1492;

/// Bytes consumed by the UDP/IPv4 headers within the datagram budget.
pub const UDP_IPV4_HEADER_SIZE: usize = 28;

/// Largest wire image of a single packet (headers of this protocol plus payload).
pub const MAX_PACKET_SIZE: usize = MAX_PACKET_SIZE_WITH_UDP_HEADER - UDP_IPV4_HEADER_SIZE;

/// The SYN tick drives ACK emission and the periodic congestion-control update on every
///  connection. The name is UDT heritage and has nothing to do with TCP SYN.
pub const SYN_INTERVAL: Duration = Duration::from_millis(10);

/// Interval at which an unacknowledged Handshake is re-sent while a connection waits for
///  its HandshakeACK.
pub const HANDSHAKE_RESEND_INTERVAL: Duration = Duration::from_millis(100);

/// A send queue with nothing queued, nothing in flight and no NAKs deactivates after this
///  long without being woken.
pub const EMPTY_QUEUES_INACTIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Clamps for the congestion controller's estimated timeout.
pub const MINIMUM_ESTIMATED_TIMEOUT: Duration = Duration::from_millis(10);
pub const MAXIMUM_ESTIMATED_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the number of packets in flight regardless of what the congestion
///  controller asks for.
pub const MAX_PACKETS_IN_FLIGHT: u32 = 25600;

/// Default flow window before the first congestion-control update arrives.
pub const DEFAULT_FLOW_WINDOW_SIZE: u32 = 16;


pub struct SocketConfig {
    /// Interval of the periodic per-connection sync tick.
    pub syn_interval: Duration,

    /// Interval at which Handshake packets are re-sent while unacknowledged.
    pub handshake_resend_interval: Duration,

    /// Idle time after which a send queue with empty queues deactivates.
    pub inactivity_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> SocketConfig {
        SocketConfig {
            syn_interval: SYN_INTERVAL,
            handshake_resend_interval: HANDSHAKE_RESEND_INTERVAL,
            inactivity_timeout: EMPTY_QUEUES_INACTIVE_TIMEOUT,
        }
    }
}

impl SocketConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.syn_interval.is_zero() {
            bail!("syn interval must be non-zero");
        }
        if self.handshake_resend_interval.is_zero() {
            bail!("handshake resend interval must be non-zero");
        }
        Ok(())
    }
}
