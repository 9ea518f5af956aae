//! A reliable, message-oriented transport protocol layered on top of UDP.
//!
//! The engine is a UDT-style ARQ: packets carry 27-bit wrapping sequence numbers, the
//!  receiver reports gaps with immediate NAKs and acknowledges progress with periodic
//!  ACKs, the sender retransmits selectively at a pace dictated by a pluggable congestion
//!  controller, and a three-way handshake pins down the initial sequence number per
//!  direction. Unreliable datagram traffic coexists on the same socket.
//!
//! ## Design goals
//!
//! * One UDP socket serves every peer; per-peer state lives in a `Connection` created on
//!   demand for the first packet sent to or received from an address.
//! * The application-facing abstraction is *messages* (defined-length chunks, possibly
//!   larger than one datagram) next to raw packets and datagrams:
//!   * a `PacketList` chunks a message into packets and the receiver reassembles them,
//!     delivering parts in order per message
//!   * independent messages deliberately interleave on the wire - the sender fair-queues
//!     up to 16 concurrent messages round-robin, so one bulk message cannot starve the
//!     rest
//! * Reliability is selective-repeat: the receiver keeps a loss list of missing sequence
//!   ranges and NAKs them as soon as a gap is seen; the periodic ACK (every SYN tick,
//!   ~10 ms) carries the next-expected sequence number as a cumulative safety net
//! * Sending is paced: the congestion controller turns ACK/loss/timeout events into a
//!   packet send period, window sizes and a timeout estimate
//! * No IP-level fragmentation: the packet size budget is a fixed 1492-byte datagram
//!   including the 28-byte UDP/IPv4 header; the engine never discovers the MTU
//!
//! ## Data packet header
//!
//! All header words are little-endian; bit 0 of the first byte on the wire is the
//!  control bit.
//!
//! ```ascii
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C|R|M| O |                  Sequence Number (27)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | P |                    Message Number (30)                    |  only if M = 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Message Part Number (32)                  |  only if M = 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Payload (variable)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! * `C`: control bit, 0 for data packets
//! * `R`: reliable bit
//! * `M`: message bit - the two optional words are present iff it is set
//! * `O`: obfuscation level 0-3; a reversible payload XOR, not a security feature
//! * `P`: position of this packet in its message: 00 ONLY, 10 FIRST, 11 MIDDLE, 01 LAST
//!
//! ## Control packet header
//!
//! ```ascii
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C|          Type (15)          |         reserved (16)         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Control Data (variable)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `C` is always 1; the reserved bits are zero on send and ignored on receive.
//!
//! * `ACK` (0): next-expected sequence number (u32 LE)
//! * `Handshake` (1): the sender's initial sequence number; re-sent until acknowledged
//! * `HandshakeACK` (2): echoes the initial sequence number of the Handshake it answers
//! * `HandshakeRequest` (3): no payload; asks the peer to (re-)send its Handshake
//! * `NAK` (4): inclusive range of missing sequence numbers, two u32 LE
//!
//! ## Handshake
//!
//! Data flows only after a completed handshake in the sending direction:
//!
//! 1. a client that wants a peer's stream sends `HandshakeRequest` (and re-sends it on
//!    the SYN tick until answered)
//! 2. the data sender answers with `Handshake` carrying its initial sequence number, and
//!    keeps re-sending it on a fixed interval
//! 3. the receiver records the initial number and answers `HandshakeACK`; the first data
//!    packet carries `initial + 1`
//!
//! A `HandshakeRequest` that arrives on an established connection resets it: receive
//!  state is cleared, pending reassemblies are failed, and the handshake runs again.
//!
//! ## Related
//!
//! * UDT - the ancestor of this design: NAK-driven selective repeat, SYN-tick ACKs,
//!   pluggable congestion control. The wire format here is a private dialect and not
//!   interoperable.
//! * QUIC - connection-based with enforced encryption and stream multiplexing; this
//!   protocol is deliberately smaller and leaves security to other layers.

pub mod config;
pub mod congestion;
pub mod connection;
pub mod control_packet;
pub mod loss_list;
pub mod packet;
pub mod packet_list;
pub mod packet_queue;
pub mod payload;
pub mod send_pipeline;
pub mod send_queue;
pub mod sequence_number;
pub mod socket;
pub mod stats;

pub use config::SocketConfig;
pub use packet::{BasePacket, ObfuscationLevel, Packet, PacketPosition};
pub use packet_list::PacketList;
pub use sequence_number::{MessageNumber, MessagePartNumber, SequenceNumber};
pub use socket::Socket;
