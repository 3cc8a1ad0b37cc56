//! A reliable-ordered messaging layer on top of an unreliable datagram transport (UDP).
//!
//! ## Design goals
//!
//! This crate provides game-server-grade messaging between a fixed number of logical
//! connections multiplexed over a single UDP endpoint:
//! * A mix of traffic classes per connection, multiplexed as *channels*:
//!   * small fire-and-forget datagrams ([`channel::UnreliableUnorderedChannel`])
//!   * unreliable messages that are only worth processing right when they arrive, e.g.
//!     telemetry ([`channel::UnreliableProcessChannel`])
//!   * a reliable, strictly in-order message stream, including oversized "block" messages
//!     that are fragmented across many packets ([`channel::ReliableOrderedChannel`])
//! * *Packets* carry 16-bit wrapping sequence numbers; each packet piggybacks an
//!   acknowledgement plus a 32-bit ack bitmap for the 32 preceding sequence numbers, so
//!   acknowledgements cost nothing extra on a bidirectional link
//! * Reliability is per *message*, not per packet: a lost packet is never retransmitted,
//!   the messages it carried are simply included in a later packet
//! * Connection quality is measured (RTT, jitter, packet loss, bandwidth) but not reacted
//!   to - congestion control is the caller's business
//!
//! The crate is a *core*: it contains no socket code, no event loop, no crypto and never
//! blocks. It is driven from a pump loop through [`endpoint::EndPoint`] and talks to the
//! outside world through small collaborator traits ([`endpoint::DatagramSink`],
//! [`endpoint::Clock`], [`endpoint::ConnectionStatus`], [`channel::PacketHandler`]).
//!
//! ## Wire format
//!
//! Regular packet header (4 to 9 bytes, all integers little-endian):
//! ```ascii
//! 0: prefix (u8)
//!    * bit 0: 0 = regular packet, 1 = fragment packet
//!    * bits 1..4: one bit per ack-bitmap byte that is present on the wire (a byte is
//!       omitted when it is 0xFF, i.e. fully acked)
//!    * bit 5: 1 = the ack is sent as a one-byte difference from the packet sequence
//! 1: sequence (u16)
//! 3: ack (u8 difference if prefix bit 5, u16 absolute otherwise)
//! *: 0..4 ack-bitmap bytes, ascending significance
//! ```
//!
//! Fragment packet header (5 bytes):
//! ```ascii
//! 0: prefix = 0x01
//! 1: sequence (u16)
//! 3: fragment id (u8)
//! 4: number of fragments - 1 (u8)
//! ```
//! Fragment 0 additionally carries the regular packet header of the reassembled packet
//! before its payload bytes.
//!
//! The packet payload after the transport headers is a bit-packed stream (32-bit
//! little-endian word granularity, see [`serialise`]): a sequence of channel sections,
//! each introduced by its channel index, terminated by the channel-count sentinel.
//!
//! ## Threading model
//!
//! All per-connection state sits behind per-connection locks: operations on a single
//! connection serialize, operations on different connections proceed in parallel. The
//! unreliable channels use lock-free bounded queues on the send side so any thread can
//! enqueue messages without touching the connection locks. The pump
//! ([`endpoint::EndPoint::update`]) is expected to run on one worker per connection.

pub mod buffers;
pub mod channel;
pub mod config;
pub mod endpoint;
pub mod packet_header;
pub mod sequence;
pub mod serialise;
pub mod transport;
