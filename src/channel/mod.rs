//! The message channels multiplexed onto each connection.
//!
//! A channel is a logical stream with its own delivery guarantees. Every channel
//! variant shares the [`ChannelMessage`] entity and the wire layout of a channel
//! section inside a packet payload: the channel index (written by the channel,
//! dispatched on by the endpoint), a block flag, and either a block fragment or a
//! message list.

mod reliable;
mod unreliable;
mod unreliable_process;

pub use reliable::ReliableOrderedChannel;
pub use unreliable::UnreliableUnorderedChannel;
pub use unreliable_process::UnreliableProcessChannel;

use crate::serialise::{BitReader, BitWriter};
use std::fmt::{Display, Formatter};

/// A message travelling over a channel.
///
/// The `data` buffer is owned: enqueuing a message moves it into the channel, dequeuing
/// moves it back out, so there is exactly one owner at every point of the message's
/// life and dropping an entry releases its bytes.
///
/// For a block message, `data[..block_offset]` is the regular part serialised by the
/// application's [`PacketHandler`] and `data[block_offset..block_offset + block_size]`
/// is the block region that the reliable channel spreads across fragments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Application-defined type tag. Opaque to this crate.
    pub protocol: u16,
    /// Reliable channels: the message id. Unreliable channels: the sequence of the
    /// packet the message arrived in.
    pub id: u16,
    pub is_block: bool,
    /// Byte offset inside `data` where the block region begins (at most 32767).
    pub block_offset: u16,
    /// Size of the block region in bytes.
    pub block_size: u16,
    pub data: Vec<u8>,
}

impl ChannelMessage {
    pub fn new(protocol: u16, data: Vec<u8>) -> ChannelMessage {
        ChannelMessage {
            protocol,
            data,
            ..ChannelMessage::default()
        }
    }

    /// A block message: everything from `block_offset` to the end of `data` is the
    /// block region.
    pub fn new_block(protocol: u16, data: Vec<u8>, block_offset: u16) -> ChannelMessage {
        debug_assert!(block_offset <= 32767);
        debug_assert!((block_offset as usize) <= data.len());
        let block_size = (data.len() - block_offset as usize) as u16;
        ChannelMessage {
            protocol,
            id: 0,
            is_block: true,
            block_offset,
            block_size,
            data,
        }
    }
}

/// Latching channel error state.
///
/// Any transition away from `None` is logged once and sticks until the channel is
/// reset for that connection; while latched, sends are dropped, receives return
/// nothing, and inbound packet data is ignored. The connection manager is expected to
/// observe the error and tear the logical connection down.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum ChannelErrorLevel {
    #[default]
    None = 0,
    /// A protocol invariant was violated (message id outside the receive window,
    /// fragment count mismatch, unexpected block id). The peers cannot recover.
    Desync = 1,
    /// The application tried to send while the send queue was full.
    SendQueueFull = 2,
    /// A message (de)serialisation handler failed, or the relative id decoding did.
    FailedToSerialise = 3,
    /// Block reassembly could not allocate the combined message buffer.
    OutOfMemory = 4,
}

impl ChannelErrorLevel {
    pub(crate) fn from_u8(value: u8) -> ChannelErrorLevel {
        match value {
            1 => ChannelErrorLevel::Desync,
            2 => ChannelErrorLevel::SendQueueFull,
            3 => ChannelErrorLevel::FailedToSerialise,
            4 => ChannelErrorLevel::OutOfMemory,
            _ => ChannelErrorLevel::None,
        }
    }
}

impl Display for ChannelErrorLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ChannelErrorLevel::None => "none",
            ChannelErrorLevel::Desync => "desync",
            ChannelErrorLevel::SendQueueFull => "send queue full",
            ChannelErrorLevel::FailedToSerialise => "failed to serialise",
            ChannelErrorLevel::OutOfMemory => "out of memory",
        };
        write!(f, "{}", text)
    }
}

/// Per-connection channel event counters, intended for telemetry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelCounter {
    MessagesSent,
    MessagesReceived,
}

pub const CHANNEL_COUNTER_COUNT: usize = 2;

/// Application-supplied codec for message payloads.
///
/// The (protocol, payload) pair of a message is opaque to the channels; this trait is
/// how they measure, write and read the application's bits. For a block message only
/// the non-block part (`data[..block_offset]`) goes through the handler, the block
/// region is moved by the channel itself.
pub trait PacketHandler: Send + Sync {
    /// The exact number of bits [`PacketHandler::serialise_message`] will produce for
    /// a message of this protocol. Cached per message at enqueue time and used for
    /// packet budgeting.
    fn message_bits(&self, protocol: u16) -> u32;

    /// Writes the message payload. Returns false on failure, which latches
    /// [`ChannelErrorLevel::FailedToSerialise`] on the channel.
    fn serialise_message(&self, message: &ChannelMessage, stream: &mut BitWriter) -> bool;

    /// Reads a message payload into `message` (whose `protocol` and `id` are already
    /// set). Returns false on failure.
    fn deserialise_message(&self, message: &mut ChannelMessage, stream: &mut BitReader) -> bool;

    /// Inline delivery for [`UnreliableProcessChannel`]. The message is consumed; its
    /// bytes are gone when this returns, so anything kept must be copied out.
    fn handle_unreliable_message(&self, message: ChannelMessage) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Test codec: the protocol tag doubles as the payload length in bytes, so
    /// measurement is trivially exact and round-trips are byte-faithful. For block
    /// messages only the pre-block bytes travel through the handler, mirroring how a
    /// real application handler treats the block region.
    pub struct LengthCodedHandler;

    impl LengthCodedHandler {
        fn payload_len(message: &ChannelMessage) -> usize {
            if message.is_block {
                message.block_offset as usize
            } else {
                message.data.len()
            }
        }
    }

    impl PacketHandler for LengthCodedHandler {
        fn message_bits(&self, protocol: u16) -> u32 {
            protocol as u32 * 8
        }

        fn serialise_message(&self, message: &ChannelMessage, stream: &mut BitWriter) -> bool {
            debug_assert_eq!(Self::payload_len(message), message.protocol as usize);
            for &byte in &message.data[..Self::payload_len(message)] {
                stream.write_bits(byte as u32, 8);
            }
            true
        }

        fn deserialise_message(&self, message: &mut ChannelMessage, stream: &mut BitReader) -> bool {
            let len = message.protocol as usize;
            let mut data = Vec::with_capacity(len);
            for _ in 0..len {
                match stream.read_bits(8) {
                    Ok(byte) => data.push(byte as u8),
                    Err(_) => return false,
                }
            }
            if message.is_block {
                message.block_offset = len as u16;
            }
            message.data = data;
            true
        }

        fn handle_unreliable_message(&self, _message: ChannelMessage) -> bool {
            true
        }
    }

    #[test]
    fn test_channel_error_level_round_trips_through_u8() {
        for level in [
            ChannelErrorLevel::None,
            ChannelErrorLevel::Desync,
            ChannelErrorLevel::SendQueueFull,
            ChannelErrorLevel::FailedToSerialise,
            ChannelErrorLevel::OutOfMemory,
        ] {
            assert_eq!(ChannelErrorLevel::from_u8(level as u8), level);
        }
    }

    #[test]
    fn test_new_block_derives_block_size() {
        let message = ChannelMessage::new_block(3, vec![1, 2, 3, 4, 5, 6, 7], 3);
        assert!(message.is_block);
        assert_eq!(message.block_offset, 3);
        assert_eq!(message.block_size, 4);
    }
}
