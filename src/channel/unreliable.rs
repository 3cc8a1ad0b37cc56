use super::{ChannelCounter, ChannelErrorLevel, ChannelMessage, PacketHandler, CHANNEL_COUNTER_COUNT};
use crate::config::ChannelConfig;
use crate::serialise::{bits_required, BitReader, BitWriter};
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tracing::{debug, warn};

pub(super) struct UnreliableConnection {
    pub(super) send_queue: ArrayQueue<ChannelMessage>,
    pub(super) receive_queue: Option<ArrayQueue<ChannelMessage>>,
    error_level: AtomicU8,
    counters: [AtomicU64; CHANNEL_COUNTER_COUNT],
}

impl UnreliableConnection {
    pub(super) fn new(config: &ChannelConfig, with_receive_queue: bool) -> UnreliableConnection {
        UnreliableConnection {
            send_queue: ArrayQueue::new(config.send_queue_size),
            receive_queue: with_receive_queue
                .then(|| ArrayQueue::new(config.receive_queue_size)),
            error_level: AtomicU8::new(ChannelErrorLevel::None as u8),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub(super) fn error_level(&self) -> ChannelErrorLevel {
        ChannelErrorLevel::from_u8(self.error_level.load(Ordering::Acquire))
    }

    pub(super) fn set_error_level(&self, channel_index: u16, error_level: ChannelErrorLevel) {
        let previous = self.error_level.swap(error_level as u8, Ordering::AcqRel);
        if previous != error_level as u8 && error_level != ChannelErrorLevel::None {
            warn!(
                "unreliable channel {} went into error state: {}",
                channel_index, error_level
            );
        }
    }

    pub(super) fn bump(&self, counter: ChannelCounter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn counter(&self, counter: ChannelCounter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub(super) fn reset(&self) {
        self.set_error_level(0, ChannelErrorLevel::None);
        while self.send_queue.pop().is_some() {}
        if let Some(receive_queue) = &self.receive_queue {
            while receive_queue.pop().is_some() {}
        }
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Pops queued messages into a packet-sized batch, discarding any that cannot fit.
    /// Shared by both unreliable channel variants.
    pub(super) fn collect_messages(
        &self,
        config: &ChannelConfig,
        available_bits: u32,
        handler: &dyn PacketHandler,
    ) -> (Vec<ChannelMessage>, u32) {
        let protocol_bits = bits_required(0, config.max_message_protocol as u64);
        let give_up_bits = protocol_bits + 32;

        let mut messages = Vec::new();
        let mut used_bits = 0u32;
        loop {
            if messages.len() == config.max_messages_per_packet {
                break;
            }
            if available_bits.saturating_sub(used_bits) < give_up_bits {
                break;
            }
            let Some(message) = self.send_queue.pop() else {
                break;
            };

            let message_bits = protocol_bits + handler.message_bits(message.protocol);
            if used_bits + message_bits > available_bits {
                // fire and forget: a message that does not fit this packet is gone
                debug!(
                    "discarding unreliable message of protocol {} that does not fit the packet",
                    message.protocol
                );
                continue;
            }
            used_bits += message_bits;
            messages.push(message);
        }
        (messages, used_bits)
    }
}

/// Fire-and-forget channel with a receive queue.
///
/// No acks, no retries, no ordering guarantees. The send and receive queues are
/// lock-free, so any thread may enqueue messages while the pump drains them; a full
/// queue drops (latching [`ChannelErrorLevel::SendQueueFull`] on the send side,
/// silently on the receive side).
pub struct UnreliableUnorderedChannel {
    channel_index: u16,
    num_channels: usize,
    config: ChannelConfig,
    connections: Vec<UnreliableConnection>,
}

impl UnreliableUnorderedChannel {
    pub fn new(
        channel_index: u16,
        num_channels: usize,
        config: ChannelConfig,
        max_connection_count: usize,
    ) -> UnreliableUnorderedChannel {
        let connections = (0..max_connection_count)
            .map(|_| UnreliableConnection::new(&config, true))
            .collect();
        UnreliableUnorderedChannel {
            channel_index,
            num_channels,
            config,
            connections,
        }
    }

    pub fn error_level(&self, connection_index: usize) -> ChannelErrorLevel {
        self.connections[connection_index].error_level()
    }

    pub fn counter(&self, connection_index: usize, counter: ChannelCounter) -> u64 {
        self.connections[connection_index].counter(counter)
    }

    pub fn send_message(&self, connection_index: usize, message: ChannelMessage) {
        let connection = &self.connections[connection_index];
        if connection.error_level() != ChannelErrorLevel::None {
            return; // message dropped
        }
        if connection.send_queue.push(message).is_err() {
            connection.set_error_level(self.channel_index, ChannelErrorLevel::SendQueueFull);
            return;
        }
        connection.bump(ChannelCounter::MessagesSent);
    }

    /// Pops the next available received message, in arrival order of whatever packets
    /// happened to make it through.
    pub fn receive_message(&self, connection_index: usize) -> Option<ChannelMessage> {
        let connection = &self.connections[connection_index];
        if connection.error_level() != ChannelErrorLevel::None {
            return None;
        }
        let message = connection
            .receive_queue
            .as_ref()
            .expect("unordered channel always has a receive queue")
            .pop()?;
        connection.bump(ChannelCounter::MessagesReceived);
        Some(message)
    }

    pub fn get_packet_data(
        &self,
        connection_index: usize,
        stream: &mut BitWriter,
        available_bits: u32,
        handler: &dyn PacketHandler,
    ) -> u32 {
        let connection = &self.connections[connection_index];
        if connection.send_queue.is_empty() {
            return 0;
        }

        let mut available_bits = available_bits;
        if let Some(budget) = self.config.packet_budget_bytes {
            available_bits = available_bits.min(budget as u32 * 8);
        }

        let channel_index_bits = bits_required(0, self.num_channels as u64);
        let num_messages_bits = bits_required(1, self.config.max_messages_per_packet as u64);
        let header_bits = channel_index_bits + 1 + 1 + num_messages_bits;
        if available_bits < header_bits {
            return 0;
        }

        let (messages, _) =
            connection.collect_messages(&self.config, available_bits - header_bits, handler);
        if messages.is_empty() {
            return 0;
        }

        let bits_before = stream.bits_written();
        stream.serialise_integer(self.channel_index as u64, 0, self.num_channels as u64);
        stream.serialise_bool(false); // never a block
        stream.serialise_bool(true); // messages follow
        stream.serialise_integer(
            messages.len() as u64,
            1,
            self.config.max_messages_per_packet as u64,
        );
        for message in &messages {
            stream.serialise_integer(
                message.protocol as u64,
                0,
                self.config.max_message_protocol as u64,
            );
            let ok = handler.serialise_message(message, stream);
            debug_assert!(ok, "write-side message serialisation must not fail");
        }
        stream.bits_written() - bits_before
    }

    /// Decodes the channel section and enqueues each message into the receive queue,
    /// dropping silently when the queue is full.
    pub fn process_packet_data(
        &self,
        connection_index: usize,
        stream: &mut BitReader,
        packet_sequence: u16,
        handler: &dyn PacketHandler,
    ) -> bool {
        let connection = &self.connections[connection_index];
        if connection.error_level() != ChannelErrorLevel::None {
            return false;
        }

        let receive_queue = connection
            .receive_queue
            .as_ref()
            .expect("unordered channel always has a receive queue");

        deserialise_message_section(
            connection,
            self.channel_index,
            &self.config,
            stream,
            packet_sequence,
            handler,
            &mut |message| {
                if receive_queue.push(message).is_err() {
                    debug!("unreliable receive queue full, dropping message");
                }
            },
        )
    }

    pub fn reset(&self, connection_index: usize) {
        self.connections[connection_index].reset();
    }

    pub fn reset_all(&self) {
        for connection in &self.connections {
            connection.reset();
        }
    }
}

/// Reads one unreliable channel section (block flag, has-messages flag, count, then
/// the messages) and hands each decoded message to `deliver`. Shared by both
/// unreliable channel variants.
pub(super) fn deserialise_message_section(
    connection: &UnreliableConnection,
    channel_index: u16,
    config: &ChannelConfig,
    stream: &mut BitReader,
    packet_sequence: u16,
    handler: &dyn PacketHandler,
    deliver: &mut dyn FnMut(ChannelMessage),
) -> bool {
    let is_block = match stream.deserialise_bool() {
        Ok(flag) => flag,
        Err(_) => {
            connection.set_error_level(channel_index, ChannelErrorLevel::FailedToSerialise);
            return false;
        }
    };
    if is_block {
        // unreliable channels never carry block fragments
        connection.set_error_level(channel_index, ChannelErrorLevel::Desync);
        return false;
    }

    let has_messages = match stream.deserialise_bool() {
        Ok(flag) => flag,
        Err(_) => {
            connection.set_error_level(channel_index, ChannelErrorLevel::FailedToSerialise);
            return false;
        }
    };
    if !has_messages {
        return true;
    }

    let num_messages = match stream.deserialise_integer(1, config.max_messages_per_packet as u64) {
        Ok(n) => n as usize,
        Err(_) => {
            debug!("failed to deserialise the channel's message count");
            connection.set_error_level(channel_index, ChannelErrorLevel::FailedToSerialise);
            return false;
        }
    };

    for _ in 0..num_messages {
        let protocol = match stream.deserialise_integer(0, config.max_message_protocol as u64) {
            Ok(protocol) => protocol as u16,
            Err(_) => {
                debug!("failed to deserialise a message protocol tag");
                connection.set_error_level(channel_index, ChannelErrorLevel::FailedToSerialise);
                return false;
            }
        };

        let mut message = ChannelMessage {
            protocol,
            // unreliable messages are identified by the packet they arrived in
            id: packet_sequence,
            ..ChannelMessage::default()
        };
        if !handler.deserialise_message(&mut message, stream) {
            debug!("failed to deserialise message payload, protocol {}", protocol);
            connection.set_error_level(channel_index, ChannelErrorLevel::FailedToSerialise);
            return false;
        }
        deliver(message);
    }

    true
}
