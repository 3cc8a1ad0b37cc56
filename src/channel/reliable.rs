use super::{ChannelCounter, ChannelErrorLevel, ChannelMessage, PacketHandler, CHANNEL_COUNTER_COUNT};
use crate::buffers::SequenceBuffer;
use crate::config::ChannelConfig;
use crate::sequence::{sequence_greater_than, sequence_less_than};
use crate::serialise::{bits_required, relative_sequence_encoding_bits, BitReader, BitWriter};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// An entry in the message send queue. Messages stay here until acked; because each
/// message is acked individually the queue can have holes.
struct MessageSendQueueEntry {
    message: ChannelMessage,
    /// Cached payload size from [`PacketHandler::message_bits`], for packet budgeting.
    measured_bits: u32,
    last_sent_millis: Option<u64>,
}

struct MessageReceiveQueueEntry {
    message: ChannelMessage,
}

/// What a sent packet carried, so a packet-level ack can be walked back to message or
/// fragment level.
enum SentPacketIds {
    Messages(Vec<u16>),
    Fragment { message_id: u16, fragment_id: u16 },
}

struct SentPacketEntry {
    acked: bool,
    ids: SentPacketIds,
}

/// State of the block currently going out. Although several block messages can sit in
/// the send queue, at most one block is in flight per direction at a time.
struct SendBlockData {
    active: bool,
    num_fragments: usize,
    num_acked_fragments: usize,
    block_message_id: u16,
    acked_fragment: Vec<bool>,
    fragment_send_time_millis: Vec<Option<u64>>,
}

impl SendBlockData {
    fn new(max_fragments: usize) -> SendBlockData {
        SendBlockData {
            active: false,
            num_fragments: 0,
            num_acked_fragments: 0,
            block_message_id: 0,
            acked_fragment: vec![false; max_fragments],
            fragment_send_time_millis: vec![None; max_fragments],
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.num_fragments = 0;
        self.num_acked_fragments = 0;
        self.block_message_id = 0;
        self.acked_fragment.fill(false);
        self.fragment_send_time_millis.fill(None);
    }
}

/// State of the block currently coming in. The fragment buffer is allocated once per
/// connection and reused across blocks.
struct ReceiveBlockData {
    active: bool,
    num_fragments: usize,
    num_received_fragments: usize,
    message_id: u16,
    block_size: usize,
    received_fragment: Vec<bool>,
    block_data: Vec<u8>,
    /// The block message's non-block part, carried by fragment 0.
    message: Option<ChannelMessage>,
}

impl ReceiveBlockData {
    fn new(max_fragments: usize, fragment_size: usize) -> ReceiveBlockData {
        ReceiveBlockData {
            active: false,
            num_fragments: 0,
            num_received_fragments: 0,
            message_id: 0,
            block_size: 0,
            received_fragment: vec![false; max_fragments],
            block_data: vec![0; max_fragments * fragment_size],
            message: None,
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.num_fragments = 0;
        self.num_received_fragments = 0;
        self.message_id = 0;
        self.block_size = 0;
        self.received_fragment.fill(false);
        self.message = None;
    }
}

struct ReliableConnection {
    error_level: ChannelErrorLevel,
    /// Id the next enqueued message will get.
    send_message_id: u16,
    /// Id the consumer will dequeue next.
    receive_message_id: u16,
    /// Oldest message in the send queue that has not been acked yet.
    oldest_unacked_message_id: u16,
    send_queue: SequenceBuffer<MessageSendQueueEntry>,
    receive_queue: SequenceBuffer<MessageReceiveQueueEntry>,
    sent_packets: SequenceBuffer<SentPacketEntry>,
    send_block: SendBlockData,
    receive_block: ReceiveBlockData,
    counters: [u64; CHANNEL_COUNTER_COUNT],
}

impl ReliableConnection {
    fn new(config: &ChannelConfig) -> ReliableConnection {
        ReliableConnection {
            error_level: ChannelErrorLevel::None,
            send_message_id: 0,
            receive_message_id: 0,
            oldest_unacked_message_id: 0,
            send_queue: SequenceBuffer::new(config.send_queue_size),
            receive_queue: SequenceBuffer::new(config.receive_queue_size),
            sent_packets: SequenceBuffer::new(config.sent_packet_buffer_size),
            send_block: SendBlockData::new(config.max_fragments),
            receive_block: ReceiveBlockData::new(config.max_fragments, config.fragment_size),
            counters: [0; CHANNEL_COUNTER_COUNT],
        }
    }

    fn has_messages_to_send(&self) -> bool {
        self.oldest_unacked_message_id != self.send_message_id
    }

    fn can_send_message(&self) -> bool {
        self.send_queue.available(self.send_message_id)
    }

    /// True while the message at the head of the resend window is a block. In that
    /// mode every packet carries exactly one fragment of the current block until all
    /// of its fragments are acked.
    fn sending_block_message(&self) -> bool {
        debug_assert!(self.has_messages_to_send());
        self.send_queue
            .find(self.oldest_unacked_message_id)
            .map(|entry| entry.message.is_block)
            .unwrap_or(false)
    }

    /// Walks the oldest unacked id forward across acked (removed) entries. The send
    /// queue is not a true queue: messages ack individually, leaving holes.
    fn update_oldest_unacked_message_id(&mut self) {
        let stop_message_id = self.send_message_id;
        while self.oldest_unacked_message_id != stop_message_id
            && !self.send_queue.exists(self.oldest_unacked_message_id)
        {
            self.oldest_unacked_message_id = self.oldest_unacked_message_id.wrapping_add(1);
        }
        debug_assert!(!sequence_greater_than(
            self.oldest_unacked_message_id,
            stop_message_id
        ));
    }

    fn set_error_level(&mut self, channel_index: u16, error_level: ChannelErrorLevel) {
        if error_level != self.error_level && error_level != ChannelErrorLevel::None {
            warn!(
                "reliable channel {} went into error state: {}",
                channel_index, error_level
            );
        }
        self.error_level = error_level;
    }
}

/// The reliable-ordered channel: per-message acks with hole tracking, strict in-order
/// delivery to the consumer, and block messages fragmented across packets.
pub struct ReliableOrderedChannel {
    channel_index: u16,
    num_channels: usize,
    config: ChannelConfig,
    connections: Vec<Mutex<ReliableConnection>>,
}

impl ReliableOrderedChannel {
    pub fn new(
        channel_index: u16,
        num_channels: usize,
        config: ChannelConfig,
        max_connection_count: usize,
    ) -> ReliableOrderedChannel {
        let connections = (0..max_connection_count)
            .map(|_| Mutex::new(ReliableConnection::new(&config)))
            .collect();
        ReliableOrderedChannel {
            channel_index,
            num_channels,
            config,
            connections,
        }
    }

    pub fn error_level(&self, connection_index: usize) -> ChannelErrorLevel {
        self.connections[connection_index].lock().error_level
    }

    pub fn counter(&self, connection_index: usize, counter: ChannelCounter) -> u64 {
        self.connections[connection_index].lock().counters[counter as usize]
    }

    /// The id up to which (exclusive) every sent message has been acked. Equal to the
    /// next send id once everything is through.
    pub fn oldest_unacked_message_id(&self, connection_index: usize) -> u16 {
        self.connections[connection_index].lock().oldest_unacked_message_id
    }

    /// Enqueues a message. On a latched error the message is dropped; on a full send
    /// queue the channel latches [`ChannelErrorLevel::SendQueueFull`].
    pub fn send_message(
        &self,
        connection_index: usize,
        mut message: ChannelMessage,
        handler: &dyn PacketHandler,
    ) {
        let mut guard = self.connections[connection_index].lock();
        let state = &mut *guard;
        if state.error_level != ChannelErrorLevel::None {
            return; // message dropped
        }
        if !state.can_send_message() {
            // increase your send queue size!
            state.set_error_level(self.channel_index, ChannelErrorLevel::SendQueueFull);
            return;
        }

        message.id = state.send_message_id;
        if message.is_block {
            debug_assert!(message.block_size >= 1);
            debug_assert!(
                message.block_size as usize
                    <= self.config.max_fragments * self.config.fragment_size
            );
        }

        let measured_bits = handler.message_bits(message.protocol);
        let message_id = message.id;
        state.send_queue.insert(
            message_id,
            MessageSendQueueEntry {
                message,
                measured_bits,
                last_sent_millis: None,
            },
        );
        state.counters[ChannelCounter::MessagesSent as usize] += 1;
        state.send_message_id = state.send_message_id.wrapping_add(1);
    }

    /// Dequeues the next in-order message, if it has arrived. Returns `None` on a
    /// latched error or when the message at the receive position is still missing.
    pub fn receive_message(&self, connection_index: usize) -> Option<ChannelMessage> {
        let mut guard = self.connections[connection_index].lock();
        let state = &mut *guard;
        if state.error_level != ChannelErrorLevel::None {
            return None;
        }

        let receive_message_id = state.receive_message_id;
        let entry = state.receive_queue.remove(receive_message_id)?;
        debug_assert_eq!(entry.message.id, receive_message_id);

        state.counters[ChannelCounter::MessagesReceived as usize] += 1;
        state.receive_message_id = receive_message_id.wrapping_add(1);
        Some(entry.message)
    }

    /// Fills this channel's section of the outgoing packet `packet_sequence` with up to
    /// `available_bits` of data. Returns the number of bits written; zero means the
    /// stream was left untouched.
    pub fn get_packet_data(
        &self,
        connection_index: usize,
        stream: &mut BitWriter,
        packet_sequence: u16,
        available_bits: u32,
        now_millis: u64,
        handler: &dyn PacketHandler,
    ) -> u32 {
        let mut guard = self.connections[connection_index].lock();
        let state = &mut *guard;

        if !state.has_messages_to_send() {
            return 0;
        }

        let mut available_bits = available_bits;
        if let Some(budget) = self.config.packet_budget_bytes {
            available_bits = available_bits.min(budget as u32 * 8);
        }

        let channel_index_bits = bits_required(0, self.num_channels as u64);
        if available_bits <= channel_index_bits {
            return 0;
        }
        available_bits -= channel_index_bits;

        let bits_before = stream.bits_written();
        if state.sending_block_message() {
            self.write_block_fragment(
                state,
                stream,
                packet_sequence,
                available_bits,
                now_millis,
                handler,
            );
        } else {
            self.write_messages(
                state,
                stream,
                packet_sequence,
                available_bits,
                now_millis,
                handler,
            );
        }
        stream.bits_written() - bits_before
    }

    /// Processes this channel's section of an inbound packet. Returns false if the
    /// section could not be parsed (the rest of the packet payload is unusable) or the
    /// channel is in an error state.
    pub fn process_packet_data(
        &self,
        connection_index: usize,
        stream: &mut BitReader,
        packet_sequence: u16,
        handler: &dyn PacketHandler,
    ) -> bool {
        let _ = packet_sequence;
        let mut guard = self.connections[connection_index].lock();
        let state = &mut *guard;
        if state.error_level != ChannelErrorLevel::None {
            return false;
        }

        let is_block = match stream.deserialise_bool() {
            Ok(flag) => flag,
            Err(_) => {
                state.set_error_level(self.channel_index, ChannelErrorLevel::FailedToSerialise);
                return false;
            }
        };

        if is_block {
            self.process_block_fragment(state, stream, handler)
        } else {
            self.process_messages(state, stream, handler)
        }
    }

    /// Walks a packet-level ack back to the messages or block fragment the packet
    /// carried. Each ack reaches each packet at most once; the transport's own acked
    /// flag guarantees that, and the local one makes it idempotent regardless.
    pub fn process_acknowledgement(&self, connection_index: usize, packet_sequence: u16) {
        let mut guard = self.connections[connection_index].lock();
        let state = &mut *guard;
        if state.error_level != ChannelErrorLevel::None {
            return;
        }

        let Some(entry) = state.sent_packets.find_mut(packet_sequence) else {
            return;
        };
        if entry.acked {
            return;
        }
        entry.acked = true;

        match &entry.ids {
            SentPacketIds::Messages(message_ids) => {
                let message_ids = message_ids.clone();
                for message_id in message_ids {
                    if state.send_queue.remove(message_id).is_some() {
                        debug!(
                            "acked message {} on channel {}, connection {}",
                            message_id, self.channel_index, connection_index
                        );
                        state.update_oldest_unacked_message_id();
                    }
                }
            }
            SentPacketIds::Fragment {
                message_id,
                fragment_id,
            } => {
                let message_id = *message_id;
                let fragment_id = *fragment_id as usize;
                // a late fragment ack after the block completed (or for a previous
                // block) must be ignored
                if state.send_block.active && state.send_block.block_message_id == message_id {
                    if !state.send_block.acked_fragment[fragment_id] {
                        state.send_block.acked_fragment[fragment_id] = true;
                        state.send_block.num_acked_fragments += 1;
                        if state.send_block.num_acked_fragments == state.send_block.num_fragments {
                            debug!(
                                "all fragments of block message {} acked on channel {}, connection {}",
                                message_id, self.channel_index, connection_index
                            );
                            state.send_block.active = false;
                            state.send_queue.remove(message_id);
                            state.update_oldest_unacked_message_id();
                        }
                    }
                }
            }
        }
    }

    /// Clears one connection's state, including a latched error level.
    pub fn reset(&self, connection_index: usize) {
        let mut guard = self.connections[connection_index].lock();
        let state = &mut *guard;
        *state = ReliableConnection::new(&self.config);
    }

    pub fn reset_all(&self) {
        for connection_index in 0..self.connections.len() {
            self.reset(connection_index);
        }
    }

    fn write_block_fragment(
        &self,
        state: &mut ReliableConnection,
        stream: &mut BitWriter,
        packet_sequence: u16,
        available_bits: u32,
        now_millis: u64,
        handler: &dyn PacketHandler,
    ) {
        let message_id = state.oldest_unacked_message_id;
        let (block_size, measured_bits) = {
            let entry = state
                .send_queue
                .find(message_id)
                .expect("head of the resend window must be in the send queue");
            debug_assert!(entry.message.is_block);
            (entry.message.block_size as usize, entry.measured_bits)
        };

        if !state.send_block.active {
            // start sending this block
            let num_fragments = block_size.div_ceil(self.config.fragment_size);
            debug_assert!(num_fragments >= 1);
            debug_assert!(num_fragments <= self.config.max_fragments);

            state.send_block.active = true;
            state.send_block.block_message_id = message_id;
            state.send_block.num_fragments = num_fragments;
            state.send_block.num_acked_fragments = 0;
            state.send_block.acked_fragment.fill(false);
            state.send_block.fragment_send_time_millis.fill(None);
        }
        let num_fragments = state.send_block.num_fragments;

        // the next fragment to send: lowest unacked one whose resend timer expired
        // (there may not be one right now)
        let mut fragment_id = None;
        for i in 0..num_fragments {
            let due = match state.send_block.fragment_send_time_millis[i] {
                None => true,
                Some(sent) => sent + self.config.fragment_resend_time_millis < now_millis,
            };
            if !state.send_block.acked_fragment[i] && due {
                fragment_id = Some(i);
                break;
            }
        }
        let Some(fragment_id) = fragment_id else {
            return;
        };

        let fragment_remainder = block_size % self.config.fragment_size;
        let fragment_bytes = if fragment_remainder != 0 && fragment_id == num_fragments - 1 {
            fragment_remainder
        } else {
            self.config.fragment_size
        };

        // everything this fragment will cost, with byte-alignment slack for the raw
        // fragment bytes
        let mut fragment_bits = 1 // block flag
            + 16 // message id
            + bits_required(1, self.config.max_fragments as u64)
            + if num_fragments > 1 {
                bits_required(0, num_fragments as u64 - 1)
            } else {
                0
            }
            + bits_required(1, self.config.fragment_size as u64)
            + 7
            + fragment_bytes as u32 * 8;
        if fragment_id == 0 {
            fragment_bits += bits_required(0, self.config.max_message_protocol as u64) + measured_bits;
        }
        if fragment_bits > available_bits {
            return;
        }

        stream.serialise_integer(self.channel_index as u64, 0, self.num_channels as u64);
        stream.serialise_bool(true);
        stream.write_bits(message_id as u32, 16);
        if self.config.max_fragments > 1 {
            stream.serialise_integer(num_fragments as u64, 1, self.config.max_fragments as u64);
        }
        if num_fragments > 1 {
            stream.serialise_integer(fragment_id as u64, 0, num_fragments as u64 - 1);
        }
        stream.serialise_integer(fragment_bytes as u64, 1, self.config.fragment_size as u64);

        {
            let entry = state
                .send_queue
                .find(message_id)
                .expect("block entry checked above");
            let start = entry.message.block_offset as usize
                + fragment_id * self.config.fragment_size;
            stream.serialise_bytes(&entry.message.data[start..start + fragment_bytes]);

            if fragment_id == 0 {
                // the block message's non-block part rides along with fragment 0
                stream.serialise_integer(
                    entry.message.protocol as u64,
                    0,
                    self.config.max_message_protocol as u64,
                );
                let ok = handler.serialise_message(&entry.message, stream);
                debug_assert!(ok, "write-side message serialisation must not fail");
            }
        }

        state.send_block.fragment_send_time_millis[fragment_id] = Some(now_millis);
        state.sent_packets.insert(
            packet_sequence,
            SentPacketEntry {
                acked: false,
                ids: SentPacketIds::Fragment {
                    message_id,
                    fragment_id: fragment_id as u16,
                },
            },
        );
    }

    fn write_messages(
        &self,
        state: &mut ReliableConnection,
        stream: &mut BitWriter,
        packet_sequence: u16,
        available_bits: u32,
        now_millis: u64,
        handler: &dyn PacketHandler,
    ) {
        let protocol_bits = bits_required(0, self.config.max_message_protocol as u64);
        let num_messages_bits = bits_required(1, self.config.max_messages_per_packet as u64);
        let header_bits = 1 + 1 + num_messages_bits; // block flag + has-messages flag
        if available_bits < header_bits {
            return;
        }
        let available_bits = available_bits - header_bits;

        // don't run ahead of what the receiver can buffer
        let message_limit = self
            .config
            .send_queue_size
            .min(self.config.receive_queue_size);
        let give_up_bits = protocol_bits + 32;

        let mut message_ids: Vec<u16> = Vec::new();
        let mut used_bits = 0u32;
        let mut give_up_counter = 0usize;
        let mut previous_message_id = 0u16;

        for i in 0..message_limit {
            if available_bits.saturating_sub(used_bits) < give_up_bits {
                break;
            }
            if give_up_counter > self.config.send_queue_size {
                break;
            }

            let message_id = state.oldest_unacked_message_id.wrapping_add(i as u16);
            let Some(entry) = state.send_queue.find_mut(message_id) else {
                continue; // hole: already acked
            };
            if entry.message.is_block {
                // the block is dealt with in block mode once everything before it is
                // acked
                break;
            }

            let due = match entry.last_sent_millis {
                None => true,
                Some(sent) => sent + self.config.message_resend_time_millis <= now_millis,
            };
            if due && available_bits >= entry.measured_bits {
                let id_bits = if message_ids.is_empty() {
                    16
                } else {
                    relative_sequence_encoding_bits(previous_message_id, message_id)
                };
                let message_bits = entry.measured_bits + protocol_bits + id_bits;

                if used_bits + message_bits > available_bits {
                    give_up_counter += 1;
                    continue;
                }

                used_bits += message_bits;
                entry.last_sent_millis = Some(now_millis);
                message_ids.push(message_id);
                previous_message_id = message_id;
            }

            if message_ids.len() == self.config.max_messages_per_packet {
                break;
            }
        }

        if message_ids.is_empty() {
            return;
        }

        stream.serialise_integer(self.channel_index as u64, 0, self.num_channels as u64);
        stream.serialise_bool(false); // not a block fragment
        stream.serialise_bool(true); // messages follow
        stream.serialise_integer(
            message_ids.len() as u64,
            1,
            self.config.max_messages_per_packet as u64,
        );

        stream.write_bits(message_ids[0] as u32, 16);
        for window in message_ids.windows(2) {
            stream.serialise_sequence_relative(window[0], window[1]);
        }

        for &message_id in &message_ids {
            let entry = state
                .send_queue
                .find(message_id)
                .expect("selected message is in the send queue");
            stream.serialise_integer(
                entry.message.protocol as u64,
                0,
                self.config.max_message_protocol as u64,
            );
            let ok = handler.serialise_message(&entry.message, stream);
            debug_assert!(ok, "write-side message serialisation must not fail");
        }

        state.sent_packets.insert(
            packet_sequence,
            SentPacketEntry {
                acked: false,
                ids: SentPacketIds::Messages(message_ids),
            },
        );
    }

    fn process_messages(
        &self,
        state: &mut ReliableConnection,
        stream: &mut BitReader,
        handler: &dyn PacketHandler,
    ) -> bool {
        let has_messages = match stream.deserialise_bool() {
            Ok(flag) => flag,
            Err(_) => {
                state.set_error_level(self.channel_index, ChannelErrorLevel::FailedToSerialise);
                return false;
            }
        };
        if !has_messages {
            return true;
        }

        let min_message_id = state.receive_message_id;
        let max_message_id = state
            .receive_message_id
            .wrapping_add(self.config.receive_queue_size as u16 - 1);

        let num_messages =
            match stream.deserialise_integer(1, self.config.max_messages_per_packet as u64) {
                Ok(n) => n as usize,
                Err(_) => {
                    debug!("failed to deserialise the channel's message count");
                    state.set_error_level(self.channel_index, ChannelErrorLevel::FailedToSerialise);
                    return false;
                }
            };

        let mut message_ids = Vec::with_capacity(num_messages);
        for i in 0..num_messages {
            let message_id = if i == 0 {
                match stream.read_bits(16) {
                    Ok(id) => id as u16,
                    Err(_) => {
                        debug!("failed to deserialise the first message id");
                        state.set_error_level(
                            self.channel_index,
                            ChannelErrorLevel::FailedToSerialise,
                        );
                        return false;
                    }
                }
            } else {
                match stream.deserialise_sequence_relative(message_ids[i - 1]) {
                    Ok(id) => id,
                    Err(_) => {
                        debug!("failed to deserialise relative message id at index {}", i);
                        state.set_error_level(
                            self.channel_index,
                            ChannelErrorLevel::FailedToSerialise,
                        );
                        return false;
                    }
                }
            };
            message_ids.push(message_id);
        }

        for &message_id in &message_ids {
            let protocol =
                match stream.deserialise_integer(0, self.config.max_message_protocol as u64) {
                    Ok(protocol) => protocol as u16,
                    Err(_) => {
                        debug!("failed to deserialise a message protocol tag");
                        state.set_error_level(
                            self.channel_index,
                            ChannelErrorLevel::FailedToSerialise,
                        );
                        return false;
                    }
                };

            let mut message = ChannelMessage {
                protocol,
                id: message_id,
                ..ChannelMessage::default()
            };
            // the payload bits must be consumed even if the message itself is not
            // kept, or the rest of the section misparses
            if !handler.deserialise_message(&mut message, stream) {
                debug!("failed to deserialise message payload, protocol {}", protocol);
                state.set_error_level(self.channel_index, ChannelErrorLevel::FailedToSerialise);
                return false;
            }

            if sequence_less_than(message_id, min_message_id) {
                // already dequeued by the consumer; a late retransmission
                continue;
            }
            if sequence_greater_than(message_id, max_message_id) {
                // did you forget to dequeue messages on the receiver?
                debug!(
                    "message id overflow: {} vs [{}, {}]",
                    message_id, min_message_id, max_message_id
                );
                state.set_error_level(self.channel_index, ChannelErrorLevel::Desync);
                return false;
            }
            if state.receive_queue.exists(message_id) {
                continue; // duplicate
            }

            if state
                .receive_queue
                .insert(message_id, MessageReceiveQueueEntry { message })
                .is_none()
            {
                state.set_error_level(self.channel_index, ChannelErrorLevel::Desync);
                return false;
            }
        }

        true
    }

    fn process_block_fragment(
        &self,
        state: &mut ReliableConnection,
        stream: &mut BitReader,
        handler: &dyn PacketHandler,
    ) -> bool {
        macro_rules! parse_or_fail {
            ($expr:expr, $what:literal) => {
                match $expr {
                    Ok(value) => value,
                    Err(_) => {
                        debug!(concat!("failed to deserialise ", $what));
                        state.set_error_level(
                            self.channel_index,
                            ChannelErrorLevel::FailedToSerialise,
                        );
                        return false;
                    }
                }
            };
        }

        let message_id = parse_or_fail!(stream.read_bits(16), "block message id") as u16;
        let num_fragments = if self.config.max_fragments > 1 {
            parse_or_fail!(
                stream.deserialise_integer(1, self.config.max_fragments as u64),
                "block fragment count"
            ) as usize
        } else {
            1
        };
        let fragment_id = if num_fragments > 1 {
            parse_or_fail!(
                stream.deserialise_integer(0, num_fragments as u64 - 1),
                "block fragment id"
            ) as usize
        } else {
            0
        };
        let fragment_bytes = parse_or_fail!(
            stream.deserialise_integer(1, self.config.fragment_size as u64),
            "block fragment size"
        ) as usize;

        let mut fragment_data = vec![0u8; fragment_bytes];
        parse_or_fail!(stream.deserialise_bytes(&mut fragment_data), "block fragment bytes");

        let mut block_message = None;
        if fragment_id == 0 {
            let protocol = parse_or_fail!(
                stream.deserialise_integer(0, self.config.max_message_protocol as u64),
                "block message protocol"
            ) as u16;
            let mut message = ChannelMessage {
                protocol,
                id: message_id,
                is_block: true,
                ..ChannelMessage::default()
            };
            if !handler.deserialise_message(&mut message, stream) {
                debug!("failed to deserialise block message payload, protocol {}", protocol);
                state.set_error_level(self.channel_index, ChannelErrorLevel::FailedToSerialise);
                return false;
            }
            block_message = Some(message);
        }

        // a block is only accepted at the current receive position; anything else is a
        // stray retransmission from the past or a block we cannot buffer yet
        if message_id != state.receive_message_id {
            debug!(
                "dropping block fragment for message {} (receive position is {})",
                message_id, state.receive_message_id
            );
            return true;
        }

        if !state.receive_block.active {
            // start receiving a new block
            state.receive_block.active = true;
            state.receive_block.num_fragments = num_fragments;
            state.receive_block.num_received_fragments = 0;
            state.receive_block.message_id = message_id;
            state.receive_block.block_size = 0;
            state.receive_block.received_fragment.fill(false);
            state.receive_block.message = None;
        }

        if num_fragments != state.receive_block.num_fragments {
            debug!(
                "block fragment count mismatch: expected {}, got {}",
                state.receive_block.num_fragments, num_fragments
            );
            state.set_error_level(self.channel_index, ChannelErrorLevel::Desync);
            return false;
        }
        debug_assert!(fragment_id < num_fragments);

        if state.receive_block.received_fragment[fragment_id] {
            return true; // duplicate fragment
        }

        state.receive_block.received_fragment[fragment_id] = true;
        state.receive_block.num_received_fragments += 1;

        let offset = fragment_id * self.config.fragment_size;
        state.receive_block.block_data[offset..offset + fragment_bytes]
            .copy_from_slice(&fragment_data);

        if fragment_id == 0 {
            state.receive_block.message = block_message;
        }
        if fragment_id == num_fragments - 1 {
            state.receive_block.block_size =
                (num_fragments - 1) * self.config.fragment_size + fragment_bytes;
        }

        if state.receive_block.num_received_fragments == state.receive_block.num_fragments {
            // finished receiving the block: attach the block region to the message
            // carried by fragment 0 and enqueue the whole thing
            let mut message = state
                .receive_block
                .message
                .take()
                .expect("fragment 0 was received, so the block message is present");
            let block_size = state.receive_block.block_size;

            if state
                .receive_queue
                .get_at_index(message_id as usize % self.config.receive_queue_size)
                .is_some()
            {
                // did you forget to dequeue messages on the receiver?
                state.set_error_level(self.channel_index, ChannelErrorLevel::Desync);
                return false;
            }

            let block_offset = message.data.len();
            let mut combined = Vec::new();
            if combined
                .try_reserve_exact(block_offset + block_size)
                .is_err()
            {
                state.set_error_level(self.channel_index, ChannelErrorLevel::OutOfMemory);
                return false;
            }
            combined.extend_from_slice(&message.data);
            combined.extend_from_slice(&state.receive_block.block_data[..block_size]);

            message.id = message_id;
            message.block_offset = block_offset as u16;
            message.block_size = block_size as u16;
            message.data = combined;

            if state
                .receive_queue
                .insert(message_id, MessageReceiveQueueEntry { message })
                .is_none()
            {
                state.set_error_level(self.channel_index, ChannelErrorLevel::Desync);
                return false;
            }
            state.receive_block.reset();
        }

        true
    }
}
