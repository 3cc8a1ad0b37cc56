use super::unreliable::{deserialise_message_section, UnreliableConnection};
use super::{ChannelCounter, ChannelErrorLevel, ChannelMessage, PacketHandler};
use crate::config::ChannelConfig;
use crate::serialise::{bits_required, BitReader, BitWriter};
use tracing::debug;

/// Fire-and-forget channel without a receive queue.
///
/// The send path is identical to [`super::UnreliableUnorderedChannel`], but inbound
/// messages are handed to [`PacketHandler::handle_unreliable_message`] the moment they
/// are decoded and their bytes are released right after the call. Intended for
/// telemetry-style data where anything not processed immediately is stale anyway.
pub struct UnreliableProcessChannel {
    channel_index: u16,
    num_channels: usize,
    config: ChannelConfig,
    connections: Vec<UnreliableConnection>,
}

impl UnreliableProcessChannel {
    pub fn new(
        channel_index: u16,
        num_channels: usize,
        config: ChannelConfig,
        max_connection_count: usize,
    ) -> UnreliableProcessChannel {
        let connections = (0..max_connection_count)
            .map(|_| UnreliableConnection::new(&config, false))
            .collect();
        UnreliableProcessChannel {
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

    /// Decodes the channel section, dispatching every message inline. The handler gets
    /// ownership; nothing is queued.
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

        deserialise_message_section(
            connection,
            self.channel_index,
            &self.config,
            stream,
            packet_sequence,
            handler,
            &mut |message| {
                let protocol = message.protocol;
                if !handler.handle_unreliable_message(message) {
                    debug!("unreliable message handler rejected protocol {}", protocol);
                }
                connection.bump(ChannelCounter::MessagesReceived);
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

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    const NUM_CHANNELS: usize = 1;

    /// Records every inline-dispatched message for inspection.
    struct RecordingHandler {
        handled: Mutex<Vec<ChannelMessage>>,
    }

    impl RecordingHandler {
        fn new() -> RecordingHandler {
            RecordingHandler {
                handled: Mutex::new(Vec::new()),
            }
        }
    }

    impl PacketHandler for RecordingHandler {
        fn message_bits(&self, protocol: u16) -> u32 {
            protocol as u32 * 8
        }

        fn serialise_message(&self, message: &ChannelMessage, stream: &mut BitWriter) -> bool {
            for &byte in &message.data {
                stream.write_bits(byte as u32, 8);
            }
            true
        }

        fn deserialise_message(&self, message: &mut ChannelMessage, stream: &mut BitReader) -> bool {
            let mut data = Vec::with_capacity(message.protocol as usize);
            for _ in 0..message.protocol {
                match stream.read_bits(8) {
                    Ok(byte) => data.push(byte as u8),
                    Err(_) => return false,
                }
            }
            message.data = data;
            true
        }

        fn handle_unreliable_message(&self, message: ChannelMessage) -> bool {
            self.handled.lock().push(message);
            true
        }
    }

    #[test]
    fn test_messages_are_dispatched_inline() {
        let config = ChannelConfig::default();
        let sender = UnreliableProcessChannel::new(0, NUM_CHANNELS, config.clone(), 1);
        let receiver = UnreliableProcessChannel::new(0, NUM_CHANNELS, config, 1);
        let handler = RecordingHandler::new();

        for i in 0..3u8 {
            sender.send_message(0, ChannelMessage::new(1, vec![i]));
        }

        let mut writer = BitWriter::new(1024);
        let available = writer.bits_available();
        let used = sender.get_packet_data(0, &mut writer, available, &handler);
        assert!(used > 0);
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.deserialise_integer(0, NUM_CHANNELS as u64).unwrap(), 0);
        assert!(receiver.process_packet_data(0, &mut reader, 17, &handler));

        let handled = handler.handled.lock();
        assert_eq!(handled.len(), 3);
        for (i, message) in handled.iter().enumerate() {
            assert_eq!(message.data, vec![i as u8]);
            assert_eq!(message.id, 17);
        }
        assert_eq!(receiver.counter(0, ChannelCounter::MessagesReceived), 3);
    }

    #[test]
    fn test_send_queue_full_latches() {
        let config = ChannelConfig {
            send_queue_size: 4,
            ..ChannelConfig::default()
        };
        let channel = UnreliableProcessChannel::new(0, NUM_CHANNELS, config, 1);
        for _ in 0..4 {
            channel.send_message(0, ChannelMessage::new(0, Vec::new()));
        }
        channel.send_message(0, ChannelMessage::new(0, Vec::new()));
        assert_eq!(channel.error_level(0), ChannelErrorLevel::SendQueueFull);
    }
}
