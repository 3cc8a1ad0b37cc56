//! The connection manager: one [`EndPoint`] per UDP endpoint.
//!
//! The endpoint owns the transport and the configured channel set, multiplexes the
//! channels into packets on the way out and demultiplexes inbound packet payloads on
//! the channel index tag. It is driven from outside: the embedding application pumps
//! [`EndPoint::update`] periodically per connection and feeds inbound datagrams into
//! [`EndPoint::receive_datagram`]; the endpoint itself never blocks and owns no
//! sockets, clocks or threads - those arrive through the collaborator traits.

#[cfg(test)]
use mockall::automock;

use crate::channel::{
    ChannelCounter, ChannelErrorLevel, ChannelMessage, PacketHandler, ReliableOrderedChannel,
    UnreliableProcessChannel, UnreliableUnorderedChannel,
};
use crate::config::{ChannelKind, RudpConfig};
use crate::serialise::{bits_required, BitReader, BitWriter};
use crate::transport::Transport;
use std::sync::Arc;
use tracing::debug;

/// Best-effort datagram output. No delivery report; the implementation may copy the
/// buffer. This is the seam where sockets (and, below them, encryption) attach.
#[cfg_attr(test, automock)]
pub trait DatagramSink: Send + Sync {
    fn send(&self, connection_index: usize, data: &[u8]);
}

/// Monotonic time in milliseconds.
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Tells the endpoint which connection slots currently have a live peer. Used to gate
/// statistics recomputation.
#[cfg_attr(test, automock)]
pub trait ConnectionStatus: Send + Sync {
    fn is_connected(&self, connection_index: usize) -> bool;
}

/// One configured channel of the endpoint's channel set.
pub enum Channel {
    ReliableOrdered(ReliableOrderedChannel),
    UnreliableUnordered(UnreliableUnorderedChannel),
    UnreliableProcess(UnreliableProcessChannel),
}

impl Channel {
    fn send_message(
        &self,
        connection_index: usize,
        message: ChannelMessage,
        handler: &dyn PacketHandler,
    ) {
        match self {
            Channel::ReliableOrdered(channel) => {
                channel.send_message(connection_index, message, handler)
            }
            Channel::UnreliableUnordered(channel) => channel.send_message(connection_index, message),
            Channel::UnreliableProcess(channel) => channel.send_message(connection_index, message),
        }
    }

    fn receive_message(&self, connection_index: usize) -> Option<ChannelMessage> {
        match self {
            Channel::ReliableOrdered(channel) => channel.receive_message(connection_index),
            Channel::UnreliableUnordered(channel) => channel.receive_message(connection_index),
            // process channels deliver inline and have nothing to dequeue
            Channel::UnreliableProcess(_) => None,
        }
    }

    fn get_packet_data(
        &self,
        connection_index: usize,
        stream: &mut BitWriter,
        packet_sequence: u16,
        available_bits: u32,
        now_millis: u64,
        handler: &dyn PacketHandler,
    ) -> u32 {
        match self {
            Channel::ReliableOrdered(channel) => channel.get_packet_data(
                connection_index,
                stream,
                packet_sequence,
                available_bits,
                now_millis,
                handler,
            ),
            Channel::UnreliableUnordered(channel) => {
                channel.get_packet_data(connection_index, stream, available_bits, handler)
            }
            Channel::UnreliableProcess(channel) => {
                channel.get_packet_data(connection_index, stream, available_bits, handler)
            }
        }
    }

    fn process_packet_data(
        &self,
        connection_index: usize,
        stream: &mut BitReader,
        packet_sequence: u16,
        handler: &dyn PacketHandler,
    ) -> bool {
        match self {
            Channel::ReliableOrdered(channel) => {
                channel.process_packet_data(connection_index, stream, packet_sequence, handler)
            }
            Channel::UnreliableUnordered(channel) => {
                channel.process_packet_data(connection_index, stream, packet_sequence, handler)
            }
            Channel::UnreliableProcess(channel) => {
                channel.process_packet_data(connection_index, stream, packet_sequence, handler)
            }
        }
    }

    fn process_acknowledgement(&self, connection_index: usize, packet_sequence: u16) {
        if let Channel::ReliableOrdered(channel) = self {
            channel.process_acknowledgement(connection_index, packet_sequence);
        }
        // unreliable channels never track sent packets
    }

    pub fn error_level(&self, connection_index: usize) -> ChannelErrorLevel {
        match self {
            Channel::ReliableOrdered(channel) => channel.error_level(connection_index),
            Channel::UnreliableUnordered(channel) => channel.error_level(connection_index),
            Channel::UnreliableProcess(channel) => channel.error_level(connection_index),
        }
    }

    pub fn counter(&self, connection_index: usize, counter: ChannelCounter) -> u64 {
        match self {
            Channel::ReliableOrdered(channel) => channel.counter(connection_index, counter),
            Channel::UnreliableUnordered(channel) => channel.counter(connection_index, counter),
            Channel::UnreliableProcess(channel) => channel.counter(connection_index, counter),
        }
    }

    fn reset(&self, connection_index: usize) {
        match self {
            Channel::ReliableOrdered(channel) => channel.reset(connection_index),
            Channel::UnreliableUnordered(channel) => channel.reset(connection_index),
            Channel::UnreliableProcess(channel) => channel.reset(connection_index),
        }
    }
}

/// The place where all other parts of the protocol come together: applications hand
/// messages to channels, the pump turns queued messages into packets, and inbound
/// datagrams flow back up through the transport into the channels.
pub struct EndPoint {
    config: Arc<RudpConfig>,
    transport: Transport,
    channels: Vec<Channel>,
    handler: Arc<dyn PacketHandler>,
    sink: Arc<dyn DatagramSink>,
    clock: Arc<dyn Clock>,
    status: Arc<dyn ConnectionStatus>,
}

impl EndPoint {
    pub fn new(
        config: RudpConfig,
        handler: Arc<dyn PacketHandler>,
        sink: Arc<dyn DatagramSink>,
        clock: Arc<dyn Clock>,
        status: Arc<dyn ConnectionStatus>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let config = Arc::new(config);

        let num_channels = config.channels.len();
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(index, kind)| {
                let channel_config = config.effective_channel_config(index as u16);
                match kind {
                    ChannelKind::ReliableOrdered => Channel::ReliableOrdered(
                        ReliableOrderedChannel::new(
                            index as u16,
                            num_channels,
                            channel_config,
                            config.max_connection_count,
                        ),
                    ),
                    ChannelKind::UnreliableUnordered => Channel::UnreliableUnordered(
                        UnreliableUnorderedChannel::new(
                            index as u16,
                            num_channels,
                            channel_config,
                            config.max_connection_count,
                        ),
                    ),
                    ChannelKind::UnreliableProcess => Channel::UnreliableProcess(
                        UnreliableProcessChannel::new(
                            index as u16,
                            num_channels,
                            channel_config,
                            config.max_connection_count,
                        ),
                    ),
                }
            })
            .collect();

        Ok(EndPoint {
            transport: Transport::new(config.clone()),
            config,
            channels,
            handler,
            sink,
            clock,
            status,
        })
    }

    /// Hands a message to a channel on one connection. Queue overflow and error
    /// handling are the channel's business (see [`ChannelErrorLevel`]).
    pub fn send_message(
        &self,
        connection_index: usize,
        channel_index: usize,
        message: ChannelMessage,
    ) {
        self.channels[channel_index].send_message(connection_index, message, &*self.handler);
    }

    /// Dequeues the next received message from a channel, if any.
    pub fn receive_message(
        &self,
        connection_index: usize,
        channel_index: usize,
    ) -> Option<ChannelMessage> {
        self.channels[channel_index].receive_message(connection_index)
    }

    /// One pump step for one connection: fans the transport's pending packet acks out
    /// to every channel, then assembles and sends the next outbound packet. A packet
    /// goes out even when no channel has payload - acknowledgements ride on it.
    pub fn update(&self, connection_index: usize) {
        let now_millis = self.clock.now_millis();

        let acknowledgements = self.transport.acknowledgements(connection_index);
        if !acknowledgements.is_empty() {
            for &packet_sequence in &acknowledgements {
                for channel in &self.channels {
                    channel.process_acknowledgement(connection_index, packet_sequence);
                }
            }
            self.transport
                .clear_acknowledgements(connection_index, acknowledgements.len());
        }

        let packet_sequence = self.transport.next_packet_sequence(connection_index);
        let num_channels = self.channels.len();
        let sentinel_bits = bits_required(0, num_channels as u64);

        let mut writer = BitWriter::new(self.packet_capacity_bytes());
        let mut available_bits = writer.bits_available().saturating_sub(sentinel_bits);
        for channel in &self.channels {
            if available_bits == 0 {
                break;
            }
            let used = channel.get_packet_data(
                connection_index,
                &mut writer,
                packet_sequence,
                available_bits,
                now_millis,
                &*self.handler,
            );
            available_bits = available_bits.saturating_sub(used);
        }

        // the channel-count sentinel terminates the section list
        writer.serialise_integer(num_channels as u64, 0, num_channels as u64);
        writer.flush();

        self.transport.send_packet(
            connection_index,
            writer.as_bytes(),
            now_millis,
            &*self.sink,
        );
    }

    /// One pump step for every connected connection.
    pub fn update_all(&self) {
        for connection_index in 0..self.config.max_connection_count {
            if self.status.is_connected(connection_index) {
                self.update(connection_index);
            }
        }
    }

    /// Feeds one inbound datagram into the transport. The payload is demultiplexed on
    /// the channel index tag, section by section, until the sentinel.
    pub fn receive_datagram(&self, connection_index: usize, data: &[u8]) {
        let now_millis = self.clock.now_millis();
        let channels = &self.channels;
        let handler = &*self.handler;
        let num_channels = channels.len();

        let mut process = |packet_sequence: u16, payload: &[u8]| -> bool {
            let mut reader = BitReader::new(payload);
            loop {
                let channel_index = match reader.deserialise_integer(0, num_channels as u64) {
                    Ok(index) => index as usize,
                    Err(e) => {
                        debug!("packet payload ends without a channel sentinel: {}", e);
                        return false;
                    }
                };
                if channel_index == num_channels {
                    return true; // sentinel: end of the section list
                }
                if !channels[channel_index].process_packet_data(
                    connection_index,
                    &mut reader,
                    packet_sequence,
                    handler,
                ) {
                    return false;
                }
            }
        };

        self.transport
            .receive_packet(connection_index, data, now_millis, &mut process);
    }

    /// Recomputes connection statistics for every connected connection.
    pub fn update_statistics(&self) {
        self.transport.update_statistics(&*self.status);
    }

    /// Tears down one connection's state across the transport and every channel,
    /// clearing latched channel errors.
    pub fn reset(&self, connection_index: usize) {
        self.transport.reset(connection_index);
        for channel in &self.channels {
            channel.reset(connection_index);
        }
    }

    /// The channel's latched error state. A non-`None` level means the logical
    /// connection should be torn down (see [`EndPoint::reset`]).
    pub fn channel_error_level(
        &self,
        connection_index: usize,
        channel_index: usize,
    ) -> ChannelErrorLevel {
        self.channels[channel_index].error_level(connection_index)
    }

    pub fn channel(&self, channel_index: usize) -> &Channel {
        &self.channels[channel_index]
    }

    /// The transport, for statistics and counters.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn packet_capacity_bytes(&self) -> usize {
        // the bit writer needs whole 32 bit words; rounding down keeps every packet
        // within max_packet_size
        (self.config.max_packet_size & !3).max(4)
    }
}
