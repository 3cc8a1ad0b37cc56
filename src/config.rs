use anyhow::bail;
use rustc_hash::FxHashMap;

/// The kind of a channel multiplexed onto every connection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelKind {
    /// Messages are individually acked and delivered strictly in send order; oversized
    /// "block" messages are fragmented at the message level.
    ReliableOrdered,
    /// Fire and forget: no acks, no retries, no ordering. Received messages queue up
    /// until the application dequeues them.
    UnreliableUnordered,
    /// Like [`ChannelKind::UnreliableUnordered`], but received messages are handed to a
    /// callback as they arrive instead of being queued. Meant for telemetry-style data
    /// that is worthless once stale.
    UnreliableProcess,
}

/// Tuning knobs for one channel. All sizes are validated once at endpoint construction.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Capacity of the message send queue. Must divide 65536.
    pub send_queue_size: usize,
    /// Capacity of the message receive queue. Must divide 65536.
    pub receive_queue_size: usize,
    /// Capacity of the ring mapping packet sequences to the messages they carried
    /// (reliable channels only). Must divide 65536.
    ///
    /// Consider your packet send rate: this buffer should cover at least a few seconds
    /// worth of packets, otherwise acks for older packets are lost and messages get
    /// retransmitted needlessly.
    pub sent_packet_buffer_size: usize,
    /// Upper bound on the number of messages serialised into a single packet.
    pub max_messages_per_packet: usize,
    /// Optional hard cap (in bytes) on how much of a packet this channel may fill.
    /// `None` means the channel can use whatever budget the packet has left.
    pub packet_budget_bytes: Option<usize>,
    /// Largest application-defined message protocol tag; bounds the bits spent on the
    /// tag per message.
    pub max_message_protocol: u16,
    /// Maximum number of fragments a block message may be split into.
    pub max_fragments: usize,
    /// Size of one block fragment in bytes. The largest sendable block is
    /// `max_fragments * fragment_size`.
    pub fragment_size: usize,
    /// A message is eligible for retransmission once this much time has passed since
    /// the last packet that carried it.
    pub message_resend_time_millis: u64,
    /// Like `message_resend_time_millis`, for block fragments.
    pub fragment_resend_time_millis: u64,
}

impl Default for ChannelConfig {
    fn default() -> ChannelConfig {
        ChannelConfig {
            send_queue_size: 512,
            receive_queue_size: 512,
            sent_packet_buffer_size: 512,
            max_messages_per_packet: 256,
            packet_budget_bytes: None,
            max_message_protocol: u16::MAX,
            max_fragments: 4,
            fragment_size: 1024,
            message_resend_time_millis: 100,
            fragment_resend_time_millis: 250,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_queue_size == 0 || 65536 % self.send_queue_size != 0 {
            bail!("channel send queue size must be a positive divisor of 65536");
        }
        if self.receive_queue_size == 0 || 65536 % self.receive_queue_size != 0 {
            bail!("channel receive queue size must be a positive divisor of 65536");
        }
        if self.sent_packet_buffer_size == 0 || 65536 % self.sent_packet_buffer_size != 0 {
            bail!("channel sent packet buffer size must be a positive divisor of 65536");
        }
        if self.max_messages_per_packet == 0 {
            bail!("a packet must be allowed to carry at least one message");
        }
        if self.max_fragments == 0 || self.fragment_size == 0 {
            bail!("block fragmentation parameters must be positive");
        }
        if self.max_fragments * self.fragment_size > u16::MAX as usize {
            bail!(
                "largest block ({} bytes) must fit a 16 bit block size",
                self.max_fragments * self.fragment_size
            );
        }
        Ok(())
    }
}

/// Configuration of a whole endpoint: the transport tuning plus the channel set.
///
/// Transport-level fragmentation (packets larger than `fragment_above`) is independent
/// of the channel-level block fragmentation: the former splits one oversized *packet*
/// into datagrams, the latter spreads one oversized *message* across many packets.
#[derive(Clone)]
pub struct RudpConfig {
    /// Number of connection slots this endpoint manages.
    pub max_connection_count: usize,
    /// The largest packet payload the transport accepts for sending, and implicitly the
    /// reassembled size limit on receive. Bigger sends are counted and dropped.
    pub max_packet_size: usize,
    /// Packets larger than this many bytes are split into fragments.
    ///
    /// In an ideal world this would be derived from the discovered path MTU, but MTU
    /// discovery over UDP is unreliable, so the application chooses. With full Ethernet
    /// frames and no optional IP headers the usable payload is `1500 - 20 - 8 = 1472`
    /// for IPv4. Choosing this too big causes silently dropped datagrams; too small
    /// wastes bandwidth on fragment headers.
    pub fragment_above: usize,
    /// Maximum number of fragments one packet may be split into (at most 256).
    pub max_fragments: usize,
    /// Size of one transport-level fragment in bytes.
    pub fragment_size: usize,
    /// Capacity of the per-connection ring of not-yet-consumed acknowledgements.
    pub acknowledge_buffer_size: usize,
    /// Capacity of the sent packet buffer. Must divide 65536.
    ///
    /// Measured in seconds at your packet send rate, this must exceed the ack window of
    /// the peer, otherwise acks arrive for packets the buffer has already forgotten and
    /// they are dropped silently.
    pub sent_packet_buffer_size: usize,
    /// Capacity of the received packet buffer. Must divide 65536.
    pub received_packet_buffer_size: usize,
    /// Capacity of the buffer of partially reassembled inbound packets. Must divide 65536.
    pub fragment_reassembly_buffer_size: usize,
    /// Whether bandwidth accounting assumes IPv6 (48 bytes of IP + UDP header per
    /// datagram) or IPv4 (28 bytes).
    pub ipv6: bool,
    /// The channel of each index, in wire order. At least one.
    pub channels: Vec<ChannelKind>,
    /// Configuration applied to every channel without a specific override.
    pub default_channel_config: ChannelConfig,
    /// Per-channel-index overrides of the default channel configuration.
    pub specific_channel_configs: FxHashMap<u16, ChannelConfig>,
}

impl RudpConfig {
    /// A configuration suitable for IPv4 with end-to-end full Ethernet MTU: packets up
    /// to 16 KiB, fragmented into chunks that fit one datagram each, one reliable
    /// ordered channel.
    pub fn default_ipv4() -> RudpConfig {
        RudpConfig {
            max_connection_count: 16,
            max_packet_size: 16 * 1024,
            fragment_above: 1024,
            max_fragments: 16,
            fragment_size: 1024,
            acknowledge_buffer_size: 256,
            sent_packet_buffer_size: 1024,
            received_packet_buffer_size: 1024,
            fragment_reassembly_buffer_size: 64,
            ipv6: false,
            channels: vec![ChannelKind::ReliableOrdered],
            default_channel_config: ChannelConfig::default(),
            specific_channel_configs: FxHashMap::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connection_count == 0 {
            bail!("at least one connection slot is required");
        }
        if self.max_packet_size == 0 {
            bail!("max packet size must be positive");
        }
        if self.fragment_above == 0 || self.fragment_above > self.max_packet_size {
            bail!("fragmentation threshold must be in [1, max_packet_size]");
        }
        if self.fragment_size == 0 {
            bail!("fragment size must be positive");
        }
        if self.max_fragments == 0 || self.max_fragments > 256 {
            bail!("fragment count must be in [1, 256] to fit the fragment header");
        }
        if self.max_packet_size.div_ceil(self.fragment_size) > self.max_fragments {
            bail!(
                "a maximum size packet needs {} fragments but only {} are allowed",
                self.max_packet_size.div_ceil(self.fragment_size),
                self.max_fragments
            );
        }
        if self.acknowledge_buffer_size == 0 {
            bail!("acknowledge buffer size must be positive");
        }
        for (name, size) in [
            ("sent packet", self.sent_packet_buffer_size),
            ("received packet", self.received_packet_buffer_size),
            ("fragment reassembly", self.fragment_reassembly_buffer_size),
        ] {
            if size == 0 || 65536 % size != 0 {
                bail!("{} buffer size must be a positive divisor of 65536", name);
            }
        }
        if self.channels.is_empty() {
            bail!("at least one channel is required");
        }
        self.default_channel_config.validate()?;
        for config in self.specific_channel_configs.values() {
            config.validate()?;
        }
        Ok(())
    }

    /// The effective configuration of one channel: the specific override if present,
    /// the default otherwise.
    pub fn effective_channel_config(&self, channel_index: u16) -> ChannelConfig {
        self.specific_channel_configs
            .get(&channel_index)
            .unwrap_or(&self.default_channel_config)
            .clone()
    }
}
