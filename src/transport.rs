//! The packet-level reliability engine.
//!
//! [`Transport`] assigns a wrapping 16 bit sequence number to every outbound packet,
//! piggybacks an acknowledgement plus a 32 bit ack bitmap for the peer's packets on
//! every header, splits oversized packets into fragments and reassembles them on the
//! way in, and keeps per-connection quality statistics (RTT, jitter, packet loss,
//! bandwidth).
//!
//! It knows nothing about messages or channels: outbound it takes opaque payload
//! bytes, inbound it hands the payload to a caller-supplied processing function and
//! only commits the packet (records it as received, walks the ack bitmap) when that
//! function accepts it.

use crate::buffers::SequenceBuffer;
use crate::config::RudpConfig;
use crate::endpoint::{ConnectionStatus, DatagramSink};
use crate::packet_header::{
    FragmentHeader, PacketHeader, FRAGMENT_HEADER_BYTES, IP_HEADER_BYTES_IPV4,
    IP_HEADER_BYTES_IPV6, MAX_PACKET_HEADER_BYTES,
};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

const ROUND_TRIP_TIME_SMOOTHING_FACTOR: f32 = 0.0025;
const PACKET_LOSS_SMOOTHING_FACTOR: f32 = 0.1;
const BANDWIDTH_SMOOTHING_FACTOR: f32 = 0.1;
const ROUND_TRIP_TIME_HISTORY_SIZE: usize = 512;

/// Per-connection transport event counters, intended for telemetry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransportCounter {
    PacketsSent,
    PacketsReceived,
    PacketsAcknowledged,
    StalePackets,
    InvalidPackets,
    OversizedSendPackets,
    OversizedReceivePackets,
    FragmentedPacketsSent,
    FragmentedPacketsReceived,
    InvalidFragmentedPackets,
}

pub const TRANSPORT_COUNTER_COUNT: usize = 10;

/// Bookkeeping for one sent packet, kept until the sent packet buffer advances past it.
#[derive(Clone, Copy, Debug)]
pub struct SentPacketData {
    pub time_millis: u64,
    pub acked: bool,
    /// Includes the IP + UDP header overhead, for bandwidth accounting.
    pub packet_bytes: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct ReceivedPacketData {
    pub time_millis: u64,
    pub packet_bytes: u32,
}

/// One partially reassembled inbound packet.
///
/// The buffer reserves [`MAX_PACKET_HEADER_BYTES`] in front so the inner packet header
/// carried by fragment 0 can be placed right-aligned against the payload, whatever its
/// encoded size turns out to be.
struct FragmentReassemblyData {
    num_fragments_total: usize,
    num_fragments_received: usize,
    packet_header_bytes: usize,
    packet_bytes: usize,
    fragment_received: Vec<bool>,
    buffer: Vec<u8>,
}

/// Snapshot of the derived per-connection statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConnectionStatistics {
    pub round_trip_time_millis: f32,
    pub round_trip_time_minimum_millis: f32,
    pub round_trip_time_maximum_millis: f32,
    pub round_trip_time_average_millis: f32,
    pub average_jitter_from_minimum_rtt_millis: f32,
    pub max_jitter_from_minimum_rtt_millis: f32,
    pub std_jitter_from_average_rtt_millis: f32,
    /// Fraction of packets in the older half of the sent buffer that were never acked,
    /// in percent, exponentially smoothed.
    pub packet_loss_percent: f32,
    pub sent_bandwidth_kbps: f32,
    pub received_bandwidth_kbps: f32,
    pub acknowledged_bandwidth_kbps: f32,
}

struct ConnectionState {
    sequence: u16,
    sent_packets: SequenceBuffer<SentPacketData>,
    received_packets: SequenceBuffer<ReceivedPacketData>,
    fragment_reassembly: SequenceBuffer<FragmentReassemblyData>,
    acknowledgements: Vec<u16>,
    rtt_history: Vec<f32>,
    statistics: ConnectionStatistics,
    counters: [u64; TRANSPORT_COUNTER_COUNT],
}

impl ConnectionState {
    fn new(config: &RudpConfig) -> ConnectionState {
        ConnectionState {
            sequence: 0,
            sent_packets: SequenceBuffer::new(config.sent_packet_buffer_size),
            received_packets: SequenceBuffer::new(config.received_packet_buffer_size),
            fragment_reassembly: SequenceBuffer::new(config.fragment_reassembly_buffer_size),
            acknowledgements: Vec::with_capacity(config.acknowledge_buffer_size),
            rtt_history: vec![-1.0; ROUND_TRIP_TIME_HISTORY_SIZE],
            statistics: ConnectionStatistics::default(),
            counters: [0; TRANSPORT_COUNTER_COUNT],
        }
    }

    fn reset(&mut self, config: &RudpConfig) {
        *self = ConnectionState::new(config);
    }
}

pub struct Transport {
    config: Arc<RudpConfig>,
    connections: Vec<Mutex<ConnectionState>>,
}

impl Transport {
    pub fn new(config: Arc<RudpConfig>) -> Transport {
        let connections = (0..config.max_connection_count)
            .map(|_| Mutex::new(ConnectionState::new(&config)))
            .collect();
        Transport {
            config,
            connections,
        }
    }

    /// Wraps `packet_data` in an rUDP header (fragmenting if necessary) and emits the
    /// resulting datagram(s) on the sink. Oversized payloads are counted and dropped.
    pub fn send_packet(
        &self,
        connection_index: usize,
        packet_data: &[u8],
        now_millis: u64,
        sink: &dyn DatagramSink,
    ) {
        if packet_data.len() > self.config.max_packet_size {
            debug!(
                "packet too large to send: {} bytes, maximum is {}, connection {}",
                packet_data.len(),
                self.config.max_packet_size,
                connection_index
            );
            self.bump(connection_index, TransportCounter::OversizedSendPackets);
            return;
        }

        let mut guard = self.connections[connection_index].lock();
        let state = &mut *guard;

        let sequence = state.sequence;
        state.sequence = state.sequence.wrapping_add(1);

        let (ack, ack_bits) = state.received_packets.ack_bits();
        let header = PacketHeader {
            sequence,
            ack,
            ack_bits,
        };

        let ip_overhead = if self.config.ipv6 {
            IP_HEADER_BYTES_IPV6
        } else {
            IP_HEADER_BYTES_IPV4
        };
        state.sent_packets.insert(
            sequence,
            SentPacketData {
                time_millis: now_millis,
                acked: false,
                packet_bytes: ip_overhead + packet_data.len() as u32,
            },
        );

        if packet_data.len() <= self.config.fragment_above {
            trace!(
                "sending packet sequence {} without fragmentation, connection {}",
                sequence,
                connection_index
            );
            let mut buf = BytesMut::with_capacity(MAX_PACKET_HEADER_BYTES + packet_data.len());
            header.ser(&mut buf);
            buf.put_slice(packet_data);
            sink.send(connection_index, &buf);
        } else {
            let num_fragments = packet_data.len().div_ceil(self.config.fragment_size);
            debug_assert!(num_fragments >= 1);
            debug_assert!(num_fragments <= self.config.max_fragments);

            trace!(
                "sending packet sequence {} as {} fragments, connection {}",
                sequence,
                num_fragments,
                connection_index
            );

            let mut buf = BytesMut::with_capacity(
                FRAGMENT_HEADER_BYTES + MAX_PACKET_HEADER_BYTES + self.config.fragment_size,
            );
            for fragment_id in 0..num_fragments {
                buf.clear();
                FragmentHeader {
                    sequence,
                    fragment_id: fragment_id as u8,
                    num_fragments: num_fragments as u8,
                }
                .ser(&mut buf);
                if fragment_id == 0 {
                    header.ser(&mut buf);
                }
                let start = fragment_id * self.config.fragment_size;
                let end = (start + self.config.fragment_size).min(packet_data.len());
                buf.put_slice(&packet_data[start..end]);

                sink.send(connection_index, &buf);
                state.counters[TransportCounter::FragmentedPacketsSent as usize] += 1;
            }
        }

        state.counters[TransportCounter::PacketsSent as usize] += 1;
    }

    /// Processes one inbound datagram. `process` receives the packet sequence and the
    /// payload bytes and returns whether the payload was accepted; only accepted
    /// packets are recorded as received and have their ack bitmap applied.
    pub fn receive_packet(
        &self,
        connection_index: usize,
        packet_data: &[u8],
        now_millis: u64,
        process: &mut dyn FnMut(u16, &[u8]) -> bool,
    ) {
        if packet_data.len()
            > self.config.max_packet_size + MAX_PACKET_HEADER_BYTES + FRAGMENT_HEADER_BYTES
        {
            debug!(
                "packet too large to receive: {} bytes, connection {}",
                packet_data.len(),
                connection_index
            );
            self.bump(connection_index, TransportCounter::OversizedReceivePackets);
            return;
        }
        if packet_data.is_empty() {
            self.bump(connection_index, TransportCounter::InvalidPackets);
            return;
        }

        if packet_data[0] & 1 == 0 {
            self.receive_regular_packet(connection_index, packet_data, now_millis, process);
        } else {
            self.receive_fragment_packet(connection_index, packet_data, now_millis, process);
        }
    }

    /// The unread acknowledged packet sequences for a connection, oldest first.
    pub fn acknowledgements(&self, connection_index: usize) -> Vec<u16> {
        self.connections[connection_index].lock().acknowledgements.clone()
    }

    /// Releases the first `count` acknowledgements previously returned by
    /// [`Transport::acknowledgements`].
    pub fn clear_acknowledgements(&self, connection_index: usize, count: usize) {
        let mut guard = self.connections[connection_index].lock();
        let state = &mut *guard;
        let count = count.min(state.acknowledgements.len());
        state.acknowledgements.drain(..count);
    }

    /// The sequence number the next sent packet will carry.
    pub fn next_packet_sequence(&self, connection_index: usize) -> u16 {
        self.connections[connection_index].lock().sequence
    }

    pub fn counter(&self, connection_index: usize, counter: TransportCounter) -> u64 {
        self.connections[connection_index].lock().counters[counter as usize]
    }

    /// Snapshot of the derived statistics, as of the last
    /// [`Transport::update_statistics`] tick.
    pub fn statistics(&self, connection_index: usize) -> ConnectionStatistics {
        self.connections[connection_index].lock().statistics
    }

    pub fn reset(&self, connection_index: usize) {
        self.connections[connection_index].lock().reset(&self.config);
    }

    pub fn reset_all(&self) {
        for connection in &self.connections {
            connection.lock().reset(&self.config);
        }
    }

    /// Recomputes the derived statistics for every connected connection. Meant to run
    /// on a periodic tick rather than per packet; readers observe eventually-consistent
    /// values.
    pub fn update_statistics(&self, status: &dyn ConnectionStatus) {
        for connection_index in 0..self.connections.len() {
            if !status.is_connected(connection_index) {
                continue;
            }
            let mut guard = self.connections[connection_index].lock();
            let state = &mut *guard;
            Self::update_round_trip_time_statistics(state);
            Self::update_packet_loss(state, self.config.sent_packet_buffer_size);
            Self::update_sent_bandwidth(state, self.config.sent_packet_buffer_size);
            Self::update_received_bandwidth(state, self.config.received_packet_buffer_size);
        }
    }

    fn receive_regular_packet(
        &self,
        connection_index: usize,
        packet_data: &[u8],
        now_millis: u64,
        process: &mut dyn FnMut(u16, &[u8]) -> bool,
    ) {
        let mut guard = self.connections[connection_index].lock();
        let state = &mut *guard;
        state.counters[TransportCounter::PacketsReceived as usize] += 1;

        let mut read = packet_data;
        let header = match PacketHeader::deser(&mut read) {
            Ok(header) => header,
            Err(e) => {
                debug!(
                    "ignoring invalid packet on connection {}: {}",
                    connection_index, e
                );
                state.counters[TransportCounter::InvalidPackets as usize] += 1;
                return;
            }
        };
        let payload = read;

        if payload.len() > self.config.max_packet_size {
            debug!(
                "packet payload too large to receive: {} bytes, connection {}",
                payload.len(),
                connection_index
            );
            state.counters[TransportCounter::OversizedReceivePackets as usize] += 1;
            return;
        }

        if !state.received_packets.test_insert(header.sequence) {
            debug!(
                "ignoring stale packet sequence {}, connection {}",
                header.sequence, connection_index
            );
            state.counters[TransportCounter::StalePackets as usize] += 1;
            return;
        }

        trace!(
            "processing packet sequence {}, connection {}",
            header.sequence,
            connection_index
        );

        if !process(header.sequence, payload) {
            debug!(
                "packet sequence {} rejected by the channel layer, connection {}",
                header.sequence, connection_index
            );
            return;
        }

        let ip_overhead = if self.config.ipv6 {
            IP_HEADER_BYTES_IPV6
        } else {
            IP_HEADER_BYTES_IPV4
        };
        state.received_packets.insert(
            header.sequence,
            ReceivedPacketData {
                time_millis: now_millis,
                packet_bytes: ip_overhead + packet_data.len() as u32,
            },
        );
        // partial reassemblies shadowed by this completion are gone for good
        state.fragment_reassembly.advance_sequence(header.sequence);

        let mut ack_bits = header.ack_bits;
        for i in 0..32u16 {
            if ack_bits & 1 != 0 {
                let ack_sequence = header.ack.wrapping_sub(i);
                if let Some(sent) = state.sent_packets.find_mut(ack_sequence) {
                    if !sent.acked
                        && state.acknowledgements.len() < self.config.acknowledge_buffer_size
                    {
                        trace!(
                            "acknowledged packet sequence {}, connection {}",
                            ack_sequence,
                            connection_index
                        );
                        sent.acked = true;
                        state.acknowledgements.push(ack_sequence);
                        state.counters[TransportCounter::PacketsAcknowledged as usize] += 1;

                        let round_trip_time = now_millis.saturating_sub(sent.time_millis) as f32;
                        state.rtt_history
                            [ack_sequence as usize % ROUND_TRIP_TIME_HISTORY_SIZE] =
                            round_trip_time;
                        let smoothed = &mut state.statistics.round_trip_time_millis;
                        if (*smoothed == 0.0 && round_trip_time > 0.0)
                            || (*smoothed - round_trip_time).abs() < 0.00001
                        {
                            *smoothed = round_trip_time;
                        } else {
                            *smoothed +=
                                (round_trip_time - *smoothed) * ROUND_TRIP_TIME_SMOOTHING_FACTOR;
                        }
                    }
                }
            }
            ack_bits >>= 1;
        }
    }

    fn receive_fragment_packet(
        &self,
        connection_index: usize,
        packet_data: &[u8],
        now_millis: u64,
        process: &mut dyn FnMut(u16, &[u8]) -> bool,
    ) {
        let mut read = packet_data;
        let fragment = match FragmentHeader::deser(&mut read, self.config.max_fragments) {
            Ok(fragment) => fragment,
            Err(e) => {
                debug!(
                    "ignoring invalid fragment on connection {}: {}",
                    connection_index, e
                );
                self.bump(connection_index, TransportCounter::InvalidFragmentedPackets);
                return;
            }
        };

        // fragment 0 carries the regular header of the reassembled packet; its
        // sequence must agree with the fragment header
        let mut inner_header_bytes = 0;
        if fragment.fragment_id == 0 {
            let mut inner = read;
            let inner_header = match PacketHeader::deser(&mut inner) {
                Ok(header) => header,
                Err(e) => {
                    debug!(
                        "bad packet header in fragment 0 on connection {}: {}",
                        connection_index, e
                    );
                    self.bump(connection_index, TransportCounter::InvalidFragmentedPackets);
                    return;
                }
            };
            if inner_header.sequence != fragment.sequence {
                debug!(
                    "fragment sequence {} does not match inner packet sequence {}, connection {}",
                    fragment.sequence, inner_header.sequence, connection_index
                );
                self.bump(connection_index, TransportCounter::InvalidFragmentedPackets);
                return;
            }
            inner_header_bytes = read.len() - inner.len();
        }

        let fragment_bytes = read.len() - inner_header_bytes;
        if fragment_bytes > self.config.fragment_size {
            debug!(
                "fragment of {} bytes exceeds the fragment size {}, connection {}",
                fragment_bytes, self.config.fragment_size, connection_index
            );
            self.bump(connection_index, TransportCounter::InvalidFragmentedPackets);
            return;
        }
        if fragment.fragment_id != fragment.num_fragments - 1
            && fragment_bytes != self.config.fragment_size
        {
            debug!(
                "non-final fragment {} is {} bytes, expected exactly {}, connection {}",
                fragment.fragment_id, fragment_bytes, self.config.fragment_size, connection_index
            );
            self.bump(connection_index, TransportCounter::InvalidFragmentedPackets);
            return;
        }

        let completed = {
            let mut guard = self.connections[connection_index].lock();
            let state = &mut *guard;

            if !state.fragment_reassembly.exists(fragment.sequence) {
                let entry = FragmentReassemblyData {
                    num_fragments_total: fragment.num_fragments as usize,
                    num_fragments_received: 0,
                    packet_header_bytes: 0,
                    packet_bytes: 0,
                    fragment_received: vec![false; fragment.num_fragments as usize],
                    buffer: vec![
                        0;
                        MAX_PACKET_HEADER_BYTES
                            + fragment.num_fragments as usize * self.config.fragment_size
                    ],
                };
                if state
                    .fragment_reassembly
                    .insert(fragment.sequence, entry)
                    .is_none()
                {
                    debug!(
                        "ignoring stale fragment for packet sequence {}, connection {}",
                        fragment.sequence, connection_index
                    );
                    state.counters[TransportCounter::InvalidFragmentedPackets as usize] += 1;
                    return;
                }
                // make the pending sequence visible to outgoing ack generation windows
                state.received_packets.advance_sequence(fragment.sequence);
            }

            let fragment_size = self.config.fragment_size;
            let entry = state
                .fragment_reassembly
                .find_mut(fragment.sequence)
                .expect("reassembly entry was just inserted");

            if fragment.num_fragments as usize != entry.num_fragments_total {
                debug!(
                    "fragment count mismatch: expected {}, got {}, connection {}",
                    entry.num_fragments_total, fragment.num_fragments, connection_index
                );
                state.counters[TransportCounter::InvalidFragmentedPackets as usize] += 1;
                return;
            }
            if entry.fragment_received[fragment.fragment_id as usize] {
                trace!(
                    "ignoring duplicate fragment {} of packet sequence {}, connection {}",
                    fragment.fragment_id,
                    fragment.sequence,
                    connection_index
                );
                return;
            }

            entry.fragment_received[fragment.fragment_id as usize] = true;
            entry.num_fragments_received += 1;

            if fragment.fragment_id == 0 {
                entry.packet_header_bytes = inner_header_bytes;
                entry.buffer[MAX_PACKET_HEADER_BYTES - inner_header_bytes..MAX_PACKET_HEADER_BYTES]
                    .copy_from_slice(&read[..inner_header_bytes]);
            }
            if fragment.fragment_id == fragment.num_fragments - 1 {
                entry.packet_bytes =
                    (entry.num_fragments_total - 1) * fragment_size + fragment_bytes;
            }

            let offset = MAX_PACKET_HEADER_BYTES + fragment.fragment_id as usize * fragment_size;
            entry.buffer[offset..offset + fragment_bytes]
                .copy_from_slice(&read[inner_header_bytes..]);

            trace!(
                "received fragment {} of packet sequence {} ({}/{}), connection {}",
                fragment.fragment_id,
                fragment.sequence,
                entry.num_fragments_received,
                entry.num_fragments_total,
                connection_index
            );
            state.counters[TransportCounter::FragmentedPacketsReceived as usize] += 1;

            if entry.num_fragments_received == entry.num_fragments_total {
                state.fragment_reassembly.remove(fragment.sequence)
            } else {
                None
            }
        };

        // reassembly complete: feed the reconstructed packet back through the regular
        // path (outside the lock, which receive_regular_packet takes itself)
        if let Some(entry) = completed {
            debug!(
                "completed reassembly of packet sequence {}, connection {}",
                fragment.sequence, connection_index
            );
            let start = MAX_PACKET_HEADER_BYTES - entry.packet_header_bytes;
            let end = MAX_PACKET_HEADER_BYTES + entry.packet_bytes;
            self.receive_regular_packet(connection_index, &entry.buffer[start..end], now_millis, process);
        }
    }

    fn update_round_trip_time_statistics(state: &mut ConnectionState) {
        let mut min_rtt = f32::MAX;
        let mut max_rtt = 0.0f32;
        let mut sum_rtt = 0.0f32;
        let mut count = 0u32;
        for &rtt in &state.rtt_history {
            if rtt >= 0.0 {
                min_rtt = min_rtt.min(rtt);
                max_rtt = max_rtt.max(rtt);
                sum_rtt += rtt;
                count += 1;
            }
        }
        let stats = &mut state.statistics;
        if count == 0 {
            stats.round_trip_time_minimum_millis = 0.0;
            stats.round_trip_time_maximum_millis = 0.0;
            stats.round_trip_time_average_millis = 0.0;
            stats.average_jitter_from_minimum_rtt_millis = 0.0;
            stats.max_jitter_from_minimum_rtt_millis = 0.0;
            stats.std_jitter_from_average_rtt_millis = 0.0;
            return;
        }
        stats.round_trip_time_minimum_millis = min_rtt;
        stats.round_trip_time_maximum_millis = max_rtt;
        stats.round_trip_time_average_millis = sum_rtt / count as f32;

        let mut jitter_sum = 0.0f32;
        let mut jitter_max = 0.0f32;
        let mut deviation_sum = 0.0f32;
        for &rtt in &state.rtt_history {
            if rtt >= 0.0 {
                let difference = rtt - stats.round_trip_time_minimum_millis;
                let deviation = rtt - stats.round_trip_time_average_millis;
                jitter_sum += difference;
                jitter_max = jitter_max.max(difference);
                deviation_sum += deviation * deviation;
            }
        }
        stats.average_jitter_from_minimum_rtt_millis = jitter_sum / count as f32;
        stats.max_jitter_from_minimum_rtt_millis = jitter_max;
        stats.std_jitter_from_average_rtt_millis = (deviation_sum / count as f32).sqrt();
    }

    fn update_packet_loss(state: &mut ConnectionState, sent_packet_buffer_size: usize) {
        let base_sequence = state
            .sent_packets
            .next_sequence()
            .wrapping_sub(sent_packet_buffer_size as u16)
            .wrapping_add(1);
        let mut num_sent = 0u32;
        let mut num_dropped = 0u32;
        for i in 0..sent_packet_buffer_size / 2 {
            let sequence = base_sequence.wrapping_add(i as u16);
            if let Some(sent) = state.sent_packets.find(sequence) {
                num_sent += 1;
                if !sent.acked {
                    num_dropped += 1;
                }
            }
        }
        let loss = &mut state.statistics.packet_loss_percent;
        if num_sent == 0 {
            *loss = 0.0;
            return;
        }
        let packet_loss = num_dropped as f32 / num_sent as f32 * 100.0;
        if (*loss - packet_loss).abs() > 0.00001 {
            *loss += (packet_loss - *loss) * PACKET_LOSS_SMOOTHING_FACTOR;
        } else {
            *loss = packet_loss;
        }
    }

    fn update_sent_bandwidth(state: &mut ConnectionState, sent_packet_buffer_size: usize) {
        let base_sequence = state
            .sent_packets
            .next_sequence()
            .wrapping_sub(sent_packet_buffer_size as u16)
            .wrapping_add(1);

        let mut bytes_sent = 0u64;
        let mut start_time = u64::MAX;
        let mut finish_time = 0u64;
        let mut acked_bytes_sent = 0u64;
        let mut acked_start_time = u64::MAX;
        let mut acked_finish_time = 0u64;
        for i in 0..sent_packet_buffer_size / 2 {
            let sequence = base_sequence.wrapping_add(i as u16);
            let Some(sent) = state.sent_packets.find(sequence) else {
                continue;
            };
            bytes_sent += sent.packet_bytes as u64;
            start_time = start_time.min(sent.time_millis);
            finish_time = finish_time.max(sent.time_millis);
            if sent.acked {
                acked_bytes_sent += sent.packet_bytes as u64;
                acked_start_time = acked_start_time.min(sent.time_millis);
                acked_finish_time = acked_finish_time.max(sent.time_millis);
            }
        }

        if start_time != u64::MAX && finish_time > start_time {
            let kbps = bytes_sent as f32 * 8.0 / (finish_time - start_time) as f32;
            Self::smooth_bandwidth(&mut state.statistics.sent_bandwidth_kbps, kbps);
        }
        if acked_start_time != u64::MAX && acked_finish_time > acked_start_time {
            let kbps =
                acked_bytes_sent as f32 * 8.0 / (acked_finish_time - acked_start_time) as f32;
            Self::smooth_bandwidth(&mut state.statistics.acknowledged_bandwidth_kbps, kbps);
        }
    }

    fn update_received_bandwidth(state: &mut ConnectionState, received_packet_buffer_size: usize) {
        let base_sequence = state
            .received_packets
            .next_sequence()
            .wrapping_sub(received_packet_buffer_size as u16)
            .wrapping_add(1);

        let mut bytes_received = 0u64;
        let mut start_time = u64::MAX;
        let mut finish_time = 0u64;
        for i in 0..received_packet_buffer_size / 2 {
            let sequence = base_sequence.wrapping_add(i as u16);
            let Some(received) = state.received_packets.find(sequence) else {
                continue;
            };
            bytes_received += received.packet_bytes as u64;
            start_time = start_time.min(received.time_millis);
            finish_time = finish_time.max(received.time_millis);
        }

        if start_time != u64::MAX && finish_time > start_time {
            let kbps = bytes_received as f32 * 8.0 / (finish_time - start_time) as f32;
            Self::smooth_bandwidth(&mut state.statistics.received_bandwidth_kbps, kbps);
        }
    }

    fn smooth_bandwidth(smoothed: &mut f32, sample_kbps: f32) {
        if (*smoothed - sample_kbps).abs() > 0.00001 {
            *smoothed += (sample_kbps - *smoothed) * BANDWIDTH_SMOOTHING_FACTOR;
        } else {
            *smoothed = sample_kbps;
        }
    }

    fn bump(&self, connection_index: usize, counter: TransportCounter) {
        self.connections[connection_index].lock().counters[counter as usize] += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RudpConfig;
    use parking_lot::Mutex as TestMutex;
    use rstest::rstest;

    /// Collects everything "sent" so tests can shuttle datagrams around by hand.
    struct CollectingSink {
        datagrams: TestMutex<Vec<Vec<u8>>>,
    }

    impl CollectingSink {
        fn new() -> CollectingSink {
            CollectingSink {
                datagrams: TestMutex::new(Vec::new()),
            }
        }

        fn drain(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.datagrams.lock())
        }
    }

    impl DatagramSink for CollectingSink {
        fn send(&self, _connection_index: usize, data: &[u8]) {
            self.datagrams.lock().push(data.to_vec());
        }
    }

    struct AlwaysConnected;
    impl ConnectionStatus for AlwaysConnected {
        fn is_connected(&self, _connection_index: usize) -> bool {
            true
        }
    }

    fn test_config() -> RudpConfig {
        let mut config = RudpConfig::default_ipv4();
        config.max_connection_count = 2;
        config.max_packet_size = 4096;
        config.fragment_above = 1024;
        config.fragment_size = 1024;
        config.max_fragments = 4;
        config
    }

    fn transport() -> Transport {
        Transport::new(Arc::new(test_config()))
    }

    #[test]
    fn test_small_packet_single_datagram() {
        let transport = transport();
        let sink = CollectingSink::new();

        transport.send_packet(0, &[1, 2, 3], 1000, &sink);

        let datagrams = sink.drain();
        assert_eq!(datagrams.len(), 1);
        // nothing received yet: ack = 65535 as a difference of 1, all four (all-zero)
        // ack bitmap bytes on the wire
        assert_eq!(
            datagrams[0],
            vec![0b0011_1110, 0, 0, 1, 0, 0, 0, 0, 1, 2, 3]
        );
        assert_eq!(transport.counter(0, TransportCounter::PacketsSent), 1);
        assert_eq!(transport.next_packet_sequence(0), 1);
    }

    #[test]
    fn test_oversized_send_is_counted_and_dropped() {
        let transport = transport();
        let sink = CollectingSink::new();

        transport.send_packet(0, &vec![0u8; 5000], 1000, &sink);

        assert!(sink.drain().is_empty());
        assert_eq!(transport.counter(0, TransportCounter::OversizedSendPackets), 1);
        assert_eq!(transport.counter(0, TransportCounter::PacketsSent), 0);
    }

    #[rstest]
    #[case::two_fragments(2048, 2)]
    #[case::three_fragments(2049, 3)]
    #[case::max_fragments(4096, 4)]
    fn test_fragmented_send(#[case] payload_len: usize, #[case] expected_fragments: usize) {
        let transport = transport();
        let sink = CollectingSink::new();

        let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
        transport.send_packet(0, &payload, 1000, &sink);

        let datagrams = sink.drain();
        assert_eq!(datagrams.len(), expected_fragments);
        for (i, datagram) in datagrams.iter().enumerate() {
            assert_eq!(datagram[0], 1, "fragment prefix");
            assert_eq!(datagram[3], i as u8, "fragment id");
            assert_eq!(datagram[4], (expected_fragments - 1) as u8);
        }
        assert_eq!(
            transport.counter(0, TransportCounter::FragmentedPacketsSent),
            expected_fragments as u64
        );
    }

    #[test]
    fn test_receive_round_trip_marks_acks() {
        let a = transport();
        let b = transport();
        let a_sink = CollectingSink::new();
        let b_sink = CollectingSink::new();

        // a sends 5 packets to b
        for i in 0..5u8 {
            a.send_packet(0, &[i], 1000 + i as u64, &a_sink);
        }
        for datagram in a_sink.drain() {
            b.receive_packet(0, &datagram, 2000, &mut |_, _| true);
        }
        assert_eq!(b.counter(0, TransportCounter::PacketsReceived), 5);

        // b sends one packet back, carrying acks for all 5
        b.send_packet(0, &[9], 2000, &b_sink);
        for datagram in b_sink.drain() {
            a.receive_packet(0, &datagram, 2050, &mut |_, _| true);
        }

        let acks = a.acknowledgements(0);
        assert_eq!(acks.len(), 5);
        for sequence in 0..5u16 {
            assert!(acks.contains(&sequence));
        }
        assert_eq!(a.counter(0, TransportCounter::PacketsAcknowledged), 5);

        a.clear_acknowledgements(0, 3);
        assert_eq!(a.acknowledgements(0).len(), 2);
    }

    #[test]
    fn test_acks_are_idempotent() {
        let a = transport();
        let b = transport();
        let sink = CollectingSink::new();

        a.send_packet(0, &[1], 1000, &sink);
        let outbound = sink.drain();
        for datagram in &outbound {
            b.receive_packet(0, datagram, 1500, &mut |_, _| true);
        }

        // two ack-bearing packets from b both cover sequence 0
        b.send_packet(0, &[2], 1500, &sink);
        b.send_packet(0, &[3], 1501, &sink);
        for datagram in sink.drain() {
            a.receive_packet(0, &datagram, 1600, &mut |_, _| true);
        }

        assert_eq!(a.acknowledgements(0), vec![0]);
        assert_eq!(a.counter(0, TransportCounter::PacketsAcknowledged), 1);
    }

    #[test]
    fn test_ack_bitmap_covers_everything_but_dropped_sequences() {
        let a = transport();
        let b = transport();
        let sink = CollectingSink::new();

        // 40 packets, of which sequences 7, 11 and 12 never arrive
        for i in 0..40u64 {
            a.send_packet(0, &[i as u8], 1000 + i, &sink);
        }
        let outbound = sink.drain();

        // the 32 bit ack bitmap only reaches 32 sequences back, so b replies every
        // 10 deliveries to keep every received sequence covered by some bitmap
        let mut replies = Vec::new();
        for (i, datagram) in outbound.iter().enumerate() {
            let sequence = u16::from_le_bytes([datagram[1], datagram[2]]);
            if !matches!(sequence, 7 | 11 | 12) {
                b.receive_packet(0, datagram, 2000 + i as u64, &mut |_, _| true);
            }
            if i % 10 == 9 {
                b.send_packet(0, &[0], 2000 + i as u64, &sink);
                replies.extend(sink.drain());
            }
        }
        for datagram in replies {
            a.receive_packet(0, &datagram, 2100, &mut |_, _| true);
        }

        let acked: Vec<u16> = a.acknowledgements(0);
        for sequence in 0..40u16 {
            let expect_acked = !matches!(sequence, 7 | 11 | 12);
            assert_eq!(
                acked.contains(&sequence),
                expect_acked,
                "sequence {} ack state",
                sequence
            );
        }
        assert_eq!(a.counter(0, TransportCounter::InvalidPackets), 0);
        assert_eq!(b.counter(0, TransportCounter::InvalidPackets), 0);
    }

    #[test]
    fn test_rejected_payload_is_not_recorded() {
        let transport = transport();
        let sink = CollectingSink::new();

        let sender = self::transport();
        sender.send_packet(0, &[7], 1000, &sink);
        let datagram = sink.drain().pop().unwrap();

        transport.receive_packet(0, &datagram, 1100, &mut |_, _| false);
        assert_eq!(transport.counter(0, TransportCounter::PacketsReceived), 1);

        // the packet was not accepted, so a resend with the same sequence is not stale
        let mut accepted = false;
        transport.receive_packet(0, &datagram, 1200, &mut |_, _| {
            accepted = true;
            true
        });
        assert!(accepted);
        assert_eq!(transport.counter(0, TransportCounter::StalePackets), 0);
    }

    #[test]
    fn test_stale_packet_rejected() {
        let transport = transport();
        let sender = self::transport();
        let sink = CollectingSink::new();

        // capture a packet with sequence 0
        sender.send_packet(0, &[1], 1000, &sink);
        let old = sink.drain().pop().unwrap();

        // advance the receiver far past the received packet buffer
        for _ in 0..=1024 {
            sender.send_packet(0, &[2], 1000, &sink);
        }
        let fresh = sink.drain().pop().unwrap();
        transport.receive_packet(0, &fresh, 1100, &mut |_, _| true);

        let mut forwarded = false;
        transport.receive_packet(0, &old, 1200, &mut |_, _| {
            forwarded = true;
            true
        });
        assert!(!forwarded);
        assert_eq!(transport.counter(0, TransportCounter::StalePackets), 1);
    }

    #[test]
    fn test_fragment_round_trip() {
        let sender = transport();
        let receiver = transport();
        let sink = CollectingSink::new();

        let payload: Vec<u8> = (0..3000).map(|i| (i * 7) as u8).collect();
        sender.send_packet(0, &payload, 1000, &sink);

        let mut delivered = Vec::new();
        for datagram in sink.drain() {
            receiver.receive_packet(0, &datagram, 1100, &mut |sequence, data| {
                assert_eq!(sequence, 0);
                delivered = data.to_vec();
                true
            });
        }

        assert_eq!(delivered, payload);
        assert_eq!(
            receiver.counter(0, TransportCounter::FragmentedPacketsReceived),
            3
        );
        assert_eq!(receiver.counter(0, TransportCounter::PacketsReceived), 1);
    }

    #[test]
    fn test_fragment_reordered_delivery_still_completes() {
        let sender = transport();
        let receiver = transport();
        let sink = CollectingSink::new();

        let payload: Vec<u8> = (0..2500).map(|i| (i % 251) as u8).collect();
        sender.send_packet(0, &payload, 1000, &sink);

        let mut datagrams = sink.drain();
        datagrams.reverse();

        let mut delivered = Vec::new();
        for datagram in datagrams {
            receiver.receive_packet(0, &datagram, 1100, &mut |_, data| {
                delivered = data.to_vec();
                true
            });
        }
        assert_eq!(delivered, payload);
    }

    #[test]
    fn test_duplicate_fragment_is_ignored() {
        let sender = transport();
        let receiver = transport();
        let sink = CollectingSink::new();

        let payload = vec![3u8; 2048];
        sender.send_packet(0, &payload, 1000, &sink);
        let datagrams = sink.drain();

        let mut completions = 0;
        let mut process = |_: u16, _: &[u8]| {
            completions += 1;
            true
        };
        receiver.receive_packet(0, &datagrams[0], 1100, &mut process);
        receiver.receive_packet(0, &datagrams[0], 1100, &mut process);
        receiver.receive_packet(0, &datagrams[1], 1100, &mut process);
        assert_eq!(completions, 1);
    }

    #[test]
    fn test_single_fragment_packet_must_carry_inner_header() {
        let receiver = transport();

        // a num_fragments == 1 fragment without the inner regular header: the embedded
        // header parse fails or mismatches, so the fragment is invalid
        let bogus = [0x01u8, 0, 0, 0, 0, 0xff, 0xff, 0xff];
        receiver.receive_packet(0, &bogus, 1000, &mut |_, _| true);
        assert_eq!(
            receiver.counter(0, TransportCounter::InvalidFragmentedPackets),
            1
        );
    }

    #[test]
    fn test_fragment_count_mismatch_rejected() {
        let sender = transport();
        let receiver = transport();
        let sink = CollectingSink::new();

        sender.send_packet(0, &vec![1u8; 2048], 1000, &sink);
        let datagrams = sink.drain();

        receiver.receive_packet(0, &datagrams[0], 1100, &mut |_, _| true);

        // tamper with the second fragment's total count
        let mut tampered = datagrams[1].clone();
        tampered[4] = 2; // claims 3 fragments now
        receiver.receive_packet(0, &tampered, 1100, &mut |_, _| true);
        assert_eq!(
            receiver.counter(0, TransportCounter::InvalidFragmentedPackets),
            1
        );
    }

    #[test]
    fn test_packet_loss_converges_to_zero_on_lossless_link() {
        let a = transport();
        let b = transport();
        let sink = CollectingSink::new();

        for round in 0..600u64 {
            a.send_packet(0, &[round as u8], round * 10, &sink);
            for datagram in sink.drain() {
                b.receive_packet(0, &datagram, round * 10 + 1, &mut |_, _| true);
            }
            b.send_packet(0, &[0], round * 10 + 2, &sink);
            for datagram in sink.drain() {
                a.receive_packet(0, &datagram, round * 10 + 3, &mut |_, _| true);
            }
            a.clear_acknowledgements(0, a.acknowledgements(0).len());
        }

        for _ in 0..50 {
            a.update_statistics(&AlwaysConnected);
        }
        let statistics = a.statistics(0);
        assert!(
            statistics.packet_loss_percent < 1.0,
            "packet loss should converge to zero, was {}",
            statistics.packet_loss_percent
        );
        assert!(statistics.sent_bandwidth_kbps > 0.0);
    }

    #[test]
    fn test_reset_clears_connection_state() {
        let transport = transport();
        let sink = CollectingSink::new();

        transport.send_packet(0, &[1], 1000, &sink);
        transport.send_packet(1, &[1], 1000, &sink);
        transport.reset(0);

        assert_eq!(transport.next_packet_sequence(0), 0);
        assert_eq!(transport.counter(0, TransportCounter::PacketsSent), 0);
        // other connections are untouched
        assert_eq!(transport.counter(1, TransportCounter::PacketsSent), 1);
    }
}
