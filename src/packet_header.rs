use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};

/// Smallest possible regular packet header: prefix, sequence, 1-byte ack difference.
pub const MIN_PACKET_HEADER_BYTES: usize = 4;
/// Largest possible regular packet header: prefix, sequence, 2-byte ack, 4 ack-bitmap bytes.
pub const MAX_PACKET_HEADER_BYTES: usize = 9;
/// Fragment header: prefix, sequence, fragment id, fragment count.
pub const FRAGMENT_HEADER_BYTES: usize = 5;

// note: UDP over IPv4 = 20 + 8 bytes, UDP over IPv6 = 40 + 8 bytes
pub const IP_HEADER_BYTES_IPV4: u32 = 28;
pub const IP_HEADER_BYTES_IPV6: u32 = 48;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct Prefix: u8 {
        const FRAGMENT       = 0b0000_0001;
        const ACK_BITS_BYTE0 = 0b0000_0010;
        const ACK_BITS_BYTE1 = 0b0000_0100;
        const ACK_BITS_BYTE2 = 0b0000_1000;
        const ACK_BITS_BYTE3 = 0b0001_0000;
        const ACK_DIFFERENCE = 0b0010_0000;
    }
}

/// The header of a regular (non-fragmented) rUDP packet.
///
/// The encoded form is 4 to 9 bytes: ack-bitmap bytes that are fully acked (0xFF) are
/// omitted, and when the ack trails the packet sequence by at most 255 it is sent as a
/// one-byte difference instead of a two-byte absolute value. The prefix byte records
/// which of these compressions apply.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    pub sequence: u16,
    pub ack: u16,
    pub ack_bits: u32,
}

impl PacketHeader {
    /// The number of bytes [`PacketHeader::ser`] will produce for this header.
    pub fn serialised_len(&self) -> usize {
        let ack_bytes = (0..4)
            .filter(|i| (self.ack_bits >> (8 * i)) & 0xff != 0xff)
            .count();
        let difference_fits = self.sequence.wrapping_sub(self.ack) <= 255;
        1 + 2 + if difference_fits { 1 } else { 2 } + ack_bytes
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut prefix = Prefix::empty();
        if self.ack_bits & 0x0000_00ff != 0x0000_00ff {
            prefix |= Prefix::ACK_BITS_BYTE0;
        }
        if self.ack_bits & 0x0000_ff00 != 0x0000_ff00 {
            prefix |= Prefix::ACK_BITS_BYTE1;
        }
        if self.ack_bits & 0x00ff_0000 != 0x00ff_0000 {
            prefix |= Prefix::ACK_BITS_BYTE2;
        }
        if self.ack_bits & 0xff00_0000 != 0xff00_0000 {
            prefix |= Prefix::ACK_BITS_BYTE3;
        }

        let sequence_difference = self.sequence.wrapping_sub(self.ack);
        if sequence_difference <= 255 {
            prefix |= Prefix::ACK_DIFFERENCE;
        }

        buf.put_u8(prefix.bits());
        buf.put_u16_le(self.sequence);

        if sequence_difference <= 255 {
            buf.put_u8(sequence_difference as u8);
        } else {
            buf.put_u16_le(self.ack);
        }

        if prefix.contains(Prefix::ACK_BITS_BYTE0) {
            buf.put_u8((self.ack_bits & 0xff) as u8);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE1) {
            buf.put_u8(((self.ack_bits >> 8) & 0xff) as u8);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE2) {
            buf.put_u8(((self.ack_bits >> 16) & 0xff) as u8);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE3) {
            buf.put_u8(((self.ack_bits >> 24) & 0xff) as u8);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let prefix = Prefix::from_bits_truncate(buf.try_get_u8()?);
        if prefix.contains(Prefix::FRAGMENT) {
            bail!("prefix byte does not indicate a regular packet");
        }

        let sequence = buf.try_get_u16_le()?;

        let ack = if prefix.contains(Prefix::ACK_DIFFERENCE) {
            sequence.wrapping_sub(buf.try_get_u8()? as u16)
        } else {
            buf.try_get_u16_le()?
        };

        let mut ack_bits = 0xffff_ffffu32;
        if prefix.contains(Prefix::ACK_BITS_BYTE0) {
            ack_bits = (ack_bits & 0xffff_ff00) | buf.try_get_u8()? as u32;
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE1) {
            ack_bits = (ack_bits & 0xffff_00ff) | ((buf.try_get_u8()? as u32) << 8);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE2) {
            ack_bits = (ack_bits & 0xff00_ffff) | ((buf.try_get_u8()? as u32) << 16);
        }
        if prefix.contains(Prefix::ACK_BITS_BYTE3) {
            ack_bits = (ack_bits & 0x00ff_ffff) | ((buf.try_get_u8()? as u32) << 24);
        }

        Ok(PacketHeader {
            sequence,
            ack,
            ack_bits,
        })
    }
}

/// The 5 byte header of one fragment of an oversized packet.
///
/// Fragment 0 additionally carries the regular [`PacketHeader`] of the reassembled
/// packet immediately after this header; parsing and validating that inner header is
/// the transport's business since it owns the reassembly state.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct FragmentHeader {
    pub sequence: u16,
    pub fragment_id: u8,
    pub num_fragments: u8,
}

impl FragmentHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.num_fragments >= 1);
        debug_assert!(self.fragment_id < self.num_fragments);
        buf.put_u8(Prefix::FRAGMENT.bits());
        buf.put_u16_le(self.sequence);
        buf.put_u8(self.fragment_id);
        buf.put_u8(self.num_fragments - 1);
    }

    pub fn deser(buf: &mut impl Buf, max_fragments: usize) -> anyhow::Result<FragmentHeader> {
        let prefix = buf.try_get_u8()?;
        if prefix != Prefix::FRAGMENT.bits() {
            bail!("prefix byte does not indicate a fragment packet");
        }

        let sequence = buf.try_get_u16_le()?;
        let fragment_id = buf.try_get_u8()?;
        let num_fragments = buf.try_get_u8()?.wrapping_add(1);

        if num_fragments as usize > max_fragments {
            bail!(
                "number of fragments {} outside of the configured maximum {}",
                num_fragments,
                max_fragments
            );
        }
        if fragment_id >= num_fragments {
            bail!(
                "fragment id {} outside of fragment count {}",
                fragment_id,
                num_fragments
            );
        }

        Ok(FragmentHeader {
            sequence,
            fragment_id,
            num_fragments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::minimal(
        PacketHeader { sequence: 5, ack: 3, ack_bits: 0xffff_ffff },
        vec![0b0010_0000, 5, 0, 2]
    )]
    #[case::zero_difference(
        PacketHeader { sequence: 7, ack: 7, ack_bits: 0xffff_ffff },
        vec![0b0010_0000, 7, 0, 0]
    )]
    #[case::partial_ack_bitmap(
        PacketHeader { sequence: 101, ack: 100, ack_bits: 0xffff_ff0d },
        vec![0b0010_0010, 101, 0, 1, 0x0d]
    )]
    #[case::all_bitmap_bytes(
        PacketHeader { sequence: 40, ack: 38, ack_bits: 0 },
        vec![0b0011_1110, 40, 0, 2, 0, 0, 0, 0]
    )]
    #[case::absolute_ack(
        PacketHeader { sequence: 1000, ack: 100, ack_bits: 0xffff_ffff },
        vec![0b0000_0000, 0xe8, 0x03, 100, 0]
    )]
    #[case::wrapped_difference(
        PacketHeader { sequence: 3, ack: 65534, ack_bits: 0xffff_ffff },
        vec![0b0010_0000, 3, 0, 5]
    )]
    #[case::maximal(
        PacketHeader { sequence: 513, ack: 40000, ack_bits: 0x0102_0304 },
        vec![0b0001_1110, 0x01, 0x02, 0x40, 0x9c, 0x04, 0x03, 0x02, 0x01]
    )]
    fn test_packet_header_ser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(header.serialised_len(), expected.len());
    }

    #[rstest]
    #[case::minimal(PacketHeader { sequence: 5, ack: 3, ack_bits: 0xffff_ffff })]
    #[case::partial_bitmap(PacketHeader { sequence: 101, ack: 100, ack_bits: 0xffff_ff0d })]
    #[case::no_acks(PacketHeader { sequence: 0, ack: 65535, ack_bits: 0 })]
    #[case::absolute(PacketHeader { sequence: 30000, ack: 5, ack_bits: 0x8000_0001 })]
    #[case::wrap(PacketHeader { sequence: 10, ack: 65530, ack_bits: 0xffff_fffe })]
    fn test_packet_header_round_trip(#[case] header: PacketHeader) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        let mut read = buf.as_ref();
        let deser = PacketHeader::deser(&mut read).unwrap();
        assert!(read.is_empty());
        assert_eq!(header, deser);
    }

    #[test]
    fn test_packet_header_len_bounds() {
        let minimal = PacketHeader { sequence: 1, ack: 0, ack_bits: 0xffff_ffff };
        let maximal = PacketHeader { sequence: 0, ack: 1000, ack_bits: 0 };
        assert_eq!(minimal.serialised_len(), MIN_PACKET_HEADER_BYTES);
        assert_eq!(maximal.serialised_len(), MAX_PACKET_HEADER_BYTES);
    }

    #[test]
    fn test_packet_header_deser_rejects_fragment_prefix() {
        let data = [0x01u8, 0, 0, 0];
        assert!(PacketHeader::deser(&mut &data[..]).is_err());
    }

    #[test]
    fn test_packet_header_deser_rejects_truncated() {
        let full = [0b0010_0000u8, 5, 0, 2];
        for len in 0..full.len() {
            assert!(PacketHeader::deser(&mut &full[..len]).is_err(), "len {}", len);
        }
    }

    #[rstest]
    #[case::first(FragmentHeader { sequence: 7, fragment_id: 0, num_fragments: 4 }, vec![1, 7, 0, 0, 3])]
    #[case::last(FragmentHeader { sequence: 300, fragment_id: 3, num_fragments: 4 }, vec![1, 0x2c, 0x01, 3, 3])]
    #[case::single(FragmentHeader { sequence: 0, fragment_id: 0, num_fragments: 1 }, vec![1, 0, 0, 0, 0])]
    fn test_fragment_header_ser(#[case] header: FragmentHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(buf.len(), FRAGMENT_HEADER_BYTES);

        let deser = FragmentHeader::deser(&mut buf.freeze(), 16).unwrap();
        assert_eq!(header, deser);
    }

    #[rstest]
    #[case::id_out_of_range(vec![1, 0, 0, 4, 3], 16)]
    #[case::too_many_fragments(vec![1, 0, 0, 0, 200], 16)]
    #[case::regular_prefix(vec![0, 0, 0, 0, 0], 16)]
    #[case::truncated(vec![1, 0, 0], 16)]
    fn test_fragment_header_deser_rejects(#[case] data: Vec<u8>, #[case] max_fragments: usize) {
        assert!(FragmentHeader::deser(&mut &data[..], max_fragments).is_err());
    }
}
