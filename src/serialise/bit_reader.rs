use super::bits_required;
use anyhow::bail;

/// Reads back a bit stream produced by [`super::BitWriter`].
///
/// Words are loaded into the high end of the 64-bit scratch one at a time; values are
/// consumed from the low end. The reader accepts buffers of any byte length: a partial
/// tail word is zero-extended, which is exactly what the writer's flush padding
/// produced.
///
/// All reads are bounds-checked against the buffer's byte length expressed in bits;
/// reading past the end is an error, never a panic.
pub struct BitReader<'a> {
    data: &'a [u8],
    scratch: u64,
    scratch_bits: u32,
    bits_read: u32,
    word_index: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader {
            data,
            scratch: 0,
            scratch_bits: 0,
            bits_read: 0,
            word_index: 0,
        }
    }

    /// True if reading `bits` more bits would run past the end of the buffer.
    pub fn would_read_past_end(&self, bits: u32) -> bool {
        self.bits_read + bits > self.data.len() as u32 * 8
    }

    /// Reads `bits` bits (`1..=32`) and returns them in the low bits of the result.
    pub fn read_bits(&mut self, bits: u32) -> anyhow::Result<u32> {
        debug_assert!(bits >= 1 && bits <= 32);
        if self.would_read_past_end(bits) {
            bail!(
                "bit stream too short: reading {} bits at position {} of {}",
                bits,
                self.bits_read,
                self.data.len() * 8
            );
        }

        if self.scratch_bits < bits {
            let word = self.load_word();
            self.scratch |= (word as u64) << self.scratch_bits;
            self.scratch_bits += 32;
            self.word_index += 1;
        }
        debug_assert!(self.scratch_bits >= bits);

        let output = (self.scratch & ((1u64 << bits) - 1)) as u32;
        self.scratch >>= bits;
        self.scratch_bits -= bits;
        self.bits_read += bits;

        Ok(output)
    }

    /// Reads the remaining bits of the current byte and fails if any of them are set.
    /// The writer only ever pads with zeroes, so set padding bits mean the two sides
    /// disagree about the stream layout.
    pub fn read_align(&mut self) -> anyhow::Result<()> {
        let remainder_bits = self.bits_read % 8;
        if remainder_bits != 0 {
            let value = self.read_bits(8 - remainder_bits)?;
            debug_assert_eq!(self.bits_read % 8, 0);
            if value != 0 {
                bail!("nonzero padding bits at byte boundary");
            }
        }
        Ok(())
    }

    /// Reads a run of raw bytes. The read position must be byte aligned.
    pub fn read_bytes(&mut self, dest: &mut [u8]) -> anyhow::Result<()> {
        debug_assert_eq!(self.bits_read % 8, 0);
        if self.would_read_past_end(dest.len() as u32 * 8) {
            bail!(
                "bit stream too short: reading {} bytes at bit position {}",
                dest.len(),
                self.bits_read
            );
        }

        let mut head_bytes = ((4 - (self.bits_read % 32) / 8) % 4) as usize;
        if head_bytes > dest.len() {
            head_bytes = dest.len();
        }
        for i in 0..head_bytes {
            dest[i] = self.read_bits(8)? as u8;
        }
        if head_bytes == dest.len() {
            return Ok(());
        }

        let num_words = (dest.len() - head_bytes) / 4;
        if num_words > 0 {
            debug_assert_eq!(self.bits_read % 32, 0);
            debug_assert_eq!(self.scratch_bits, 0);
            let offset = self.word_index * 4;
            dest[head_bytes..head_bytes + num_words * 4]
                .copy_from_slice(&self.data[offset..offset + num_words * 4]);
            self.bits_read += num_words as u32 * 32;
            self.word_index += num_words;
        }

        let tail_start = head_bytes + num_words * 4;
        for i in tail_start..dest.len() {
            dest[i] = self.read_bits(8)? as u8;
        }

        Ok(())
    }

    /// Number of padding bits a [`BitReader::read_align`] would consume now, in `[0, 7]`.
    pub fn align_bits(&self) -> u32 {
        (8 - self.bits_read % 8) % 8
    }

    pub fn bits_read(&self) -> u32 {
        self.bits_read
    }

    pub fn bits_remaining(&self) -> u32 {
        self.data.len() as u32 * 8 - self.bits_read
    }

    /// Reads an integer known to lie in `[min, max]`, written by
    /// [`super::BitWriter::serialise_integer`]. Fails if the decoded value is outside
    /// the range (a malformed or hostile stream).
    pub fn deserialise_integer(&mut self, min: u64, max: u64) -> anyhow::Result<u64> {
        let bits = bits_required(min, max);
        if bits == 0 {
            return Ok(min);
        }
        let value = min + self.read_bits(bits)? as u64;
        if value > max {
            bail!("bounded integer out of range: {} not in [{}, {}]", value, min, max);
        }
        Ok(value)
    }

    pub fn deserialise_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Aligns to a byte boundary (verifying zero padding), then reads raw bytes.
    pub fn deserialise_bytes(&mut self, dest: &mut [u8]) -> anyhow::Result<()> {
        self.read_align()?;
        self.read_bytes(dest)
    }

    /// Inverse of [`super::BitWriter::serialise_u16_relative`].
    pub fn deserialise_u16_relative(&mut self, previous: u16) -> anyhow::Result<u16> {
        if self.deserialise_bool()? {
            return Ok(previous.wrapping_add(1));
        }
        if self.deserialise_bool()? {
            let difference = self.deserialise_integer(2, 5)?;
            return Ok(previous.wrapping_add(difference as u16));
        }
        if self.deserialise_bool()? {
            let difference = self.deserialise_integer(6, 21)?;
            return Ok(previous.wrapping_add(difference as u16));
        }
        if self.deserialise_bool()? {
            let difference = self.deserialise_integer(22, 277)?;
            return Ok(previous.wrapping_add(difference as u16));
        }
        if self.deserialise_bool()? {
            let difference = self.deserialise_integer(278, 4373)?;
            return Ok(previous.wrapping_add(difference as u16));
        }
        Ok(self.deserialise_integer(0, u16::MAX as u64)? as u16)
    }

    /// Inverse of [`super::BitWriter::serialise_u32_relative`].
    pub fn deserialise_u32_relative(&mut self, previous: u32) -> anyhow::Result<u32> {
        if self.deserialise_bool()? {
            return Ok(previous.wrapping_add(1));
        }
        if self.deserialise_bool()? {
            let difference = self.deserialise_integer(2, 5)?;
            return Ok(previous.wrapping_add(difference as u32));
        }
        if self.deserialise_bool()? {
            let difference = self.deserialise_integer(6, 21)?;
            return Ok(previous.wrapping_add(difference as u32));
        }
        if self.deserialise_bool()? {
            let difference = self.deserialise_integer(22, 277)?;
            return Ok(previous.wrapping_add(difference as u32));
        }
        if self.deserialise_bool()? {
            let difference = self.deserialise_integer(278, 4373)?;
            return Ok(previous.wrapping_add(difference as u32));
        }
        if self.deserialise_bool()? {
            let difference = self.deserialise_integer(4374, 69909)?;
            return Ok(previous.wrapping_add(difference as u32));
        }
        Ok(self.deserialise_integer(0, u32::MAX as u64)? as u32)
    }

    /// Inverse of [`super::BitWriter::serialise_sequence_relative`].
    pub fn deserialise_sequence_relative(&mut self, previous: u16) -> anyhow::Result<u16> {
        self.deserialise_u16_relative(previous)
    }

    fn load_word(&mut self) -> u32 {
        let offset = self.word_index * 4;
        let end = (offset + 4).min(self.data.len());
        let mut word = [0u8; 4];
        word[..end - offset].copy_from_slice(&self.data[offset..end]);
        u32::from_le_bytes(word)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{relative_sequence_encoding_bits, BitWriter};
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_read_bits_round_trip() {
        let values = [
            (1u32, 1u32),
            (0, 1),
            (0x2aa, 10),
            (0xffff_ffff, 32),
            (0x1234, 16),
            (5, 3),
            (0x7fff_ffff, 31),
        ];
        let mut writer = BitWriter::new(64);
        for (value, bits) in values {
            writer.write_bits(value, bits);
        }
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        for (value, bits) in values {
            assert_eq!(reader.read_bits(bits).unwrap(), value);
        }
    }

    #[test]
    fn test_partial_tail_word() {
        // 5 byte buffer: the second word only has one real byte
        let data = [0xff, 0x00, 0xff, 0x00, 0xab];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(32).unwrap(), 0x00ff00ff);
        assert_eq!(reader.read_bits(8).unwrap(), 0xab);
        assert!(reader.would_read_past_end(1));
        assert!(reader.read_bits(1).is_err());
    }

    #[rstest]
    #[case::exact(16, 16, false)]
    #[case::one_more(16, 17, true)]
    #[case::empty_buffer(0, 1, true)]
    fn test_would_read_past_end(#[case] buffer_bits: u32, #[case] read_bits: u32, #[case] expected: bool) {
        let data = vec![0u8; (buffer_bits / 8) as usize];
        let reader = BitReader::new(&data);
        assert_eq!(reader.would_read_past_end(read_bits), expected);
    }

    #[test]
    fn test_read_align_accepts_zero_padding() {
        let mut writer = BitWriter::new(16);
        writer.write_bits(3, 2);
        writer.write_align();
        writer.write_bits(0xab, 8);
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.read_bits(2).unwrap(), 3);
        reader.read_align().unwrap();
        assert_eq!(reader.read_bits(8).unwrap(), 0xab);
    }

    #[test]
    fn test_read_align_rejects_nonzero_padding() {
        let mut writer = BitWriter::new(16);
        writer.write_bits(0xff, 8); // all bits of the first byte set
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.read_bits(3).unwrap(), 0b111);
        assert!(reader.read_align().is_err());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::three(3)]
    #[case::word(4)]
    #[case::word_plus_tail(7)]
    #[case::several_words(23)]
    fn test_byte_round_trip(#[case] len: usize) {
        let bytes: Vec<u8> = (0..len as u8).map(|i| i.wrapping_mul(37).wrapping_add(11)).collect();

        let mut writer = BitWriter::new(64);
        writer.write_bits(1, 5); // unaligned start
        writer.serialise_bytes(&bytes);
        writer.write_bits(0b10, 2);
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.read_bits(5).unwrap(), 1);
        let mut read_back = vec![0u8; len];
        reader.deserialise_bytes(&mut read_back).unwrap();
        assert_eq!(read_back, bytes);
        assert_eq!(reader.read_bits(2).unwrap(), 0b10);
    }

    #[rstest]
    #[case::zero_width(7, 7, 7)]
    #[case::small(3, 0, 5)]
    #[case::shifted(278, 278, 4373)]
    #[case::max_u32(u32::MAX as u64, 0, u32::MAX as u64)]
    fn test_integer_round_trip(#[case] value: u64, #[case] min: u64, #[case] max: u64) {
        let mut writer = BitWriter::new(16);
        writer.serialise_integer(value, min, max);
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.deserialise_integer(min, max).unwrap(), value);
        assert_eq!(reader.bits_read(), bits_required(min, max));
    }

    #[test]
    fn test_integer_rejects_out_of_range() {
        // range [1, 6] takes 3 bits; a raw 7 decodes to 8 which is outside the range
        let mut writer = BitWriter::new(8);
        writer.write_bits(7, 3);
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        assert!(reader.deserialise_integer(1, 6).is_err());
    }

    #[rstest]
    #[case::successor(100, 101)]
    #[case::tier_2(100, 103)]
    #[case::tier_3_wrapped(65530, 5)]
    #[case::tier_4(0, 250)]
    #[case::tier_5_wrapped(65000, 1000)]
    #[case::fallback_equal(1000, 1000)]
    #[case::fallback_backwards(100, 50)]
    fn test_u16_relative_round_trip(#[case] previous: u16, #[case] current: u16) {
        let mut writer = BitWriter::new(16);
        writer.serialise_u16_relative(previous, current);
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.deserialise_u16_relative(previous).unwrap(), current);
    }

    #[test]
    fn test_u16_relative_bit_count_estimate_is_an_upper_bound() {
        for (previous, current) in [(100u16, 101u16), (100, 105), (65530, 5), (65000, 1000), (9, 9), (0, 60000)] {
            let mut writer = BitWriter::new(16);
            writer.serialise_u16_relative(previous, current);
            assert!(writer.bits_written() <= relative_sequence_encoding_bits(previous, current));
        }
    }

    #[rstest]
    #[case::successor(7, 8)]
    #[case::tier_6(1000, 60000)]
    #[case::fallback(0, 1_000_000)]
    #[case::fallback_equal(42, 42)]
    #[case::wrapped(u32::MAX, 10)]
    fn test_u32_relative_round_trip(#[case] previous: u32, #[case] current: u32) {
        let mut writer = BitWriter::new(16);
        writer.serialise_u32_relative(previous, current);
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.deserialise_u32_relative(previous).unwrap(), current);
    }

    #[test]
    fn test_sequence_relative_round_trip_matches_spec_example() {
        let mut writer = BitWriter::new(8);
        writer.serialise_sequence_relative(65530, 5);
        writer.flush();

        let mut reader = BitReader::new(writer.as_bytes());
        assert_eq!(reader.deserialise_sequence_relative(65530).unwrap(), 5);
    }
}
