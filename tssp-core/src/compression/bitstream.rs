//! MSB-first bit packing used by the column codecs

/// Bit writer for encoding compressed data
#[derive(Debug, Default)]
pub struct BitWriter {
    buffer: Vec<u8>,
    current: u8,
    used: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with capacity hint in bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            current: 0,
            used: 0,
        }
    }

    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(bit as u64, 1);
    }

    /// Write the low `num_bits` bits of `value`, most significant first
    pub fn write_bits(&mut self, value: u64, num_bits: u32) {
        debug_assert!(num_bits <= 64);
        let mut remaining = num_bits;
        while remaining > 0 {
            let free = 8 - self.used;
            let take = remaining.min(free);
            let shift = remaining - take;
            let chunk = ((value >> shift) & ((1u64 << take) - 1)) as u8;
            self.current |= chunk << (free - take);
            self.used += take;
            remaining -= take;
            if self.used == 8 {
                self.buffer.push(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }

    /// Flush the partial byte and return the buffer
    pub fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.buffer.push(self.current);
        }
        self.buffer
    }

    /// Current size in bytes, partial byte included
    pub fn len(&self) -> usize {
        self.buffer.len() + usize::from(self.used > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.used == 0
    }
}

/// Bit reader for decoding compressed data
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
        }
    }

    #[inline]
    pub fn read_bit(&mut self) -> Option<bool> {
        self.read_bits(1).map(|b| b == 1)
    }

    /// Read `num_bits` bits as a u64; `None` when the input runs out
    pub fn read_bits(&mut self, num_bits: u32) -> Option<u64> {
        debug_assert!(num_bits <= 64);
        let mut value = 0u64;
        let mut remaining = num_bits;
        while remaining > 0 {
            let byte = *self.data.get(self.byte_pos)?;
            let avail = 8 - self.bit_pos;
            let take = remaining.min(avail);
            let bits = (byte >> (avail - take)) & ((1u16 << take) - 1) as u8;
            value = (value << take) | u64::from(bits);
            self.bit_pos += take;
            remaining -= take;
            if self.bit_pos == 8 {
                self.byte_pos += 1;
                self.bit_pos = 0;
            }
        }
        Some(value)
    }

    /// Current position in bits
    pub fn position(&self) -> usize {
        self.byte_pos * 8 + self.bit_pos as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_writer_reader() {
        let mut writer = BitWriter::new();
        writer.write_bit(true);
        writer.write_bit(false);
        writer.write_bit(true);
        writer.write_bits(0b1010_1010, 8);
        writer.write_bits(0xFF, 8);
        assert_eq!(writer.len(), 3);

        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_bit(), Some(false));
        assert_eq!(reader.read_bit(), Some(true));
        assert_eq!(reader.read_bits(8), Some(0b1010_1010));
        assert_eq!(reader.read_bits(8), Some(0xFF));
        assert_eq!(reader.position(), 19);
    }

    #[test]
    fn test_full_width_values() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b11, 2);
        writer.write_bits(u64::MAX - 1, 64);
        writer.write_bits(0x1234_5678_9ABC_DEF0, 64);

        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bits(2), Some(0b11));
        assert_eq!(reader.read_bits(64), Some(u64::MAX - 1));
        assert_eq!(reader.read_bits(64), Some(0x1234_5678_9ABC_DEF0));
        assert_eq!(reader.read_bits(8), None);
    }
}
