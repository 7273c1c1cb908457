//! Gorilla-style encoders for integer and float columns

use super::bitstream::BitWriter;
use super::CompressedBlock;

/// Delta-of-delta encoder for integers and timestamps.
///
/// Regular series (fixed scrape interval, counters) collapse to one bit per value.
pub struct IntegerEncoder {
    writer: BitWriter,
    count: usize,
    prev: i64,
    prev_delta: i64,
}

impl IntegerEncoder {
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(256),
            count: 0,
            prev: 0,
            prev_delta: 0,
        }
    }

    pub fn encode(&mut self, value: i64) {
        if self.count == 0 {
            self.writer.write_bits(value as u64, 64);
        } else {
            let delta = value.wrapping_sub(self.prev);
            let dod = delta.wrapping_sub(self.prev_delta);
            self.write_dod(dod);
            self.prev_delta = delta;
        }
        self.prev = value;
        self.count += 1;
    }

    fn write_dod(&mut self, dod: i64) {
        match dod {
            0 => self.writer.write_bit(false),
            -63..=64 => {
                self.writer.write_bits(0b10, 2);
                self.writer.write_bits((dod + 63) as u64, 7);
            }
            -255..=256 => {
                self.writer.write_bits(0b110, 3);
                self.writer.write_bits((dod + 255) as u64, 9);
            }
            -2047..=2048 => {
                self.writer.write_bits(0b1110, 4);
                self.writer.write_bits((dod + 2047) as u64, 12);
            }
            _ => {
                self.writer.write_bits(0b1111, 4);
                self.writer.write_bits(dod as u64, 64);
            }
        }
    }

    pub fn finish(self) -> CompressedBlock {
        CompressedBlock {
            count: self.count,
            data: self.writer.finish(),
        }
    }
}

impl Default for IntegerEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// XOR encoder for float columns.
///
/// A changed value is stored as its meaningful XOR bits, reusing the previous
/// leading/trailing-zero window when the new bits fit inside it.
pub struct FloatEncoder {
    writer: BitWriter,
    count: usize,
    prev_bits: u64,
    window: Option<(u32, u32)>,
}

impl FloatEncoder {
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(256),
            count: 0,
            prev_bits: 0,
            window: None,
        }
    }

    pub fn encode(&mut self, value: f64) {
        let bits = value.to_bits();
        if self.count == 0 {
            self.writer.write_bits(bits, 64);
        } else {
            self.encode_xor(bits ^ self.prev_bits);
        }
        self.prev_bits = bits;
        self.count += 1;
    }

    fn encode_xor(&mut self, xor: u64) {
        if xor == 0 {
            self.writer.write_bit(false);
            return;
        }
        self.writer.write_bit(true);

        let leading = xor.leading_zeros();
        let trailing = xor.trailing_zeros();
        match self.window {
            Some((prev_leading, prev_trailing))
                if leading >= prev_leading && trailing >= prev_trailing =>
            {
                self.writer.write_bit(false);
                let meaningful = 64 - prev_leading - prev_trailing;
                self.writer.write_bits(xor >> prev_trailing, meaningful);
            }
            _ => {
                self.writer.write_bit(true);
                let meaningful = 64 - leading - trailing;
                // leading < 64 and 1 <= meaningful <= 64, both fit in 6 bits
                self.writer.write_bits(u64::from(leading), 6);
                self.writer.write_bits(u64::from(meaningful - 1), 6);
                self.writer.write_bits(xor >> trailing, meaningful);
                self.window = Some((leading, trailing));
            }
        }
    }

    pub fn finish(self) -> CompressedBlock {
        CompressedBlock {
            count: self.count,
            data: self.writer.finish(),
        }
    }
}

impl Default for FloatEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_interval_is_compact() {
        let mut encoder = IntegerEncoder::new();
        for i in 0..1000 {
            encoder.encode(1_600_000_000_000_000_000 + i * 10_000_000_000);
        }
        let block = encoder.finish();
        assert_eq!(block.count, 1000);
        // 64 bits for the first value, one 64-bit dod for the second, then 1 bit each
        assert!(block.data.len() < 8 + 9 + 1000 / 8 + 2, "got {} bytes", block.data.len());
    }

    #[test]
    fn test_constant_float_is_compact() {
        let mut encoder = FloatEncoder::new();
        for _ in 0..100 {
            encoder.encode(23.5);
        }
        let block = encoder.finish();
        assert!(block.bytes_per_point() < 1.0);
    }
}
