//! Decoders matching [`super::encoder`]

use super::bitstream::BitReader;
use crate::{Result, TsspError};

fn truncated() -> TsspError {
    TsspError::Compression("unexpected end of encoded block".into())
}

/// Delta-of-delta integer decoder
pub struct IntegerDecoder<'a> {
    reader: BitReader<'a>,
    count: usize,
    decoded: usize,
    prev: i64,
    prev_delta: i64,
}

impl<'a> IntegerDecoder<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            count,
            decoded: 0,
            prev: 0,
            prev_delta: 0,
        }
    }

    /// Decode every value into `dst`
    pub fn decode_all(&mut self, dst: &mut Vec<i64>) -> Result<()> {
        dst.reserve(self.count - self.decoded);
        while let Some(v) = self.decode_next()? {
            dst.push(v);
        }
        Ok(())
    }

    pub fn decode_next(&mut self) -> Result<Option<i64>> {
        if self.decoded >= self.count {
            return Ok(None);
        }
        let value = if self.decoded == 0 {
            self.reader.read_bits(64).ok_or_else(truncated)? as i64
        } else {
            let dod = self.read_dod()?;
            let delta = self.prev_delta.wrapping_add(dod);
            self.prev_delta = delta;
            self.prev.wrapping_add(delta)
        };
        self.prev = value;
        self.decoded += 1;
        Ok(Some(value))
    }

    fn read_dod(&mut self) -> Result<i64> {
        // count leading one bits of the prefix, at most four
        let mut ones = 0;
        while ones < 4 {
            if !self.reader.read_bit().ok_or_else(truncated)? {
                break;
            }
            ones += 1;
        }
        let (bits, bias) = match ones {
            0 => return Ok(0),
            1 => (7, 63),
            2 => (9, 255),
            3 => (12, 2047),
            _ => return Ok(self.reader.read_bits(64).ok_or_else(truncated)? as i64),
        };
        let v = self.reader.read_bits(bits).ok_or_else(truncated)? as i64;
        Ok(v - bias)
    }
}

/// XOR float decoder
pub struct FloatDecoder<'a> {
    reader: BitReader<'a>,
    count: usize,
    decoded: usize,
    prev_bits: u64,
    window: Option<(u32, u32)>,
}

impl<'a> FloatDecoder<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            count,
            decoded: 0,
            prev_bits: 0,
            window: None,
        }
    }

    pub fn decode_all(&mut self, dst: &mut Vec<f64>) -> Result<()> {
        dst.reserve(self.count - self.decoded);
        while let Some(v) = self.decode_next()? {
            dst.push(v);
        }
        Ok(())
    }

    pub fn decode_next(&mut self) -> Result<Option<f64>> {
        if self.decoded >= self.count {
            return Ok(None);
        }
        let bits = if self.decoded == 0 {
            self.reader.read_bits(64).ok_or_else(truncated)?
        } else {
            self.prev_bits ^ self.read_xor()?
        };
        self.prev_bits = bits;
        self.decoded += 1;
        Ok(Some(f64::from_bits(bits)))
    }

    fn read_xor(&mut self) -> Result<u64> {
        if !self.reader.read_bit().ok_or_else(truncated)? {
            return Ok(0);
        }
        let new_window = self.reader.read_bit().ok_or_else(truncated)?;
        let (leading, trailing) = if new_window {
            let leading = self.reader.read_bits(6).ok_or_else(truncated)? as u32;
            let meaningful = self.reader.read_bits(6).ok_or_else(truncated)? as u32 + 1;
            if leading + meaningful > 64 {
                return Err(TsspError::Compression(format!(
                    "invalid xor window: {} leading, {} meaningful bits",
                    leading, meaningful
                )));
            }
            let window = (leading, 64 - leading - meaningful);
            self.window = Some(window);
            window
        } else {
            self.window.ok_or_else(|| {
                TsspError::Compression("xor window reused before being set".into())
            })?
        };
        let meaningful = 64 - leading - trailing;
        let bits = self.reader.read_bits(meaningful).ok_or_else(truncated)?;
        Ok(bits << trailing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{FloatEncoder, IntegerEncoder};

    #[test]
    fn test_integer_all_buckets() {
        let values: Vec<i64> = vec![
            0, 10, 20, 30, 31, 100, 400, 2500, 2400, -1_000_000, i64::MAX, i64::MIN, 7,
        ];
        let mut encoder = IntegerEncoder::new();
        values.iter().for_each(|v| encoder.encode(*v));
        let block = encoder.finish();

        let mut out = Vec::new();
        IntegerDecoder::new(&block.data, block.count)
            .decode_all(&mut out)
            .unwrap();
        assert_eq!(out, values);
    }

    #[test]
    fn test_float_windows() {
        let values: Vec<f64> = (0..500)
            .map(|i| 20.0 + (i as f64 * 0.1).sin() * 5.0)
            .chain([0.0, -0.0, f64::MAX, f64::MIN_POSITIVE, 1.0, 1.0])
            .collect();
        let mut encoder = FloatEncoder::new();
        values.iter().for_each(|v| encoder.encode(*v));
        let block = encoder.finish();

        let mut out = Vec::new();
        FloatDecoder::new(&block.data, block.count)
            .decode_all(&mut out)
            .unwrap();
        let bits: Vec<u64> = values.iter().map(|v| v.to_bits()).collect();
        let got: Vec<u64> = out.iter().map(|v| v.to_bits()).collect();
        assert_eq!(got, bits);
    }

    #[test]
    fn test_truncated_input_errors() {
        let mut encoder = IntegerEncoder::new();
        for v in [1, 1000, 5, 9_000_000] {
            encoder.encode(v);
        }
        let block = encoder.finish();
        let short = &block.data[..block.data.len() - 2];
        let mut out = Vec::new();
        assert!(IntegerDecoder::new(short, block.count)
            .decode_all(&mut out)
            .is_err());
    }
}
