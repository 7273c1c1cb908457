//! Column block codecs
//!
//! Integers and timestamps use delta-of-delta bit packing and floats use XOR encoding,
//! both after the Gorilla paper ("Gorilla: A Fast, Scalable, In-Memory Time Series
//! Database"). Booleans are bit-packed and strings are LZ4 compressed.
//!
//! A column block is laid out as (little-endian):
//!
//! ```text
//! +---------+-----------+---------------+------------------------+-----------+
//! | type u8 | rows u32  | nil_count u32 | bitmap (if nil_count)  | payload   |
//! +---------+-----------+---------------+------------------------+-----------+
//! ```
//!
//! The payload encodes only the valid (non-null) values, in row order.

mod bitstream;
mod decoder;
mod encoder;

pub use bitstream::{BitReader, BitWriter};
pub use decoder::{FloatDecoder, IntegerDecoder};
pub use encoder::{FloatEncoder, IntegerEncoder};

use crate::record::{ColVal, ColumnValues};
use crate::{FieldType, Result, TsspError};
use bytes::{Buf, BufMut};

/// Size of the fixed block prefix
pub const BLOCK_HEADER_SIZE: usize = 9;

/// Encoded values produced by one encoder
#[derive(Debug, Clone)]
pub struct CompressedBlock {
    /// Compressed data
    pub data: Vec<u8>,
    /// Number of encoded values
    pub count: usize,
}

impl CompressedBlock {
    /// Get bytes per point
    pub fn bytes_per_point(&self) -> f64 {
        self.data.len() as f64 / self.count as f64
    }
}

/// Encode rows `[start, end)` of `col` as one column block appended to `dst`.
pub fn encode_column(col: &ColVal, start: usize, end: usize, dst: &mut Vec<u8>) -> Result<()> {
    let rows = end - start;
    let valid_rows: Vec<usize> = (start..end).filter(|&r| col.is_valid(r)).collect();
    let nil_count = rows - valid_rows.len();

    dst.put_u8(col.field_type() as u8);
    dst.put_u32_le(rows as u32);
    dst.put_u32_le(nil_count as u32);
    if nil_count > 0 {
        let mut bitmap = vec![0u8; (rows + 7) / 8];
        for &r in &valid_rows {
            let i = r - start;
            bitmap[i >> 3] |= 1 << (i & 7);
        }
        dst.put_slice(&bitmap);
    }

    match col.values() {
        ColumnValues::Integer(vals) => {
            let mut enc = IntegerEncoder::new();
            valid_rows.iter().for_each(|&r| enc.encode(vals[r]));
            dst.put_slice(&enc.finish().data);
        }
        ColumnValues::Float(vals) => {
            let mut enc = FloatEncoder::new();
            valid_rows.iter().for_each(|&r| enc.encode(vals[r]));
            dst.put_slice(&enc.finish().data);
        }
        ColumnValues::Boolean(vals) => {
            let mut writer = BitWriter::with_capacity((valid_rows.len() + 7) / 8);
            valid_rows.iter().for_each(|&r| writer.write_bit(vals[r]));
            dst.put_slice(&writer.finish());
        }
        ColumnValues::String { .. } => {
            let mut raw = Vec::new();
            for &r in &valid_rows {
                let b = col.bytes_at(r);
                raw.put_u32_le(b.len() as u32);
                raw.put_slice(b);
            }
            dst.put_slice(&lz4_flex::compress_prepend_size(&raw));
        }
    }
    Ok(())
}

/// Decode a column block, checking that its type matches `expected`.
pub fn decode_column(data: &[u8], expected: FieldType) -> Result<ColVal> {
    if data.len() < BLOCK_HEADER_SIZE {
        return Err(TsspError::Corruption(format!(
            "column block too short: {} bytes",
            data.len()
        )));
    }
    let mut cursor = std::io::Cursor::new(data);
    let tag = cursor.get_u8();
    let ty = FieldType::from_u8(tag)
        .ok_or_else(|| TsspError::Corruption(format!("unknown column type tag {}", tag)))?;
    if ty != expected {
        return Err(TsspError::Corruption(format!(
            "column block holds {} values, expected {}",
            ty, expected
        )));
    }
    let rows = cursor.get_u32_le() as usize;
    let nil_count = cursor.get_u32_le() as usize;
    if nil_count > rows {
        return Err(TsspError::Corruption(format!(
            "nil count {} exceeds row count {}",
            nil_count, rows
        )));
    }

    let pos = cursor.position() as usize;
    let (bitmap, payload) = if nil_count > 0 {
        let len = (rows + 7) / 8;
        if data.len() < pos + len {
            return Err(TsspError::Corruption("column bitmap truncated".into()));
        }
        (Some(data[pos..pos + len].to_vec()), &data[pos + len..])
    } else {
        (None, &data[pos..])
    };
    let is_valid = |r: usize| {
        bitmap
            .as_ref()
            .map_or(true, |b| b[r >> 3] & (1 << (r & 7)) != 0)
    };
    let valid = (0..rows).filter(|&r| is_valid(r)).count();
    if valid != rows - nil_count {
        return Err(TsspError::Corruption(format!(
            "bitmap marks {} valid rows, header says {}",
            valid,
            rows - nil_count
        )));
    }

    let values = match ty {
        FieldType::Integer => {
            let mut packed = Vec::with_capacity(valid);
            IntegerDecoder::new(payload, valid).decode_all(&mut packed)?;
            ColumnValues::Integer(spread(packed, rows, is_valid, 0))
        }
        FieldType::Float => {
            let mut packed = Vec::with_capacity(valid);
            FloatDecoder::new(payload, valid).decode_all(&mut packed)?;
            ColumnValues::Float(spread(packed, rows, is_valid, 0.0))
        }
        FieldType::Boolean => {
            let mut reader = BitReader::new(payload);
            let mut packed = Vec::with_capacity(valid);
            for _ in 0..valid {
                let bit = reader.read_bit().ok_or_else(|| {
                    TsspError::Compression("boolean block truncated".into())
                })?;
                packed.push(bit);
            }
            ColumnValues::Boolean(spread(packed, rows, is_valid, false))
        }
        FieldType::String => {
            let raw = lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| TsspError::Compression(e.to_string()))?;
            let mut cursor = std::io::Cursor::new(raw.as_slice());
            let mut data = Vec::with_capacity(raw.len());
            let mut offsets = Vec::with_capacity(rows);
            for r in 0..rows {
                offsets.push(data.len() as u32);
                if !is_valid(r) {
                    continue;
                }
                if cursor.remaining() < 4 {
                    return Err(TsspError::Compression("string block truncated".into()));
                }
                let len = cursor.get_u32_le() as usize;
                if cursor.remaining() < len {
                    return Err(TsspError::Compression("string block truncated".into()));
                }
                let at = cursor.position() as usize;
                data.extend_from_slice(&raw[at..at + len]);
                cursor.advance(len);
            }
            ColumnValues::String { data, offsets }
        }
    };

    Ok(ColVal::from_parts(values, bitmap, rows))
}

fn spread<T: Copy>(packed: Vec<T>, rows: usize, is_valid: impl Fn(usize) -> bool, zero: T) -> Vec<T> {
    if packed.len() == rows {
        return packed;
    }
    let mut it = packed.into_iter();
    (0..rows)
        .map(|r| {
            if is_valid(r) {
                it.next().unwrap_or(zero)
            } else {
                zero
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldValue;

    fn roundtrip(col: &ColVal) -> ColVal {
        let mut buf = Vec::new();
        encode_column(col, 0, col.len(), &mut buf).unwrap();
        decode_column(&buf, col.field_type()).unwrap()
    }

    #[test]
    fn test_column_with_nulls() {
        let mut col = ColVal::new(FieldType::Float);
        for i in 0..37 {
            if i % 5 == 0 {
                col.append_null();
            } else {
                col.append_float(i as f64 * 1.5);
            }
        }
        assert_eq!(roundtrip(&col), col);

        let mut col = ColVal::new(FieldType::String);
        col.append_string("alpha");
        col.append_null();
        col.append_string("");
        col.append_string("omega");
        let back = roundtrip(&col);
        assert_eq!(back.value(3), Some(FieldValue::String("omega".into())));
        assert!(back.is_nil(1));
        assert_eq!(back.len(), 4);

        let mut col = ColVal::new(FieldType::Boolean);
        for i in 0..11 {
            col.append_boolean(i % 3 == 0);
        }
        assert_eq!(roundtrip(&col), col);
    }

    #[test]
    fn test_encode_sub_range() {
        let mut col = ColVal::new(FieldType::Integer);
        col.append_integers(&[1, 2, 3, 4, 5, 6]);
        let mut buf = Vec::new();
        encode_column(&col, 2, 5, &mut buf).unwrap();
        let back = decode_column(&buf, FieldType::Integer).unwrap();
        assert_eq!(back.integer_values(), Some(&[3, 4, 5][..]));
    }

    #[test]
    fn test_type_mismatch_is_corruption() {
        let mut col = ColVal::new(FieldType::Integer);
        col.append_integer(1);
        let mut buf = Vec::new();
        encode_column(&col, 0, 1, &mut buf).unwrap();
        let err = decode_column(&buf, FieldType::Float).unwrap_err();
        assert!(err.is_corruption());
        assert!(decode_column(&buf[..4], FieldType::Integer).is_err());
    }
}
