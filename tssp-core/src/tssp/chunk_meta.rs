//! Chunk metadata: where the column segments of one series live
//!
//! A chunk-meta block groups the metas of consecutive series and is addressed by one
//! meta-index item. It is CRC protected as a whole:
//! `[crc32 u32][count u32][chunk meta]...`.

use super::{need, put_crc_block, put_name, verify_crc_block};
use crate::record::ColMeta;
use crate::{Field, FieldType, FieldValue, Result, Schema, SeriesId, Timestamp, TsspError};
use bytes::{Buf, BufMut};

/// Time span and row count of one segment, shared by every column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub rows: u32,
}

/// Location of one column block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: i64,
    pub size: u32,
}

/// Per-column part of a chunk meta
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub ty: FieldType,
    pub pre_agg: ColMeta,
    pub segments: Vec<Segment>,
}

impl ColumnMeta {
    pub fn field(&self) -> Field {
        Field::new(self.name.clone(), self.ty)
    }
}

/// Directory entry of one series in a file
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    pub sid: SeriesId,
    /// Offset of the first column block of the series
    pub offset: i64,
    /// Bytes spanned by all column blocks of the series
    pub size: u32,
    pub time_ranges: Vec<SegmentRange>,
    /// Columns in schema order, time last
    pub columns: Vec<ColumnMeta>,
}

impl ChunkMeta {
    pub fn segment_count(&self) -> usize {
        self.time_ranges.len()
    }

    pub fn rows(&self) -> usize {
        self.time_ranges.iter().map(|r| r.rows as usize).sum()
    }

    pub fn min_time(&self) -> Timestamp {
        self.time_ranges.first().map_or(Timestamp::MAX, |r| r.min_time)
    }

    pub fn max_time(&self) -> Timestamp {
        self.time_ranges.last().map_or(Timestamp::MIN, |r| r.max_time)
    }

    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        self.min_time() <= max && self.max_time() >= min
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn schema(&self) -> Schema {
        self.columns.iter().map(ColumnMeta::field).collect()
    }

    fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u64(self.sid);
        dst.put_i64(self.offset);
        dst.put_u32(self.size);
        dst.put_u32(self.time_ranges.len() as u32);
        dst.put_u32(self.columns.len() as u32);
        for r in &self.time_ranges {
            dst.put_i64(r.min_time);
            dst.put_i64(r.max_time);
            dst.put_u32(r.rows);
        }
        for col in &self.columns {
            put_name(dst, &col.name, "column")?;
            dst.put_u8(col.ty as u8);
            encode_col_meta(&col.pre_agg, dst);
            for seg in &col.segments {
                dst.put_i64(seg.offset);
                dst.put_u32(seg.size);
            }
        }
        Ok(())
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        need(buf, 28, "chunk meta")?;
        let sid = buf.get_u64();
        let offset = buf.get_i64();
        let size = buf.get_u32();
        let segs = buf.get_u32() as usize;
        let cols = buf.get_u32() as usize;

        need(buf, segs * 20, "chunk meta time ranges")?;
        let time_ranges = (0..segs)
            .map(|_| SegmentRange {
                min_time: buf.get_i64(),
                max_time: buf.get_i64(),
                rows: buf.get_u32(),
            })
            .collect();

        let mut columns = Vec::with_capacity(cols.min(4096));
        for _ in 0..cols {
            let name = get_str(buf)?;
            need(buf, 1, "column type")?;
            let tag = buf.get_u8();
            let ty = FieldType::from_u8(tag)
                .ok_or_else(|| TsspError::Corruption(format!("unknown column type tag {}", tag)))?;
            let pre_agg = decode_col_meta(buf)?;
            need(buf, segs * 12, "column segments")?;
            let segments = (0..segs)
                .map(|_| Segment {
                    offset: buf.get_i64(),
                    size: buf.get_u32(),
                })
                .collect();
            columns.push(ColumnMeta {
                name,
                ty,
                pre_agg,
                segments,
            });
        }

        Ok(Self {
            sid,
            offset,
            size,
            time_ranges,
            columns,
        })
    }
}

/// Encode the chunk-meta block for `metas`
pub(crate) fn encode_block(metas: &[ChunkMeta], dst: &mut Vec<u8>) -> Result<()> {
    let mut payload = Vec::new();
    payload.put_u32(metas.len() as u32);
    for m in metas {
        m.encode(&mut payload)?;
    }
    put_crc_block(dst, &payload);
    Ok(())
}

/// Decode a chunk-meta block, CRC included
pub(crate) fn decode_block(block: &[u8]) -> Result<Vec<ChunkMeta>> {
    let mut payload = verify_crc_block(block)?;
    need(payload, 4, "chunk meta block")?;
    let count = payload.get_u32() as usize;
    let mut metas = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        metas.push(ChunkMeta::decode(&mut payload)?);
    }
    Ok(metas)
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    need(buf, 2, "string length")?;
    let len = buf.get_u16() as usize;
    need(buf, len, "string")?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| TsspError::Corruption(format!("invalid utf-8 name: {}", e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn encode_value(v: &FieldValue, dst: &mut Vec<u8>) {
    dst.put_u8(v.field_type() as u8);
    match v {
        FieldValue::Integer(i) => dst.put_i64(*i),
        FieldValue::Float(f) => dst.put_u64(f.to_bits()),
        FieldValue::Boolean(b) => dst.put_u8(*b as u8),
        FieldValue::String(s) => {
            dst.put_u32(s.len() as u32);
            dst.put_slice(s.as_bytes());
        }
    }
}

/// Decode an optional value; a zero tag means absent
fn decode_value(buf: &mut &[u8]) -> Result<Option<FieldValue>> {
    need(buf, 1, "value tag")?;
    let tag = buf.get_u8();
    if tag == 0 {
        return Ok(None);
    }
    let ty = FieldType::from_u8(tag)
        .ok_or_else(|| TsspError::Corruption(format!("unknown value tag {}", tag)))?;
    let v = match ty {
        FieldType::Integer => {
            need(buf, 8, "integer value")?;
            FieldValue::Integer(buf.get_i64())
        }
        FieldType::Float => {
            need(buf, 8, "float value")?;
            FieldValue::Float(f64::from_bits(buf.get_u64()))
        }
        FieldType::Boolean => {
            need(buf, 1, "boolean value")?;
            FieldValue::Boolean(buf.get_u8() != 0)
        }
        FieldType::String => {
            need(buf, 4, "string value")?;
            let len = buf.get_u32() as usize;
            need(buf, len, "string value")?;
            let s = String::from_utf8_lossy(&buf[..len]).into_owned();
            buf.advance(len);
            FieldValue::String(s)
        }
    };
    Ok(Some(v))
}

fn encode_timed(v: &Option<(FieldValue, Timestamp)>, dst: &mut Vec<u8>) {
    match v {
        Some((v, t)) => {
            encode_value(v, dst);
            dst.put_i64(*t);
        }
        None => dst.put_u8(0),
    }
}

fn decode_timed(buf: &mut &[u8]) -> Result<Option<(FieldValue, Timestamp)>> {
    match decode_value(buf)? {
        Some(v) => {
            need(buf, 8, "value time")?;
            Ok(Some((v, buf.get_i64())))
        }
        None => Ok(None),
    }
}

fn encode_col_meta(meta: &ColMeta, dst: &mut Vec<u8>) {
    dst.put_u64(meta.count);
    encode_timed(&meta.min, dst);
    encode_timed(&meta.max, dst);
    encode_timed(&meta.first, dst);
    encode_timed(&meta.last, dst);
    match &meta.sum {
        Some(v) => encode_value(v, dst),
        None => dst.put_u8(0),
    }
}

fn decode_col_meta(buf: &mut &[u8]) -> Result<ColMeta> {
    need(buf, 8, "column pre-aggregation")?;
    Ok(ColMeta {
        count: buf.get_u64(),
        min: decode_timed(buf)?,
        max: decode_timed(buf)?,
        first: decode_timed(buf)?,
        last: decode_timed(buf)?,
        sum: decode_value(buf)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(sid: SeriesId) -> ChunkMeta {
        let ranges = vec![
            SegmentRange { min_time: 1, max_time: 10, rows: 10 },
            SegmentRange { min_time: 11, max_time: 15, rows: 5 },
        ];
        let pre_agg = ColMeta {
            count: 14,
            min: Some((FieldValue::Float(-1.5), 3)),
            max: Some((FieldValue::Float(9.0), 12)),
            first: Some((FieldValue::Float(0.5), 1)),
            last: Some((FieldValue::Float(2.0), 15)),
            sum: Some(FieldValue::Float(33.25)),
        };
        let columns = vec![
            ColumnMeta {
                name: "load".into(),
                ty: FieldType::Float,
                pre_agg,
                segments: vec![Segment { offset: 16, size: 40 }, Segment { offset: 56, size: 30 }],
            },
            ColumnMeta {
                name: "host".into(),
                ty: FieldType::String,
                pre_agg: ColMeta {
                    count: 1,
                    first: Some((FieldValue::String("a".into()), 1)),
                    last: Some((FieldValue::String("a".into()), 1)),
                    ..ColMeta::default()
                },
                segments: vec![Segment { offset: 86, size: 20 }, Segment { offset: 106, size: 20 }],
            },
        ];
        ChunkMeta { sid, offset: 16, size: 110, time_ranges: ranges, columns }
    }

    #[test]
    fn test_block_encoding() {
        let metas = vec![meta(3), meta(9)];
        let mut buf = Vec::new();
        encode_block(&metas, &mut buf).unwrap();
        let back = decode_block(&buf).unwrap();
        assert_eq!(back, metas);

        let m = &back[1];
        assert_eq!(m.rows(), 15);
        assert_eq!((m.min_time(), m.max_time()), (1, 15));
        assert!(m.overlaps(15, 100));
        assert!(!m.overlaps(16, 100));
        assert_eq!(m.column_index("host"), Some(1));
        assert_eq!(m.schema()[0], Field::new("load", FieldType::Float));
    }

    #[test]
    fn test_block_corruption() {
        let mut buf = Vec::new();
        encode_block(&[meta(1)], &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 1;
        assert!(decode_block(&buf).unwrap_err().is_corruption());
        assert!(decode_block(&buf[..2]).is_err());
    }

    #[test]
    fn test_block_rejects_long_column_name() {
        let mut m = meta(1);
        m.columns[0].name = "c".repeat(u16::MAX as usize + 1);
        let err = encode_block(&[m], &mut Vec::new()).unwrap_err();
        assert!(matches!(err, TsspError::InvalidFormat(_)));
    }
}
