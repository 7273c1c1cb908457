//! File trailer: section locations and file-wide statistics

use super::source::ByteSource;
use super::{need, put_name, FILE_HEADER_SIZE, FILE_MAGIC, FOOTER_SIZE, FORMAT_VERSION};
use crate::{Result, SeriesId, Timestamp, TsspError};
use bytes::{Buf, BufMut};

const FIXED_SIZE: usize = 8 * 15 + 4 + 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trailer {
    /// Measurement the file belongs to
    pub name: String,
    pub series_count: u64,
    pub rows: u64,
    pub min_id: SeriesId,
    pub max_id: SeriesId,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub data_offset: u64,
    pub data_size: u64,
    pub chunk_meta_offset: u64,
    pub chunk_meta_size: u64,
    /// Meta-index section, header included
    pub meta_index_offset: u64,
    pub meta_index_size: u64,
    pub meta_index_items: u64,
    pub bloom_offset: u64,
    pub bloom_size: u64,
    pub bloom_hashes: u32,
}

impl Trailer {
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        dst.put_u64(self.series_count);
        dst.put_u64(self.rows);
        dst.put_u64(self.min_id);
        dst.put_u64(self.max_id);
        dst.put_i64(self.min_time);
        dst.put_i64(self.max_time);
        dst.put_u64(self.data_offset);
        dst.put_u64(self.data_size);
        dst.put_u64(self.chunk_meta_offset);
        dst.put_u64(self.chunk_meta_size);
        dst.put_u64(self.meta_index_offset);
        dst.put_u64(self.meta_index_size);
        dst.put_u64(self.meta_index_items);
        dst.put_u64(self.bloom_offset);
        dst.put_u64(self.bloom_size);
        dst.put_u32(self.bloom_hashes);
        put_name(dst, &self.name, "measurement")
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        need(data, FIXED_SIZE, "trailer")?;
        let mut t = Trailer {
            series_count: data.get_u64(),
            rows: data.get_u64(),
            min_id: data.get_u64(),
            max_id: data.get_u64(),
            min_time: data.get_i64(),
            max_time: data.get_i64(),
            data_offset: data.get_u64(),
            data_size: data.get_u64(),
            chunk_meta_offset: data.get_u64(),
            chunk_meta_size: data.get_u64(),
            meta_index_offset: data.get_u64(),
            meta_index_size: data.get_u64(),
            meta_index_items: data.get_u64(),
            bloom_offset: data.get_u64(),
            bloom_size: data.get_u64(),
            bloom_hashes: data.get_u32(),
            name: String::new(),
        };
        let len = data.get_u16() as usize;
        need(data, len, "measurement name")?;
        t.name = std::str::from_utf8(&data[..len])
            .map_err(|e| TsspError::Corruption(format!("invalid measurement name: {}", e)))?
            .to_string();
        Ok(t)
    }

    /// Read and validate header, footer and trailer of a file
    pub fn load(source: &dyn ByteSource) -> Result<Self> {
        let size = source.size();
        if size < (FILE_HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(TsspError::Corruption(format!(
                "{:?}: file too small ({} bytes)",
                source.path(),
                size
            )));
        }

        let header = source.read_at(0, FILE_HEADER_SIZE)?;
        if &header[..4] != FILE_MAGIC {
            return Err(TsspError::InvalidFormat(format!(
                "{:?}: not a TSSP file",
                source.path()
            )));
        }
        let version = (&header[4..8]).get_u32();
        if version != FORMAT_VERSION {
            return Err(TsspError::InvalidFormat(format!(
                "{:?}: unsupported version {}",
                source.path(),
                version
            )));
        }

        let footer = source.read_at(size - FOOTER_SIZE as u64, FOOTER_SIZE)?;
        if &footer[4..] != FILE_MAGIC {
            return Err(TsspError::Corruption(format!(
                "{:?}: bad footer magic",
                source.path()
            )));
        }
        let trailer_size = (&footer[..4]).get_u32() as u64;
        let trailer_end = size - FOOTER_SIZE as u64;
        if trailer_size > trailer_end - FILE_HEADER_SIZE as u64 {
            return Err(TsspError::Corruption(format!(
                "{:?}: trailer size {} exceeds file",
                source.path(),
                trailer_size
            )));
        }
        let data = source.read_at(trailer_end - trailer_size, trailer_size as usize)?;
        Trailer::decode(&data)
    }

    pub fn contains_id(&self, id: SeriesId) -> bool {
        self.series_count > 0 && id >= self.min_id && id <= self.max_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailer_encoding() {
        let t = Trailer {
            name: "cpu".into(),
            series_count: 3,
            rows: 300,
            min_id: 2,
            max_id: 40,
            min_time: -5,
            max_time: 1_000,
            data_offset: 16,
            data_size: 512,
            chunk_meta_offset: 528,
            chunk_meta_size: 100,
            meta_index_offset: 628,
            meta_index_size: 56,
            meta_index_items: 1,
            bloom_offset: 684,
            bloom_size: 8,
            bloom_hashes: 7,
        };
        let mut buf = Vec::new();
        t.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), FIXED_SIZE + 3);
        assert_eq!(Trailer::decode(&buf).unwrap(), t);
        assert!(Trailer::decode(&buf[..FIXED_SIZE + 1]).is_err());
        assert!(t.contains_id(40) && !t.contains_id(41) && !t.contains_id(1));

        let long = Trailer {
            name: "m".repeat(u16::MAX as usize + 1),
            ..t
        };
        assert!(matches!(long.encode(&mut Vec::new()), Err(TsspError::InvalidFormat(_))));
    }
}
