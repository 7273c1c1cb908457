//! Meta index: the top-level directory of a TSSP file
//!
//! Each item points at one chunk-meta block and records the first series id and the
//! time span of the series it covers. The section (and the detached `.idx` file, which
//! holds the same bytes) starts with a 16-byte header followed by fixed-size entries:
//!
//! ```text
//! header: "TSMI" | version u32 | item count u64
//! entry:  crc32 u32 | id u64 | min_time i64 | max_time i64 | offset i64 | size u32
//! ```

use super::source::{ByteSource, DiskSource};
use super::{need, put_crc_block, verify_crc_block, CRC_SIZE, FORMAT_VERSION};
use crate::{Result, SeriesId, Timestamp, TsspError};
use bytes::{Buf, BufMut};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Size of the section header
pub const META_INDEX_HEADER_SIZE: usize = 16;

/// Size of one item payload: three i64, one u64 and one u32
pub const META_INDEX_ITEM_SIZE: usize = 36;

const ENTRY_SIZE: usize = CRC_SIZE + META_INDEX_ITEM_SIZE;
const SECTION_MAGIC: &[u8; 4] = b"TSMI";

/// One meta-index item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaIndex {
    /// First series id of the chunk-meta block
    pub id: SeriesId,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    /// Offset of the chunk-meta block in the file
    pub offset: i64,
    /// Size of the chunk-meta block, CRC included
    pub size: u32,
}

impl MetaIndex {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        let mut payload = Vec::with_capacity(META_INDEX_ITEM_SIZE);
        payload.put_u64(self.id);
        payload.put_i64(self.min_time);
        payload.put_i64(self.max_time);
        payload.put_i64(self.offset);
        payload.put_u32(self.size);
        put_crc_block(dst, &payload);
    }

    /// Decode one entry, CRC included
    pub fn decode(entry: &[u8]) -> Result<Self> {
        need(entry, ENTRY_SIZE, "meta index entry")?;
        let mut payload = verify_crc_block(&entry[..ENTRY_SIZE])?;
        Ok(Self {
            id: payload.get_u64(),
            min_time: payload.get_i64(),
            max_time: payload.get_i64(),
            offset: payload.get_i64(),
            size: payload.get_u32(),
        })
    }

    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        self.min_time <= max && self.max_time >= min
    }
}

/// Offset and length of entry `chunk_id` inside a meta-index section
pub fn get_meta_index_offset_and_length_by_chunk_id(chunk_id: usize) -> (i64, u32) {
    (
        (chunk_id * ENTRY_SIZE + META_INDEX_HEADER_SIZE) as i64,
        ENTRY_SIZE as u32,
    )
}

/// Number of entries held by a detached meta-index file; 0 when the file is absent.
pub fn get_meta_index_chunk_count(path: &Path) -> Result<usize> {
    match fs::metadata(path) {
        Ok(meta) => Ok(chunk_count_of_size(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(TsspError::io_with_path("stat", path, e)),
    }
}

fn chunk_count_of_size(size: u64) -> usize {
    (size.saturating_sub(META_INDEX_HEADER_SIZE as u64) / ENTRY_SIZE as u64) as usize
}

/// Encode a complete meta-index section
pub(crate) fn encode_section(items: &[MetaIndex], dst: &mut Vec<u8>) {
    dst.reserve(META_INDEX_HEADER_SIZE + items.len() * ENTRY_SIZE);
    dst.put_slice(SECTION_MAGIC);
    dst.put_u32(FORMAT_VERSION);
    dst.put_u64(items.len() as u64);
    for item in items {
        item.encode(dst);
    }
}

/// Decode a complete meta-index section
pub(crate) fn decode_section(data: &[u8]) -> Result<Vec<MetaIndex>> {
    need(data, META_INDEX_HEADER_SIZE, "meta index header")?;
    if &data[..4] != SECTION_MAGIC {
        return Err(TsspError::InvalidFormat("bad meta index magic".into()));
    }
    let mut header = &data[4..META_INDEX_HEADER_SIZE];
    let version = header.get_u32();
    if version != FORMAT_VERSION {
        return Err(TsspError::InvalidFormat(format!(
            "unsupported meta index version {}",
            version
        )));
    }
    let count = header.get_u64() as usize;
    let body = &data[META_INDEX_HEADER_SIZE..];
    if body.len() / ENTRY_SIZE < count {
        return Err(TsspError::Corruption(format!(
            "meta index holds {} entries, header says {}",
            body.len() / ENTRY_SIZE,
            count
        )));
    }
    body.chunks_exact(ENTRY_SIZE)
        .take(count)
        .map(MetaIndex::decode)
        .collect()
}

/// Path of the detached meta index belonging to a TSSP file
pub fn detached_meta_index_path(tssp_path: &Path) -> PathBuf {
    let name = tssp_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or(name);
    tssp_path.with_file_name(format!("{}.idx", stem))
}

/// Write `items` as a standalone meta-index file.
pub fn write_detached_meta_index(path: &Path, items: &[MetaIndex]) -> Result<()> {
    let mut buf = Vec::new();
    encode_section(items, &mut buf);
    let mut file = File::create(path).map_err(|e| TsspError::io_with_path("create", path, e))?;
    file.write_all(&buf)
        .and_then(|_| file.sync_all())
        .map_err(|e| TsspError::io_with_path("write", path, e))?;
    Ok(())
}

/// Random-access reader over a detached meta-index file
pub struct DetachedMetaIndexReader {
    source: DiskSource,
}

impl DetachedMetaIndexReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            source: DiskSource::open(path)?,
        })
    }

    pub fn chunk_count(&self) -> usize {
        chunk_count_of_size(self.source.size())
    }

    /// Read the given entries, validating each CRC. Results are sorted by block offset.
    pub fn read_items(&self, chunk_ids: &[usize]) -> Result<Vec<MetaIndex>> {
        let count = self.chunk_count();
        let mut items = Vec::with_capacity(chunk_ids.len());
        for &id in chunk_ids {
            if id >= count {
                return Err(TsspError::InvalidFormat(format!(
                    "chunk id {} out of range, file holds {}",
                    id, count
                )));
            }
            let (offset, len) = get_meta_index_offset_and_length_by_chunk_id(id);
            let entry = self.source.read_at(offset as u64, len as usize)?;
            items.push(MetaIndex::decode(&entry)?);
        }
        items.sort_by_key(|m| m.offset);
        Ok(items)
    }

    /// Read every entry of the file
    pub fn read_all(&self) -> Result<Vec<MetaIndex>> {
        let data = self.source.read_at(0, self.source.size() as usize)?;
        let mut items = decode_section(&data)?;
        items.sort_by_key(|m| m.offset);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn items(n: usize) -> Vec<MetaIndex> {
        (0..n)
            .map(|i| MetaIndex {
                id: (i as u64 + 1) * 16,
                min_time: i as i64 * 100,
                max_time: i as i64 * 100 + 99,
                offset: 4096 - i as i64 * 64,
                size: 64,
            })
            .collect()
    }

    #[test]
    fn test_offset_formula() {
        assert_eq!(get_meta_index_offset_and_length_by_chunk_id(0), (16, 40));
        assert_eq!(get_meta_index_offset_and_length_by_chunk_id(1), (56, 40));
        assert_eq!(get_meta_index_offset_and_length_by_chunk_id(10), (416, 40));
        assert_eq!(chunk_count_of_size(16 + 40 * 7), 7);
        assert_eq!(chunk_count_of_size(16 + 40 * 7 + 39), 7);
        assert_eq!(chunk_count_of_size(3), 0);
    }

    #[test]
    fn test_detached_meta_index() {
        let dir = TempDir::new().unwrap();
        let tssp = dir.path().join("00000001-0000-00000000.tssp");
        let path = detached_meta_index_path(&tssp);
        assert_eq!(path, dir.path().join("00000001-0000-00000000.idx"));
        assert_eq!(get_meta_index_chunk_count(&path).unwrap(), 0);

        let written = items(5);
        write_detached_meta_index(&path, &written).unwrap();
        assert_eq!(get_meta_index_chunk_count(&path).unwrap(), 5);

        let reader = DetachedMetaIndexReader::open(&path).unwrap();
        let got = reader.read_items(&[0, 3, 1]).unwrap();
        // sorted by offset, and offsets decrease with the chunk id
        assert_eq!(got, vec![written[3], written[1], written[0]]);
        assert_eq!(reader.read_all().unwrap().len(), 5);
        assert!(reader.read_items(&[5]).is_err());
    }

    #[test]
    fn test_detached_entry_crc() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.idx");
        write_detached_meta_index(&path, &items(2)).unwrap();

        let mut data = fs::read(&path).unwrap();
        let (offset, _) = get_meta_index_offset_and_length_by_chunk_id(1);
        data[offset as usize + 10] ^= 0x55;
        fs::write(&path, &data).unwrap();

        let reader = DetachedMetaIndexReader::open(&path).unwrap();
        assert!(reader.read_items(&[0]).is_ok());
        assert!(reader.read_items(&[1]).unwrap_err().is_corruption());
    }
}
