//! TSSP immutable columnar files
//!
//! One file holds the data of many series of a single measurement, sorted by series id.
//! Every integer in the index structures is big-endian; column blocks use the
//! little-endian layout of [`crate::compression`].
//!
//! ```text
//! +-------------------------------+ 0
//! | header: "TSSP" | version u32  |
//! |         reserved u64          |
//! +-------------------------------+ 16
//! | column segments               |  [crc32 u32][column block] ...
//! +-------------------------------+
//! | chunk-meta blocks             |  one per meta-index item:
//! |                               |  [crc32 u32][count u32][chunk meta] ...
//! +-------------------------------+
//! | meta index                    |  16-byte header, then
//! |                               |  [crc32 u32][36-byte item] ...
//! +-------------------------------+
//! | bloom filter over series ids  |
//! +-------------------------------+
//! | trailer                       |
//! +-------------------------------+
//! | trailer size u32 | "TSSP"     |
//! +-------------------------------+ file size
//! ```

mod bloom;
pub(crate) mod builder;
mod chunk_meta;
mod file;
mod file_name;
mod files;
mod meta_index;
mod reader;
mod source;
mod trailer;

pub use bloom::BloomFilter;
pub use builder::MsBuilder;
pub use chunk_meta::{ChunkMeta, ColumnMeta, Segment, SegmentRange};
pub use file::{FileRef, TsspFile};
pub use file_name::{TsspFileName, OUT_OF_ORDER_DIR, TMP_FILE_SUFFIX, TSSP_FILE_SUFFIX};
pub use files::{compare_file, compare_file_by_descend, TsspFiles};
pub(crate) use files::full_compacted_names;
pub use meta_index::{
    detached_meta_index_path, get_meta_index_chunk_count,
    get_meta_index_offset_and_length_by_chunk_id, write_detached_meta_index,
    DetachedMetaIndexReader, MetaIndex, META_INDEX_HEADER_SIZE, META_INDEX_ITEM_SIZE,
};
pub use reader::{ReadContext, TsspFileReader};
pub use source::{open_source, stream_read_batch, ByteSource, DiskSource, MemorySource, MmapSource};
pub use trailer::Trailer;

use crate::{Result, TsspError};
use bytes::BufMut;

/// Leading and trailing file magic
pub const FILE_MAGIC: &[u8; 4] = b"TSSP";

/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Size of the file header
pub const FILE_HEADER_SIZE: usize = 16;

/// Size of the footer: trailer length and magic
pub const FOOTER_SIZE: usize = 8;

/// Size of the CRC32 prefix on every checksummed block
pub const CRC_SIZE: usize = 4;

/// Append `payload` prefixed by its big-endian CRC32.
pub(crate) fn put_crc_block(dst: &mut Vec<u8>, payload: &[u8]) {
    dst.put_u32(crc32fast::hash(payload));
    dst.put_slice(payload);
}

/// Check the CRC prefix of `block` and return the payload behind it.
pub(crate) fn verify_crc_block(block: &[u8]) -> Result<&[u8]> {
    if block.len() < CRC_SIZE {
        return Err(TsspError::Corruption(format!(
            "checksummed block too short: {} bytes",
            block.len()
        )));
    }
    let expected = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    let payload = &block[CRC_SIZE..];
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(TsspError::ChecksumMismatch { expected, actual });
    }
    Ok(payload)
}

/// Append a u16 length-prefixed name
pub(crate) fn put_name(dst: &mut Vec<u8>, name: &str, what: &str) -> Result<()> {
    let len = u16::try_from(name.len()).map_err(|_| {
        TsspError::InvalidFormat(format!("{} name of {} bytes exceeds {}", what, name.len(), u16::MAX))
    })?;
    dst.put_u16(len);
    dst.put_slice(name.as_bytes());
    Ok(())
}

/// Bounds check before slicing decoded index data
pub(crate) fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.len() < n {
        return Err(TsspError::Corruption(format!(
            "{} truncated: need {} bytes, have {}",
            what,
            n,
            buf.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_block() {
        let mut buf = Vec::new();
        put_crc_block(&mut buf, b"payload");
        assert_eq!(verify_crc_block(&buf).unwrap(), b"payload");

        buf[6] ^= 0xff;
        let err = verify_crc_block(&buf).unwrap_err();
        assert!(matches!(err, TsspError::ChecksumMismatch { .. }));
        assert!(verify_crc_block(&buf[..3]).unwrap_err().is_corruption());
    }
}
