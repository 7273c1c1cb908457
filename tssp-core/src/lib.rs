//! TSSP - Immutable Columnar Storage for Time-Series Data
//!
//! The storage engine of a time-series shard: sealed columnar files of
//! series-sorted, time-ordered data, shared between queries and background
//! compaction through reference counting.
//!
//! # Architecture
//!
//! - **Record**: columnar batches with null bitmaps, merged by time
//! - **Compression**: delta-of-delta integers, XOR floats, packed booleans, LZ4 strings
//! - **TSSP files**: column segments indexed by chunk metas and a meta index
//! - **Compaction**: level, full and out-of-order merges planned per measurement
//! - **Table store**: the files of a shard, replaced atomically after compaction

pub mod compaction;
pub mod compression;
pub mod options;
pub mod packet;
pub mod record;
pub mod store;
pub mod tssp;

mod error;
mod types;

pub use error::{Result, TsspError};
pub use options::Config;
pub use store::{MmsTables, Sequencer};
pub use types::*;

/// TSSP version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Rows per column segment
    pub const MAX_ROWS_PER_SEGMENT: usize = 1000;

    /// Series covered by one meta-index item
    pub const MAX_CHUNK_METAS_PER_INDEX: usize = 16;

    /// Bytes written before a builder rolls to the next extent (8GB)
    pub const FILE_SIZE_LIMIT: u64 = 8 * 1024 * 1024 * 1024;

    /// Minimum files per compaction group, by level
    pub const LEVEL_MIN_GROUP_FILES: [usize; 8] = [8, 4, 4, 4, 4, 4, 2, 2];

    /// Highest compaction level
    pub const MAX_LEVEL: u16 = 7;

    /// Bloom filter bits per series id
    pub const BLOOM_BITS_PER_KEY: usize = 10;
}
