//! Engine configuration

use crate::{Result, TsspError};
use serde::{Deserialize, Serialize};

/// Storage engine configuration
///
/// Passed explicitly to the table store, builders and readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rows per column segment
    pub max_rows_per_segment: usize,
    /// Series covered by one meta-index item
    pub max_chunk_metas_per_index: usize,
    /// Bytes written before a builder rolls to the next extent
    pub file_size_limit: u64,
    /// Minimum files per compaction group, indexed by level
    pub level_min_group_files: Vec<usize>,
    /// Highest compaction level
    pub max_level: u16,
    /// Compaction groups merged in parallel
    pub compact_threads: usize,
    /// Read sealed files through a memory map
    pub enable_mmap_read: bool,
    /// Keep decoded meta index and chunk metas in memory
    pub cache_meta_data: bool,
    /// Keep raw column blocks in memory
    pub cache_data_block: bool,
    pub bloom_bits_per_key: usize,
    /// Records kept by each record pool
    pub record_pool_capacity: usize,
    /// Rebuild the sequencer in the background when a store opens
    pub load_id_times_on_open: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_rows_per_segment: crate::config::MAX_ROWS_PER_SEGMENT,
            max_chunk_metas_per_index: crate::config::MAX_CHUNK_METAS_PER_INDEX,
            file_size_limit: crate::config::FILE_SIZE_LIMIT,
            level_min_group_files: crate::config::LEVEL_MIN_GROUP_FILES.to_vec(),
            max_level: crate::config::MAX_LEVEL,
            compact_threads: 2,
            enable_mmap_read: false,
            cache_meta_data: true,
            cache_data_block: false,
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
            record_pool_capacity: 16,
            load_id_times_on_open: true,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_rows_per_segment == 0 {
            return Err(TsspError::Config("max_rows_per_segment must be > 0".into()));
        }
        if self.max_chunk_metas_per_index == 0 {
            return Err(TsspError::Config(
                "max_chunk_metas_per_index must be > 0".into(),
            ));
        }
        if self.file_size_limit == 0 {
            return Err(TsspError::Config("file_size_limit must be > 0".into()));
        }
        if self.level_min_group_files.len() < self.max_level as usize + 1 {
            return Err(TsspError::Config(format!(
                "level_min_group_files has {} entries, need {}",
                self.level_min_group_files.len(),
                self.max_level + 1
            )));
        }
        if let Some(n) = self.level_min_group_files.iter().find(|&&n| n < 2) {
            return Err(TsspError::Config(format!(
                "minimum compaction group of {} files is below 2",
                n
            )));
        }
        if self.compact_threads == 0 {
            return Err(TsspError::Config("compact_threads must be > 0".into()));
        }
        Ok(())
    }

    /// Minimum group size for `level`; the last entry covers deeper levels
    pub fn min_group_files(&self, level: u16) -> usize {
        self.level_min_group_files
            .get(level as usize)
            .or_else(|| self.level_min_group_files.last())
            .copied()
            .unwrap_or(2)
    }
}
