//! Reader of one sealed TSSP file
//!
//! The reader owns the byte source and the decoded index caches. Its reference count
//! tracks in-flight reads: `close` only marks the reader, and the source is dropped once
//! the last in-flight read unreferences it.

use super::bloom::BloomFilter;
use super::chunk_meta::{decode_block, ChunkMeta, Segment};
use super::meta_index::{decode_section, MetaIndex};
use super::source::{open_source, ByteSource, MemorySource};
use super::trailer::Trailer;
use super::{verify_crc_block, CRC_SIZE};
use crate::compression::decode_column;
use crate::options::Config;
use crate::record::Record;
use crate::{Result, SeriesId, TimeRange, Timestamp, TsspError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-query read options and counters
#[derive(Debug, Clone)]
pub struct ReadContext {
    /// Rows outside this range are dropped while decoding
    pub time_range: TimeRange,
    /// Keep the raw blocks read in the file's block cache
    pub cache_blocks: bool,
    blocks_read: u64,
    bytes_read: u64,
}

impl ReadContext {
    pub fn new(time_range: TimeRange) -> Self {
        Self {
            time_range,
            cache_blocks: false,
            blocks_read: 0,
            bytes_read: 0,
        }
    }

    pub fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl Default for ReadContext {
    fn default() -> Self {
        Self::new(TimeRange::all())
    }
}

pub struct TsspFileReader {
    path: RwLock<PathBuf>,
    enable_mmap: bool,
    cache_meta: bool,
    cache_blocks: bool,
    source: RwLock<Option<Arc<dyn ByteSource>>>,
    file_size: u64,
    trailer: Trailer,
    bloom: BloomFilter,
    meta_index: RwLock<Option<Arc<Vec<MetaIndex>>>>,
    chunk_metas: Mutex<HashMap<usize, (Arc<Vec<ChunkMeta>>, usize)>>,
    blocks: Mutex<HashMap<i64, Bytes>>,
    refs: AtomicI64,
    closed: AtomicBool,
    released: AtomicBool,
}

impl TsspFileReader {
    pub fn open(path: &Path, conf: &Config) -> Result<Self> {
        let source = open_source(path, conf.enable_mmap_read)?;
        let trailer = Trailer::load(source.as_ref())?;
        let bloom_data = source.read_at(trailer.bloom_offset, trailer.bloom_size as usize)?;
        let bloom = BloomFilter::from_bytes(bloom_data.to_vec(), trailer.bloom_hashes);
        debug!(
            path = %path.display(),
            source = source.kind(),
            series = trailer.series_count,
            "opened tssp file"
        );
        Ok(Self {
            path: RwLock::new(path.to_path_buf()),
            enable_mmap: conf.enable_mmap_read,
            cache_meta: conf.cache_meta_data,
            cache_blocks: conf.cache_data_block,
            file_size: source.size(),
            source: RwLock::new(Some(source)),
            trailer,
            bloom,
            meta_index: RwLock::new(None),
            chunk_metas: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            refs: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub(crate) fn set_path(&self, path: PathBuf) {
        *self.path.write() = path;
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    pub fn ref_reader(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one in-flight reference, releasing the source if the reader was closed.
    pub fn unref_reader(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            self.refs.fetch_add(1, Ordering::SeqCst);
            warn!(path = %self.path().display(), "unbalanced reader unref");
            return;
        }
        if prev == 1 && self.closed.load(Ordering::SeqCst) {
            self.release();
        }
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Mark closed; the source is released now or by the last `unref_reader`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.refs.load(Ordering::SeqCst) == 0 {
            self.release();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.source.write().take();
        self.clear_caches();
        debug!(path = %self.path().display(), "released tssp file reader");
    }

    fn source(&self) -> Result<Arc<dyn ByteSource>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(TsspError::FileClosed);
        }
        if let Some(src) = self.source.read().as_ref() {
            return Ok(src.clone());
        }
        let mut guard = self.source.write();
        if self.released.load(Ordering::SeqCst) {
            return Err(TsspError::FileClosed);
        }
        if let Some(src) = guard.as_ref() {
            return Ok(src.clone());
        }
        let src = open_source(&self.path(), self.enable_mmap)?;
        *guard = Some(src.clone());
        Ok(src)
    }

    /// Drop the file handle; the next read reopens it. A loaded copy is kept.
    pub fn free_file_handle(&self) -> bool {
        let mut guard = self.source.write();
        let on_disk = guard.as_ref().map_or(false, |s| s.memory_size() == 0);
        if on_disk {
            guard.take();
        }
        on_disk
    }

    /// Replace the source with an in-memory copy of the whole file
    pub fn load_into_memory(&self) -> Result<()> {
        let src = self.source()?;
        if src.memory_size() > 0 {
            return Ok(());
        }
        let data = src.read_at(0, src.size() as usize)?;
        let mem: Arc<dyn ByteSource> = Arc::new(MemorySource::from_bytes(&self.path(), data));
        let mut guard = self.source.write();
        if self.released.load(Ordering::SeqCst) {
            return Err(TsspError::FileClosed);
        }
        *guard = Some(mem);
        debug!(path = %self.path().display(), bytes = self.file_size, "loaded tssp file into memory");
        Ok(())
    }

    /// Drop decoded caches, and the in-memory copy too when `drop_loaded` is set.
    ///
    /// Returns the number of bytes freed.
    pub fn free_memory(&self, drop_loaded: bool) -> usize {
        let mut freed = self.clear_caches();
        if drop_loaded {
            let mut guard = self.source.write();
            let loaded = guard.as_ref().map_or(0, |s| s.memory_size());
            if loaded > 0 {
                guard.take();
                freed += loaded;
            }
        }
        freed
    }

    fn clear_caches(&self) -> usize {
        let mut freed = 0;
        if let Some(items) = self.meta_index.write().take() {
            freed += items.len() * std::mem::size_of::<MetaIndex>();
        }
        freed += self
            .chunk_metas
            .lock()
            .drain()
            .map(|(_, (_, size))| size)
            .sum::<usize>();
        freed += self.blocks.lock().drain().map(|(_, b)| b.len()).sum::<usize>();
        freed
    }

    /// Bytes held by caches and any in-memory copy
    pub fn memory_size(&self) -> usize {
        let index = self
            .meta_index
            .read()
            .as_ref()
            .map_or(0, |m| m.len() * std::mem::size_of::<MetaIndex>());
        let metas: usize = self.chunk_metas.lock().values().map(|(_, s)| *s).sum();
        let blocks: usize = self.blocks.lock().values().map(Bytes::len).sum();
        let loaded = self.source.read().as_ref().map_or(0, |s| s.memory_size());
        index + metas + blocks + loaded
    }

    pub fn min_max_time(&self) -> (Timestamp, Timestamp) {
        (self.trailer.min_time, self.trailer.max_time)
    }

    /// Bloom and id-range check; false means the series is absent
    pub fn contains(&self, sid: SeriesId) -> bool {
        self.trailer.contains_id(sid) && self.bloom.may_contain(sid)
    }

    /// True when the series has rows inside `tr`
    pub fn contains_value(&self, sid: SeriesId, tr: TimeRange) -> Result<bool> {
        if !self.contains(sid) || !tr.overlaps_bounds(self.trailer.min_time, self.trailer.max_time) {
            return Ok(false);
        }
        Ok(self.chunk_meta(sid, tr)?.is_some())
    }

    /// Every meta-index item, loading the section on first use
    pub fn meta_index_items(&self) -> Result<Arc<Vec<MetaIndex>>> {
        if let Some(items) = self.meta_index.read().as_ref() {
            return Ok(items.clone());
        }
        let src = self.source()?;
        let data = src.read_at(
            self.trailer.meta_index_offset,
            self.trailer.meta_index_size as usize,
        )?;
        let items = Arc::new(decode_section(&data)?);
        if items.len() as u64 != self.trailer.meta_index_items {
            return Err(TsspError::Corruption(format!(
                "{:?}: meta index holds {} items, trailer says {}",
                self.path(),
                items.len(),
                self.trailer.meta_index_items
            )));
        }
        if self.cache_meta {
            *self.meta_index.write() = Some(items.clone());
        }
        Ok(items)
    }

    pub fn meta_index_count(&self) -> usize {
        self.trailer.meta_index_items as usize
    }

    pub fn meta_index_at(&self, idx: usize) -> Result<Option<MetaIndex>> {
        Ok(self.meta_index_items()?.get(idx).copied())
    }

    /// Locate the meta-index item that may hold `sid` with rows in `tr`
    pub fn meta_index(&self, sid: SeriesId, tr: TimeRange) -> Result<Option<(usize, MetaIndex)>> {
        if !self.trailer.contains_id(sid) {
            return Ok(None);
        }
        let items = self.meta_index_items()?;
        let idx = items.partition_point(|m| m.id <= sid);
        if idx == 0 {
            return Ok(None);
        }
        let item = items[idx - 1];
        if !item.overlaps(tr.min, tr.max) {
            return Ok(None);
        }
        Ok(Some((idx - 1, item)))
    }

    /// Raw chunk-meta block `idx`, CRC still attached
    pub fn read_meta_block(&self, idx: usize) -> Result<Bytes> {
        let item = self.meta_index_at(idx)?.ok_or_else(|| {
            TsspError::InvalidFormat(format!(
                "meta index {} out of range ({} items)",
                idx,
                self.meta_index_count()
            ))
        })?;
        self.source()?.read_at(item.offset as u64, item.size as usize)
    }

    /// Decoded chunk metas of block `idx`
    pub fn read_chunk_meta_data(&self, idx: usize) -> Result<Arc<Vec<ChunkMeta>>> {
        if let Some((metas, _)) = self.chunk_metas.lock().get(&idx) {
            return Ok(metas.clone());
        }
        let block = self.read_meta_block(idx)?;
        let metas = Arc::new(decode_block(&block)?);
        if self.cache_meta {
            self.chunk_metas
                .lock()
                .insert(idx, (metas.clone(), block.len()));
        }
        Ok(metas)
    }

    /// Chunk meta of `sid`, if the series has rows in `tr`
    pub fn chunk_meta(&self, sid: SeriesId, tr: TimeRange) -> Result<Option<ChunkMeta>> {
        let Some((idx, _)) = self.meta_index(sid, tr)? else {
            return Ok(None);
        };
        let metas = self.read_chunk_meta_data(idx)?;
        let found = metas
            .binary_search_by_key(&sid, |m| m.sid)
            .ok()
            .map(|i| &metas[i])
            .filter(|m| m.overlaps(tr.min, tr.max))
            .cloned();
        Ok(found)
    }

    /// The `index`-th chunk meta of the file, in series order
    pub fn chunk_meta_at(&self, index: usize) -> Result<Option<ChunkMeta>> {
        let mut skipped = 0;
        for idx in 0..self.meta_index_count() {
            let metas = self.read_chunk_meta_data(idx)?;
            if index < skipped + metas.len() {
                return Ok(Some(metas[index - skipped].clone()));
            }
            skipped += metas.len();
        }
        Ok(None)
    }

    /// Every chunk meta of the file, in series order
    pub fn all_chunk_metas(&self) -> Result<Vec<ChunkMeta>> {
        let mut all = Vec::with_capacity(self.trailer.series_count as usize);
        for idx in 0..self.meta_index_count() {
            all.extend(self.read_chunk_meta_data(idx)?.iter().cloned());
        }
        Ok(all)
    }

    /// Raw bytes `[offset, offset + size)`
    pub fn read_data(&self, offset: i64, size: u32, ctx: &mut ReadContext) -> Result<Bytes> {
        if let Some(b) = self.blocks.lock().get(&offset) {
            if b.len() == size as usize {
                return Ok(b.clone());
            }
        }
        let data = self.source()?.read_at(offset as u64, size as usize)?;
        ctx.blocks_read += 1;
        ctx.bytes_read += data.len() as u64;
        if self.cache_blocks || ctx.cache_blocks {
            self.blocks.lock().insert(offset, data.clone());
        }
        Ok(data)
    }

    /// One column block with its CRC checked
    pub fn read_data_block(&self, seg: &Segment, ctx: &mut ReadContext) -> Result<Bytes> {
        let raw = self.read_data(seg.offset, seg.size, ctx)?;
        verify_crc_block(&raw)?;
        Ok(raw.slice(CRC_SIZE..))
    }

    /// Decode segment `segment` of `cm` and append it to `dst`, column-matched by name.
    ///
    /// Columns of `dst` that the series lacks are filled with nulls. Rows outside
    /// `ctx.time_range` are skipped.
    pub fn read_at(
        &self,
        cm: &ChunkMeta,
        segment: usize,
        dst: &mut Record,
        ctx: &mut ReadContext,
    ) -> Result<()> {
        let range = cm.time_ranges.get(segment).copied().ok_or_else(|| {
            TsspError::InvalidFormat(format!(
                "segment {} out of range, series {} has {}",
                segment,
                cm.sid,
                cm.segment_count()
            ))
        })?;
        let tr = ctx.time_range;
        if !tr.overlaps_bounds(range.min_time, range.max_time) {
            return Ok(());
        }

        let rows = range.rows as usize;
        let mut seg_rec = Record::new(dst.schema.clone(), false);
        for (i, field) in dst.schema.iter().enumerate() {
            let Some(ci) = cm.column_index(&field.name) else {
                seg_rec.col_vals[i].pad_nulls(rows);
                continue;
            };
            let col = &cm.columns[ci];
            if col.ty != field.ty {
                return Err(TsspError::InvalidFormat(format!(
                    "column {} is {} in file, {} requested",
                    field.name, col.ty, field.ty
                )));
            }
            let seg = col.segments.get(segment).ok_or_else(|| {
                TsspError::Corruption(format!("column {} lacks segment {}", col.name, segment))
            })?;
            let block = self.read_data_block(seg, ctx)?;
            let values = decode_column(&block, col.ty)?;
            if values.len() != rows {
                return Err(TsspError::Corruption(format!(
                    "column {} segment {} holds {} rows, expected {}",
                    col.name,
                    segment,
                    values.len(),
                    rows
                )));
            }
            seg_rec.col_vals[i] = values;
        }

        let times = seg_rec.times();
        let start = times.partition_point(|&t| t < tr.min);
        let end = times.partition_point(|&t| t <= tr.max);
        if start < end {
            dst.append_rec(&seg_rec, start, end);
        }
        Ok(())
    }

    /// Read every row of `sid` inside `ctx.time_range`.
    ///
    /// `schema` selects and orders the columns; the series' own schema is used when absent.
    pub fn read_series(
        &self,
        sid: SeriesId,
        schema: Option<&crate::Schema>,
        ctx: &mut ReadContext,
    ) -> Result<Option<Record>> {
        let Some(cm) = self.chunk_meta(sid, ctx.time_range)? else {
            return Ok(None);
        };
        let schema = schema.cloned().unwrap_or_else(|| cm.schema());
        let mut rec = Record::new(schema, false);
        for seg in 0..cm.segment_count() {
            self.read_at(&cm, seg, &mut rec, ctx)?;
        }
        Ok((!rec.is_empty()).then_some(rec))
    }
}

impl Drop for TsspFileReader {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            self.release();
        }
    }
}
