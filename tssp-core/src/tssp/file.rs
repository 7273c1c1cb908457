//! Reference-counted lifecycle of one TSSP file
//!
//! A [`TsspFile`] starts with one reference, held by the file set that registered it.
//! Queries and compactions take extra references through [`TsspFile::acquire`]. When
//! the count drops to zero the file stops accepting reads, its reader is closed, and the
//! file is deleted from disk if it was marked for removal.
//!
//! Two counters are involved: the file count decides when the file is retired, the
//! reader count (taken around every single access) decides when the byte source can be
//! dropped. An access started before `close` always completes against a live source.

use super::chunk_meta::ChunkMeta;
use super::file_name::TsspFileName;
use super::meta_index::{detached_meta_index_path, MetaIndex};
use super::reader::{ReadContext, TsspFileReader};
use super::trailer::Trailer;
use crate::options::Config;
use crate::record::Record;
use crate::{Result, Schema, SeriesId, TimeRange, Timestamp, TsspError};
use bytes::Bytes;
use parking_lot::RwLock;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TsspFile {
    name: TsspFileName,
    path: RwLock<PathBuf>,
    reader: TsspFileReader,
    refs: AtomicI64,
    stopped: AtomicBool,
    mark_remove: AtomicBool,
    retired: AtomicBool,
}

/// Scoped reader reference taken around one access
struct ReadGuard<'a>(&'a TsspFileReader);

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.unref_reader();
    }
}

impl TsspFile {
    /// Open a sealed file; `order` tells whether it belongs to the ordered set.
    pub fn open(path: &Path, order: bool, conf: &Config) -> Result<Arc<Self>> {
        let mut name = TsspFileName::parse(path)?;
        name.set_order(order);
        let reader = TsspFileReader::open(path, conf)?;
        Ok(Arc::new(Self {
            name,
            path: RwLock::new(path.to_path_buf()),
            reader,
            refs: AtomicI64::new(1),
            stopped: AtomicBool::new(false),
            mark_remove: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }))
    }

    pub fn file_name(&self) -> TsspFileName {
        self.name
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub fn level(&self) -> u16 {
        self.name.level
    }

    pub fn is_order(&self) -> bool {
        self.name.order
    }

    pub fn file_size(&self) -> u64 {
        self.reader.file_size()
    }

    /// Measurement recorded in the trailer
    pub fn measurement(&self) -> &str {
        &self.reader.trailer().name
    }

    /// Take a reference held until the returned guard drops
    pub fn acquire(self: &Arc<Self>) -> Result<FileRef> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TsspError::FileClosed);
        }
        self.ref_file();
        if self.stopped.load(Ordering::SeqCst) {
            self.unref_file();
            return Err(TsspError::FileClosed);
        }
        Ok(FileRef { file: self.clone() })
    }

    pub fn ref_file(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference; the last one retires the file.
    pub fn unref_file(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            self.refs.fetch_add(1, Ordering::SeqCst);
            warn!(path = %self.path().display(), "unbalanced file unref");
            return;
        }
        if prev == 1 {
            self.retire();
        }
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Delete the file from disk once it is retired
    pub fn mark_remove(&self) {
        self.mark_remove.store(true, Ordering::SeqCst);
    }

    pub fn is_marked_remove(&self) -> bool {
        self.mark_remove.load(Ordering::SeqCst)
    }

    /// Refuse further accesses; in-flight ones complete.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the file and close its reader without waiting for references
    pub fn close(&self) {
        self.stop();
        self.reader.close();
    }

    fn retire(&self) {
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        self.reader.close();
        if !self.mark_remove.load(Ordering::SeqCst) {
            return;
        }
        let path = self.path();
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "removed tssp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "tssp file already removed")
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove tssp file"),
        }
        let idx = detached_meta_index_path(&path);
        if idx.exists() {
            if let Err(e) = fs::remove_file(&idx) {
                warn!(path = %idx.display(), error = %e, "failed to remove detached meta index");
            }
        }
    }

    /// Move the file, for tier changes. Open handles stay valid.
    pub fn rename(&self, new_path: &Path) -> Result<()> {
        let _g = self.read_guard()?;
        let mut path = self.path.write();
        fs::rename(&*path, new_path).map_err(|e| TsspError::io_with_path("rename", &*path, e))?;
        debug!(from = %path.display(), to = %new_path.display(), "renamed tssp file");
        *path = new_path.to_path_buf();
        self.reader.set_path(new_path.to_path_buf());
        Ok(())
    }

    /// Free cached memory. Nothing is freed while any query or read holds the file.
    ///
    /// `force` additionally drops a copy loaded by [`load_into_memory`](Self::load_into_memory).
    pub fn free(&self, force: bool) -> usize {
        if self.ref_count() > 1 || self.reader.ref_count() > 0 {
            return 0;
        }
        self.reader.free_memory(force)
    }

    pub fn free_file_handle(&self) -> bool {
        self.reader.free_file_handle()
    }

    pub fn load_into_memory(&self) -> Result<()> {
        let _g = self.read_guard()?;
        self.reader.load_into_memory()
    }

    pub fn memory_size(&self) -> usize {
        self.reader.memory_size()
    }

    pub fn reader(&self) -> &TsspFileReader {
        &self.reader
    }

    fn read_guard(&self) -> Result<ReadGuard<'_>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TsspError::FileClosed);
        }
        self.reader.ref_reader();
        let guard = ReadGuard(&self.reader);
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TsspError::FileClosed);
        }
        Ok(guard)
    }

    pub fn trailer(&self) -> Result<Trailer> {
        let _g = self.read_guard()?;
        Ok(self.reader.trailer().clone())
    }

    pub fn min_max_time(&self) -> Result<(Timestamp, Timestamp)> {
        let _g = self.read_guard()?;
        Ok(self.reader.min_max_time())
    }

    pub fn contains(&self, sid: SeriesId) -> Result<bool> {
        let _g = self.read_guard()?;
        Ok(self.reader.contains(sid))
    }

    pub fn contains_value(&self, sid: SeriesId, tr: TimeRange) -> Result<bool> {
        let _g = self.read_guard()?;
        self.reader.contains_value(sid, tr)
    }

    pub fn meta_index_at(&self, idx: usize) -> Result<Option<MetaIndex>> {
        let _g = self.read_guard()?;
        self.reader.meta_index_at(idx)
    }

    pub fn meta_index(&self, sid: SeriesId, tr: TimeRange) -> Result<Option<(usize, MetaIndex)>> {
        let _g = self.read_guard()?;
        self.reader.meta_index(sid, tr)
    }

    pub fn read_chunk_meta_data(&self, idx: usize) -> Result<Arc<Vec<ChunkMeta>>> {
        let _g = self.read_guard()?;
        self.reader.read_chunk_meta_data(idx)
    }

    pub fn chunk_meta(&self, sid: SeriesId, tr: TimeRange) -> Result<Option<ChunkMeta>> {
        let _g = self.read_guard()?;
        self.reader.chunk_meta(sid, tr)
    }

    pub fn chunk_meta_at(&self, index: usize) -> Result<Option<ChunkMeta>> {
        let _g = self.read_guard()?;
        self.reader.chunk_meta_at(index)
    }

    pub fn all_chunk_metas(&self) -> Result<Vec<ChunkMeta>> {
        let _g = self.read_guard()?;
        self.reader.all_chunk_metas()
    }

    pub fn read_data(&self, offset: i64, size: u32, ctx: &mut ReadContext) -> Result<Bytes> {
        let _g = self.read_guard()?;
        self.reader.read_data(offset, size, ctx)
    }

    pub fn read_at(
        &self,
        cm: &ChunkMeta,
        segment: usize,
        dst: &mut Record,
        ctx: &mut ReadContext,
    ) -> Result<()> {
        let _g = self.read_guard()?;
        self.reader.read_at(cm, segment, dst, ctx)
    }

    pub fn read_series(
        &self,
        sid: SeriesId,
        schema: Option<&Schema>,
        ctx: &mut ReadContext,
    ) -> Result<Option<Record>> {
        let _g = self.read_guard()?;
        self.reader.read_series(sid, schema, ctx)
    }
}

impl Drop for TsspFile {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::SeqCst) {
            self.retire();
        }
    }
}

impl std::fmt::Debug for TsspFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsspFile")
            .field("name", &self.name)
            .field("path", &self.path())
            .field("refs", &self.ref_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A held reference to a [`TsspFile`], released on drop
pub struct FileRef {
    file: Arc<TsspFile>,
}

impl FileRef {
    pub fn file(&self) -> &Arc<TsspFile> {
        &self.file
    }
}

impl Deref for FileRef {
    type Target = TsspFile;

    fn deref(&self) -> &TsspFile {
        &self.file
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        self.file.unref_file();
    }
}
