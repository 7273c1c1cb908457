//! Table store: every TSSP file of one shard, grouped by measurement
//!
//! Layout on disk:
//!
//! ```text
//! <shard dir>/<measurement>/<seq>-<level>-<merge><extent>.tssp
//! <shard dir>/<measurement>/out-of-order/<seq>-<level>-<merge><extent>.tssp
//! ```

mod compact;
mod sequencer;

pub use sequencer::{IdTime, Sequencer};

use crate::compaction::InCompact;
use crate::options::Config;
use crate::record::{RecordKind, RecordPool, RecordPoolStats};
use crate::tssp::{
    FileRef, MsBuilder, TsspFile, TsspFileName, TsspFiles, OUT_OF_ORDER_DIR, TSSP_FILE_SUFFIX,
};
use crate::{Result, TimeRange, TsspError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Storage tier of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tier {
    Hot = 1,
    Warm = 2,
    Cold = 3,
}

impl Tier {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => Tier::Warm,
            3 => Tier::Cold,
            _ => Tier::Hot,
        }
    }
}

/// Ordered and out-of-order files of one measurement
#[derive(Default)]
pub struct TableFiles {
    pub order: TsspFiles,
    pub out_of_order: TsspFiles,
}

impl TableFiles {
    pub fn files(&self, order: bool) -> &TsspFiles {
        if order {
            &self.order
        } else {
            &self.out_of_order
        }
    }

    fn all(&self) -> Vec<Arc<TsspFile>> {
        let mut all = self.order.snapshot().as_ref().clone();
        all.extend(self.out_of_order.snapshot().iter().cloned());
        all
    }
}

pub struct MmsTables {
    dir: PathBuf,
    conf: Arc<Config>,
    tables: RwLock<HashMap<String, Arc<TableFiles>>>,
    sequencer: Arc<Sequencer>,
    in_compact: Arc<InCompact>,
    next_seq: AtomicU64,
    tier: AtomicU8,
    closed: AtomicBool,
    compaction_enabled: AtomicBool,
    merge_enabled: AtomicBool,
    merge_pool: RecordPool,
    load_lock: Mutex<()>,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl MmsTables {
    /// Create an empty store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, conf: Arc<Config>) -> Result<Self> {
        conf.validate()?;
        let merge_pool = RecordPool::new(RecordKind::Merge, conf.record_pool_capacity);
        Ok(Self {
            dir: dir.into(),
            conf,
            tables: RwLock::new(HashMap::new()),
            sequencer: Arc::new(Sequencer::new()),
            in_compact: Arc::new(InCompact::new()),
            next_seq: AtomicU64::new(1),
            tier: AtomicU8::new(Tier::Hot as u8),
            closed: AtomicBool::new(false),
            compaction_enabled: AtomicBool::new(true),
            merge_enabled: AtomicBool::new(true),
            merge_pool,
            load_lock: Mutex::new(()),
            loader: Mutex::new(None),
        })
    }

    /// Open the files under `dir`.
    ///
    /// Unfinished `.init` files left by a crash are deleted. Returns the store and the
    /// highest sequence found on disk; new files are numbered after it.
    pub fn open(dir: impl Into<PathBuf>, conf: Arc<Config>) -> Result<(Arc<Self>, u64)> {
        let start = Instant::now();
        let store = Self::new(dir, conf)?;
        fs::create_dir_all(&store.dir).map_err(|e| TsspError::io_with_path("mkdir", &store.dir, e))?;

        let mut max_seq = 0;
        let mut file_count = 0;
        for entry in read_dir(&store.dir)? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let table = TableFiles::default();
            for order in [true, false] {
                let dir = if order { path.clone() } else { path.join(OUT_OF_ORDER_DIR) };
                let files = store.open_dir(&dir, order)?;
                for f in &files {
                    max_seq = max_seq.max(f.file_name().seq);
                }
                file_count += files.len();
                table.files(order).add_files(files);
            }
            if !table.order.is_empty() || !table.out_of_order.is_empty() {
                store.tables.write().insert(name, Arc::new(table));
            }
        }
        store.next_seq.store(max_seq + 1, Ordering::SeqCst);
        info!(
            path = %store.dir.display(),
            measurements = store.tables.read().len(),
            files = file_count,
            max_seq,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "opened table store"
        );

        let store = Arc::new(store);
        if store.conf.load_id_times_on_open {
            let loader = store.clone();
            let handle = std::thread::Builder::new()
                .name("tssp-load-id-times".into())
                .spawn(move || {
                    loader.load_id_times_in_lock();
                })?;
            *store.loader.lock() = Some(handle);
        }
        Ok((store, max_seq))
    }

    fn open_dir(&self, dir: &Path, order: bool) -> Result<Vec<Arc<TsspFile>>> {
        let mut files = Vec::new();
        if !dir.is_dir() {
            return Ok(files);
        }
        for entry in read_dir(dir)? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if TsspFileName::is_tmp(&path) {
                match fs::remove_file(&path) {
                    Ok(()) => info!(path = %path.display(), "removed unfinished tssp file"),
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove unfinished tssp file"),
                }
                continue;
            }
            if !path.to_str().map_or(false, |p| p.ends_with(TSSP_FILE_SUFFIX)) {
                continue;
            }
            files.push(TsspFile::open(&path, order, &self.conf)?);
        }
        Ok(files)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.conf
    }

    /// Record reuse of compaction and out-of-order merges
    pub fn merge_pool_stats(&self) -> RecordPoolStats {
        self.merge_pool.stats()
    }

    /// Directory holding the files of measurement `name`
    pub fn mst_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Builder for a new file of `name` with the next sequence
    pub fn new_builder(&self, name: &str, order: bool) -> MsBuilder {
        let file_name = TsspFileName::new(self.next_sequence(), 0, 0, 0, order);
        MsBuilder::new(self.mst_dir(name), name, file_name, self.conf.clone())
    }

    pub fn sequencer(&self) -> Arc<Sequencer> {
        self.sequencer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TsspError::StoreClosed);
        }
        Ok(())
    }

    fn table(&self, name: &str) -> Option<Arc<TableFiles>> {
        self.tables.read().get(name).cloned()
    }

    fn table_or_create(&self, name: &str) -> Arc<TableFiles> {
        if let Some(t) = self.table(name) {
            return t;
        }
        self.tables
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TableFiles::default()))
            .clone()
    }

    /// Seal `builder` and register its files.
    ///
    /// The sequencer counts the new rows unless `tmp` is set, which marks files that
    /// hold data already counted elsewhere.
    pub fn add_table(&self, builder: MsBuilder, order: bool, tmp: bool) -> Result<Vec<Arc<TsspFile>>> {
        self.check_open()?;
        let name = builder.name().to_string();
        let files = builder.finish()?;
        if files.is_empty() {
            return Ok(files);
        }
        if !tmp {
            for file in &files {
                for cm in file.all_chunk_metas()? {
                    self.sequencer
                        .add_rows(&name, cm.sid, cm.rows() as u64, cm.max_time());
                }
            }
        }
        self.add_tssp_files(&name, order, files.clone());
        Ok(files)
    }

    pub fn add_tssp_files(&self, name: &str, order: bool, files: Vec<Arc<TsspFile>>) {
        debug!(measurement = name, order, files = files.len(), "adding tssp files");
        self.table_or_create(name).files(order).add_files(files);
    }

    /// Swap `old` for `new` in one set of `name`.
    ///
    /// Replaced files are deleted once the last reader lets go of them.
    pub fn replace_files(
        &self,
        name: &str,
        old: &[TsspFileName],
        new: Vec<Arc<TsspFile>>,
        order: bool,
    ) -> Result<()> {
        let Some(table) = self.table(name) else {
            // measurement dropped while the new files were built
            for f in new {
                f.mark_remove();
                f.unref_file();
            }
            return Ok(());
        };
        let added = new.len();
        let removed = table.files(order).replace(old, new);
        for f in &removed {
            f.mark_remove();
            f.unref_file();
        }
        info!(
            measurement = name,
            order,
            removed = removed.len(),
            added,
            "replaced tssp files"
        );
        Ok(())
    }

    /// Swap ordered files for their down-sampled versions.
    pub fn replace_down_sample_files(
        &self,
        name: &str,
        old: &[TsspFileName],
        new: Vec<Arc<TsspFile>>,
    ) -> Result<()> {
        self.check_open()?;
        if old.iter().any(|n| self.in_compact.contains(&n.file_name())) {
            return Err(TsspError::Internal(format!(
                "{}: down-sampled files are being compacted",
                name
            )));
        }
        debug!(measurement = name, files = old.len(), "replacing down-sampled files");
        self.replace_files(name, old, new, true)
    }

    /// Remove measurement `name` and delete its files. Concurrent calls are harmless.
    pub fn drop_measurement(&self, name: &str) -> Result<()> {
        let Some(table) = self.tables.write().remove(name) else {
            return Ok(());
        };
        let files = table.all();
        for f in &files {
            f.stop();
        }
        for f in table.order.take_all().into_iter().chain(table.out_of_order.take_all()) {
            f.mark_remove();
            f.unref_file();
        }
        self.sequencer.remove_measurement(name);

        let dir = self.mst_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(TsspError::io_with_path("remove", &dir, e)),
        }
        info!(measurement = name, files = files.len(), "dropped measurement");
        Ok(())
    }

    /// Rebuild the sequencer from the files. Returns the number of rows counted, or 0
    /// when the store closes before the scan completes.
    pub fn load_id_times_in_lock(&self) -> u64 {
        let _lock = self.load_lock.lock();
        if self.is_closed() {
            return 0;
        }
        let start = Instant::now();
        self.sequencer.set_loading(true);
        self.sequencer.free();

        let tables: Vec<(String, Arc<TableFiles>)> = self
            .tables
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut rows = 0u64;
        for (name, table) in tables {
            for file in table.all() {
                if self.is_closed() {
                    self.sequencer.set_loading(false);
                    return 0;
                }
                let Ok(file) = file.acquire() else {
                    continue;
                };
                let metas = match file.all_chunk_metas() {
                    Ok(m) => m,
                    Err(e) if e.is_closed() => continue,
                    Err(e) => {
                        error!(path = %file.path().display(), error = %e, "failed to load series times");
                        continue;
                    }
                };
                for cm in metas {
                    self.sequencer
                        .add_rows(&name, cm.sid, cm.rows() as u64, cm.max_time());
                    rows += cm.rows() as u64;
                }
            }
        }
        self.sequencer.set_loading(false);
        info!(
            series = self.sequencer.len(),
            rows,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "loaded series times"
        );
        rows
    }

    /// Current files of one set of `name`
    pub fn table_files(&self, name: &str, order: bool) -> Option<Arc<Vec<Arc<TsspFile>>>> {
        Some(self.table(name)?.files(order).snapshot())
    }

    pub fn file(&self, name: &str, path: &Path, order: bool) -> Option<Arc<TsspFile>> {
        self.table(name)?.files(order).get_by_path(path)
    }

    /// References to the ordered and out-of-order files of `name` overlapping `tr`
    pub fn get_both_files_ref(&self, name: &str, tr: TimeRange) -> Result<(Vec<FileRef>, Vec<FileRef>)> {
        self.check_open()?;
        let Some(table) = self.table(name) else {
            return Ok((Vec::new(), Vec::new()));
        };
        let pick = |files: &TsspFiles| -> Result<Vec<FileRef>> {
            let mut refs = Vec::new();
            for f in files.snapshot().iter() {
                let r = match f.acquire() {
                    Ok(r) => r,
                    // replaced after the snapshot was taken
                    Err(e) if e.is_closed() => continue,
                    Err(e) => return Err(e),
                };
                let (min, max) = match r.min_max_time() {
                    Ok(t) => t,
                    // stopped by a concurrent drop
                    Err(e) if e.is_closed() => continue,
                    Err(e) => return Err(e),
                };
                if tr.overlaps_bounds(min, max) {
                    refs.push(r);
                }
            }
            Ok(refs)
        };
        Ok((pick(&table.order)?, pick(&table.out_of_order)?))
    }

    pub fn measurements(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn disk_size(&self) -> u64 {
        self.tables
            .read()
            .values()
            .map(|t| t.order.disk_size() + t.out_of_order.disk_size())
            .sum()
    }

    /// Release cached memory of every unused file
    pub fn free_all_memory(&self) -> usize {
        let tables: Vec<Arc<TableFiles>> = self.tables.read().values().cloned().collect();
        let freed = tables
            .iter()
            .flat_map(|t| t.all())
            .map(|f| f.free(false))
            .sum();
        debug!(freed, "freed file memory");
        freed
    }

    pub fn tier(&self) -> Tier {
        Tier::from_u8(self.tier.load(Ordering::SeqCst))
    }

    pub fn set_tier(&self, tier: Tier) {
        let prev = self.tier.swap(tier as u8, Ordering::SeqCst);
        if prev != tier as u8 {
            info!(path = %self.dir.display(), ?tier, "changed tier");
        }
    }

    pub fn compaction_enable(&self) {
        self.compaction_enabled.store(true, Ordering::SeqCst);
    }

    pub fn compaction_disable(&self) {
        self.compaction_enabled.store(false, Ordering::SeqCst);
    }

    pub fn compaction_enabled(&self) -> bool {
        self.compaction_enabled.load(Ordering::SeqCst)
    }

    pub fn merge_enable(&self) {
        self.merge_enabled.store(true, Ordering::SeqCst);
    }

    pub fn merge_disable(&self) {
        self.merge_enabled.store(false, Ordering::SeqCst);
    }

    pub fn merge_enabled(&self) -> bool {
        self.merge_enabled.load(Ordering::SeqCst)
    }

    /// Close the store. Files still referenced by readers are released when the last
    /// reference drops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let loader = self.loader.lock().take();
        // the loader itself may drop the last handle to the store
        if let Some(handle) = loader.filter(|h| h.thread().id() != std::thread::current().id()) {
            if handle.join().is_err() {
                warn!("series time loader panicked");
            }
        }
        let tables: Vec<Arc<TableFiles>> = self.tables.write().drain().map(|(_, t)| t).collect();
        let mut count = 0;
        for table in tables {
            table.order.stop_files();
            table.out_of_order.stop_files();
            for f in table.order.take_all().into_iter().chain(table.out_of_order.take_all()) {
                f.close();
                f.unref_file();
                count += 1;
            }
        }
        info!(path = %self.dir.display(), files = count, "closed table store");
        Ok(())
    }
}

impl Drop for MmsTables {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close table store");
        }
    }
}

fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let entries = fs::read_dir(dir).map_err(|e| TsspError::io_with_path("read dir", dir, e))?;
    let mut out = entries
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| TsspError::io_with_path("read dir", dir, e))?;
    out.sort_by_key(|e| e.file_name());
    Ok(out)
}
