//! Sorted, copy-on-write set of the files of one measurement

use super::file::TsspFile;
use super::file_name::TsspFileName;
use crate::compaction::PlanFile;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

/// Files of one measurement and order kind, sorted by name.
///
/// Readers take a [`snapshot`](Self::snapshot) and never observe a half-applied
/// update: every mutation builds a new list and swaps it in under the write lock.
#[derive(Default)]
pub struct TsspFiles {
    files: RwLock<Arc<Vec<Arc<TsspFile>>>>,
}

impl TsspFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files(mut files: Vec<Arc<TsspFile>>) -> Self {
        files.sort_by_key(|f| f.file_name());
        Self {
            files: RwLock::new(Arc::new(files)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<TsspFile>>> {
        self.files.read().clone()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    pub fn add(&self, file: Arc<TsspFile>) {
        self.add_files(std::iter::once(file));
    }

    pub fn add_files(&self, files: impl IntoIterator<Item = Arc<TsspFile>>) {
        let mut guard = self.files.write();
        let mut next = guard.as_ref().clone();
        for file in files {
            let name = file.file_name();
            let at = next.partition_point(|f| f.file_name() < name);
            next.insert(at, file);
        }
        *guard = Arc::new(next);
    }

    /// Swap the files named in `old` for `new` in one step.
    ///
    /// Returns the files taken out of the set; the caller owns their set reference.
    pub fn replace(&self, old: &[TsspFileName], new: Vec<Arc<TsspFile>>) -> Vec<Arc<TsspFile>> {
        let mut guard = self.files.write();
        let (removed, mut kept): (Vec<_>, Vec<_>) = guard
            .iter()
            .cloned()
            .partition(|f| old.contains(&f.file_name()));
        kept.extend(new);
        kept.sort_by_key(|f| f.file_name());
        *guard = Arc::new(kept);
        removed
    }

    pub fn remove(&self, name: &TsspFileName) -> Option<Arc<TsspFile>> {
        self.replace(std::slice::from_ref(name), Vec::new()).pop()
    }

    pub fn get(&self, name: &TsspFileName) -> Option<Arc<TsspFile>> {
        let files = self.files.read();
        files
            .binary_search_by(|f| f.file_name().cmp(name))
            .ok()
            .map(|i| files[i].clone())
    }

    pub fn get_by_path(&self, path: &Path) -> Option<Arc<TsspFile>> {
        self.files.read().iter().find(|f| f.path() == path).cloned()
    }

    pub fn contains(&self, name: &TsspFileName) -> bool {
        self.get(name).is_some()
    }

    /// True when all files are extents of one logical file
    pub fn full_compacted(&self) -> bool {
        let names: Vec<TsspFileName> = self.files.read().iter().map(|f| f.file_name()).collect();
        full_compacted_names(&names)
    }

    pub fn max_level(&self) -> u16 {
        self.files.read().iter().map(|f| f.level()).max().unwrap_or(0)
    }

    pub fn disk_size(&self) -> u64 {
        self.files.read().iter().map(|f| f.file_size()).sum()
    }

    /// Empty the set and hand back its files
    pub fn take_all(&self) -> Vec<Arc<TsspFile>> {
        let mut guard = self.files.write();
        let files = std::mem::take(&mut *guard);
        Arc::try_unwrap(files).unwrap_or_else(|shared| shared.as_ref().clone())
    }

    /// Reject new accesses to every file; in-flight reads complete.
    pub fn stop_files(&self) {
        self.files.read().iter().for_each(|f| f.stop());
    }
}

pub(crate) fn full_compacted_names(names: &[TsspFileName]) -> bool {
    match names.first() {
        Some(first) => names.iter().all(|n| n.seq == first.seq),
        None => true,
    }
}

/// Order files by max time, then by sequence.
pub fn compare_file<F: PlanFile>(a: &F, b: &F) -> Ordering {
    let max = |f: &F| f.min_max_time().map_or(i64::MIN, |(_, max)| max);
    max(a)
        .cmp(&max(b))
        .then_with(|| a.file_name().seq.cmp(&b.file_name().seq))
}

/// Order files by min time, then by sequence; used by descending scans.
pub fn compare_file_by_descend<F: PlanFile>(a: &F, b: &F) -> Ordering {
    let min = |f: &F| f.min_max_time().map_or(i64::MIN, |(min, _)| min);
    min(a)
        .cmp(&min(b))
        .then_with(|| a.file_name().seq.cmp(&b.file_name().seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::tests::FakeFile;
    use crate::tssp::builder::tests::{series_record, small_conf, write_file};
    use tempfile::TempDir;

    #[test]
    fn test_full_compacted() {
        let cases: Vec<(Vec<(u64, u16, u16)>, bool)> = vec![
            (vec![(1, 3, 0)], true),
            (vec![(1, 0, 0)], true),
            (vec![(1, 3, 0), (1, 3, 1), (1, 3, 2), (1, 3, 3)], true),
            (vec![(1, 3, 0), (1, 3, 1), (2, 3, 0), (2, 3, 1)], false),
            (vec![(1, 1, 0), (2, 1, 0), (3, 1, 0), (4, 1, 0), (5, 1, 0)], false),
            (vec![(1, 0, 0), (2, 0, 0), (3, 0, 0), (4, 0, 0)], false),
            (vec![(1, 3, 0), (2, 1, 0), (3, 0, 0), (4, 0, 0)], false),
        ];
        for (files, exp) in cases {
            let names: Vec<TsspFileName> = files
                .iter()
                .map(|&(seq, level, extent)| TsspFileName::new(seq, level, 0, extent, true))
                .collect();
            assert_eq!(full_compacted_names(&names), exp, "{:?}", files);
        }
    }

    #[test]
    fn test_compare_file() {
        let f1 = FakeFile::with_time("00000001-0000-00000000.tssp", 10, 20);
        let f2 = FakeFile::with_time("00000002-0000-00000000.tssp", 10, 30);
        let f3 = FakeFile::with_time("00000003-0000-00000000.tssp", 15, 18);
        let f4 = FakeFile::with_time("00000004-0000-00000000.tssp", 13, 20);

        assert_eq!(compare_file(&f1, &f2), Ordering::Less);
        assert_eq!(compare_file(&f1, &f3), Ordering::Greater);
        assert_eq!(compare_file(&f3, &f2), Ordering::Less);
        assert_eq!(compare_file(&f1, &f4), Ordering::Less);

        assert_eq!(compare_file_by_descend(&f1, &f4), Ordering::Less);
        assert_eq!(compare_file_by_descend(&f2, &f4), Ordering::Less);
        assert_eq!(compare_file_by_descend(&f3, &f4), Ordering::Greater);
        assert_eq!(compare_file_by_descend(&f1, &f2), Ordering::Less);
    }

    #[test]
    fn test_copy_on_write_updates() {
        let dir = TempDir::new().unwrap();
        let conf = small_conf();
        let mk = |seq: u64, level: u16| {
            write_file(
                dir.path(),
                "cpu",
                TsspFileName::new(seq, level, 0, 0, true),
                conf.clone(),
                &[(1, series_record(seq as i64 * 100, 1, 10))],
            )
        };

        let files = TsspFiles::from_files(vec![mk(3, 0), mk(1, 0)]);
        files.add(mk(2, 0));
        let before = files.snapshot();
        let seqs: Vec<u64> = before.iter().map(|f| f.file_name().seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(!files.full_compacted());

        let merged = mk(1, 1);
        let old: Vec<TsspFileName> = before.iter().map(|f| f.file_name()).collect();
        let removed = files.replace(&old, vec![merged.clone()]);
        assert_eq!(removed.len(), 3);
        assert_eq!(before.len(), 3);
        assert_eq!(files.len(), 1);
        assert!(files.full_compacted());
        assert_eq!(files.max_level(), 1);
        assert!(files.get(&merged.file_name()).is_some());
        assert!(files.get_by_path(&merged.path()).is_some());
        assert!(files.get(&old[1]).is_none());
        assert_eq!(files.disk_size(), merged.file_size());

        assert!(files.remove(&merged.file_name()).is_some());
        assert!(files.is_empty());
    }
}
