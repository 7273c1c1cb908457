//! Compaction planning and merging
//!
//! Planning picks groups of files per measurement and marks their names as in
//! compaction, so no file ever belongs to two running merges. The marks are cleared
//! through [`CompactGuard`] whether the merge succeeds or fails.

mod merge;
mod planner;

pub(crate) use merge::{merge_files, MergeStats};
pub use planner::{full_plan, level_plan, out_of_order_plan, OutOfOrderPlan};

use crate::tssp::{TsspFile, TsspFileName};
use crate::Timestamp;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

/// What the planner needs to know about a file
pub trait PlanFile {
    fn file_name(&self) -> TsspFileName;

    fn path(&self) -> PathBuf;

    fn min_max_time(&self) -> Option<(Timestamp, Timestamp)> {
        None
    }
}

impl PlanFile for TsspFile {
    fn file_name(&self) -> TsspFileName {
        TsspFile::file_name(self)
    }

    fn path(&self) -> PathBuf {
        TsspFile::path(self)
    }

    fn min_max_time(&self) -> Option<(Timestamp, Timestamp)> {
        TsspFile::min_max_time(self).ok()
    }
}

impl<T: PlanFile + ?Sized> PlanFile for Arc<T> {
    fn file_name(&self) -> TsspFileName {
        (**self).file_name()
    }

    fn path(&self) -> PathBuf {
        (**self).path()
    }

    fn min_max_time(&self) -> Option<(Timestamp, Timestamp)> {
        (**self).min_max_time()
    }
}

/// Files of one measurement selected to be merged together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactGroup {
    /// Measurement
    pub name: String,
    /// File names in sequence order
    pub group: Vec<String>,
    /// Level of the input files
    pub level: u16,
}

impl CompactGroup {
    pub fn len(&self) -> usize {
        self.group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }
}

/// Names of the files currently being merged
#[derive(Debug, Default)]
pub struct InCompact {
    names: Mutex<HashSet<String>>,
}

impl InCompact {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }

    /// Mark all of `names` unless one of them is already marked.
    pub fn try_mark(&self, names: &[String]) -> bool {
        let mut set = self.names.lock();
        if names.iter().any(|n| set.contains(n)) {
            return false;
        }
        set.extend(names.iter().cloned());
        true
    }

    pub fn done(&self, names: &[String]) {
        let mut set = self.names.lock();
        for n in names {
            set.remove(n);
        }
    }

    /// Run `f` with the set locked, so checks and marks made inside are atomic.
    pub(crate) fn with_locked<R>(&self, f: impl FnOnce(&mut HashSet<String>) -> R) -> R {
        f(&mut self.names.lock())
    }
}

/// Clears the in-compaction marks of a group when dropped
#[must_use = "dropping the guard releases the group immediately"]
pub struct CompactGuard {
    in_compact: Arc<InCompact>,
    names: Vec<String>,
}

impl CompactGuard {
    pub fn new(in_compact: Arc<InCompact>, names: Vec<String>) -> Self {
        Self { in_compact, names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for CompactGuard {
    fn drop(&mut self) {
        self.in_compact.done(&self.names);
    }
}
