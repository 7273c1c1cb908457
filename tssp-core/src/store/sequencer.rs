//! Per-series flush bookkeeping

use crate::{SeriesId, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Last flushed time and flushed row count of one series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdTime {
    pub time: Timestamp,
    pub rows: u64,
}

/// Per measurement, the [`IdTime`] of every series flushed to a file.
///
/// Rebuilt from the files when a store opens, then kept current as new files are added.
#[derive(Debug, Default)]
pub struct Sequencer {
    tables: RwLock<HashMap<String, HashMap<SeriesId, IdTime>>>,
    loading: AtomicBool,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str, sid: SeriesId) -> Option<IdTime> {
        self.tables.read().get(name)?.get(&sid).copied()
    }

    /// Record `rows` more rows of `sid`, flushed up to `max_time`.
    pub fn add_rows(&self, name: &str, sid: SeriesId, rows: u64, max_time: Timestamp) {
        let mut tables = self.tables.write();
        let entry = tables
            .entry(name.to_string())
            .or_default()
            .entry(sid)
            .or_insert(IdTime {
                time: Timestamp::MIN,
                rows: 0,
            });
        entry.rows += rows;
        entry.time = entry.time.max(max_time);
    }

    pub fn series_count(&self, name: &str) -> usize {
        self.tables.read().get(name).map_or(0, HashMap::len)
    }

    pub fn len(&self) -> usize {
        self.tables.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remove_measurement(&self, name: &str) {
        self.tables.write().remove(name);
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub(crate) fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    /// Drop everything; the next load starts from scratch.
    pub fn free(&self) {
        self.tables.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_rows() {
        let seq = Sequencer::new();
        assert!(seq.get("cpu", 1).is_none());
        seq.add_rows("cpu", 1, 10, 500);
        seq.add_rows("cpu", 1, 5, 300);
        seq.add_rows("cpu", 2, 1, 7);
        seq.add_rows("mem", 1, 3, 9);

        assert_eq!(seq.get("cpu", 1), Some(IdTime { time: 500, rows: 15 }));
        assert_eq!(seq.series_count("cpu"), 2);
        assert_eq!(seq.len(), 3);

        seq.remove_measurement("cpu");
        assert_eq!(seq.series_count("cpu"), 0);
        assert_eq!(seq.get("mem", 1).map(|t| t.rows), Some(3));
        seq.free();
        assert!(seq.is_empty());
    }
}
