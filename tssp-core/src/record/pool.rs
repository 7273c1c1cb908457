//! Bounded record recycling

use super::{Record, REC_MAX_LEN_FOR_REUSE, REC_MAX_ROW_NUM_FOR_REUSE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Usage category of a pool, reported in its statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Write,
    Read,
    Compact,
    Merge,
}

/// Counters describing pool effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordPoolStats {
    /// `get` served from the pool
    pub hits: u64,
    /// `get` that allocated a fresh record
    pub allocs: u64,
    /// `put` that dropped an oversized record
    pub aborts: u64,
}

/// A fixed-capacity free list of [`Record`]s.
///
/// Records wider than [`REC_MAX_LEN_FOR_REUSE`] columns or longer than
/// [`REC_MAX_ROW_NUM_FOR_REUSE`] rows are dropped on `put` instead of being retained.
pub struct RecordPool {
    kind: RecordKind,
    capacity: usize,
    free: Mutex<Vec<Record>>,
    hits: AtomicU64,
    allocs: AtomicU64,
    aborts: AtomicU64,
}

impl RecordPool {
    pub fn new(kind: RecordKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
            hits: AtomicU64::new(0),
            allocs: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Take an empty record from the pool, or allocate one
    pub fn get(&self) -> Record {
        if let Some(rec) = self.free.lock().pop() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return rec;
        }
        self.allocs.fetch_add(1, Ordering::Relaxed);
        Record::default()
    }

    /// Return a record to the pool
    pub fn put(&self, mut rec: Record) {
        if rec.col_nums() > REC_MAX_LEN_FOR_REUSE || rec.row_nums() > REC_MAX_ROW_NUM_FOR_REUSE {
            self.aborts.fetch_add(1, Ordering::Relaxed);
            return;
        }
        rec.reset_for_reuse();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(rec);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RecordPoolStats {
        RecordPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            allocs: self.allocs.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::float_record;

    #[test]
    fn test_pool_reuses_records() {
        let pool = RecordPool::new(RecordKind::Read, 2);
        let rec = pool.get();
        assert_eq!(pool.stats().allocs, 1);

        pool.put(rec);
        assert_eq!(pool.len(), 1);
        let rec = pool.get();
        assert!(rec.schema.is_empty());
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_pool_drops_oversized_records() {
        let pool = RecordPool::new(RecordKind::Compact, 4);
        let rows: Vec<_> = (0..REC_MAX_ROW_NUM_FOR_REUSE as i64 + 1)
            .map(|t| (t, Some(1.0)))
            .collect();
        pool.put(float_record("v", &rows));
        assert!(pool.is_empty());
        assert_eq!(pool.stats().aborts, 1);

        pool.put(float_record("v", &[(1, Some(1.0))]));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_pool_capacity_bound() {
        let pool = RecordPool::new(RecordKind::Write, 1);
        pool.put(Record::default());
        pool.put(Record::default());
        assert_eq!(pool.len(), 1);
    }
}
