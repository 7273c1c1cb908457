//! Compaction driven by the table store

use super::{MmsTables, TableFiles};
use crate::compaction::{
    full_plan, level_plan, merge_files, out_of_order_plan, CompactGroup, CompactGuard, MergeStats,
};
use crate::tssp::{FileRef, MsBuilder, TsspFile, TsspFileName};
use crate::{Result, TsspError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

impl MmsTables {
    fn compaction_stopped(&self) -> bool {
        self.is_closed() || !self.compaction_enabled.load(Ordering::SeqCst)
    }

    fn merge_stopped(&self) -> bool {
        self.is_closed() || !self.merge_enabled.load(Ordering::SeqCst)
    }

    /// Plan level compaction at `level` for every measurement.
    ///
    /// Files at `max_level` are never compacted further. The files of the returned
    /// groups stay marked until [`compact_done`](Self::compact_done) is called for
    /// each group.
    pub fn level_plan(&self, level: u16) -> Vec<CompactGroup> {
        if self.compaction_stopped() || level >= self.conf.max_level {
            return Vec::new();
        }
        let min_group = self.conf.min_group_files(level);
        let mut plans = Vec::new();
        for name in self.measurements() {
            let Some(table) = self.table(&name) else {
                continue;
            };
            if table.order.full_compacted() {
                continue;
            }
            let files = table.order.snapshot();
            plans.extend(level_plan(&name, &files, level, min_group, &self.in_compact));
        }
        plans
    }

    /// Release the files of a finished group
    pub fn compact_done(&self, group: &[String]) {
        self.in_compact.done(group);
    }

    /// Plan and run level compaction at `level`, `compact_threads` groups at a time.
    ///
    /// Returns the number of groups merged. Failed groups leave their input files in
    /// place; the first failure is returned after every group has run.
    pub fn level_compact(&self, level: u16) -> Result<usize> {
        let plans = self.level_plan(level);
        if plans.is_empty() {
            return Ok(0);
        }
        let threads = self.conf.compact_threads.max(1);
        let mut done = 0;
        let mut first_err = None;
        let mut pending = plans.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<CompactGroup> = pending.by_ref().take(threads).collect();
            let results: Vec<Result<()>> = std::thread::scope(|s| {
                let handles: Vec<_> = batch
                    .into_iter()
                    .map(|plan| s.spawn(move || self.compact_group(plan)))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join()
                            .unwrap_or_else(|_| Err(TsspError::Internal("compaction worker panicked".into())))
                    })
                    .collect()
            });
            for r in results {
                match r {
                    Ok(()) => done += 1,
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }

    /// Merge the files of one planned group into the next level.
    pub fn compact_group(&self, plan: CompactGroup) -> Result<()> {
        let guard = CompactGuard::new(self.in_compact.clone(), plan.group.clone());
        let Some(table) = self.table(&plan.name) else {
            return Ok(());
        };
        let names = parse_names(guard.names(), true)?;
        let Some(first) = names.first().copied() else {
            return Ok(());
        };
        let next = plan
            .level
            .checked_add(1)
            .filter(|l| *l <= self.conf.max_level)
            .ok_or_else(|| {
                TsspError::Internal(format!("{}: level {} is already the highest", plan.name, plan.level))
            })?;
        let out = TsspFileName::new(first.seq, next, first.merge, 0, true);
        let result = self.merge_into(&plan.name, &table, &names, &[], out, || self.compaction_stopped());
        self.log_result("level compaction", &plan.name, plan.level, &names, &result);
        let (files, _) = result?;
        self.replace_files(&plan.name, &names, files, true)
    }

    /// Merge every ordered file of `name` into one logical file.
    ///
    /// Returns false when there was nothing to do.
    pub fn full_compact(&self, name: &str) -> Result<bool> {
        if self.compaction_stopped() {
            return Ok(false);
        }
        let Some(table) = self.table(name) else {
            return Ok(false);
        };
        let files = table.order.snapshot();
        let Some(plan) = full_plan(name, &files, &self.in_compact) else {
            return Ok(false);
        };
        let guard = CompactGuard::new(self.in_compact.clone(), plan.group);
        let names = parse_names(guard.names(), true)?;
        let Some(first) = names.first().copied() else {
            return Ok(false);
        };
        let out = TsspFileName::new(first.seq, plan.level, next_merge(name, &first)?, 0, true);
        let result = self.merge_into(name, &table, &names, &[], out, || self.compaction_stopped());
        self.log_result("full compaction", name, plan.level, &names, &result);
        let (files, _) = result?;
        self.replace_files(name, &names, files, true)?;
        Ok(true)
    }

    /// Fold the out-of-order files of `name` into its ordered files.
    ///
    /// Returns false when there was nothing to do.
    pub fn merge_out_of_order(&self, name: &str) -> Result<bool> {
        if self.merge_stopped() {
            return Ok(false);
        }
        let Some(table) = self.table(name) else {
            return Ok(false);
        };
        let unordered = table.out_of_order.snapshot();
        let ordered = table.order.snapshot();
        let Some(plan) = out_of_order_plan(name, &unordered, &ordered, &self.in_compact) else {
            return Ok(false);
        };
        let _guard = CompactGuard::new(self.in_compact.clone(), plan.names());
        let order_names = parse_names(&plan.order, true)?;
        let unordered_names = parse_names(&plan.out_of_order, false)?;

        let base = order_names
            .first()
            .or(unordered_names.first())
            .copied()
            .ok_or_else(|| TsspError::Internal("empty out-of-order plan".into()))?;
        let out = TsspFileName::new(base.seq, base.level, next_merge(name, &base)?, 0, true);
        let level = base.level;
        let result = self.merge_into(name, &table, &order_names, &unordered_names, out, || {
            self.merge_stopped()
        });
        let all: Vec<TsspFileName> = order_names.iter().chain(&unordered_names).copied().collect();
        self.log_result("out-of-order merge", name, level, &all, &result);
        let (files, _) = result?;
        // ordered side first, so the merged rows are never missing from both sets
        self.replace_files(name, &order_names, files, true)?;
        self.replace_files(name, &unordered_names, Vec::new(), false)?;
        Ok(true)
    }

    fn merge_into(
        &self,
        name: &str,
        table: &TableFiles,
        order: &[TsspFileName],
        out_of_order: &[TsspFileName],
        out: TsspFileName,
        stop: impl Fn() -> bool,
    ) -> Result<(Vec<Arc<TsspFile>>, MergeStats)> {
        let mut inputs: Vec<FileRef> = Vec::with_capacity(order.len() + out_of_order.len());
        for (names, ordered) in [(order, true), (out_of_order, false)] {
            for fname in names {
                let file = table
                    .files(ordered)
                    .get(fname)
                    .ok_or_else(|| TsspError::Internal(format!("{}: {} left the file set", name, fname)))?;
                inputs.push(file.acquire()?);
            }
        }
        // newest data first
        inputs.sort_by_key(|f| std::cmp::Reverse(f.file_name().seq));

        let builder = MsBuilder::new(self.mst_dir(name), name, out, self.conf.clone());
        merge_files(&inputs, builder, &self.merge_pool, &stop)
    }

    fn log_result(
        &self,
        kind: &str,
        name: &str,
        level: u16,
        inputs: &[TsspFileName],
        result: &Result<(Vec<Arc<TsspFile>>, MergeStats)>,
    ) {
        let files: Vec<String> = inputs.iter().map(TsspFileName::file_name).collect();
        match result {
            Ok((out, stats)) => info!(
                measurement = name,
                level,
                files = ?files,
                outputs = out.len(),
                rows = stats.rows_out,
                "{} finished",
                kind
            ),
            Err(TsspError::CompactionStopped) => {
                warn!(measurement = name, level, files = ?files, "{} stopped", kind)
            }
            Err(e) => error!(measurement = name, level, files = ?files, error = %e, "{} failed", kind),
        }
    }
}

fn next_merge(name: &str, base: &TsspFileName) -> Result<u16> {
    base.merge
        .checked_add(1)
        .ok_or_else(|| TsspError::Internal(format!("{}: merge count of {} exhausted", name, base)))
}

fn parse_names(names: &[String], order: bool) -> Result<Vec<TsspFileName>> {
    names
        .iter()
        .map(|n| {
            let mut fname = TsspFileName::parse(n)?;
            fname.set_order(order);
            Ok(fname)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::tests::{flush, test_conf};
    use super::*;
    use crate::options::Config;
    use crate::tssp::builder::tests::series_record;
    use crate::tssp::ReadContext;
    use crate::TimeRange;
    use tempfile::TempDir;

    fn level_conf() -> Arc<Config> {
        Arc::new(Config {
            level_min_group_files: vec![4, 4, 4, 4, 4, 4, 2, 2],
            ..test_conf().as_ref().clone()
        })
    }

    /// Register a single-series file with an explicit name
    fn add_file(store: &MmsTables, name: TsspFileName, t0: i64) -> Arc<TsspFile> {
        let mut builder = MsBuilder::new(store.mst_dir("cpu"), "cpu", name, store.config().clone());
        builder.write_record(1, &series_record(t0, 10, 10)).unwrap();
        let files = builder.finish().unwrap();
        store.add_tssp_files("cpu", true, files.clone());
        files[0].clone()
    }

    #[test]
    fn test_level_compact() {
        let dir = TempDir::new().unwrap();
        let store = MmsTables::new(dir.path(), level_conf()).unwrap();
        let mut paths = Vec::new();
        for i in 0..5 {
            paths.push(flush(&store, "cpu", true, 1..4, i * 100, 10).path());
        }

        assert_eq!(store.level_compact(0).unwrap(), 1);
        // per series: four reads and three merges, all recycled after the first series
        let pooled = store.merge_pool_stats();
        assert_eq!(pooled.hits + pooled.allocs, 21);
        assert!(pooled.allocs <= 3);
        let files = store.table_files("cpu", true).unwrap();
        let levels: Vec<u16> = files.iter().map(|f| f.level()).collect();
        assert_eq!(levels, vec![1, 0]);
        assert_eq!(files[0].file_name().seq, 1);
        assert!(paths[..4].iter().all(|p| !p.exists()));
        assert!(store.in_compact.is_empty());

        let mut ctx = ReadContext::default();
        let rec = files[0].read_series(2, None, &mut ctx).unwrap().unwrap();
        assert_eq!(rec.row_nums(), 40);
        assert_eq!(rec.min_time(true), Some(0));
        assert_eq!(rec.max_time(true), Some(390));

        // one file left at level 0
        assert_eq!(store.level_compact(0).unwrap(), 0);
    }

    #[test]
    fn test_level_plan_and_done() {
        let dir = TempDir::new().unwrap();
        let store = MmsTables::new(dir.path(), level_conf()).unwrap();
        for i in 0..4 {
            flush(&store, "cpu", true, 1..2, i * 100, 10);
        }
        let plans = store.level_plan(0);
        assert_eq!(plans.len(), 1);
        assert!(store.level_plan(0).is_empty());
        store.compact_done(&plans[0].group);
        assert_eq!(store.level_plan(0).len(), 1);

        store.compaction_disable();
        assert!(store.level_plan(0).is_empty());
    }

    #[test]
    fn test_stopped_compaction_keeps_inputs() {
        let dir = TempDir::new().unwrap();
        let store = MmsTables::new(dir.path(), level_conf()).unwrap();
        for i in 0..4 {
            flush(&store, "cpu", true, 1..3, i * 100, 10);
        }
        let plan = store.level_plan(0).remove(0);
        store.compaction_disable();
        let err = store.compact_group(plan).unwrap_err();
        assert!(matches!(err, TsspError::CompactionStopped));
        assert!(store.in_compact.is_empty());

        let files = store.table_files("cpu", true).unwrap();
        assert_eq!(files.len(), 4);
        assert!(files.iter().all(|f| f.path().exists()));
        let out = TsspFileName::new(1, 1, 0, 0, true);
        assert!(!out.path(&store.mst_dir("cpu"), true).exists());
        assert!(!out.path(&store.mst_dir("cpu"), false).exists());
    }

    #[test]
    fn test_max_level_is_not_compacted() {
        let dir = TempDir::new().unwrap();
        let store = MmsTables::new(dir.path(), level_conf()).unwrap();
        add_file(&store, TsspFileName::new(1, 7, 0, 0, true), 0);
        add_file(&store, TsspFileName::new(2, 7, 0, 0, true), 100);
        add_file(&store, TsspFileName::new(3, 6, 0, 0, true), 200);
        add_file(&store, TsspFileName::new(4, 6, 0, 0, true), 300);

        assert!(store.level_plan(7).is_empty());
        assert!(store.level_plan(8).is_empty());
        assert_eq!(store.level_compact(7).unwrap(), 0);

        assert_eq!(store.level_compact(6).unwrap(), 1);
        let files = store.table_files("cpu", true).unwrap();
        let levels: Vec<u16> = files.iter().map(|f| f.level()).collect();
        assert_eq!(levels, vec![7, 7, 7]);
    }

    #[test]
    fn test_exhausted_names_fail_cleanly() {
        let dir = TempDir::new().unwrap();
        let store = MmsTables::new(dir.path(), level_conf()).unwrap();
        let top = [
            add_file(&store, TsspFileName::new(1, u16::MAX, 0, 0, true), 0),
            add_file(&store, TsspFileName::new(2, u16::MAX, 0, 0, true), 100),
        ];
        let plan = CompactGroup {
            name: "cpu".into(),
            group: top.iter().map(|f| f.file_name().file_name()).collect(),
            level: u16::MAX,
        };
        assert!(store.in_compact.try_mark(&plan.group));
        assert!(matches!(store.compact_group(plan), Err(TsspError::Internal(_))));
        assert!(store.in_compact.is_empty());
        assert!(top.iter().all(|f| f.path().exists()));

        store.drop_measurement("cpu").unwrap();
        add_file(&store, TsspFileName::new(3, 0, u16::MAX, 0, true), 0);
        add_file(&store, TsspFileName::new(4, 0, 0, 0, true), 100);
        assert!(matches!(store.full_compact("cpu"), Err(TsspError::Internal(_))));
        assert!(store.in_compact.is_empty());
        assert_eq!(store.table_files("cpu", true).unwrap().len(), 2);
    }

    #[test]
    fn test_full_compact() {
        let dir = TempDir::new().unwrap();
        let store = MmsTables::new(dir.path(), level_conf()).unwrap();
        for i in 0..3 {
            flush(&store, "cpu", true, 1..3, i * 100, 10);
        }
        assert!(store.full_compact("cpu").unwrap());
        let files = store.table_files("cpu", true).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name(), TsspFileName::new(1, 0, 1, 0, true));
        assert_eq!(files[0].trailer().unwrap().rows, 60);

        assert!(!store.full_compact("cpu").unwrap());
        assert!(!store.full_compact("mem").unwrap());
    }

    #[test]
    fn test_merge_out_of_order() {
        let dir = TempDir::new().unwrap();
        let store = MmsTables::new(dir.path(), level_conf()).unwrap();
        flush(&store, "cpu", true, 1..3, 0, 10);
        let late = flush(&store, "cpu", true, 1..3, 1000, 10);
        let unordered = flush(&store, "cpu", false, 2..4, 50, 10);
        let unordered_path = unordered.path();
        drop((late, unordered));

        assert!(store.merge_out_of_order("cpu").unwrap());
        assert!(store.table_files("cpu", false).unwrap().is_empty());
        assert!(!unordered_path.exists());

        let files = store.table_files("cpu", true).unwrap();
        let names: Vec<TsspFileName> = files.iter().map(|f| f.file_name()).collect();
        assert_eq!(
            names,
            vec![TsspFileName::new(1, 0, 1, 0, true), TsspFileName::new(2, 0, 0, 0, true)]
        );

        let (order, ooo) = store.get_both_files_ref("cpu", TimeRange::new(0, 999)).unwrap();
        assert_eq!((order.len(), ooo.len()), (1, 0));
        let mut ctx = ReadContext::new(TimeRange::new(0, 999));
        // times 0..90 and 50..140 share 50..90
        let rec = order[0].read_series(2, None, &mut ctx).unwrap().unwrap();
        assert_eq!(rec.row_nums(), 15);
        let rec = order[0].read_series(3, None, &mut ctx).unwrap().unwrap();
        assert_eq!(rec.min_time(true), Some(50));

        assert!(!store.merge_out_of_order("cpu").unwrap());
        store.merge_disable();
        flush(&store, "cpu", false, 1..2, 5, 1);
        assert!(!store.merge_out_of_order("cpu").unwrap());
    }

    #[test]
    fn test_merge_older_out_of_order_data() {
        let dir = TempDir::new().unwrap();
        let store = MmsTables::new(dir.path(), level_conf()).unwrap();
        flush(&store, "cpu", true, 1..3, 1000, 10);
        flush(&store, "cpu", true, 1..3, 2000, 10);
        flush(&store, "cpu", false, 1..3, 0, 10);

        assert!(store.merge_out_of_order("cpu").unwrap());
        let files = store.table_files("cpu", true).unwrap();
        let names: Vec<TsspFileName> = files.iter().map(|f| f.file_name()).collect();
        assert_eq!(
            names,
            vec![TsspFileName::new(1, 0, 1, 0, true), TsspFileName::new(2, 0, 0, 0, true)]
        );
        let ranges: Vec<(i64, i64)> = files.iter().map(|f| f.min_max_time().unwrap()).collect();
        assert_eq!(ranges, vec![(0, 1090), (2000, 2090)]);
        assert!(store.table_files("cpu", false).unwrap().is_empty());
    }
}
