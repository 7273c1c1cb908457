//! Selection of compaction groups

use super::{CompactGroup, InCompact, PlanFile};
use crate::tssp::TsspFileName;
use crate::Timestamp;
use std::collections::HashSet;
use tracing::debug;

/// Plan level compaction of the files of measurement `name` at `level`.
///
/// Files are scanned in sequence order and collected into runs of adjacent files at
/// `level`. A file at another level or an extent of a split file ends the current run;
/// a run reaching `min_group` files becomes a group and its files are marked in
/// `in_compact`. A file of `level` already being compacted ends the scan, keeping the
/// groups found before it.
pub fn level_plan<F: PlanFile>(
    name: &str,
    files: &[F],
    level: u16,
    min_group: usize,
    in_compact: &InCompact,
) -> Vec<CompactGroup> {
    let mut names: Vec<TsspFileName> = files.iter().map(PlanFile::file_name).collect();
    names.sort();

    in_compact.with_locked(|marked| {
        let mut plans = Vec::new();
        let mut run: Vec<String> = Vec::new();

        for (i, fname) in names.iter().enumerate() {
            if fname.level != level {
                run.clear();
                continue;
            }
            let file_name = fname.file_name();
            if marked.contains(&file_name) {
                break;
            }
            let split = fname.extent > 0 || names.get(i + 1).map_or(false, |n| n.seq == fname.seq);
            if split {
                run.clear();
                continue;
            }

            run.push(file_name);
            if run.len() >= min_group {
                let group = std::mem::take(&mut run);
                marked.extend(group.iter().cloned());
                plans.push(CompactGroup {
                    name: name.to_string(),
                    group,
                    level,
                });
            }
        }

        if !plans.is_empty() {
            debug!(measurement = name, level, groups = plans.len(), "planned level compaction");
        }
        plans
    })
}

/// Plan a full compaction of every file of `name` into one logical file.
///
/// Returns `None` when the files already form one logical file or any of them is
/// being compacted.
pub fn full_plan<F: PlanFile>(name: &str, files: &[F], in_compact: &InCompact) -> Option<CompactGroup> {
    let mut names: Vec<TsspFileName> = files.iter().map(PlanFile::file_name).collect();
    names.sort();
    if crate::tssp::full_compacted_names(&names) {
        return None;
    }
    let level = names.iter().map(|n| n.level).max().unwrap_or(0);
    let group: Vec<String> = names.iter().map(TsspFileName::file_name).collect();
    if !in_compact.try_mark(&group) {
        return None;
    }
    Some(CompactGroup {
        name: name.to_string(),
        group,
        level,
    })
}

/// Files selected for an out-of-order merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfOrderPlan {
    pub name: String,
    /// Out-of-order files, in sequence order
    pub out_of_order: Vec<String>,
    /// Ordered files whose time range overlaps the out-of-order data, or the ordered
    /// file next to it in time when none does
    pub order: Vec<String>,
}

impl OutOfOrderPlan {
    pub fn names(&self) -> Vec<String> {
        self.out_of_order.iter().chain(&self.order).cloned().collect()
    }
}

/// Plan merging all out-of-order files of `name` into the ordered set.
///
/// Every extent of an ordered logical file joins the plan when one of them overlaps.
/// When no ordered file overlaps, the time-adjacent ordered file is merged instead, so
/// the output keeps its place in the ordered set.
/// Returns `None` when there is nothing to merge or a selected file is busy.
pub fn out_of_order_plan<F: PlanFile>(
    name: &str,
    out_of_order: &[F],
    order: &[F],
    in_compact: &InCompact,
) -> Option<OutOfOrderPlan> {
    if out_of_order.is_empty() {
        return None;
    }
    let (min, max) = out_of_order
        .iter()
        .filter_map(PlanFile::min_max_time)
        .fold((Timestamp::MAX, Timestamp::MIN), |(lo, hi), (a, b)| {
            (lo.min(a), hi.max(b))
        });

    let mut overlapping: HashSet<u64> = order
        .iter()
        .filter(|f| f.min_max_time().map_or(false, |(a, b)| a <= max && b >= min))
        .map(|f| f.file_name().seq)
        .collect();
    if overlapping.is_empty() {
        // fold into the ordered file right after the data, or the last one when the
        // data is newer than everything ordered, so the set stays sorted by time
        let timed = || order.iter().filter_map(|f| Some((f.min_max_time()?, f.file_name().seq)));
        let next = timed()
            .filter(|((a, _), _)| *a > max)
            .min_by_key(|((a, _), seq)| (*a, *seq));
        let adjacent = next.or_else(|| timed().max_by_key(|((_, b), seq)| (*b, *seq)));
        if let Some((_, seq)) = adjacent {
            overlapping.insert(seq);
        }
    }

    let mut unordered: Vec<TsspFileName> = out_of_order.iter().map(PlanFile::file_name).collect();
    unordered.sort();
    let mut ordered: Vec<TsspFileName> = order
        .iter()
        .map(PlanFile::file_name)
        .filter(|n| overlapping.contains(&n.seq))
        .collect();
    ordered.sort();

    let plan = OutOfOrderPlan {
        name: name.to_string(),
        out_of_order: unordered.iter().map(TsspFileName::file_name).collect(),
        order: ordered.iter().map(TsspFileName::file_name).collect(),
    };
    if !in_compact.try_mark(&plan.names()) {
        return None;
    }
    Some(plan)
}
