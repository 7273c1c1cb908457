//! Series-by-series merge of a group of files into new files

use crate::record::RecordPool;
use crate::tssp::{ChunkMeta, FileRef, MsBuilder, ReadContext, TsspFile};
use crate::{Result, SeriesId, TsspError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub series: u64,
    pub rows_in: u64,
    pub rows_out: u64,
    pub bytes_read: u64,
}

/// Merge every series of `inputs` and write the result through `builder`.
///
/// `inputs` must be ordered newest first: on a timestamp present in several files, the
/// non-null values of the newest one win. `stop` is polled between series; once it
/// returns true the merge is abandoned with [`TsspError::CompactionStopped`] and any
/// partial output is removed. Per-series records are taken from and returned to
/// `pool`.
pub(crate) fn merge_files(
    inputs: &[FileRef],
    mut builder: MsBuilder,
    pool: &RecordPool,
    stop: &dyn Fn() -> bool,
) -> Result<(Vec<Arc<TsspFile>>, MergeStats)> {
    let start = Instant::now();
    let metas: Vec<Vec<ChunkMeta>> = inputs
        .iter()
        .map(|f| f.all_chunk_metas())
        .collect::<Result<_>>()?;
    let sids: BTreeSet<SeriesId> = metas.iter().flatten().map(|m| m.sid).collect();

    let mut stats = MergeStats::default();
    let mut ctx = ReadContext::default();
    for sid in sids {
        if stop() {
            debug!(measurement = builder.name(), sid, "merge interrupted");
            return Err(TsspError::CompactionStopped);
        }

        let mut merged = None;
        for (file, file_metas) in inputs.iter().zip(&metas) {
            let Ok(i) = file_metas.binary_search_by_key(&sid, |m| m.sid) else {
                continue;
            };
            let cm = &file_metas[i];
            let mut rec = pool.get();
            rec.reset_with_schema(cm.schema());
            for seg in 0..cm.segment_count() {
                file.read_at(cm, seg, &mut rec, &mut ctx)?;
            }
            stats.rows_in += rec.row_nums() as u64;
            merged = Some(match merged {
                None => rec,
                Some(newer) => {
                    let mut out = pool.get();
                    out.merge_record(&newer, &rec);
                    pool.put(newer);
                    pool.put(rec);
                    out
                }
            });
        }

        if let Some(rec) = merged {
            stats.series += 1;
            stats.rows_out += rec.row_nums() as u64;
            let written = builder.write_record(sid, &rec);
            pool.put(rec);
            written?;
        }
    }
    stats.bytes_read = ctx.bytes_read();

    let name = builder.name().to_string();
    let files = builder.finish()?;
    info!(
        measurement = %name,
        inputs = inputs.len(),
        outputs = files.len(),
        series = stats.series,
        rows_in = stats.rows_in,
        rows_out = stats.rows_out,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "merged files"
    );
    Ok((files, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::tssp::builder::tests::{series_record, small_conf, write_file};
    use crate::tssp::TsspFileName;
    use crate::FieldValue;
    use tempfile::TempDir;

    #[test]
    fn test_merge_prefers_newest() {
        let dir = TempDir::new().unwrap();
        let conf = small_conf();
        let old = write_file(
            dir.path(),
            "cpu",
            TsspFileName::new(1, 0, 0, 0, true),
            conf.clone(),
            &[(1, series_record(0, 10, 100)), (5, series_record(0, 10, 20))],
        );
        let mut newer_rec = series_record(500, 10, 100);
        newer_rec.col_vals[0] = {
            let mut col = crate::record::ColVal::new(crate::FieldType::Integer);
            (0..100).for_each(|i| col.append_integer(-i));
            col
        };
        let new = write_file(
            dir.path(),
            "cpu",
            TsspFileName::new(2, 0, 0, 0, true),
            conf.clone(),
            &[(1, newer_rec), (9, series_record(0, 1, 5))],
        );

        let inputs = vec![new.acquire().unwrap(), old.acquire().unwrap()];
        let builder = MsBuilder::new(
            dir.path().join("cpu"),
            "cpu",
            TsspFileName::new(1, 1, 0, 0, true),
            conf,
        );
        let pool = RecordPool::new(RecordKind::Merge, 4);
        let (files, stats) = merge_files(&inputs, builder, &pool, &|| false).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(stats.series, 3);
        assert_eq!(stats.rows_in, 100 + 20 + 100 + 5);
        // series 1 spans [0, 990] and [500, 1490]; 50 timestamps collide
        assert_eq!(stats.rows_out, 150 + 20 + 5);
        // four reads and one merged output across three series
        let pooled = pool.stats();
        assert_eq!(pooled.hits + pooled.allocs, 5);
        assert!(pooled.hits >= 2);
        assert!(!pool.is_empty());

        let out = &files[0];
        let rec = out.read_series(1, None, &mut ReadContext::default()).unwrap().unwrap();
        assert_eq!(rec.row_nums(), 150);
        assert!(rec.times().windows(2).all(|w| w[0] < w[1]));
        let at_500 = rec.times().iter().position(|&t| t == 500).unwrap();
        assert_eq!(rec.value(0, at_500), Some(FieldValue::Integer(0)));
        assert_eq!(rec.value(0, at_500 + 1), Some(FieldValue::Integer(-1)));
        assert_eq!(rec.value(0, 10), Some(FieldValue::Integer(10)));
        assert_eq!(out.trailer().unwrap().series_count, 3);
    }

    #[test]
    fn test_merge_stops() {
        let dir = TempDir::new().unwrap();
        let conf = small_conf();
        let file = write_file(
            dir.path(),
            "cpu",
            TsspFileName::new(1, 0, 0, 0, true),
            conf.clone(),
            &[(1, series_record(0, 10, 10))],
        );
        let out_name = TsspFileName::new(1, 1, 0, 0, true);
        let builder = MsBuilder::new(dir.path().join("cpu"), "cpu", out_name, conf);
        let pool = RecordPool::new(RecordKind::Merge, 4);
        let err = merge_files(&[file.acquire().unwrap()], builder, &pool, &|| true).unwrap_err();
        assert!(matches!(err, TsspError::CompactionStopped));
        assert!(!out_name.path(&dir.path().join("cpu"), false).exists());
        assert!(!out_name.path(&dir.path().join("cpu"), true).exists());
    }
}
