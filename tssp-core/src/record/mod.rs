//! Columnar record batches
//!
//! A [`Record`] is the unit every other component reads and writes: a schema sorted by
//! field name with the `time` column last, one [`ColVal`] per schema column, and optional
//! per-column pre-aggregation in [`RecMeta`]. All columns hold the same number of rows.

mod colval;
mod merge;
mod meta;
mod pool;

pub use colval::{ColVal, ColumnValues};
pub use meta::{ColMeta, RecMeta};
pub use pool::{RecordKind, RecordPool, RecordPoolStats};

use crate::{cmp_field_name, Field, FieldValue, Schema, TimeRange, Timestamp, TIME_FIELD};
use std::cmp::Ordering;
use std::fmt;

/// Records with more columns than this are not returned to a pool
pub const REC_MAX_LEN_FOR_REUSE: usize = 512;

/// Records with more rows than this are not returned to a pool
pub const REC_MAX_ROW_NUM_FOR_REUSE: usize = 2024;

/// Columnar batch of rows sharing one schema
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub schema: Schema,
    pub col_vals: Vec<ColVal>,
    pub rec_meta: Option<RecMeta>,
}

impl Record {
    /// Create an empty record for `schema`.
    ///
    /// The schema must already be in canonical order (see [`crate::sort_schema`]).
    pub fn new(schema: Schema, init_col_meta: bool) -> Self {
        debug_assert!(
            schema.last().map_or(true, |f| f.name == TIME_FIELD),
            "time column must be last"
        );
        let col_vals = schema.iter().map(|f| ColVal::new(f.ty)).collect();
        let rec_meta = init_col_meta.then(|| RecMeta::with_columns(schema.len()));
        Self {
            schema,
            col_vals,
            rec_meta,
        }
    }

    pub fn row_nums(&self) -> usize {
        self.col_vals.last().map_or(0, ColVal::len)
    }

    pub fn col_nums(&self) -> usize {
        self.col_vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_nums() == 0
    }

    pub fn column(&self, i: usize) -> &ColVal {
        &self.col_vals[i]
    }

    pub fn column_mut(&mut self, i: usize) -> &mut ColVal {
        &mut self.col_vals[i]
    }

    /// Index of a column by name
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.schema
            .binary_search_by(|f| cmp_field_name(&f.name, name))
            .ok()
    }

    pub fn time_column(&self) -> Option<&ColVal> {
        self.col_vals.last()
    }

    /// Timestamps of every row
    pub fn times(&self) -> &[Timestamp] {
        self.time_column()
            .and_then(ColVal::integer_values)
            .unwrap_or(&[])
    }

    pub fn time(&self, row: usize) -> Timestamp {
        self.times()[row]
    }

    pub fn append_time(&mut self, t: Timestamp) {
        if let Some(col) = self.col_vals.last_mut() {
            col.append_integer(t);
        }
    }

    /// Smallest timestamp, given the row order of the record
    pub fn min_time(&self, ascending: bool) -> Option<Timestamp> {
        let times = self.times();
        if ascending {
            times.first().copied()
        } else {
            times.last().copied()
        }
    }

    /// Largest timestamp, given the row order of the record
    pub fn max_time(&self, ascending: bool) -> Option<Timestamp> {
        let times = self.times();
        if ascending {
            times.last().copied()
        } else {
            times.first().copied()
        }
    }

    /// Append rows `[start, end)` of `src`, matching columns by name.
    ///
    /// Columns of this record that `src` lacks are padded with nulls; `src` columns
    /// unknown to this record are ignored.
    pub fn append_rec(&mut self, src: &Record, start: usize, end: usize) {
        self.append_rec_impl(src, start, end, true);
    }

    /// Like [`append_rec`](Self::append_rec) but without padding the columns `src`
    /// lacks; the caller pads them once the whole tag set has been appended.
    pub fn append_rec_for_tag_set(&mut self, src: &Record, start: usize, end: usize) {
        self.append_rec_impl(src, start, end, false);
    }

    fn append_rec_impl(&mut self, src: &Record, start: usize, end: usize, pad: bool) {
        if start >= end {
            return;
        }
        let mut i_src = 0;
        for i in 0..self.schema.len() {
            while i_src < src.schema.len()
                && cmp_field_name(&src.schema[i_src].name, &self.schema[i].name) == Ordering::Less
            {
                i_src += 1;
            }
            if i_src < src.schema.len() && src.schema[i_src].name == self.schema[i].name {
                self.col_vals[i].append_col_val(&src.col_vals[i_src], start, end);
                self.append_col_times(i, src, i_src, start, end);
                i_src += 1;
            } else if pad {
                self.col_vals[i].pad_nulls(end - start);
            }
        }
    }

    fn append_col_times(&mut self, i: usize, src: &Record, i_src: usize, start: usize, end: usize) {
        let (Some(dst_meta), Some(src_meta)) = (self.rec_meta.as_mut(), src.rec_meta.as_ref())
        else {
            return;
        };
        if let (Some(dst), Some(times)) = (dst_meta.times.get_mut(i), src_meta.times.get(i_src)) {
            if times.len() >= end {
                dst.extend_from_slice(&times[start..end]);
            }
        }
    }

    /// Append rows `[start, end)` of a record with the same column set, skipping the
    /// `src` column indexes listed in `skip`.
    pub fn append_rec_for_series(&mut self, src: &Record, start: usize, end: usize, skip: &[usize]) {
        if start >= end {
            return;
        }
        let mut i = 0;
        for (i_src, col) in src.col_vals.iter().enumerate() {
            if skip.contains(&i_src) {
                continue;
            }
            debug_assert_eq!(self.schema[i].name, src.schema[i_src].name);
            self.col_vals[i].append_col_val(col, start, end);
            i += 1;
        }
        debug_assert_eq!(i, self.col_vals.len());
    }

    /// Replace the contents of this record with rows `[start, end)` of `src`
    pub fn slice_from_record(&mut self, src: &Record, start: usize, end: usize) {
        self.reset_with_schema(src.schema.clone());
        self.append_rec(src, start, end);
    }

    /// Split into consecutive records of at most `max_rows` rows each.
    pub fn split(&self, max_rows: usize) -> Vec<Record> {
        let rows = self.row_nums();
        if max_rows == 0 || rows <= max_rows {
            return vec![self.clone()];
        }
        (0..rows)
            .step_by(max_rows)
            .map(|start| {
                let mut seg = Record::new(self.schema.clone(), false);
                seg.append_rec(self, start, (start + max_rows).min(rows));
                seg
            })
            .collect()
    }

    /// True when every non-time column is null at `row`
    pub fn is_nil_row(&self, row: usize) -> bool {
        let fields = self.col_nums().saturating_sub(1);
        self.col_vals[..fields].iter().all(|c| c.is_nil(row))
    }

    /// Drop rows whose non-time columns are all null.
    ///
    /// Returns `self` untouched when some field column has no nulls at all, or when no
    /// row turns out to be entirely null.
    pub fn kick_nil_row(self) -> Record {
        let fields = self.col_nums().saturating_sub(1);
        if self.col_vals[..fields]
            .iter()
            .any(|c| !c.is_empty() && c.nil_count() == 0)
        {
            return self;
        }

        let rows = self.row_nums();
        let mut kept: Option<Record> = None;
        let mut row = 0;
        while row < rows {
            let start = row;
            while row < rows && !self.is_nil_row(row) {
                row += 1;
            }
            if row > start {
                if row - start == rows {
                    return self;
                }
                kept.get_or_insert_with(|| Record::new(self.schema.clone(), false))
                    .append_rec(&self, start, row);
            } else {
                row += 1;
            }
        }
        kept.unwrap_or_else(|| Record::new(self.schema.clone(), false))
    }

    /// Copy the rows inside `tr` into a record shaped like `schema`.
    ///
    /// With `ascending == false` the copied rows are reversed. Returns `None` when no row
    /// falls inside the range or none of the requested fields exist in this record.
    pub fn copy_with_condition(&self, ascending: bool, tr: TimeRange, schema: &Schema) -> Option<Record> {
        let times = self.times();
        let start = times.partition_point(|&t| t < tr.min);
        let end = times.partition_point(|&t| t <= tr.max);
        if start >= end {
            return None;
        }

        let mut out = Record::new(schema.clone(), false);
        let mut exists = false;
        let fields = schema.len().saturating_sub(1);
        for (i, field) in schema[..fields].iter().enumerate() {
            match self.field_index(&field.name) {
                Some(idx) => {
                    exists = true;
                    copy_rows(&mut out.col_vals[i], &self.col_vals[idx], start, end, ascending);
                }
                None => out.col_vals[i].pad_nulls(end - start),
            }
        }
        if !exists {
            return None;
        }
        let time_idx = self.col_nums() - 1;
        copy_rows(&mut out.col_vals[fields], &self.col_vals[time_idx], start, end, ascending);
        Some(out)
    }

    /// Add columns of `other` missing from this record, padded with nulls.
    pub fn pad_record(&mut self, other: &Record) {
        let rows = self.row_nums();
        let mut added = false;
        for field in other.schema.iter().filter(|f| !f.is_time()) {
            if self.field_index(&field.name).is_none() {
                let mut col = ColVal::new(field.ty);
                col.pad_nulls(rows);
                self.schema.push(field.clone());
                self.col_vals.push(col);
                added = true;
            }
        }
        if added {
            self.sort_columns();
        }
    }

    fn sort_columns(&mut self) {
        let mut cols: Vec<(Field, ColVal)> = self
            .schema
            .drain(..)
            .zip(self.col_vals.drain(..))
            .collect();
        cols.sort_by(|a, b| cmp_field_name(&a.0.name, &b.0.name));
        for (field, col) in cols {
            self.schema.push(field);
            self.col_vals.push(col);
        }
        if let Some(meta) = self.rec_meta.as_mut() {
            *meta = RecMeta::with_columns(self.schema.len());
        }
    }

    /// Recompute [`ColMeta`] for every column from the current rows.
    pub fn compute_col_meta(&mut self) {
        let times = self.times().to_vec();
        let metas = self
            .col_vals
            .iter()
            .map(|c| ColMeta::compute(c, &times))
            .collect();
        let meta = self.rec_meta.get_or_insert_with(RecMeta::default);
        meta.col_meta = metas;
        meta.times.resize(self.schema.len(), Vec::new());
    }

    /// Value of column `col` at `row`
    pub fn value(&self, col: usize, row: usize) -> Option<FieldValue> {
        self.col_vals[col].value(row)
    }

    /// Approximate memory held by the record
    pub fn size(&self) -> usize {
        self.col_vals.iter().map(ColVal::size).sum::<usize>()
            + self.schema.iter().map(|f| f.name.len()).sum::<usize>()
    }

    /// Drop all rows, keeping the schema
    pub fn reset(&mut self) {
        self.col_vals.iter_mut().for_each(ColVal::reset);
        if let Some(meta) = self.rec_meta.as_mut() {
            meta.reset();
        }
    }

    pub fn reset_with_schema(&mut self, schema: Schema) {
        self.col_vals = schema.iter().map(|f| ColVal::new(f.ty)).collect();
        if self.rec_meta.is_some() {
            self.rec_meta = Some(RecMeta::with_columns(schema.len()));
        }
        self.schema = schema;
    }

    /// Drop schema, rows and metadata so the record can be pooled
    pub fn reset_for_reuse(&mut self) {
        self.schema.clear();
        self.col_vals.clear();
        self.rec_meta = None;
    }
}

fn copy_rows(dst: &mut ColVal, src: &ColVal, start: usize, end: usize, ascending: bool) {
    if ascending {
        dst.append_col_val(src, start, end);
    } else {
        for row in (start..end).rev() {
            dst.append_col_val(src, row, row + 1);
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (field, col) in self.schema.iter().zip(&self.col_vals) {
            write!(f, "{}({}):", field.name, field.ty)?;
            for row in 0..col.len() {
                match col.value(row) {
                    Some(v) => write!(f, " {}", v)?,
                    None => write!(f, " null")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
