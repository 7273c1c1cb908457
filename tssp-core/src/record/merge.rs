//! Time-ordered merge of two records
//!
//! `new` and `old` are each sorted by time (ascending, or descending for the `_descend`
//! variants). Rows are interleaved by timestamp; when both sides hold the same
//! timestamp the rows collapse into one, taking each column from `new` when it is
//! non-null there, else from `old`. The output schema is the union of both schemas.

use super::Record;
use crate::{cmp_field_name, Schema};
use std::cmp::Ordering;

impl Record {
    /// Merge all rows of `new` and `old` in ascending time order.
    pub fn merge_record(&mut self, new: &Record, old: &Record) {
        let limit = new.row_nums() + old.row_nums();
        self.merge_record_limit_rows(new, old, 0, 0, limit);
    }

    /// Merge all rows of `new` and `old` in descending time order.
    pub fn merge_record_descend(&mut self, new: &Record, old: &Record) {
        let limit = new.row_nums() + old.row_nums();
        self.merge_record_limit_rows_descend(new, old, 0, 0, limit);
    }

    /// Merge from `new_pos`/`old_pos`, emitting at most `limit_rows` rows.
    ///
    /// Returns the positions in `new` and `old` where the next page should resume.
    pub fn merge_record_limit_rows(
        &mut self,
        new: &Record,
        old: &Record,
        new_pos: usize,
        old_pos: usize,
        limit_rows: usize,
    ) -> (usize, usize) {
        self.merge_limit_rows_impl(new, old, new_pos, old_pos, limit_rows, true)
    }

    /// Descending counterpart of [`merge_record_limit_rows`](Self::merge_record_limit_rows).
    pub fn merge_record_limit_rows_descend(
        &mut self,
        new: &Record,
        old: &Record,
        new_pos: usize,
        old_pos: usize,
        limit_rows: usize,
    ) -> (usize, usize) {
        self.merge_limit_rows_impl(new, old, new_pos, old_pos, limit_rows, false)
    }

    fn merge_limit_rows_impl(
        &mut self,
        new: &Record,
        old: &Record,
        new_pos: usize,
        old_pos: usize,
        limit_rows: usize,
        ascending: bool,
    ) -> (usize, usize) {
        if self.schema.is_empty() {
            let schema = merge_schema(&new.schema, &old.schema);
            self.reset_with_schema(schema);
        }

        let new_times = new.times();
        let old_times = old.times();
        let before = |a: i64, b: i64| if ascending { a < b } else { a > b };

        let (mut n, mut o) = (new_pos, old_pos);
        let mut remain = limit_rows;

        while remain > 0 && n < new_times.len() && o < old_times.len() {
            let (nt, ot) = (new_times[n], old_times[o]);
            if before(ot, nt) {
                let run = old_times[o..].partition_point(|&t| before(t, nt));
                let end = o + run.min(remain);
                self.append_rec(old, o, end);
                remain -= end - o;
                o = end;
            } else if before(nt, ot) {
                let run = new_times[n..].partition_point(|&t| before(t, ot));
                let end = n + run.min(remain);
                self.append_rec(new, n, end);
                remain -= end - n;
                n = end;
            } else {
                self.merge_rec_row(new, old, n, o);
                n += 1;
                o += 1;
                remain -= 1;
            }
        }

        if remain > 0 && n < new_times.len() {
            let end = (n + remain).min(new_times.len());
            self.append_rec(new, n, end);
            n = end;
        } else if remain > 0 && o < old_times.len() {
            let end = (o + remain).min(old_times.len());
            self.append_rec(old, o, end);
            o = end;
        }

        (n, o)
    }

    /// Collapse row `new_row` of `new` and row `old_row` of `old` (same timestamp)
    /// into one appended row.
    fn merge_rec_row(&mut self, new: &Record, old: &Record, new_row: usize, old_row: usize) {
        let (mut i_new, mut i_old) = (0, 0);
        for i in 0..self.schema.len() {
            let name = &self.schema[i].name;
            let from_new = seek(&new.schema, &mut i_new, name);
            let from_old = seek(&old.schema, &mut i_old, name);

            let dst = &mut self.col_vals[i];
            match (from_new, from_old) {
                (Some(a), _) if new.col_vals[a].is_valid(new_row) => {
                    dst.append_col_val(&new.col_vals[a], new_row, new_row + 1)
                }
                (_, Some(b)) if old.col_vals[b].is_valid(old_row) => {
                    dst.append_col_val(&old.col_vals[b], old_row, old_row + 1)
                }
                _ => dst.append_null(),
            }
        }
    }
}

/// Advance `pos` through `schema` to the column called `name`, if present.
fn seek(schema: &Schema, pos: &mut usize, name: &str) -> Option<usize> {
    while *pos < schema.len() && cmp_field_name(&schema[*pos].name, name) == Ordering::Less {
        *pos += 1;
    }
    (*pos < schema.len() && schema[*pos].name == name).then_some(*pos)
}

/// Union of two canonical schemas; on a name clash the type from `new` wins.
pub(crate) fn merge_schema(new: &Schema, old: &Schema) -> Schema {
    let mut out = Schema::with_capacity(new.len().max(old.len()));
    let (mut i, mut j) = (0, 0);
    while i < new.len() && j < old.len() {
        match cmp_field_name(&new[i].name, &old[j].name) {
            Ordering::Less => {
                out.push(new[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                out.push(old[j].clone());
                j += 1;
            }
            Ordering::Equal => {
                out.push(new[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&new[i..]);
    out.extend_from_slice(&old[j..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::{float_record, schema};
    use crate::{FieldType, FieldValue};

    #[test]
    fn test_merge_overlapping_prefers_non_null() {
        let new = float_record("v", &[(1, Some(10.0)), (3, None), (5, Some(50.0))]);
        let old = float_record("v", &[(2, Some(2.0)), (3, Some(3.0)), (5, Some(5.0)), (6, None)]);

        let mut out = Record::default();
        out.merge_record(&new, &old);

        assert_eq!(out.times(), &[1, 2, 3, 5, 6]);
        assert_eq!(out.value(0, 2), Some(FieldValue::Float(3.0)));
        assert_eq!(out.value(0, 3), Some(FieldValue::Float(50.0)));
        assert_eq!(out.value(0, 4), None);
    }

    #[test]
    fn test_merge_non_overlapping_is_concatenation() {
        let old = float_record("v", &[(1, Some(1.0)), (2, Some(2.0))]);
        let new = float_record("v", &[(5, Some(5.0)), (6, Some(6.0))]);

        let mut a = Record::default();
        a.merge_record(&new, &old);
        let mut b = Record::default();
        b.merge_record(&old, &new);

        assert_eq!(a.times(), &[1, 2, 5, 6]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_merge_schema_union_pads() {
        let mut new = Record::new(schema(&[("a", FieldType::Integer)]), false);
        new.col_vals[0].append_integer(1);
        new.append_time(1);
        let old = float_record("b", &[(1, Some(9.0)), (2, Some(8.0))]);

        let mut out = Record::default();
        out.merge_record(&new, &old);
        let names: Vec<_> = out.schema.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "time"]);
        assert_eq!(out.times(), &[1, 2]);
        assert_eq!(out.value(0, 0), Some(FieldValue::Integer(1)));
        assert_eq!(out.value(1, 0), Some(FieldValue::Float(9.0)));
        assert_eq!(out.value(0, 1), None);
    }

    #[test]
    fn test_merge_limit_rows_pages() {
        let new = float_record("v", &[(2, Some(2.0)), (4, Some(4.0)), (6, Some(6.0))]);
        let old = float_record("v", &[(1, Some(1.0)), (4, Some(-4.0)), (7, Some(7.0))]);

        let mut page = Record::default();
        let (n, o) = page.merge_record_limit_rows(&new, &old, 0, 0, 3);
        assert_eq!(page.times(), &[1, 2, 4]);
        assert_eq!((n, o), (2, 2));

        let mut rest = Record::default();
        let (n, o) = rest.merge_record_limit_rows(&new, &old, n, o, 10);
        assert_eq!(rest.times(), &[6, 7]);
        assert_eq!((n, o), (3, 3));
    }

    #[test]
    fn test_merge_descend() {
        let new = float_record("v", &[(6, Some(6.0)), (3, Some(3.0))]);
        let old = float_record("v", &[(5, Some(5.0)), (3, Some(-3.0)), (1, Some(1.0))]);

        let mut out = Record::default();
        out.merge_record_descend(&new, &old);
        assert_eq!(out.times(), &[6, 5, 3, 1]);
        assert_eq!(out.value(0, 2), Some(FieldValue::Float(3.0)));
    }

    #[test]
    fn test_merge_row_count_equals_distinct_times() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let mut a: Vec<i64> = (0..50).map(|_| rng.gen_range(0..100)).collect();
            let mut b: Vec<i64> = (0..50).map(|_| rng.gen_range(0..100)).collect();
            a.sort_unstable();
            a.dedup();
            b.sort_unstable();
            b.dedup();
            let new = float_record("v", &a.iter().map(|t| (*t, Some(1.0))).collect::<Vec<_>>());
            let old = float_record("v", &b.iter().map(|t| (*t, None)).collect::<Vec<_>>());

            let mut out = Record::default();
            out.merge_record(&new, &old);

            let mut all: Vec<i64> = a.iter().chain(b.iter()).copied().collect();
            all.sort_unstable();
            all.dedup();
            assert_eq!(out.times(), all.as_slice());
            for (row, t) in all.iter().enumerate() {
                assert_eq!(out.column(0).is_valid(row), a.binary_search(t).is_ok());
            }
        }
    }
}
