//! Per-column pre-aggregation

use super::colval::ColVal;
use crate::{FieldValue, Timestamp};

/// Pre-aggregated statistics of one column.
///
/// `min`/`max` are kept for numeric and boolean columns, `sum` for numeric ones;
/// `first`/`last` are the values at the smallest and largest timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColMeta {
    pub count: u64,
    pub min: Option<(FieldValue, Timestamp)>,
    pub max: Option<(FieldValue, Timestamp)>,
    pub first: Option<(FieldValue, Timestamp)>,
    pub last: Option<(FieldValue, Timestamp)>,
    pub sum: Option<FieldValue>,
}

impl ColMeta {
    /// Aggregate the valid rows of `col`, pairing row `i` with `times[i]`.
    pub fn compute(col: &ColVal, times: &[Timestamp]) -> Self {
        let mut meta = ColMeta::default();
        let rows = col.len().min(times.len());
        for row in 0..rows {
            let Some(value) = col.value(row) else {
                continue;
            };
            meta.observe(value, times[row]);
        }
        meta
    }

    fn observe(&mut self, value: FieldValue, time: Timestamp) {
        self.count += 1;

        if !matches!(value, FieldValue::String(_)) {
            if self.min.as_ref().map_or(true, |(m, _)| value_lt(&value, m)) {
                self.min = Some((value.clone(), time));
            }
            if self.max.as_ref().map_or(true, |(m, _)| value_lt(m, &value)) {
                self.max = Some((value.clone(), time));
            }
        }

        self.sum = match (self.sum.take(), &value) {
            (Some(FieldValue::Integer(s)), FieldValue::Integer(v)) => {
                Some(FieldValue::Integer(s.wrapping_add(*v)))
            }
            (Some(FieldValue::Float(s)), FieldValue::Float(v)) => Some(FieldValue::Float(s + v)),
            (None, FieldValue::Integer(v)) => Some(FieldValue::Integer(*v)),
            (None, FieldValue::Float(v)) => Some(FieldValue::Float(*v)),
            (sum, _) => sum,
        };

        if self.first.as_ref().map_or(true, |(_, t)| time < *t) {
            self.first = Some((value.clone(), time));
        }
        if self.last.as_ref().map_or(true, |(_, t)| time >= *t) {
            self.last = Some((value, time));
        }
    }

    /// Fold another aggregate of the same column into this one.
    ///
    /// On equal timestamps `other` wins for `last` and loses for `first`.
    pub fn merge(&mut self, other: &ColMeta) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;

        if let Some((v, t)) = &other.min {
            if self.min.as_ref().map_or(true, |(m, _)| value_lt(v, m)) {
                self.min = Some((v.clone(), *t));
            }
        }
        if let Some((v, t)) = &other.max {
            if self.max.as_ref().map_or(true, |(m, _)| value_lt(m, v)) {
                self.max = Some((v.clone(), *t));
            }
        }
        self.sum = match (self.sum.take(), &other.sum) {
            (Some(FieldValue::Integer(a)), Some(FieldValue::Integer(b))) => {
                Some(FieldValue::Integer(a.wrapping_add(*b)))
            }
            (Some(FieldValue::Float(a)), Some(FieldValue::Float(b))) => {
                Some(FieldValue::Float(a + b))
            }
            (None, other_sum) => other_sum.clone(),
            (mine, _) => mine,
        };
        if let Some((v, t)) = &other.first {
            if self.first.as_ref().map_or(true, |(_, mt)| t < mt) {
                self.first = Some((v.clone(), *t));
            }
        }
        if let Some((v, t)) = &other.last {
            if self.last.as_ref().map_or(true, |(_, mt)| t >= mt) {
                self.last = Some((v.clone(), *t));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

fn value_lt(a: &FieldValue, b: &FieldValue) -> bool {
    match (a, b) {
        (FieldValue::Integer(a), FieldValue::Integer(b)) => a < b,
        (FieldValue::Float(a), FieldValue::Float(b)) => a < b,
        (FieldValue::Boolean(a), FieldValue::Boolean(b)) => !a & b,
        (FieldValue::String(a), FieldValue::String(b)) => a < b,
        _ => false,
    }
}

/// Record-level metadata: column aggregates and per-column time overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecMeta {
    pub col_meta: Vec<ColMeta>,
    pub times: Vec<Vec<Timestamp>>,
}

impl RecMeta {
    pub fn with_columns(n: usize) -> Self {
        Self {
            col_meta: vec![ColMeta::default(); n],
            times: vec![Vec::new(); n],
        }
    }

    pub fn reset(&mut self) {
        self.col_meta.iter_mut().for_each(|m| *m = ColMeta::default());
        self.times.iter_mut().for_each(Vec::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldType;

    #[test]
    fn test_compute_skips_nulls() {
        let mut col = ColVal::new(FieldType::Integer);
        col.append_integer(5);
        col.append_null();
        col.append_integer(-3);
        col.append_integer(9);
        let meta = ColMeta::compute(&col, &[10, 20, 30, 40]);

        assert_eq!(meta.count, 3);
        assert_eq!(meta.min, Some((FieldValue::Integer(-3), 30)));
        assert_eq!(meta.max, Some((FieldValue::Integer(9), 40)));
        assert_eq!(meta.first, Some((FieldValue::Integer(5), 10)));
        assert_eq!(meta.last, Some((FieldValue::Integer(9), 40)));
        assert_eq!(meta.sum, Some(FieldValue::Integer(11)));
    }

    #[test]
    fn test_merge_prefers_other_on_last_tie() {
        let mut a = ColVal::new(FieldType::Float);
        a.append_float(1.0);
        a.append_float(2.0);
        let mut b = ColVal::new(FieldType::Float);
        b.append_float(7.0);

        let mut meta = ColMeta::compute(&a, &[1, 2]);
        meta.merge(&ColMeta::compute(&b, &[2]));

        assert_eq!(meta.count, 3);
        assert_eq!(meta.last, Some((FieldValue::Float(7.0), 2)));
        assert_eq!(meta.first, Some((FieldValue::Float(1.0), 1)));
        assert_eq!(meta.max, Some((FieldValue::Float(7.0), 2)));
        assert_eq!(meta.sum, Some(FieldValue::Float(10.0)));
    }

    #[test]
    fn test_string_column_has_no_min_max() {
        let mut col = ColVal::new(FieldType::String);
        col.append_string("b");
        col.append_string("a");
        let meta = ColMeta::compute(&col, &[1, 2]);
        assert_eq!(meta.count, 2);
        assert!(meta.min.is_none());
        assert!(meta.sum.is_none());
        assert_eq!(meta.last, Some((FieldValue::String("a".into()), 2)));
    }
}
