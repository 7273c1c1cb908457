//! Column storage with a validity bitmap

use crate::{FieldType, FieldValue};

/// Typed value storage for one column.
///
/// Fixed-width columns keep one slot per row, nulls included (their slot holds the
/// type's zero value). String columns keep the start offset of every row; a null row
/// contributes an empty slice.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Integer(Vec<i64>),
    Float(Vec<f64>),
    Boolean(Vec<bool>),
    String { data: Vec<u8>, offsets: Vec<u32> },
}

impl ColumnValues {
    fn new(ty: FieldType) -> Self {
        match ty {
            FieldType::Integer => ColumnValues::Integer(Vec::new()),
            FieldType::Float => ColumnValues::Float(Vec::new()),
            FieldType::Boolean => ColumnValues::Boolean(Vec::new()),
            FieldType::String => ColumnValues::String {
                data: Vec::new(),
                offsets: Vec::new(),
            },
        }
    }

    fn field_type(&self) -> FieldType {
        match self {
            ColumnValues::Integer(_) => FieldType::Integer,
            ColumnValues::Float(_) => FieldType::Float,
            ColumnValues::Boolean(_) => FieldType::Boolean,
            ColumnValues::String { .. } => FieldType::String,
        }
    }

    fn clear(&mut self) {
        match self {
            ColumnValues::Integer(v) => v.clear(),
            ColumnValues::Float(v) => v.clear(),
            ColumnValues::Boolean(v) => v.clear(),
            ColumnValues::String { data, offsets } => {
                data.clear();
                offsets.clear();
            }
        }
    }
}

/// One column of a [`Record`](super::Record).
#[derive(Debug, Clone, PartialEq)]
pub struct ColVal {
    values: ColumnValues,
    bitmap: Vec<u8>,
    len: usize,
    nil_count: usize,
}

impl ColVal {
    /// Create an empty column of the given type
    pub fn new(ty: FieldType) -> Self {
        Self {
            values: ColumnValues::new(ty),
            bitmap: Vec::new(),
            len: 0,
            nil_count: 0,
        }
    }

    /// Assemble a column from decoded parts.
    ///
    /// `bitmap` must hold at least `len` bits; a bitmap of `None` means every row is valid.
    pub(crate) fn from_parts(values: ColumnValues, bitmap: Option<Vec<u8>>, len: usize) -> Self {
        let bitmap = bitmap.unwrap_or_else(|| {
            let mut all = vec![0xFFu8; (len + 7) / 8];
            if len % 8 != 0 {
                if let Some(last) = all.last_mut() {
                    *last = (1u8 << (len % 8)) - 1;
                }
            }
            all
        });
        let valid: usize = (0..len)
            .filter(|i| bitmap[i >> 3] & (1 << (i & 7)) != 0)
            .count();
        Self {
            values,
            bitmap,
            len,
            nil_count: len - valid,
        }
    }

    pub fn field_type(&self) -> FieldType {
        self.values.field_type()
    }

    pub fn values(&self) -> &ColumnValues {
        &self.values
    }

    /// Number of rows, nulls included
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn nil_count(&self) -> usize {
        self.nil_count
    }

    pub fn valid_count(&self) -> usize {
        self.len - self.nil_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    #[inline]
    pub fn is_valid(&self, row: usize) -> bool {
        row < self.len && self.bitmap[row >> 3] & (1 << (row & 7)) != 0
    }

    #[inline]
    pub fn is_nil(&self, row: usize) -> bool {
        !self.is_valid(row)
    }

    #[inline]
    fn push_bit(&mut self, valid: bool) {
        let idx = self.len;
        if idx >> 3 >= self.bitmap.len() {
            self.bitmap.push(0);
        }
        if valid {
            self.bitmap[idx >> 3] |= 1 << (idx & 7);
        } else {
            self.bitmap[idx >> 3] &= !(1 << (idx & 7));
            self.nil_count += 1;
        }
        self.len += 1;
    }

    pub fn append_integer(&mut self, v: i64) {
        match &mut self.values {
            ColumnValues::Integer(vals) => vals.push(v),
            other => type_mismatch(FieldType::Integer, other.field_type()),
        }
        self.push_bit(true);
    }

    pub fn append_integers(&mut self, vs: &[i64]) {
        for &v in vs {
            self.append_integer(v);
        }
    }

    pub fn append_float(&mut self, v: f64) {
        match &mut self.values {
            ColumnValues::Float(vals) => vals.push(v),
            other => type_mismatch(FieldType::Float, other.field_type()),
        }
        self.push_bit(true);
    }

    pub fn append_boolean(&mut self, v: bool) {
        match &mut self.values {
            ColumnValues::Boolean(vals) => vals.push(v),
            other => type_mismatch(FieldType::Boolean, other.field_type()),
        }
        self.push_bit(true);
    }

    pub fn append_string(&mut self, v: &str) {
        self.append_bytes(v.as_bytes());
    }

    pub fn append_bytes(&mut self, v: &[u8]) {
        match &mut self.values {
            ColumnValues::String { data, offsets } => {
                offsets.push(data.len() as u32);
                data.extend_from_slice(v);
            }
            other => type_mismatch(FieldType::String, other.field_type()),
        }
        self.push_bit(true);
    }

    /// Append one null row
    pub fn append_null(&mut self) {
        match &mut self.values {
            ColumnValues::Integer(vals) => vals.push(0),
            ColumnValues::Float(vals) => vals.push(0.0),
            ColumnValues::Boolean(vals) => vals.push(false),
            ColumnValues::String { data, offsets } => offsets.push(data.len() as u32),
        }
        self.push_bit(false);
    }

    /// Append `rows` null rows
    pub fn pad_nulls(&mut self, rows: usize) {
        for _ in 0..rows {
            self.append_null();
        }
    }

    /// Append a single typed value, or a null for `None`.
    ///
    /// # Panics
    /// Panics when the value type differs from the column type.
    pub fn append_value(&mut self, value: Option<&FieldValue>) {
        match value {
            None => self.append_null(),
            Some(FieldValue::Integer(v)) => self.append_integer(*v),
            Some(FieldValue::Float(v)) => self.append_float(*v),
            Some(FieldValue::Boolean(v)) => self.append_boolean(*v),
            Some(FieldValue::String(v)) => self.append_string(v),
        }
    }

    /// Append rows `[start, end)` of `src`.
    ///
    /// # Panics
    /// Panics when `src` has a different column type.
    pub fn append_col_val(&mut self, src: &ColVal, start: usize, end: usize) {
        if start >= end {
            return;
        }
        debug_assert!(end <= src.len);
        match (&mut self.values, &src.values) {
            (ColumnValues::Integer(dst), ColumnValues::Integer(s)) => {
                dst.extend_from_slice(&s[start..end])
            }
            (ColumnValues::Float(dst), ColumnValues::Float(s)) => {
                dst.extend_from_slice(&s[start..end])
            }
            (ColumnValues::Boolean(dst), ColumnValues::Boolean(s)) => {
                dst.extend_from_slice(&s[start..end])
            }
            (
                ColumnValues::String { data, offsets },
                ColumnValues::String { .. },
            ) => {
                for row in start..end {
                    offsets.push(data.len() as u32);
                    data.extend_from_slice(src.bytes_at(row));
                }
            }
            (dst, s) => type_mismatch(s.field_type(), dst.field_type()),
        }

        if src.nil_count == 0 {
            for _ in start..end {
                self.push_bit(true);
            }
        } else {
            for row in start..end {
                self.push_bit(src.is_valid(row));
            }
        }
    }

    /// Integer slots (nulls read as 0)
    pub fn integer_values(&self) -> Option<&[i64]> {
        match &self.values {
            ColumnValues::Integer(v) => Some(v),
            _ => None,
        }
    }

    pub fn float_values(&self) -> Option<&[f64]> {
        match &self.values {
            ColumnValues::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn boolean_values(&self) -> Option<&[bool]> {
        match &self.values {
            ColumnValues::Boolean(v) => Some(v),
            _ => None,
        }
    }

    /// Raw bytes of a string row; empty for nulls and non-string columns
    pub fn bytes_at(&self, row: usize) -> &[u8] {
        match &self.values {
            ColumnValues::String { data, offsets } => {
                let start = offsets[row] as usize;
                let end = offsets
                    .get(row + 1)
                    .map(|&o| o as usize)
                    .unwrap_or(data.len());
                &data[start..end]
            }
            _ => &[],
        }
    }

    /// Value at `row`, `None` for nulls
    pub fn value(&self, row: usize) -> Option<FieldValue> {
        if !self.is_valid(row) {
            return None;
        }
        Some(match &self.values {
            ColumnValues::Integer(v) => FieldValue::Integer(v[row]),
            ColumnValues::Float(v) => FieldValue::Float(v[row]),
            ColumnValues::Boolean(v) => FieldValue::Boolean(v[row]),
            ColumnValues::String { .. } => {
                FieldValue::String(String::from_utf8_lossy(self.bytes_at(row)).into_owned())
            }
        })
    }

    /// Approximate memory held by this column
    pub fn size(&self) -> usize {
        let values = match &self.values {
            ColumnValues::Integer(v) => v.len() * 8,
            ColumnValues::Float(v) => v.len() * 8,
            ColumnValues::Boolean(v) => v.len(),
            ColumnValues::String { data, offsets } => data.len() + offsets.len() * 4,
        };
        values + self.bitmap.len()
    }

    /// Drop all rows, keeping type and capacity
    pub fn reset(&mut self) {
        self.values.clear();
        self.bitmap.clear();
        self.len = 0;
        self.nil_count = 0;
    }
}

#[cold]
fn type_mismatch(want: FieldType, got: FieldType) -> ! {
    panic!("column type mismatch: {} column cannot take {} values", got, want)
}
