//! Core types shared by records, files and the table store

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Series identifier
pub type SeriesId = u64;

/// Name of the mandatory trailing time column
pub const TIME_FIELD: &str = "time";

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    /// 64-bit signed integer (also used for the time column)
    Integer = 1,
    /// 64-bit float
    Float = 2,
    /// Boolean
    Boolean = 3,
    /// UTF-8 string
    String = 4,
}

impl FieldType {
    /// Decode a persisted type tag
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FieldType::Integer),
            2 => Some(FieldType::Float),
            3 => Some(FieldType::Boolean),
            4 => Some(FieldType::String),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::String => "string",
        };
        f.write_str(s)
    }
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// The trailing time column
    pub fn time() -> Self {
        Self::new(TIME_FIELD, FieldType::Integer)
    }

    pub fn is_time(&self) -> bool {
        self.name == TIME_FIELD
    }
}

/// Ordered list of columns; field names sorted, time column last
pub type Schema = Vec<Field>;

/// Column ordering: names ascending, with the time column after every field.
pub fn cmp_field_name(a: &str, b: &str) -> Ordering {
    match (a == TIME_FIELD, b == TIME_FIELD) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

/// Sort a schema into canonical order: field names ascending, time last.
pub fn sort_schema(schema: &mut Schema) {
    schema.sort_by(|a, b| cmp_field_name(&a.name, &b.name));
}

/// Possible field value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 64-bit float
    Float(f64),
    /// 64-bit signed integer
    Integer(i64),
    /// Boolean
    Boolean(bool),
    /// String
    String(String),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Boolean(_) => FieldType::Boolean,
            FieldValue::String(_) => FieldType::String,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}i", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{:?}", v),
        }
    }
}

/// Inclusive time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Minimum timestamp (inclusive)
    pub min: Timestamp,
    /// Maximum timestamp (inclusive)
    pub max: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(min: Timestamp, max: Timestamp) -> Self {
        Self { min, max }
    }

    /// The range covering every timestamp
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.min && ts <= self.max
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.min <= other.max && self.max >= other.min
    }

    /// Check if `[min, max]` overlaps this range
    pub fn overlaps_bounds(&self, min: Timestamp, max: Timestamp) -> bool {
        self.min <= max && self.max >= min
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_schema_puts_time_last() {
        let mut schema = vec![
            Field::time(),
            Field::new("usage", FieldType::Float),
            Field::new("host", FieldType::String),
        ];
        sort_schema(&mut schema);
        let names: Vec<_> = schema.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["host", "usage", "time"]);
    }

    #[test]
    fn test_time_range() {
        let range1 = TimeRange::new(100, 200);
        let range2 = TimeRange::new(150, 250);
        let range3 = TimeRange::new(300, 400);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
        assert!(range1.contains(150));
        assert!(range1.contains(200));
        assert!(!range1.contains(250));
        assert!(TimeRange::all().contains(i64::MIN));
    }

    #[test]
    fn test_field_type_tags() {
        for ty in [
            FieldType::Integer,
            FieldType::Float,
            FieldType::Boolean,
            FieldType::String,
        ] {
            assert_eq!(FieldType::from_u8(ty as u8), Some(ty));
        }
        assert_eq!(FieldType::from_u8(0), None);
    }
}
