//! Value types for tidemark-rdbc
//!
//! The value model covers what relational sources hand back for ordinary
//! tables (integers, decimals, text, binary, temporal types, UUID, JSON) and
//! defines the ordering used to compare key tuples:
//! - Integers of any width compare numerically with each other and with decimals
//! - Floats compare numerically with any numeric value
//! - `NULL` sorts before every other value, matching ascending `ORDER BY`
//! - Values of unrelated types are incomparable

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

/// SQL value type that can hold any supported database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 8-bit signed integer (TINYINT)
    Int8(i8),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 64-bit unsigned integer (BIGINT UNSIGNED)
    UInt64(u64),
    /// 32-bit floating point (REAL)
    Float32(f32),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CHAR)
    String(String),
    /// Binary data (BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (DATETIME)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// JSON value
    Json(serde_json::Value),
    /// Interval (stored as microseconds)
    Interval(i64),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int8(_) => "TINYINT",
            Self::Int16(_) => "SMALLINT",
            Self::Int32(_) => "INTEGER",
            Self::Int64(_) => "BIGINT",
            Self::UInt64(_) => "BIGINT UNSIGNED",
            Self::Float32(_) => "REAL",
            Self::Float64(_) => "DOUBLE PRECISION",
            Self::Decimal(_) => "DECIMAL",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "BLOB",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "DATETIME",
            Self::DateTimeTz(_) => "TIMESTAMPTZ",
            Self::Uuid(_) => "UUID",
            Self::Json(_) => "JSON",
            Self::Interval(_) => "INTERVAL",
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int8(n) => Some(*n != 0),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::UInt64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(n) => Some(i64::from(*n)),
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::UInt64(n) => i64::try_from(*n).ok(),
            Self::Float32(n) if n.is_finite() => Some(*n as i64),
            Self::Float64(n) if n.is_finite() => Some(*n as i64),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int8(n) => Some(f64::from(*n)),
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::UInt64(n) => Some(*n as f64),
            Self::Float32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Convert to owned string representation
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Int8(n) => Some(n.to_string()),
            Self::Int16(n) => Some(n.to_string()),
            Self::Int32(n) => Some(n.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::UInt64(n) => Some(n.to_string()),
            Self::Float32(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Uuid(u) => Some(u.to_string()),
            _ => None,
        }
    }

    /// Integer view used for exact cross-width comparison
    fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Int8(n) => Some(i128::from(*n)),
            Self::Int16(n) => Some(i128::from(*n)),
            Self::Int32(n) => Some(i128::from(*n)),
            Self::Int64(n) => Some(i128::from(*n)),
            Self::UInt64(n) => Some(i128::from(*n)),
            _ => None,
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(d) => Some(*d),
            Self::Int8(n) => Some(Decimal::from(*n)),
            Self::Int16(n) => Some(Decimal::from(*n)),
            Self::Int32(n) => Some(Decimal::from(*n)),
            Self::Int64(n) => Some(Decimal::from(*n)),
            Self::UInt64(n) => Some(Decimal::from(*n)),
            _ => None,
        }
    }

    #[inline]
    fn is_float(&self) -> bool {
        matches!(self, Self::Float32(_) | Self::Float64(_))
    }

    /// Compare two values under the ordering a database applies to an
    /// ascending `ORDER BY` on a key column.
    ///
    /// Returns `None` when the values cannot be ordered relative to each
    /// other (different, unrelated types, NaN, JSON documents).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Null, _) => Some(Ordering::Less),
            (_, Self::Null) => Some(Ordering::Greater),
            (a, b) if a.is_float() || b.is_float() => a.as_f64()?.partial_cmp(&b.as_f64()?),
            (a, b) if a.as_i128().is_some() && b.as_i128().is_some() => {
                Some(a.as_i128()?.cmp(&b.as_i128()?))
            }
            (a, b) if a.as_decimal().is_some() && b.as_decimal().is_some() => {
                Some(a.as_decimal()?.cmp(&b.as_decimal()?))
            }
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::DateTimeTz(a), Self::DateTimeTz(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTimeTz(b)) => Some(a.cmp(&b.naive_utc())),
            (Self::DateTimeTz(a), Self::DateTime(b)) => Some(a.naive_utc().cmp(b)),
            (Self::Date(a), Self::DateTime(b)) => Some(a.and_time(NaiveTime::MIN).cmp(b)),
            (Self::DateTime(a), Self::Date(b)) => Some(a.cmp(&b.and_time(NaiveTime::MIN))),
            (Self::Uuid(a), Self::Uuid(b)) => Some(a.cmp(b)),
            (Self::Interval(a), Self::Interval(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Self::Int8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Self::Time(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Iterate over `(column, value)` pairs in column order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Convert row to HashMap
    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.into_iter().zip(self.values).collect()
    }
}

/// Column metadata
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// SQL type name (vendor-specific)
    pub type_name: String,
    /// Whether column is nullable
    pub nullable: bool,
    /// Primary key ordinal (1-based, None if not PK)
    pub primary_key_ordinal: Option<u32>,
    /// Column ordinal (1-based)
    pub ordinal: u32,
    /// Auto-increment/serial
    pub auto_increment: bool,
}

impl ColumnMetadata {
    /// Create basic column metadata
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
            primary_key_ordinal: None,
            ordinal: 0,
            auto_increment: false,
        }
    }

    /// Mark the column as part of the primary key at the given 1-based position
    pub fn with_primary_key(mut self, ordinal: u32) -> Self {
        self.primary_key_ordinal = Some(ordinal);
        self.nullable = false;
        self
    }

    /// Set the column ordinal
    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = ordinal;
        self
    }

    /// Check if this column is part of the primary key
    #[inline]
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_ordinal.is_some()
    }
}

/// Table metadata
#[derive(Debug, Clone)]
pub struct TableMetadata {
    /// Schema (or database for MySQL)
    pub schema: Option<String>,
    /// Table name
    pub name: String,
    /// Column metadata (in ordinal order)
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    /// Create new table metadata
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Add a column
    pub fn with_column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    /// Get fully qualified name
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(s) => format!("{}.{}", s, self.name),
            None => self.name.clone(),
        }
    }

    /// Get column by name
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Get primary key columns in key order (ties broken by column ordinal)
    pub fn primary_key_columns(&self) -> Vec<&ColumnMetadata> {
        let mut pk_cols: Vec<_> = self.columns.iter().filter(|c| c.is_primary_key()).collect();
        pk_cols.sort_by_key(|c| (c.primary_key_ordinal, c.ordinal));
        pk_cols
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int32(0).is_null());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::String("yes".into()).as_bool(), Some(true));
        assert_eq!(Value::Int32(42).as_i64(), Some(42));
        assert_eq!(Value::UInt64(u64::MAX).as_i64(), None);
        assert_eq!(Value::Float64(1.5).as_f64(), Some(1.5));
    }

    #[test]
    fn test_compare_integers_across_widths() {
        assert_eq!(
            Value::Int32(5).compare(&Value::Int64(5)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::UInt64(u64::MAX).compare(&Value::Int64(i64::MAX)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::Int8(-1).compare(&Value::UInt64(0)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_compare_decimal_and_float() {
        let d = Value::Decimal(Decimal::new(1050, 2)); // 10.50
        assert_eq!(d.compare(&Value::Int64(10)), Some(Ordering::Greater));
        assert_eq!(d.compare(&Value::Float64(10.5)), Some(Ordering::Equal));
        assert_eq!(Value::Float64(f64::NAN).compare(&Value::Int32(1)), None);
    }

    #[test]
    fn test_compare_null_sorts_first() {
        assert_eq!(Value::Null.compare(&Value::Int32(0)), Some(Ordering::Less));
        assert_eq!(
            Value::String("a".into()).compare(&Value::Null),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Null.compare(&Value::Null), Some(Ordering::Equal));
    }

    #[test]
    fn test_compare_temporal() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let noon = day.and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(
            Value::Date(day).compare(&Value::DateTime(noon)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::DateTime(noon).compare(&Value::DateTimeTz(noon.and_utc())),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_compare_unrelated_types() {
        assert_eq!(Value::String("1".into()).compare(&Value::Int32(1)), None);
        assert_eq!(
            Value::Json(serde_json::json!({})).compare(&Value::Json(serde_json::json!({}))),
            None
        );
    }

    #[test]
    fn test_row_operations() {
        let row = Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int32(1), Value::String("Alice".into())],
        );

        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&Value::Int32(1)));
        assert_eq!(
            row.get_by_name("NAME"),
            Some(&Value::String("Alice".into()))
        );
        let pairs: Vec<_> = row.iter().map(|(c, _)| c).collect();
        assert_eq!(pairs, vec!["id", "name"]);
    }

    #[test]
    fn test_primary_key_order_follows_key_ordinal() {
        let table = TableMetadata::new("order_lines")
            .with_column(ColumnMetadata::new("line_no", "int").with_ordinal(1).with_primary_key(2))
            .with_column(ColumnMetadata::new("sku", "varchar").with_ordinal(2))
            .with_column(ColumnMetadata::new("order_id", "int").with_ordinal(3).with_primary_key(1));

        let keys: Vec<_> = table
            .primary_key_columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(keys, vec!["order_id", "line_no"]);
        assert!(!table.column("ORDER_ID").unwrap().nullable);
    }
}
