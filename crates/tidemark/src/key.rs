//! Key sets, key tuples and watermarks
//!
//! A [`KeySet`] names the columns that order a table; a [`KeyTuple`] holds
//! their values for one row; a [`Watermark`] is the persisted form of the last
//! tuple a job advanced to.
//!
//! Tuples compare lexicographically in key order, so `(5, 12) > (5, 10)` and
//! `(6, 0) > (5, 10)` while `(4, 99) < (5, 10)`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tidemark_rdbc::types::{Row, TableMetadata};
use tidemark_rdbc::Value;
use tracing::{debug, warn};

use crate::error::{ExtractError, Result};
use crate::source::{TableReader, TableRef};

/// Ordered columns used both for `ORDER BY` and for watermark comparison
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet(Vec<String>);

impl KeySet {
    /// Create a key set from column names in key order
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(columns.into_iter().map(Into::into).collect())
    }

    /// Key set from user-supplied names: trimmed, empty entries dropped
    pub fn from_explicit(columns: &[String]) -> Self {
        Self(
            columns
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Primary key columns of a table, in key order
    pub fn from_primary_key(table: &TableMetadata) -> Self {
        Self::new(table.primary_key_columns().into_iter().map(|c| c.name.clone()))
    }

    /// Whether no key columns are known (single-pass mode)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of key columns
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Key column names in order
    pub fn columns(&self) -> &[String] {
        &self.0
    }

    /// Extract the key tuple of a row
    pub fn tuple_of(&self, row: &Row) -> Result<KeyTuple> {
        self.0
            .iter()
            .map(|column| {
                row.get_by_name(column).cloned().ok_or_else(|| {
                    ExtractError::Configuration(format!(
                        "key column '{column}' is missing from the result row"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(KeyTuple)
    }
}

impl fmt::Display for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Values of the key columns of one row, in key order
#[derive(Debug, Clone, PartialEq)]
pub struct KeyTuple(Vec<Value>);

impl KeyTuple {
    /// Create a tuple from values in key order
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Values in key order
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the tuple is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lexicographic comparison; `None` if any position is incomparable
    /// or the tuples differ in length
    pub fn compare(&self, other: &KeyTuple) -> Option<Ordering> {
        if self.0.len() != other.0.len() {
            return None;
        }
        for (a, b) in self.0.iter().zip(&other.0) {
            match a.compare(b)? {
                Ordering::Equal => continue,
                ord => return Some(ord),
            }
        }
        Some(Ordering::Equal)
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                Value::Null => f.write_str("NULL")?,
                Value::String(s) => write!(f, "'{s}'")?,
                other => match other.as_string() {
                    Some(s) => f.write_str(&s)?,
                    None => write!(f, "{other:?}")?,
                },
            }
        }
        f.write_str(")")
    }
}

/// One column of a persisted watermark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkEntry {
    /// Key column name
    pub column: String,
    /// Last value seen for the column
    pub value: Value,
}

/// Last key tuple a job advanced to, as an ordered column → value mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    entries: Vec<WatermarkEntry>,
}

impl Watermark {
    /// Pair a tuple with the key set it was taken from
    pub fn from_tuple(keys: &KeySet, tuple: &KeyTuple) -> Self {
        Self {
            entries: keys
                .columns()
                .iter()
                .zip(tuple.values())
                .map(|(column, value)| WatermarkEntry {
                    column: column.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    /// Entries in key order
    pub fn entries(&self) -> &[WatermarkEntry] {
        &self.entries
    }

    /// Value recorded for a column (case-insensitive)
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.column.eq_ignore_ascii_case(column))
            .map(|e| &e.value)
    }

    /// Rebuild the tuple in the order of `keys`
    ///
    /// Fails when the stored columns do not match the key set, which means
    /// the job's keys changed since the watermark was written.
    pub fn tuple_for(&self, keys: &KeySet) -> Result<KeyTuple> {
        if self.entries.len() != keys.len() {
            return Err(self.mismatch(keys));
        }
        keys.columns()
            .iter()
            .map(|column| self.get(column).cloned().ok_or_else(|| self.mismatch(keys)))
            .collect::<Result<Vec<_>>>()
            .map(KeyTuple)
    }

    fn mismatch(&self, keys: &KeySet) -> ExtractError {
        let stored: Vec<_> = self.entries.iter().map(|e| e.column.as_str()).collect();
        ExtractError::Configuration(format!(
            "stored watermark covers columns ({}) but the job is keyed on {}",
            stored.join(", "),
            keys
        ))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = KeySet::new(self.entries.iter().map(|e| e.column.clone()));
        let tuple = KeyTuple::new(self.entries.iter().map(|e| e.value.clone()).collect());
        write!(f, "{keys}={tuple}")
    }
}

/// Determine the key set for a job
///
/// Explicit keys are used as given (trimmed). Otherwise the table's primary
/// key is read once through `reader`; an unreadable or missing table is a
/// [`ExtractError::Schema`]. An empty result means single-pass mode.
pub async fn resolve_keys<R>(
    reader: &mut R,
    table: &TableRef,
    explicit: Option<&[String]>,
) -> Result<KeySet>
where
    R: TableReader + ?Sized,
{
    if let Some(explicit) = explicit {
        let keys = KeySet::from_explicit(explicit);
        if !keys.is_empty() {
            debug!(table = %table, keys = %keys, "Using configured key columns");
            return Ok(keys);
        }
    }

    let metadata = reader
        .table_metadata(table)
        .await
        .map_err(ExtractError::Schema)?
        .ok_or_else(|| {
            ExtractError::Schema(tidemark_rdbc::Error::table_not_found(table.to_string()))
        })?;

    let keys = KeySet::from_primary_key(&metadata);
    if keys.is_empty() {
        warn!(
            table = %table,
            "Table has no primary key and no key columns are configured; \
             falling back to a single unordered pass without resumption"
        );
    } else {
        debug!(table = %table, keys = %keys, "Discovered primary key");
    }
    Ok(keys)
}
