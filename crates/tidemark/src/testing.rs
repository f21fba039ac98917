//! Test doubles for extraction jobs
//!
//! [`MockTable`] is an in-memory table that answers planned queries the way a
//! database would: it keeps rows whose key tuple is beyond the query's lower
//! bound, sorts them by key and applies the limit. Failures can be scripted
//! per call. [`RecordingEmitter`] keeps every batch it accepts and
//! [`FlakyWatermarkStore`] wraps a store with scripted write failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use tidemark::testing::*;
//!
//! let table = MockTable::with_primary_key("orders", &["id"], rows);
//! let emitter = Arc::new(RecordingEmitter::new());
//! let report = Extractor::new(options, Box::new(table.clone()), store, emitter.clone())
//!     .run()
//!     .await?;
//!
//! assert_eq!(emitter.batch_sizes(), vec![100, 100, 50]);
//! assert_eq!(table.fetch_count(), 4);
//! ```
//!
//! Handles are cheap clones sharing state, so a test keeps one after boxing
//! another into the extractor.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tidemark_rdbc::dialect::{MySqlDialect, SqlDialect};
use tidemark_rdbc::types::{ColumnMetadata, Row, TableMetadata};
use tidemark_rdbc::Value;

use crate::emitter::{Batch, EmitError, Emitter};
use crate::key::{KeyTuple, Watermark};
use crate::planner::Query;
use crate::source::{TableReader, TableRef};
use crate::watermark::{MemoryWatermarkStore, StoreError, WatermarkStore};

// ============================================================================
// Mock table
// ============================================================================

/// One call to [`TableReader::fetch`]
#[derive(Debug, Clone)]
pub struct FetchRecord {
    /// When the call started (tokio clock, so paused tests see virtual time)
    pub at: tokio::time::Instant,
    /// SQL the engine rendered
    pub sql: String,
    /// Lower bound the query carried
    pub after: Option<KeyTuple>,
    /// Rows returned, `None` when the call failed
    pub rows: Option<usize>,
}

#[derive(Debug, Default)]
struct MockState {
    metadata: Option<TableMetadata>,
    metadata_error: Option<tidemark_rdbc::Error>,
    rows: Vec<Row>,
    failures: VecDeque<tidemark_rdbc::Error>,
    ignore_bound: bool,
    case_insensitive: bool,
    fetches: Vec<FetchRecord>,
    metadata_reads: usize,
    closed: bool,
}

/// In-memory table implementing [`TableReader`]
#[derive(Debug, Clone, Default)]
pub struct MockTable {
    state: Arc<Mutex<MockState>>,
}

impl MockTable {
    /// Table whose primary key is `keys`; columns are taken from the first row
    pub fn with_primary_key(name: &str, keys: &[&str], rows: Vec<Row>) -> Self {
        let columns: Vec<String> = rows
            .first()
            .map(|r| r.columns().to_vec())
            .unwrap_or_else(|| keys.iter().map(|k| k.to_string()).collect());

        let mut metadata = TableMetadata::new(name);
        for (i, column) in columns.iter().enumerate() {
            let mut meta = ColumnMetadata::new(column, "bigint").with_ordinal(i as u32 + 1);
            if let Some(pos) = keys.iter().position(|k| k.eq_ignore_ascii_case(column)) {
                meta = meta.with_primary_key(pos as u32 + 1);
            }
            metadata = metadata.with_column(meta);
        }
        Self::from_parts(Some(metadata), rows)
    }

    /// Table without a primary key
    pub fn without_primary_key(name: &str, rows: Vec<Row>) -> Self {
        Self::with_primary_key(name, &[], rows)
    }

    /// A table that does not exist
    pub fn missing() -> Self {
        Self::from_parts(None, Vec::new())
    }

    fn from_parts(metadata: Option<TableMetadata>, rows: Vec<Row>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                metadata,
                rows,
                ..Default::default()
            })),
        }
    }

    /// Append rows, as if inserted concurrently
    pub fn insert(&self, rows: impl IntoIterator<Item = Row>) {
        self.state.lock().rows.extend(rows);
    }

    /// Fail the next fetch with `error`; queued errors are used in order
    pub fn fail_next(&self, error: tidemark_rdbc::Error) {
        self.state.lock().failures.push_back(error);
    }

    /// Fail the next metadata read with `error`
    pub fn fail_metadata(&self, error: tidemark_rdbc::Error) {
        self.state.lock().metadata_error = Some(error);
    }

    /// Return rows without applying the lower bound (a source that ignores
    /// the range predicate)
    pub fn ignore_bound(&self) {
        self.state.lock().ignore_bound = true;
    }

    /// Compare string keys case-insensitively when filtering and sorting,
    /// like MySQL's default collations
    pub fn case_insensitive(&self) {
        self.state.lock().case_insensitive = true;
    }

    /// All fetch calls so far
    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.state.lock().fetches.clone()
    }

    /// Number of fetch calls so far
    pub fn fetch_count(&self) -> usize {
        self.state.lock().fetches.len()
    }

    /// Number of metadata reads so far
    pub fn metadata_reads(&self) -> usize {
        self.state.lock().metadata_reads
    }

    /// Whether the reader was closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn evaluate(state: &MockState, query: &Query) -> Vec<Row> {
        let keys = &query.keys;
        let collate = |t: KeyTuple| {
            if state.case_insensitive {
                fold_case(t)
            } else {
                t
            }
        };
        let bound = query.after.clone().map(collate);

        let mut selected: Vec<&Row> = state
            .rows
            .iter()
            .filter(|row| match (&bound, state.ignore_bound) {
                (Some(bound), false) => keys
                    .tuple_of(row)
                    .ok()
                    .map(collate)
                    .and_then(|t| t.compare(bound))
                    .is_some_and(|o| o == Ordering::Greater),
                _ => true,
            })
            .collect();

        if !keys.is_empty() {
            selected.sort_by(|a, b| match (keys.tuple_of(a), keys.tuple_of(b)) {
                (Ok(a), Ok(b)) => collate(a).compare(&collate(b)).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            });
        }
        if let Some(limit) = query.limit {
            selected.truncate(limit as usize);
        }

        selected
            .into_iter()
            .map(|row| project(row, &query.columns))
            .collect()
    }
}

fn fold_case(tuple: KeyTuple) -> KeyTuple {
    KeyTuple::new(
        tuple
            .values()
            .iter()
            .map(|v| match v {
                Value::String(s) => Value::String(s.to_lowercase()),
                other => other.clone(),
            })
            .collect(),
    )
}

fn project(row: &Row, columns: &[String]) -> Row {
    if columns.is_empty() {
        return row.clone();
    }
    let (names, values): (Vec<String>, Vec<_>) = columns
        .iter()
        .filter_map(|c| row.get_by_name(c).map(|v| (c.clone(), v.clone())))
        .unzip();
    Row::new(names, values)
}

#[async_trait]
impl TableReader for MockTable {
    fn dialect(&self) -> &dyn SqlDialect {
        &MySqlDialect
    }

    async fn table_metadata(
        &mut self,
        _table: &TableRef,
    ) -> tidemark_rdbc::Result<Option<TableMetadata>> {
        let mut state = self.state.lock();
        state.metadata_reads += 1;
        if let Some(e) = state.metadata_error.take() {
            return Err(e);
        }
        Ok(state.metadata.clone())
    }

    async fn fetch(&mut self, query: &Query) -> tidemark_rdbc::Result<Vec<Row>> {
        let mut state = self.state.lock();
        let mut record = FetchRecord {
            at: tokio::time::Instant::now(),
            sql: query.sql.clone(),
            after: query.after.clone(),
            rows: None,
        };

        if let Some(e) = state.failures.pop_front() {
            state.fetches.push(record);
            return Err(e);
        }

        let rows = Self::evaluate(&state, query);
        record.rows = Some(rows.len());
        state.fetches.push(record);
        Ok(rows)
    }

    async fn close(&mut self) -> tidemark_rdbc::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

// ============================================================================
// Recording emitter
// ============================================================================

/// Emitter that keeps every accepted batch
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    batches: Mutex<Vec<Batch>>,
    fail_at: Mutex<Option<u64>>,
    calls: Mutex<u64>,
}

impl RecordingEmitter {
    /// Create an emitter accepting everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the `n`-th call (1-based)
    pub fn fail_on_call(self, n: u64) -> Self {
        *self.fail_at.lock() = Some(n);
        self
    }

    /// Accepted batches in order
    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    /// Row count of each accepted batch
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Batch::len).collect()
    }

    /// Every accepted row, in delivery order
    pub fn rows(&self) -> Vec<Row> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.rows.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl Emitter for RecordingEmitter {
    async fn accept(&self, batch: Batch) -> Result<(), EmitError> {
        let call = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        if *self.fail_at.lock() == Some(call) {
            return Err(EmitError::Rejected(format!(
                "batch {} refused by test emitter",
                batch.sequence
            )));
        }
        self.batches.lock().push(batch);
        Ok(())
    }
}

// ============================================================================
// Flaky watermark store
// ============================================================================

/// In-memory store whose writes can be made to fail
#[derive(Debug, Default)]
pub struct FlakyWatermarkStore {
    inner: MemoryWatermarkStore,
    failing_puts: Mutex<u32>,
    puts: Mutex<Vec<Watermark>>,
}

impl FlakyWatermarkStore {
    /// Create a store that accepts every write
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes
    pub fn fail_next_puts(&self, n: u32) {
        *self.failing_puts.lock() = n;
    }

    /// Every successfully written watermark, in order
    pub fn history(&self) -> Vec<Watermark> {
        self.puts.lock().clone()
    }
}

#[async_trait]
impl WatermarkStore for FlakyWatermarkStore {
    async fn get(&self, job: &str) -> Result<Option<Watermark>, StoreError> {
        self.inner.get(job).await
    }

    async fn put(&self, job: &str, watermark: &Watermark) -> Result<(), StoreError> {
        {
            let mut failing = self.failing_puts.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(StoreError::Unavailable("scripted write failure".into()));
            }
        }
        self.inner.put(job, watermark).await?;
        self.puts.lock().push(watermark.clone());
        Ok(())
    }
}
