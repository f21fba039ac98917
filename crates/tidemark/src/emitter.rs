//! Batch emitters
//!
//! An [`Emitter`] receives every non-empty batch a job extracts. Delivery is
//! at-least-once: a batch may arrive again after a restart, so emitters write
//! each delivery independently and leave deduplication downstream.
//!
//! - [`JsonLinesEmitter`]: one durable `.jsonl` file per batch
//! - [`StdoutEmitter`]: compact JSON lines on standard output

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tidemark_rdbc::types::Row;
use tidemark_rdbc::Value;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Rows returned by one poll
#[derive(Debug, Clone)]
pub struct Batch {
    /// Job identity the rows belong to
    pub job: String,
    /// 1-based position of the batch within the current run
    pub sequence: u64,
    /// When the query returned
    pub extracted_at: DateTime<Utc>,
    /// Rows in key order
    pub rows: Vec<Row>,
}

impl Batch {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Emitter failure
#[derive(Error, Debug)]
pub enum EmitError {
    /// Writing the batch failed
    #[error("I/O error writing {path}: {source}")]
    Io {
        /// Destination path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A row could not be encoded
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The destination refused the batch
    #[error("batch rejected: {0}")]
    Rejected(String),
}

/// Destination for extracted batches
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Durably accept a batch; must tolerate re-delivery
    async fn accept(&self, batch: Batch) -> Result<(), EmitError>;
}

/// Convert a column value to JSON
///
/// Binary data is base64 encoded, decimals are emitted as strings to keep
/// their precision, temporal values use ISO-8601.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::json!(b),
        Value::Int8(n) => serde_json::json!(n),
        Value::Int16(n) => serde_json::json!(n),
        Value::Int32(n) => serde_json::json!(n),
        Value::Int64(n) => serde_json::json!(n),
        Value::UInt64(n) => serde_json::json!(n),
        Value::Float32(n) => serde_json::json!(n),
        Value::Float64(n) => serde_json::json!(n),
        Value::Decimal(d) => serde_json::json!(d.to_string()),
        Value::String(s) => serde_json::json!(s),
        Value::Bytes(b) => serde_json::json!(base64::engine::general_purpose::STANDARD.encode(b)),
        Value::Date(d) => serde_json::json!(d.to_string()),
        Value::Time(t) => serde_json::json!(t.to_string()),
        Value::DateTime(dt) => serde_json::json!(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        Value::DateTimeTz(dt) => serde_json::json!(dt.to_rfc3339()),
        Value::Uuid(u) => serde_json::json!(u.to_string()),
        Value::Json(j) => j.clone(),
        Value::Interval(micros) => serde_json::json!(micros),
    }
}

/// Convert a row to a JSON object keyed by column name
pub fn row_to_json(row: &Row) -> serde_json::Value {
    serde_json::Value::Object(
        row.iter()
            .map(|(column, value)| (column.to_string(), value_to_json(value)))
            .collect(),
    )
}

fn encode_lines(rows: &[Row]) -> Result<Vec<u8>, EmitError> {
    let mut buf = Vec::with_capacity(rows.len() * 64);
    for row in rows {
        serde_json::to_writer(&mut buf, &row_to_json(row))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

// ============================================================================
// JSON Lines files
// ============================================================================

/// Writes each batch to its own `.jsonl` file
///
/// Files are written to a temp name, fsynced and renamed, so a visible file
/// is always complete. Layout:
///
/// ```text
/// dir/
///   localhost_3306_shop_orders/
///     20240301T120000.123Z-000001.jsonl
/// ```
pub struct JsonLinesEmitter {
    dir: PathBuf,
}

impl JsonLinesEmitter {
    /// Create an emitter writing below `dir` (created on first batch)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn batch_path(&self, batch: &Batch) -> PathBuf {
        let job_dir: String = batch
            .job
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(job_dir).join(format!(
            "{}-{:06}.jsonl",
            batch.extracted_at.format("%Y%m%dT%H%M%S%.3fZ"),
            batch.sequence
        ))
    }
}

#[async_trait]
impl Emitter for JsonLinesEmitter {
    async fn accept(&self, batch: Batch) -> Result<(), EmitError> {
        let path = self.batch_path(&batch);
        let io_err = |path: &Path, source| EmitError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }

        let content = encode_lines(&batch.rows)?;
        let temp_path = path.with_extension("jsonl.tmp");
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        file.write_all(&content)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        file.sync_all().await.map_err(|e| io_err(&temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| io_err(&path, e))?;

        debug!(
            path = %path.display(),
            rows = batch.rows.len(),
            bytes = content.len(),
            "Wrote batch file"
        );
        Ok(())
    }
}

// ============================================================================
// Stdout
// ============================================================================

/// Writes rows as compact JSON lines to standard output
#[derive(Debug, Default)]
pub struct StdoutEmitter;

impl StdoutEmitter {
    /// Create a new StdoutEmitter
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Emitter for StdoutEmitter {
    async fn accept(&self, batch: Batch) -> Result<(), EmitError> {
        let content = encode_lines(&batch.rows)?;
        let mut out = tokio::io::stdout();
        let io_err = |source| EmitError::Io {
            path: "<stdout>".into(),
            source,
        };
        out.write_all(&content).await.map_err(io_err)?;
        out.flush().await.map_err(io_err)?;
        Ok(())
    }
}
