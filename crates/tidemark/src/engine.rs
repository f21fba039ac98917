//! The extraction loop
//!
//! An [`Extractor`] drives one job through
//!
//! ```text
//! INIT → PLAN → EXECUTE ⇄ RETRY_WAIT → VALIDATE → ADVANCE | STALL | EXHAUSTED
//!          ↑                                         │
//!          └──────────── IDLE (continuous) ←─────────┘
//! ```
//!
//! Everything runs sequentially on the calling task. Each non-empty batch is
//! handed to the emitter before the watermark is written, so a crash between
//! the two re-emits the batch on restart (at-least-once). The shutdown token
//! is observed at the top of every poll and during sleeps; an in-flight query
//! is never interrupted.

use std::cmp::Ordering as KeyOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tidemark_rdbc::types::Row;
use tidemark_rdbc::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::emitter::{Batch, Emitter};
use crate::error::{ExtractError, ExtractState, JobFailure};
use crate::key::{resolve_keys, KeySet, KeyTuple, Watermark};
use crate::planner::{plan, Query};
use crate::retry::{BackoffPolicy, RetryContext};
use crate::source::{TableReader, TableRef};
use crate::watermark::WatermarkStore;

/// Whether a job stops at the end of the table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Stop at the first empty poll
    #[default]
    OneShot,
    /// Keep polling for new rows until shut down
    Continuous,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneShot => write!(f, "one_shot"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// Immutable parameters of one extraction job
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Identity the watermark is stored under
    pub job_id: String,
    /// Source table
    pub table: TableRef,
    /// Projection (empty = all columns)
    pub columns: Vec<String>,
    /// Explicit key columns; `None` uses the primary key
    pub key_columns: Option<Vec<String>>,
    /// Rows per poll; `None` only when explicitly unbounded
    pub limit: Option<u64>,
    /// One-shot or continuous
    pub mode: Mode,
    /// Sleep between polls in continuous mode
    pub poll_interval: Duration,
    /// Backoff for transient query failures
    pub backoff: BackoffPolicy,
    /// Consecutive failed watermark writes before giving up
    pub max_watermark_write_failures: u32,
}

impl JobOptions {
    /// Options with defaults: all columns, primary key, 100000 rows per poll
    pub fn new(job_id: impl Into<String>, table: TableRef) -> Self {
        Self {
            job_id: job_id.into(),
            table,
            columns: Vec::new(),
            key_columns: None,
            limit: Some(100_000),
            mode: Mode::OneShot,
            poll_interval: Duration::ZERO,
            backoff: BackoffPolicy::default(),
            max_watermark_write_failures: 5,
        }
    }

    /// Set the projection
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Use explicit key columns
    pub fn with_key_columns<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_columns = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Set rows per poll
    pub fn with_batch_size(mut self, rows: u64) -> Self {
        self.limit = Some(rows);
        self
    }

    /// Remove the row limit
    pub fn unbounded(mut self) -> Self {
        self.limit = None;
        self
    }

    /// Set the mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the continuous-mode poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the tolerated number of consecutive watermark write failures
    pub fn with_max_watermark_write_failures(mut self, failures: u32) -> Self {
        self.max_watermark_write_failures = failures;
        self
    }
}

/// How a job ended without failing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// One-shot job reached an empty poll
    Exhausted,
    /// No key columns; the table was read once without a watermark
    SinglePass,
    /// One-shot job stopped because a batch did not move the watermark
    Stalled,
    /// Shutdown was requested
    Shutdown,
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "exhausted"),
            Self::SinglePass => write!(f, "single_pass"),
            Self::Stalled => write!(f, "stalled"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractStats {
    /// Queries that returned (empty or not)
    pub polls: u64,
    /// Queries that returned no rows
    pub empty_polls: u64,
    /// Rows handed to the emitter
    pub rows: u64,
    /// Batches handed to the emitter
    pub batches: u64,
    /// Retried query attempts
    pub retries: u64,
    /// Successful watermark writes
    pub watermark_writes: u64,
    /// Failed watermark writes
    pub watermark_write_failures: u64,
}

/// Thread-safe counters for a running job
#[derive(Debug, Default)]
pub struct AtomicExtractStats {
    polls: AtomicU64,
    empty_polls: AtomicU64,
    rows: AtomicU64,
    batches: AtomicU64,
    retries: AtomicU64,
    watermark_writes: AtomicU64,
    watermark_write_failures: AtomicU64,
}

impl AtomicExtractStats {
    /// Record a completed query
    pub fn record_poll(&self, rows: usize) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if rows == 0 {
            self.empty_polls.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a batch accepted by the emitter
    pub fn record_batch(&self, rows: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Record a retried attempt
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a watermark write outcome
    pub fn record_watermark_write(&self, ok: bool) {
        if ok {
            self.watermark_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.watermark_write_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> ExtractStats {
        ExtractStats {
            polls: self.polls.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            watermark_writes: self.watermark_writes.load(Ordering::Relaxed),
            watermark_write_failures: self.watermark_write_failures.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a run that did not fail
#[derive(Debug, Clone)]
pub struct ExtractReport {
    /// Job identity
    pub job_id: String,
    /// Why the run ended
    pub completion: Completion,
    /// Key set the job ran with
    pub keys: KeySet,
    /// Watermark in the store when the run ended
    pub watermark: Option<Watermark>,
    /// Counters
    pub stats: ExtractStats,
}

/// Runs one extraction job
pub struct Extractor {
    options: JobOptions,
    reader: Box<dyn TableReader>,
    store: Arc<dyn WatermarkStore>,
    emitter: Arc<dyn Emitter>,
    shutdown: CancellationToken,
    stats: Arc<AtomicExtractStats>,
}

/// What a state hands to the loop
enum Step {
    Continue,
    Finish(Completion),
}

impl Extractor {
    /// Create an extractor; nothing touches the source until [`Extractor::run`]
    pub fn new(
        options: JobOptions,
        reader: Box<dyn TableReader>,
        store: Arc<dyn WatermarkStore>,
        emitter: Arc<dyn Emitter>,
    ) -> Self {
        Self {
            options,
            reader,
            store,
            emitter,
            shutdown: CancellationToken::new(),
            stats: Arc::new(AtomicExtractStats::default()),
        }
    }

    /// Stop between polls once `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Live counters, readable while the job runs
    pub fn stats(&self) -> Arc<AtomicExtractStats> {
        Arc::clone(&self.stats)
    }

    /// Job parameters
    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Run the job to completion
    pub async fn run(mut self) -> Result<ExtractReport, JobFailure> {
        let span = info_span!("extract", job = %self.options.job_id);
        async move {
            let result = self.run_loop().await;
            if let Err(e) = self.reader.close().await {
                warn!(error = %e, "Failed to close source connection");
            }
            match &result {
                Ok(report) => info!(
                    completion = %report.completion,
                    polls = report.stats.polls,
                    rows = report.stats.rows,
                    batches = report.stats.batches,
                    "Extraction finished"
                ),
                Err(failure) => warn!(
                    state = %failure.state,
                    kind = failure.error.kind(),
                    error = %failure.error,
                    "Extraction failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_loop(&mut self) -> Result<ExtractReport, JobFailure> {
        // INIT
        let keys = resolve_keys(
            self.reader.as_mut(),
            &self.options.table,
            self.options.key_columns.as_deref(),
        )
        .await
        .map_err(|e| JobFailure::new(ExtractState::Init, e))?;
        self.check_projection(&keys)
            .map_err(|e| JobFailure::new(ExtractState::Init, e))?;
        if keys.is_empty() && self.options.mode == Mode::Continuous {
            return Err(JobFailure::new(
                ExtractState::Init,
                ExtractError::Configuration(format!(
                    "{} has no key columns; continuous mode needs a key to resume from",
                    self.options.table
                )),
            ));
        }

        let initial = self
            .load_watermark(&keys)
            .await
            .map_err(|e| JobFailure::new(ExtractState::Init, e))?;
        if let Some(stored) = &initial {
            stored
                .tuple_for(&keys)
                .map_err(|e| JobFailure::new(ExtractState::Init, e))?;
        }
        info!(
            table = %self.options.table,
            keys = %keys,
            mode = %self.options.mode,
            limit = ?self.options.limit,
            watermark = %display_watermark(initial.as_ref()),
            "Starting extraction"
        );

        let mut sequence = 0u64;
        let mut put_failures = 0u32;

        loop {
            // PLAN
            if self.shutdown.is_cancelled() {
                info!("Shutdown requested, stopping between polls");
                return self.report(Completion::Shutdown, &keys).await;
            }
            let watermark = self
                .load_watermark(&keys)
                .await
                .map_err(|e| JobFailure::new(ExtractState::Plan, e))?;
            let bound = watermark
                .as_ref()
                .map(|w| w.tuple_for(&keys))
                .transpose()
                .map_err(|e| JobFailure::new(ExtractState::Plan, e))?;
            let query = plan(
                &self.options.table,
                &self.options.columns,
                &keys,
                bound.as_ref(),
                self.options.limit,
                self.reader.dialect(),
            )
            .map_err(|e| JobFailure::new(ExtractState::Plan, e))?;

            // EXECUTE
            let rows = match self.execute(&query).await? {
                Some(rows) => rows,
                None => return self.report(Completion::Shutdown, &keys).await,
            };
            self.stats.record_poll(rows.len());

            // VALIDATE
            if rows.is_empty() {
                match self.options.mode {
                    Mode::OneShot => {
                        info!(watermark = %display_watermark(watermark.as_ref()), "Table exhausted");
                        return self.report(Completion::Exhausted, &keys).await;
                    }
                    Mode::Continuous => {
                        debug!("No new rows");
                        match self.idle().await {
                            Step::Continue => continue,
                            Step::Finish(c) => return self.report(c, &keys).await,
                        }
                    }
                }
            }

            sequence += 1;
            if keys.is_empty() {
                self.emit(sequence, rows).await?;
                info!("Single pass complete; no watermark kept without key columns");
                return self.report(Completion::SinglePass, &keys).await;
            }

            let last = last_key(&keys, &rows).map_err(|e| JobFailure::new(ExtractState::Validate, e))?;
            let advanced = match &bound {
                None => true,
                // The source applied the strict range predicate, so only an
                // unchanged tuple means no progress. `Less` arises when the
                // source collation orders strings differently from bytes.
                Some(prior) => match last.compare(prior) {
                    Some(KeyOrdering::Greater) => true,
                    Some(KeyOrdering::Less) => {
                        warn!(
                            watermark = %prior,
                            last = %last,
                            "Source orders keys differently from byte order; trusting source order"
                        );
                        true
                    }
                    Some(KeyOrdering::Equal) => false,
                    None => {
                        return Err(JobFailure::new(
                            ExtractState::Validate,
                            ExtractError::Configuration(format!(
                                "key tuple {last} cannot be compared with watermark {prior}"
                            )),
                        ))
                    }
                },
            };

            let row_count = rows.len();
            self.emit(sequence, rows).await?;

            if advanced {
                // ADVANCE
                let next = Watermark::from_tuple(&keys, &last);
                match self.store.put(&self.options.job_id, &next).await {
                    Ok(()) => {
                        put_failures = 0;
                        self.stats.record_watermark_write(true);
                        info!(batch = sequence, rows = row_count, watermark = %next, "Advanced watermark");
                    }
                    Err(e) => {
                        put_failures += 1;
                        self.stats.record_watermark_write(false);
                        warn!(
                            batch = sequence,
                            failures = put_failures,
                            error = %e,
                            "Failed to persist watermark; the poll will be repeated"
                        );
                        if put_failures >= self.options.max_watermark_write_failures {
                            return Err(JobFailure::new(ExtractState::Advance, e));
                        }
                    }
                }
            } else {
                // STALL
                let stalled = display_watermark(watermark.as_ref());
                match self.options.mode {
                    Mode::OneShot => {
                        warn!(
                            watermark = %stalled,
                            last = %last,
                            "Batch did not move past the watermark; stopping"
                        );
                        return self.report(Completion::Stalled, &keys).await;
                    }
                    Mode::Continuous => {
                        return Err(JobFailure::new(
                            ExtractState::Stall,
                            ExtractError::ProgressStall {
                                watermark: stalled,
                                last: last.to_string(),
                            },
                        ))
                    }
                }
            }

            if self.options.mode == Mode::Continuous {
                if let Step::Finish(c) = self.idle().await {
                    return self.report(c, &keys).await;
                }
            }
        }
    }

    /// Key columns must be selected for the watermark to be computed
    fn check_projection(&self, keys: &KeySet) -> Result<(), ExtractError> {
        if self.options.columns.is_empty() {
            return Ok(());
        }
        for key in keys.columns() {
            if !self
                .options
                .columns
                .iter()
                .any(|c| c.eq_ignore_ascii_case(key))
            {
                return Err(ExtractError::Configuration(format!(
                    "key column '{key}' is not part of the projection"
                )));
            }
        }
        Ok(())
    }

    async fn load_watermark(&self, keys: &KeySet) -> Result<Option<Watermark>, ExtractError> {
        let stored = self.store.get(&self.options.job_id).await?;
        if keys.is_empty() {
            if stored.is_some() {
                debug!("Ignoring stored watermark for a job without key columns");
            }
            return Ok(None);
        }
        Ok(stored)
    }

    /// Run a query, retrying transient failures
    ///
    /// Returns `Ok(None)` when shutdown interrupts a backoff sleep.
    async fn execute(&mut self, query: &Query) -> Result<Option<Vec<Row>>, JobFailure> {
        let mut retry = RetryContext::new();
        loop {
            let error = match self.reader.fetch(query).await {
                Ok(rows) => return Ok(Some(rows)),
                Err(e) if !e.is_retriable() => {
                    return Err(JobFailure::new(ExtractState::Execute, ExtractError::Source(e)))
                }
                Err(e) => e,
            };

            let message = error.to_string();
            match retry.record_failure(error, &self.options.backoff) {
                Some(delay) => {
                    // RETRY_WAIT
                    self.stats.record_retry();
                    warn!(
                        attempt = retry.attempts(),
                        max_attempts = self.options.backoff.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient source error, retrying"
                    );
                    if !self.pause(delay).await {
                        info!("Shutdown requested during backoff");
                        return Ok(None);
                    }
                }
                None => {
                    let attempts = retry.attempts();
                    let last = retry
                        .into_last_error()
                        .unwrap_or_else(|| tidemark_rdbc::Error::connection(message));
                    return Err(JobFailure::new(
                        ExtractState::Execute,
                        ExtractError::TransientSource { attempts, last },
                    ));
                }
            }
        }
    }

    async fn emit(&self, sequence: u64, rows: Vec<Row>) -> Result<(), JobFailure> {
        let count = rows.len();
        let batch = Batch {
            job: self.options.job_id.clone(),
            sequence,
            extracted_at: Utc::now(),
            rows,
        };
        self.emitter
            .accept(batch)
            .await
            .map_err(|e| JobFailure::new(ExtractState::Validate, e))?;
        self.stats.record_batch(count);
        debug!(batch = sequence, rows = count, "Batch accepted");
        Ok(())
    }

    async fn idle(&self) -> Step {
        if self.pause(self.options.poll_interval).await {
            Step::Continue
        } else {
            info!("Shutdown requested while idle");
            Step::Finish(Completion::Shutdown)
        }
    }

    /// Sleep unless shutdown arrives first; `false` means shutdown
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn report(&self, completion: Completion, keys: &KeySet) -> Result<ExtractReport, JobFailure> {
        let watermark = self
            .load_watermark(keys)
            .await
            .map_err(|e| JobFailure::new(ExtractState::Done, e))?;
        Ok(ExtractReport {
            job_id: self.options.job_id.clone(),
            completion,
            keys: keys.clone(),
            watermark,
            stats: self.stats.snapshot(),
        })
    }
}

/// Key tuple of the last row; NULL keys cannot be used as a range bound
fn last_key(keys: &KeySet, rows: &[Row]) -> Result<KeyTuple, ExtractError> {
    let Some(row) = rows.last() else {
        return Err(ExtractError::Configuration("empty batch has no last key".into()));
    };
    let tuple = keys.tuple_of(row)?;
    if let Some((column, _)) = keys
        .columns()
        .iter()
        .zip(tuple.values())
        .find(|(_, v)| matches!(v, Value::Null))
    {
        return Err(ExtractError::Configuration(format!(
            "key column '{column}' is NULL; NULL keys cannot be used as a watermark"
        )));
    }
    Ok(tuple)
}

fn display_watermark(watermark: Option<&Watermark>) -> String {
    watermark.map_or_else(|| "<none>".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTable, RecordingEmitter};
    use crate::watermark::MemoryWatermarkStore;

    fn rows(range: std::ops::RangeInclusive<i64>) -> Vec<Row> {
        range
            .map(|id| Row::new(vec!["id".into()], vec![Value::Int64(id)]))
            .collect()
    }

    #[test]
    fn test_last_key_rejects_null() {
        let keys = KeySet::new(["id"]);
        let batch = vec![Row::new(vec!["id".into()], vec![Value::Null])];
        assert!(matches!(
            last_key(&keys, &batch),
            Err(ExtractError::Configuration(_))
        ));
        assert_eq!(
            last_key(&keys, &rows(1..=3)).unwrap().values(),
            [Value::Int64(3)]
        );
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = AtomicExtractStats::default();
        stats.record_poll(10);
        stats.record_poll(0);
        stats.record_batch(10);
        stats.record_retry();
        stats.record_watermark_write(true);
        stats.record_watermark_write(false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.polls, 2);
        assert_eq!(snapshot.empty_polls, 1);
        assert_eq!(snapshot.rows, 10);
        assert_eq!(snapshot.batches, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.watermark_writes, 1);
        assert_eq!(snapshot.watermark_write_failures, 1);
    }

    #[tokio::test]
    async fn test_key_outside_projection_fails_at_init() {
        let table = MockTable::with_primary_key("orders", &["id"], rows(1..=3));
        let options = JobOptions::new("job", TableRef::new("orders")).with_columns(["total"]);
        let failure = Extractor::new(
            options,
            Box::new(table),
            Arc::new(MemoryWatermarkStore::new()),
            Arc::new(RecordingEmitter::new()),
        )
        .run()
        .await
        .unwrap_err();
        assert_eq!(failure.state, ExtractState::Init);
        assert!(failure.error.is_configuration());
    }

    #[tokio::test]
    async fn test_one_shot_reads_in_batches() {
        let table = MockTable::with_primary_key("orders", &["id"], rows(1..=7));
        let emitter = Arc::new(RecordingEmitter::new());
        let options = JobOptions::new("job", TableRef::new("orders")).with_batch_size(3);
        let report = Extractor::new(
            options,
            Box::new(table),
            Arc::new(MemoryWatermarkStore::new()),
            emitter.clone(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.completion, Completion::Exhausted);
        assert_eq!(emitter.batch_sizes(), vec![3, 3, 1]);
        assert_eq!(report.stats.polls, 4);
        assert_eq!(report.stats.empty_polls, 1);
        assert_eq!(report.stats.watermark_writes, 3);
        assert_eq!(
            report.watermark.unwrap().get("id"),
            Some(&Value::Int64(7))
        );
    }
}
