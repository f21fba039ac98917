//! Retry, watermark write failures, idle polling and shutdown
//!
//! Time-dependent tests run on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tidemark::engine::{Completion, Extractor};
use tidemark::error::{ExtractError, ExtractState};
use tidemark::testing::{FlakyWatermarkStore, MockTable, RecordingEmitter};
use tidemark::watermark::{MemoryWatermarkStore, WatermarkStore};
use tidemark_rdbc::{Error, Value};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_transient_errors_back_off_with_growing_delays() {
    let table = MockTable::with_primary_key("orders", &["id"], orders(1..=3));
    table.fail_next(Error::connection("server has gone away"));
    table.fail_next(Error::Deadlock);
    table.fail_next(Error::timeout("query timed out"));
    let emitter = Arc::new(RecordingEmitter::new());

    let report = Extractor::new(
        options().with_backoff(fast_backoff()),
        Box::new(table.clone()),
        Arc::new(MemoryWatermarkStore::new()),
        emitter.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.completion, Completion::Exhausted);
    assert_eq!(report.stats.retries, 3);
    assert_eq!(emitter.batch_sizes(), vec![3]);

    let fetches = table.fetches();
    let gaps: Vec<Duration> = fetches.windows(2).take(3).map(|w| w[1].at - w[0].at).collect();
    assert_eq!(
        gaps,
        [
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
    assert!(gaps.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhaustion_fails_with_last_error() {
    let table = MockTable::with_primary_key("orders", &["id"], orders(1..=3));
    for _ in 0..4 {
        table.fail_next(Error::connection("connection refused"));
    }
    table.fail_next(Error::lock_wait("Lock wait timeout exceeded"));

    let failure = Extractor::new(
        options().with_backoff(fast_backoff()),
        Box::new(table.clone()),
        Arc::new(MemoryWatermarkStore::new()),
        Arc::new(RecordingEmitter::new()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.state, ExtractState::Execute);
    match failure.error {
        ExtractError::TransientSource { attempts, last } => {
            assert_eq!(attempts, 5);
            assert!(matches!(last, Error::LockWaitTimeout { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(table.fetch_count(), 5);
}

#[tokio::test]
async fn test_non_transient_error_is_not_retried() {
    let table = MockTable::with_primary_key("orders", &["id"], orders(1..=3));
    table.fail_next(Error::query("Unknown column 'totl' in 'field list'"));

    let failure = Extractor::new(
        options(),
        Box::new(table.clone()),
        Arc::new(MemoryWatermarkStore::new()),
        Arc::new(RecordingEmitter::new()),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.state, ExtractState::Execute);
    assert!(matches!(failure.error, ExtractError::Source(_)));
    assert_eq!(table.fetch_count(), 1);
}

#[tokio::test]
async fn test_failed_watermark_write_repeats_the_poll() {
    let table = MockTable::with_primary_key("orders", &["id"], orders(1..=4));
    let store = Arc::new(FlakyWatermarkStore::new());
    store.fail_next_puts(2);
    let emitter = Arc::new(RecordingEmitter::new());

    let report = Extractor::new(
        options().with_batch_size(2),
        Box::new(table),
        store.clone(),
        emitter.clone(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.completion, Completion::Exhausted);
    // rows 1-2 are delivered again until their watermark sticks
    let delivered: Vec<Vec<i64>> = emitter.batches().iter().map(|b| ids(&b.rows)).collect();
    assert_eq!(delivered, vec![vec![1, 2], vec![1, 2], vec![1, 2], vec![3, 4]]);
    assert_eq!(report.stats.watermark_write_failures, 2);
    assert_eq!(report.stats.watermark_writes, 2);
    assert_eq!(
        store.get(JOB).await.unwrap().unwrap().get("id"),
        Some(&Value::Int64(4))
    );
}

#[tokio::test]
async fn test_persistent_watermark_failure_fails_the_job() {
    let table = MockTable::with_primary_key("orders", &["id"], orders(1..=4));
    let store = Arc::new(FlakyWatermarkStore::new());
    store.fail_next_puts(u32::MAX);
    let emitter = Arc::new(RecordingEmitter::new());

    let failure = Extractor::new(
        options().with_max_watermark_write_failures(3),
        Box::new(table),
        store,
        emitter.clone(),
    )
    .run()
    .await
    .unwrap_err();

    assert_eq!(failure.state, ExtractState::Advance);
    assert!(matches!(failure.error, ExtractError::WatermarkStore(_)));
    assert_eq!(emitter.batches().len(), 3);
}

#[tokio::test]
async fn test_shutdown_before_first_poll() {
    let table = MockTable::with_primary_key("orders", &["id"], orders(1..=3));
    let token = CancellationToken::new();
    token.cancel();

    let report = Extractor::new(
        options(),
        Box::new(table.clone()),
        Arc::new(MemoryWatermarkStore::new()),
        Arc::new(RecordingEmitter::new()),
    )
    .with_shutdown(token)
    .run()
    .await
    .unwrap();

    assert_eq!(report.completion, Completion::Shutdown);
    assert_eq!(table.fetch_count(), 0);
    assert!(table.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_backoff() {
    let table = MockTable::with_primary_key("orders", &["id"], orders(1..=3));
    table.fail_next(Error::connection("server has gone away"));
    let token = CancellationToken::new();

    let backoff = fast_backoff().with_initial_delay(Duration::from_secs(60));
    let extractor = Extractor::new(
        options().with_backoff(backoff.with_max_delay(Duration::from_secs(600))),
        Box::new(table.clone()),
        Arc::new(MemoryWatermarkStore::new()),
        Arc::new(RecordingEmitter::new()),
    )
    .with_shutdown(token.clone());
    let job = tokio::spawn(extractor.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    let report = job.await.unwrap().unwrap();
    assert_eq!(report.completion, Completion::Shutdown);
    assert_eq!(table.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_continuous_mode_picks_up_new_rows() {
    let table = MockTable::with_primary_key("orders", &["id"], orders(1..=3));
    let store = Arc::new(MemoryWatermarkStore::new());
    let emitter = Arc::new(RecordingEmitter::new());
    let token = CancellationToken::new();

    let extractor = Extractor::new(
        continuous(Duration::from_secs(5)),
        Box::new(table.clone()),
        store.clone(),
        emitter.clone(),
    )
    .with_shutdown(token.clone());
    let job = tokio::spawn(extractor.run());

    tokio::time::sleep(Duration::from_secs(12)).await;
    table.insert(orders(4..=5));
    tokio::time::sleep(Duration::from_secs(10)).await;
    token.cancel();

    let report = job.await.unwrap().unwrap();
    assert_eq!(report.completion, Completion::Shutdown);
    assert_eq!(ids(&emitter.rows()), vec![1, 2, 3, 4, 5]);
    assert!(report.stats.empty_polls >= 2);
    assert_eq!(
        store.get(JOB).await.unwrap().unwrap().get("id"),
        Some(&Value::Int64(5))
    );

    let fetches = table.fetches();
    assert!(fetches
        .windows(2)
        .all(|w| w[1].at - w[0].at >= Duration::from_secs(5)));
}
