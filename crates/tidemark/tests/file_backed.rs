//! Restart behaviour with the file watermark store and JSON lines emitter

mod common;

use std::path::Path;
use std::sync::Arc;

use common::*;
use tidemark::engine::{Completion, Extractor};
use tidemark::emitter::JsonLinesEmitter;
use tidemark::testing::MockTable;
use tidemark::watermark::{FileWatermarkStore, WatermarkStore};
use tidemark_rdbc::Value;

fn emitted_ids(dir: &Path) -> (usize, Vec<i64>) {
    let job_dir = dir.join("localhost_3306_shop_orders");
    let mut files: Vec<_> = std::fs::read_dir(&job_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();

    let mut ids = Vec::new();
    for file in &files {
        for line in std::fs::read_to_string(file).unwrap().lines() {
            let row: serde_json::Value = serde_json::from_str(line).unwrap();
            ids.push(row["id"].as_i64().unwrap());
        }
    }
    (files.len(), ids)
}

#[tokio::test]
async fn test_restart_resumes_from_file_watermark() {
    let state = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let table = MockTable::with_primary_key("orders", &["id"], orders(1..=10));

    {
        let store = Arc::new(FileWatermarkStore::open(state.path()).await.unwrap());
        let report = Extractor::new(
            options().with_batch_size(4),
            Box::new(table.clone()),
            store,
            Arc::new(JsonLinesEmitter::new(out.path())),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(report.completion, Completion::Exhausted);
    }

    let (files, ids) = emitted_ids(out.path());
    assert_eq!(files, 3);
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());

    // rows arriving between runs are picked up by the next process
    table.insert(orders(11..=15));
    let store = Arc::new(FileWatermarkStore::open(state.path()).await.unwrap());
    assert_eq!(
        store.get(JOB).await.unwrap().unwrap().get("id"),
        Some(&Value::Int64(10))
    );

    let report = Extractor::new(
        options().with_batch_size(4),
        Box::new(table.clone()),
        store.clone(),
        Arc::new(JsonLinesEmitter::new(out.path())),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.stats.rows, 5);

    let (files, ids) = emitted_ids(out.path());
    assert_eq!(files, 5);
    assert_eq!(ids.len(), 15);
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted, (1..=15).collect::<Vec<_>>());
    assert_eq!(
        store.get(JOB).await.unwrap().unwrap().get("id"),
        Some(&Value::Int64(15))
    );
}
