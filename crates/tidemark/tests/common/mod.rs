//! Shared fixtures for extraction tests

#![allow(dead_code)]

use std::time::Duration;

use tidemark::engine::{JobOptions, Mode};
use tidemark::retry::BackoffPolicy;
use tidemark::source::TableRef;
use tidemark_rdbc::types::Row;
use tidemark_rdbc::Value;

pub const JOB: &str = "localhost:3306/shop/orders";

/// `orders` row keyed by `id`
pub fn order(id: i64) -> Row {
    Row::new(
        vec!["id".into(), "customer_id".into(), "total".into()],
        vec![
            Value::Int64(id),
            Value::Int32((id % 17) as i32),
            Value::from(format!("{}.00", id * 3)),
        ],
    )
}

pub fn orders(range: std::ops::RangeInclusive<i64>) -> Vec<Row> {
    range.map(order).collect()
}

/// Row keyed by `(tenant_id, id)`
pub fn tenant_row(tenant: i64, id: i64) -> Row {
    Row::new(
        vec!["tenant_id".into(), "id".into(), "note".into()],
        vec![
            Value::Int64(tenant),
            Value::Int64(id),
            Value::from(format!("{tenant}-{id}")),
        ],
    )
}

pub fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|r| r.get_by_name("id").and_then(Value::as_i64).unwrap())
        .collect()
}

pub fn options() -> JobOptions {
    JobOptions::new(JOB, TableRef::new("orders").with_schema("shop"))
}

pub fn continuous(poll_interval: Duration) -> JobOptions {
    options()
        .with_mode(Mode::Continuous)
        .with_poll_interval(poll_interval)
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new()
        .with_max_attempts(5)
        .with_initial_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(10))
        .with_multiplier(2.0)
}
