//! Assertion functions for checking what a read delivered.
//!
//! Concurrent reads interleave partitions arbitrarily, so most checks here
//! are order-insensitive across partitions and order-sensitive within one.

use std::collections::HashMap;

use serde_json::Value;

use crate::record::{Message, Record, StreamStatus};

/// Values of `field` across `records`, in delivery order. Records without
/// the field are skipped.
#[must_use]
pub fn field_values(records: &[Record], field: &str) -> Vec<Value> {
    records
        .iter()
        .filter_map(|record| record.get(field).cloned())
        .collect()
}

/// Assert that the records of `stream` whose `field` is one of `expected`
/// were delivered exactly in that order.
///
/// Use one call per partition to check per-partition ordering.
///
/// # Panics
///
/// Panics if any expected value is missing, duplicated or out of order.
///
/// # Example
///
/// ```
/// use partiflow::Record;
/// use partiflow::testing::{assert_delivered_in_order, row};
/// use serde_json::json;
///
/// let records = vec![
///     Record::new("s", row(json!({"n": 1}))),
///     Record::new("s", row(json!({"n": 10}))),
///     Record::new("s", row(json!({"n": 2}))),
/// ];
/// assert_delivered_in_order(&records, "s", "n", &[json!(1), json!(2)]);
/// ```
pub fn assert_delivered_in_order(records: &[Record], stream: &str, field: &str, expected: &[Value]) {
    let seen: Vec<Value> = records
        .iter()
        .filter(|record| record.stream == stream)
        .filter_map(|record| record.get(field))
        .filter(|value| expected.contains(*value))
        .cloned()
        .collect();
    assert_eq!(
        seen, expected,
        "Partition order mismatch for stream '{stream}' on field '{field}':\n  Expected: {expected:?}\n  Delivered: {seen:?}"
    );
}

/// Assert that `actual` and `expected` hold the same records, ignoring order.
///
/// # Panics
///
/// Panics if the two differ as multisets.
pub fn assert_same_records(actual: &[Record], expected: &[Record]) {
    fn counts(records: &[Record]) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for record in records {
            let key = format!("{}:{}", record.stream, Value::Object(record.data.clone()));
            *counts.entry(key).or_default() += 1;
        }
        counts
    }

    let actual_counts = counts(actual);
    let expected_counts = counts(expected);
    if actual_counts != expected_counts {
        let missing: Vec<_> = expected_counts
            .iter()
            .filter(|&(k, n)| actual_counts.get(k) != Some(n))
            .map(|(k, _)| k)
            .collect();
        let extra: Vec<_> = actual_counts
            .iter()
            .filter(|&(k, n)| expected_counts.get(k) != Some(n))
            .map(|(k, _)| k)
            .collect();
        panic!(
            "Record mismatch:\n  Missing or miscounted: {missing:?}\n  Extra or miscounted: {extra:?}\n  Expected {} records, got {}",
            expected.len(),
            actual.len()
        );
    }
}

/// Status transitions of `stream` in `messages`, in order.
#[must_use]
pub fn statuses_of(messages: &[Message], stream: &str) -> Vec<StreamStatus> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::Status(event) if event.stream == stream => Some(event.status),
            _ => None,
        })
        .collect()
}

/// Records contained in `messages`, in order.
#[must_use]
pub fn records_of(messages: &[Message]) -> Vec<Record> {
    messages
        .iter()
        .filter_map(|message| message.as_record().cloned())
        .collect()
}
