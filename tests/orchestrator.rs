//! End-to-end tests for concurrent reads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use partiflow::metrics::{
    DISCOVERY_FAILURES, PARTITIONS_COMPLETED, PARTITIONS_FAILED, RECORDS_READ, STREAMS_COMPLETED,
};
use partiflow::testing::*;
use partiflow::*;
use serde_json::{Map, Value, json};


/// Route engine logs through the test harness; `RUST_LOG=partiflow=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn rows(key: &str, n: usize) -> Vec<Map<String, Value>> {
    (0..n).map(|i| row(json!({"p": key, "i": i}))).collect()
}

fn config(max_workers: usize) -> ReadConfig {
    ReadConfig::default()
        .with_max_workers(max_workers)
        .with_stall_timeout(Duration::from_secs(10))
}

fn stream(name: &str, discovery: StaticDiscovery, fetcher: ScriptedFetcher) -> StreamDefinition {
    StreamDefinition::new(name, Arc::new(discovery), Arc::new(fetcher))
}

/// Stream `name` with one partition per `(key, rows)` pair.
fn simple_stream(name: &str, partitions: &[(&str, usize)]) -> StreamDefinition {
    let discovery = StaticDiscovery::new().with_stream(name, partitions.iter().map(|(key, _)| json!(key)));
    let fetcher = partitions
        .iter()
        .fold(ScriptedFetcher::new(), |fetcher, (key, n)| {
            fetcher.with_partition(json!(key), rows(key, *n))
        });
    stream(name, discovery, fetcher)
}

fn partition_order(records: &[Record], key: &str) -> Vec<Value> {
    records
        .iter()
        .filter(|r| r.data["p"] == key)
        .map(|r| r.data["i"].clone())
        .collect()
}

#[test]
fn test_sizes_two_zero_three_yield_five_records() -> Result<()> {
    init_tracing();
    let users = simple_stream("users", &[("p1", 2), ("p2", 0), ("p3", 3)]);
    let mut run = read(vec![users], config(2))?;
    let records = run.records().collect::<Result<Vec<_>, _>>()?;

    assert_eq!(records.len(), 5);
    assert_eq!(partition_order(&records, "p1"), vec![json!(0), json!(1)]);
    assert_eq!(partition_order(&records, "p3"), vec![json!(0), json!(1), json!(2)]);
    assert!(run.next().is_none());
    assert!(run.outstanding_partitions().is_empty());
    Ok(())
}

#[test]
fn test_records_union_across_streams() -> Result<()> {
    let a = simple_stream("a", &[("a1", 3), ("a2", 4)]);
    let b = simple_stream("b", &[("b1", 1)]);
    let c = simple_stream("c", &[]);
    let mut run = read(vec![a, b, c], config(3))?;
    let records = run.records().collect::<Result<Vec<_>, _>>()?;

    let mut expected = Vec::new();
    for (stream, key, n) in [("a", "a1", 3), ("a", "a2", 4), ("b", "b1", 1)] {
        expected.extend(rows(key, n).into_iter().map(|data| Record::new(stream, data)));
    }
    assert_same_records(&records, &expected);
    assert_eq!(run.record_count("a"), Some(7));
    assert_eq!(run.record_count("b"), Some(1));
    assert_eq!(run.record_count("c"), Some(0));
    assert_eq!(run.record_count("nope"), None);
    Ok(())
}

#[test]
fn test_failed_partition_ends_read_with_others_outstanding() -> Result<()> {
    init_tracing();
    let gate = Gate::new();
    // p2 is discovered last, so p1 and p3 are already running when it fails.
    let discovery = StaticDiscovery::new().with_stream("users", [json!("p1"), json!("p3"), json!("p2")]);
    let fetcher = ScriptedFetcher::new()
        .with_partition(json!("p1"), rows("p1", 2))
        .failing_after(json!("p2"), rows("p2", 1), "HTTP 502 from upstream")
        .with_partition(json!("p3"), rows("p3", 2))
        .gated(json!("p1"), &gate)
        .gated(json!("p3"), &gate);
    let mut run = read(vec![stream("users", discovery, fetcher)], config(3))?;

    let (records, err) = expect_terminal_error!(run.records());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data["p"], "p2");
    match &err {
        ReadError::PartitionRead { stream, partition, source } => {
            assert_eq!(stream, "users");
            assert_eq!(partition, "\"p2\"");
            assert!(format!("{source:#}").contains("HTTP 502"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(
        run.outstanding_partitions(),
        vec![PartitionId::new(1), PartitionId::new(2)]
    );
    assert_eq!(run.status("users"), Some(StreamStatus::Incomplete));
    gate.open();
    Ok(())
}

#[test]
fn test_failure_marks_started_streams_incomplete_before_error() -> Result<()> {
    let discovery = StaticDiscovery::new().with_stream("bad", [json!("x")]);
    let fetcher = ScriptedFetcher::new().failing_to_open(json!("x"), "boom");
    let mut run = read(vec![stream("bad", discovery, fetcher)], config(2))?;

    let (messages, err) = expect_terminal_error!(run.by_ref());
    assert_read_error!(err, ReadError::PartitionRead { .. });
    assert_eq!(
        statuses_of(&messages, "bad"),
        vec![StreamStatus::Started, StreamStatus::Incomplete]
    );
    Ok(())
}

#[test]
fn test_failure_marks_streams_still_waiting_incomplete() -> Result<()> {
    let discovery = StaticDiscovery::new().with_stream("first", [json!("f1")]);
    let fetcher = ScriptedFetcher::new().failing_to_open(json!("f1"), "boom");
    let first = stream("first", discovery, fetcher);
    // Holds the only generator slot, so "last" never starts.
    let gate = Gate::new();
    let blocker = stream(
        "blocker",
        StaticDiscovery::new()
            .with_stream("blocker", [json!("b1")])
            .gated("blocker", &gate),
        ScriptedFetcher::new().with_partition(json!("b1"), rows("b1", 1)),
    );
    let last = simple_stream("last", &[("l1", 1)]);
    let config = ReadConfig {
        max_concurrent_generators: Some(1),
        ..config(2)
    };
    let mut run = read(vec![first, blocker, last], config)?;

    let (messages, err) = expect_terminal_error!(run.by_ref());
    assert_read_error!(err, ReadError::PartitionRead { .. });
    assert_eq!(
        statuses_of(&messages, "first"),
        vec![StreamStatus::Started, StreamStatus::Incomplete]
    );
    assert_eq!(statuses_of(&messages, "last"), vec![StreamStatus::Incomplete]);
    assert_eq!(run.status("blocker"), Some(StreamStatus::Incomplete));
    gate.open();
    Ok(())
}

#[test]
fn test_discovery_failures_raised_after_everything_else() -> Result<()> {
    init_tracing();
    let good = simple_stream("good", &[("g1", 2), ("g2", 2)]);
    let partial = stream(
        "partial",
        StaticDiscovery::new()
            .with_stream("partial", [json!("q1")])
            .with_error("partial", "page token expired"),
        ScriptedFetcher::new().with_partition(json!("q1"), rows("q1", 3)),
    );
    let broken = StreamDefinition::new(
        "broken",
        Arc::new(FailingDiscovery::new("table dropped")),
        Arc::new(ScriptedFetcher::new()),
    );
    let metrics = MetricsCollector::new();
    let mut run = read(vec![good, partial, broken], config(4))?.with_metrics(metrics.clone());

    let (messages, err) = expect_terminal_error!(run.by_ref());
    let records = records_of(&messages);
    assert_eq!(records.len(), 7);

    match &err {
        ReadError::Discovery { failures } => {
            let mut streams: Vec<_> = failures.iter().map(|f| f.stream.as_str()).collect();
            streams.sort_unstable();
            assert_eq!(streams, vec!["broken", "partial"]);
        }
        other => panic!("unexpected error {other}"),
    }
    let message = err.to_string();
    assert!(message.contains("page token expired"), "{message}");
    assert!(message.contains("table dropped"), "{message}");

    assert_eq!(statuses_of(&messages, "good").last(), Some(&StreamStatus::Complete));
    assert_eq!(statuses_of(&messages, "partial").last(), Some(&StreamStatus::Incomplete));
    assert_eq!(statuses_of(&messages, "broken").last(), Some(&StreamStatus::Incomplete));
    assert_eq!(metrics.counter(DISCOVERY_FAILURES), Some(2));
    assert_eq!(metrics.counter(STREAMS_COMPLETED), Some(1));
    Ok(())
}

#[test]
fn test_status_sequence_for_successful_stream() -> Result<()> {
    let users = simple_stream("users", &[("p1", 2)]);
    let empty = simple_stream("empty", &[("e1", 0)]);
    let mut run = read(vec![users, empty], config(2))?;
    let messages = run.by_ref().collect::<Result<Vec<_>, _>>()?;

    assert_eq!(
        statuses_of(&messages, "users"),
        vec![StreamStatus::Started, StreamStatus::Running, StreamStatus::Complete]
    );
    assert_eq!(
        statuses_of(&messages, "empty"),
        vec![StreamStatus::Started, StreamStatus::Complete]
    );

    // Running precedes the stream's first record; Complete follows its last.
    let position = |wanted: &Message| messages.iter().position(|m| m == wanted);
    let running = position(&Message::Status(StreamStatusEvent {
        stream: "users".into(),
        status: StreamStatus::Running,
    }));
    let complete = position(&Message::Status(StreamStatusEvent {
        stream: "users".into(),
        status: StreamStatus::Complete,
    }));
    let first = messages.iter().position(|m| m.as_record().is_some());
    let last = messages.iter().rposition(|m| m.as_record().is_some());
    assert!(running < first);
    assert!(last < complete);
    Ok(())
}

#[test]
fn test_unavailable_stream_is_skipped() -> Result<()> {
    let availability = StaticAvailability::new().unavailable("secret", "403 forbidden");
    let secret = StreamDefinition::new(
        "secret",
        Arc::new(FailingDiscovery::panicking("must not be discovered")),
        Arc::new(ScriptedFetcher::new()),
    )
    .with_availability(Arc::new(availability.clone()));
    let open = simple_stream("open", &[("o1", 1)]);

    let mut run = read(vec![secret, open], config(2))?;
    let messages = run.by_ref().collect::<Result<Vec<_>, _>>()?;

    assert!(availability.was_checked("secret"));
    assert_eq!(statuses_of(&messages, "secret"), vec![StreamStatus::Incomplete]);
    assert_eq!(records_of(&messages).len(), 1);
    assert_eq!(
        run.skipped_streams(),
        &[SkippedStream {
            stream: "secret".into(),
            reason: "403 forbidden".into(),
        }]
    );
    Ok(())
}

#[test]
fn test_all_streams_unavailable_reads_nothing() -> Result<()> {
    let availability = Arc::new(StaticAvailability::new().unavailable("only", "offline"));
    let only = simple_stream("only", &[("x", 5)]).with_availability(availability);
    let mut run = read(vec![only], config(2))?;

    let messages = run.by_ref().collect::<Result<Vec<_>, _>>()?;
    assert_eq!(
        messages,
        vec![Message::Status(StreamStatusEvent {
            stream: "only".into(),
            status: StreamStatus::Incomplete,
        })]
    );
    Ok(())
}

#[test]
fn test_cursor_tracks_max_of_yielded_records() -> Result<()> {
    let discovery = StaticDiscovery::new().with_stream("events", [json!("d1"), json!("d2"), json!("d3")]);
    let fetcher = ScriptedFetcher::new()
        .with_partition(json!("d1"), vec![row(json!({"ts": 5})), row(json!({"ts": 1}))])
        .with_partition(json!("d2"), vec![row(json!({"ts": 42})), row(json!({"other": 1}))])
        .with_partition(json!("d3"), vec![row(json!({"ts": 17}))]);
    let events = stream("events", discovery, fetcher).with_cursor_field("ts");
    let mut run = read(vec![events], config(3))?;

    let mut max_seen: Option<i64> = None;
    loop {
        let Some(record) = run.records().next() else {
            break;
        };
        let record = record?;
        if let Some(ts) = record.get("ts").and_then(Value::as_i64) {
            max_seen = Some(max_seen.map_or(ts, |m| m.max(ts)));
        }
        assert_eq!(run.get_updated_state("events"), max_seen.map(|m| json!(m)));
    }
    assert_eq!(run.get_updated_state("events"), Some(json!(42)));
    Ok(())
}

#[test]
fn test_incremental_stream_emits_checkpoints_when_mark_advances() -> Result<()> {
    let discovery = StaticDiscovery::new().with_stream("orders", [json!("m1"), json!("m2")]);
    let fetcher = ScriptedFetcher::new()
        .with_partition(json!("m1"), vec![row(json!({"meta": {"updated": "2024-01-03"}}))])
        .with_partition(json!("m2"), vec![row(json!({"meta": {"updated": "2024-01-01"}}))]);
    let orders = stream("orders", discovery, fetcher).incremental("meta.updated");
    // One worker reads the partitions in discovery order.
    let mut run = read(vec![orders], config(1))?;
    let messages = run.by_ref().collect::<Result<Vec<_>, _>>()?;

    let states: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::State(state) => Some(state.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![StateCheckpoint {
            stream: "orders".into(),
            cursor_field: "meta.updated".into(),
            value: json!("2024-01-03"),
        }]
    );
    assert_eq!(run.get_updated_state("orders"), Some(json!("2024-01-03")));
    Ok(())
}

#[test]
fn test_full_refresh_cursor_emits_no_checkpoints() -> Result<()> {
    let tracked = simple_stream("tracked", &[("t1", 3)]).with_cursor_field("i");
    let mut run = read(vec![tracked], config(2))?;
    let messages = run.by_ref().collect::<Result<Vec<_>, _>>()?;

    assert!(!messages.iter().any(|m| matches!(m, Message::State(_))));
    assert_eq!(run.get_updated_state("tracked"), Some(json!(2)));
    Ok(())
}

#[test]
fn test_in_flight_limit_of_one_still_reads_everything() -> Result<()> {
    let users = simple_stream("users", &[("p1", 2), ("p2", 2), ("p3", 2), ("p4", 2)]);
    let config = ReadConfig {
        max_in_flight_partitions: Some(1),
        ..config(4)
    };
    let mut run = read(vec![users], config)?;
    let records = run.records().collect::<Result<Vec<_>, _>>()?;

    assert_eq!(records.len(), 8);
    // With one partition in flight, partitions are read back to back.
    let keys: Vec<_> = records.iter().map(|r| r.data["p"].clone()).collect();
    let mut runs = keys.clone();
    runs.dedup();
    assert_eq!(runs.len(), 4, "partitions interleaved: {keys:?}");
    Ok(())
}

#[test]
fn test_generators_start_one_at_a_time() -> Result<()> {
    let streams = vec![
        simple_stream("a", &[("a1", 1)]),
        simple_stream("b", &[("b1", 1)]),
        simple_stream("c", &[("c1", 1)]),
    ];
    let config = ReadConfig {
        max_concurrent_generators: Some(1),
        ..config(2)
    };
    let mut run = read(streams, config)?;
    let messages = run.by_ref().collect::<Result<Vec<_>, _>>()?;

    let started: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Status(event) if event.status == StreamStatus::Started => Some(event.stream.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["a", "b", "c"]);
    assert_eq!(records_of(&messages).len(), 3);
    Ok(())
}

#[mark_flaky_tests::flaky]
#[test]
fn test_stall_timeout_ends_read() -> Result<()> {
    let gate = Gate::new();
    let discovery = StaticDiscovery::new().with_stream("slow", [json!("s1")]);
    let fetcher = ScriptedFetcher::new()
        .with_partition(json!("s1"), rows("s1", 1))
        .gated(json!("s1"), &gate);
    let config = config(2).with_stall_timeout(Duration::from_millis(100));
    let mut run = read(vec![stream("slow", discovery, fetcher)], config)?;

    let (_, err) = expect_terminal_error!(run.records());
    assert!(err.is_retryable());
    assert_read_error!(err, ReadError::StallTimeout { outstanding: 1, .. });
    gate.open();
    Ok(())
}

#[mark_flaky_tests::flaky]
#[test]
fn test_read_timeout_ends_read() -> Result<()> {
    let gate = Gate::new();
    let discovery = StaticDiscovery::new().with_stream("slow", [json!("s1")]);
    let fetcher = ScriptedFetcher::new()
        .with_partition(json!("s1"), rows("s1", 1))
        .gated(json!("s1"), &gate);
    let config = config(2).with_read_timeout(Duration::from_millis(100));
    let mut run = read(vec![stream("slow", discovery, fetcher)], config)?;

    let (_, err) = expect_terminal_error!(run.records());
    assert_read_error!(err, ReadError::ReadTimeout { .. });
    gate.open();
    Ok(())
}

#[test]
fn test_duplicate_stream_names_are_rejected() {
    let err = read(
        vec![simple_stream("dup", &[]), simple_stream("dup", &[])],
        config(2),
    )
    .err();
    assert!(err.is_some());
    assert_read_error!(err.unwrap(), ReadError::Config(_));
}

#[test]
fn test_invalid_config_is_rejected_before_starting() {
    let config = ReadConfig {
        max_workers: 0,
        ..ReadConfig::default()
    };
    let err = read(vec![simple_stream("a", &[("a1", 1)])], config).err();
    assert!(err.is_some());
    assert_read_error!(err.unwrap(), ReadError::Config(_));
}

#[test]
fn test_panicking_fetcher_fails_read() -> Result<()> {
    let discovery = StaticDiscovery::new().with_stream("x", [json!("x1")]);
    let fetcher = ScriptedFetcher::new().panicking(json!("x1"), "index out of bounds");
    let mut run = read(vec![stream("x", discovery, fetcher)], config(2))?;

    let (_, err) = expect_terminal_error!(run.records());
    assert!(err.to_string().contains("index out of bounds"));
    Ok(())
}

#[test]
fn test_metrics_counters() -> Result<()> {
    let metrics = MetricsCollector::new();
    let users = simple_stream("users", &[("p1", 2), ("p2", 3)]);
    let mut run = read(vec![users], config(2))?.with_metrics(metrics.clone());
    run.by_ref().collect::<Result<Vec<_>, _>>()?;

    assert_eq!(metrics.counter(RECORDS_READ), Some(5));
    assert_eq!(metrics.counter(PARTITIONS_COMPLETED), Some(2));
    assert_eq!(metrics.counter(PARTITIONS_FAILED), None);
    assert_eq!(metrics.counter(STREAMS_COMPLETED), Some(1));
    assert!(metrics.elapsed().is_some());
    Ok(())
}

#[test]
fn test_each_partition_fetched_once() -> Result<()> {
    let discovery = StaticDiscovery::new().with_stream("s", [json!("k1"), json!("k2")]);
    let fetcher = Arc::new(
        ScriptedFetcher::new()
            .with_partition(json!("k1"), rows("k1", 1))
            .with_partition(json!("k2"), rows("k2", 1)),
    );
    let s = StreamDefinition::new("s", Arc::new(discovery), fetcher.clone());
    let mut run = read(vec![s], config(2))?;
    run.records().collect::<Result<Vec<_>, _>>()?;

    assert_eq!(fetcher.fetch_count(&json!("k1")), 1);
    assert_eq!(fetcher.fetch_count(&json!("k2")), 1);
    Ok(())
}

#[test]
fn test_partition_order_holds_for_any_worker_count() -> Result<()> {
    let keys: Vec<String> = (0..8).map(|p| format!("p{p}")).collect();
    let partitions: Vec<(&str, usize)> = keys.iter().map(|key| (key.as_str(), 200)).collect();
    let expected: Vec<Value> = (0..200).map(|i| json!(i)).collect();

    for max_workers in [1, 4, 8] {
        let config = ReadConfig {
            queue_capacity: 4,
            ..config(max_workers)
        };
        let mut run = read(vec![simple_stream("s", &partitions)], config)?;
        let records = run.records().collect::<Result<Vec<_>, _>>()?;
        assert_eq!(records.len(), 8 * 200, "max_workers = {max_workers}");

        for key in &keys {
            let partition: Vec<Record> = records
                .iter()
                .filter(|r| r.data["p"] == key.as_str())
                .cloned()
                .collect();
            assert_delivered_in_order(&partition, "s", "i", &expected);
        }
    }
    Ok(())
}

#[test]
fn test_resumed_stream_checkpoints_only_past_its_state() -> Result<()> {
    let discovery = StaticDiscovery::new().with_stream("orders", [json!("m1"), json!("m2")]);
    let fetcher = ScriptedFetcher::new()
        .with_partition(json!("m1"), vec![row(json!({"ts": 3})), row(json!({"ts": 7}))])
        .with_partition(json!("m2"), vec![row(json!({"ts": 12}))]);
    let orders = stream("orders", discovery, fetcher)
        .incremental("ts")
        .with_state(json!(10));
    let mut run = read(vec![orders], config(1))?;
    assert_eq!(run.get_updated_state("orders"), Some(json!(10)));

    let mut states = Vec::new();
    let mut records = 0;
    while let Some(message) = run.next() {
        match message? {
            Message::Record(_) => records += 1,
            Message::State(state) => states.push(state.value),
            _ => {}
        }
        let mark = run.get_updated_state("orders");
        assert!(mark.as_ref().and_then(Value::as_i64).is_some_and(|ts| ts >= 10), "{mark:?}");
    }

    assert_eq!(records, 3);
    assert_eq!(states, vec![json!(12)]);
    assert_eq!(run.get_updated_state("orders"), Some(json!(12)));
    Ok(())
}

#[test]
fn test_unusable_state_is_ignored() -> Result<()> {
    let events = simple_stream("events", &[("e1", 2)])
        .incremental("i")
        .with_state(json!({"not": "a cursor"}));
    let mut run = read(vec![events], config(1))?;
    assert_eq!(run.get_updated_state("events"), None);
    run.records().collect::<Result<Vec<_>, _>>()?;
    assert_eq!(run.get_updated_state("events"), Some(json!(1)));
    Ok(())
}

#[test]
fn test_partition_dispatch_logs_when_enabled() -> Result<()> {
    let users = simple_stream("users", &[("p1", 2), ("p2", 1)]);
    let config = ReadConfig {
        log_partitions: true,
        ..config(1)
    };
    let mut run = read(vec![users], config)?;
    let messages = run.by_ref().collect::<Result<Vec<_>, _>>()?;

    let logs: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            Message::Log(log) => Some(log.clone()),
            _ => None,
        })
        .collect();
    let expected = ["slice:\"p1\"", "slice:\"p2\""].map(|message| LogMessage {
        stream: "users".into(),
        message: message.into(),
    });
    assert_eq!(logs, expected);

    // Each partition's log line comes before its records.
    for key in ["p1", "p2"] {
        let log_at = messages
            .iter()
            .position(|m| matches!(m, Message::Log(log) if log.message.contains(key)));
        let first_record = messages
            .iter()
            .position(|m| m.as_record().is_some_and(|r| r.data["p"] == key));
        assert!(log_at < first_record, "{key}: {log_at:?} vs {first_record:?}");
    }
    assert_eq!(records_of(&messages).len(), 3);
    Ok(())
}

#[test]
fn test_partition_logs_are_off_by_default() -> Result<()> {
    let users = simple_stream("users", &[("p1", 2)]);
    let mut run = read(vec![users], config(1))?;
    let messages = run.by_ref().collect::<Result<Vec<_>, _>>()?;
    assert!(!messages.iter().any(|m| matches!(m, Message::Log(_))));
    Ok(())
}
