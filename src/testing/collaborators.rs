//! In-memory collaborators for driving a read from tests.
//!
//! Partitions are keyed by their JSON key, rendered with `to_string`, so the
//! discovery side and the fetch side agree on which script belongs to which
//! partition:
//!
//! ```
//! use partiflow::testing::{ScriptedFetcher, StaticDiscovery, row};
//! use serde_json::json;
//!
//! let discovery = StaticDiscovery::new().with_stream("users", [json!(1), json!(2)]);
//! let fetcher = ScriptedFetcher::new()
//!     .with_partition(json!(1), vec![row(json!({"id": 1}))])
//!     .with_partition(json!(2), vec![]);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde_json::{Map, Value};

use crate::cursor::CursorField;
use crate::partition::{Partition, SyncMode};
use crate::stream::{
    Availability, AvailabilityStrategy, PartitionDiscovery, PartitionStream, RecordFetcher,
    RecordStream,
};

/// Longest a [`Gate`] holds a worker before letting it through anyway.
const GATE_CEILING: Duration = Duration::from_secs(30);

/// Turn a `json!({...})` object into record data.
///
/// # Panics
///
/// Panics if `value` is not a JSON object.
#[must_use]
pub fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("row() expects a JSON object, got {other}"),
    }
}

/// A latch that holds partition readers until the test opens it.
///
/// Waiters give up after a generous ceiling so a forgotten gate cannot pin
/// pool threads forever.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the gate opens.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = cvar
            .wait_timeout_while(guard, GATE_CEILING, |open| !*open)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[derive(Clone, Default)]
struct DiscoveryScript {
    elements: Vec<Result<Value, String>>,
    open_error: Option<String>,
    gate: Option<Gate>,
}

/// Discovery over a fixed list of partition keys per stream.
#[derive(Clone, Default)]
pub struct StaticDiscovery {
    streams: HashMap<String, DiscoveryScript>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append partitions with the given keys to `stream`.
    #[must_use]
    pub fn with_stream(mut self, stream: &str, keys: impl IntoIterator<Item = Value>) -> Self {
        self.streams
            .entry(stream.to_string())
            .or_default()
            .elements
            .extend(keys.into_iter().map(Ok));
        self
    }

    /// Append an error element to `stream`'s partitions.
    #[must_use]
    pub fn with_error(mut self, stream: &str, message: &str) -> Self {
        self.streams
            .entry(stream.to_string())
            .or_default()
            .elements
            .push(Err(message.to_string()));
        self
    }

    /// Make discovery of `stream` fail before producing anything.
    #[must_use]
    pub fn failing_to_open(mut self, stream: &str, message: &str) -> Self {
        self.streams.entry(stream.to_string()).or_default().open_error = Some(message.to_string());
        self
    }

    /// Hold discovery of `stream` until `gate` opens.
    #[must_use]
    pub fn gated(mut self, stream: &str, gate: &Gate) -> Self {
        self.streams.entry(stream.to_string()).or_default().gate = Some(gate.clone());
        self
    }
}

impl PartitionDiscovery for StaticDiscovery {
    fn enumerate_partitions<'a>(
        &'a self,
        stream: &'a str,
        _sync_mode: SyncMode,
        _cursor_field: Option<&'a CursorField>,
    ) -> anyhow::Result<PartitionStream<'a>> {
        let script = self
            .streams
            .get(stream)
            .ok_or_else(|| anyhow!("no partitions scripted for '{stream}'"))?;
        if let Some(gate) = &script.gate {
            gate.wait();
        }
        if let Some(message) = &script.open_error {
            bail!("{message}");
        }
        Ok(Box::new(script.elements.iter().map(move |element| match element {
            Ok(key) => Ok(Partition::new(stream, key.clone())),
            Err(message) => Err(anyhow!("{message}")),
        })))
    }
}

/// Discovery that always fails, either with an error or a panic.
#[derive(Clone, Debug)]
pub struct FailingDiscovery {
    message: String,
    panics: bool,
}

impl FailingDiscovery {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panics: false,
        }
    }

    pub fn panicking(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panics: true,
        }
    }
}

impl PartitionDiscovery for FailingDiscovery {
    fn enumerate_partitions<'a>(
        &'a self,
        _stream: &'a str,
        _sync_mode: SyncMode,
        _cursor_field: Option<&'a CursorField>,
    ) -> anyhow::Result<PartitionStream<'a>> {
        if self.panics {
            panic!("{}", self.message);
        }
        bail!("{}", self.message)
    }
}

#[derive(Clone, Default)]
enum Ending {
    #[default]
    Exhausted,
    FailAfterRows(String),
    FailToOpen(String),
    Panic(String),
}

#[derive(Clone, Default)]
struct FetchScript {
    rows: Vec<Map<String, Value>>,
    ending: Ending,
    gate: Option<Gate>,
}

/// Fetcher that replays scripted rows per partition key.
///
/// Fetching a partition with no script is an error.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: HashMap<String, FetchScript>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl ScriptedFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&mut self, key: &Value) -> &mut FetchScript {
        self.scripts.entry(key.to_string()).or_default()
    }

    #[must_use]
    pub fn with_partition(mut self, key: Value, rows: Vec<Map<String, Value>>) -> Self {
        self.script(&key).rows = rows;
        self
    }

    /// Yield `rows`, then fail with `message`.
    #[must_use]
    pub fn failing_after(mut self, key: Value, rows: Vec<Map<String, Value>>, message: &str) -> Self {
        let script = self.script(&key);
        script.rows = rows;
        script.ending = Ending::FailAfterRows(message.to_string());
        self
    }

    #[must_use]
    pub fn failing_to_open(mut self, key: Value, message: &str) -> Self {
        self.script(&key).ending = Ending::FailToOpen(message.to_string());
        self
    }

    #[must_use]
    pub fn panicking(mut self, key: Value, message: &str) -> Self {
        self.script(&key).ending = Ending::Panic(message.to_string());
        self
    }

    /// Hold the partition's reader at open until `gate` opens.
    #[must_use]
    pub fn gated(mut self, key: Value, gate: &Gate) -> Self {
        self.script(&key).gate = Some(gate.clone());
        self
    }

    /// How many times the partition with `key` was fetched.
    #[must_use]
    pub fn fetch_count(&self, key: &Value) -> usize {
        self.fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.to_string())
            .copied()
            .unwrap_or(0)
    }
}

impl RecordFetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, partition: &'a Partition) -> anyhow::Result<RecordStream<'a>> {
        let key = partition.key().to_string();
        *self
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default() += 1;
        let script = self
            .scripts
            .get(&key)
            .ok_or_else(|| anyhow!("no rows scripted for partition {partition}"))?;
        if let Some(gate) = &script.gate {
            gate.wait();
        }
        let tail = match &script.ending {
            Ending::Exhausted => None,
            Ending::FailAfterRows(message) => Some(Err(anyhow!("{message}"))),
            Ending::FailToOpen(message) => bail!("{message}"),
            Ending::Panic(message) => panic!("{message}"),
        };
        Ok(Box::new(script.rows.iter().cloned().map(Ok).chain(tail)))
    }
}

/// Availability decided up front per stream name. Unlisted streams are
/// available.
#[derive(Clone, Debug, Default)]
pub struct StaticAvailability {
    unavailable: HashMap<String, String>,
    checked: Arc<Mutex<HashSet<String>>>,
}

impl StaticAvailability {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn unavailable(mut self, stream: &str, reason: &str) -> Self {
        self.unavailable.insert(stream.to_string(), reason.to_string());
        self
    }

    /// Whether `stream` has been checked.
    #[must_use]
    pub fn was_checked(&self, stream: &str) -> bool {
        self.checked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(stream)
    }
}

impl AvailabilityStrategy for StaticAvailability {
    fn check(&self, stream: &str) -> Availability {
        self.checked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream.to_string());
        match self.unavailable.get(stream) {
            Some(reason) => Availability::unavailable(reason.clone()),
            None => Availability::available(),
        }
    }
}
