//! Metrics collection and reporting for concurrent reads.
//!
//! A [`MetricsCollector`] can be attached to a read with
//! [`ConcurrentRead::with_metrics`](crate::ConcurrentRead::with_metrics). The
//! orchestrator then keeps the built-in counters named in this module up to
//! date, and callers may register their own [`Metric`]s alongside them.
//!
//! # Example
//!
//! ```no_run
//! use partiflow::metrics::{MetricsCollector, RECORDS_READ};
//! use partiflow::{ReadConfig, read};
//!
//! # fn main() -> anyhow::Result<()> {
//! let metrics = MetricsCollector::new();
//! let mut run = read(Vec::new(), ReadConfig::default())?.with_metrics(metrics.clone());
//! for message in run.by_ref() {
//!     message?;
//! }
//! println!("{}", metrics.snapshot()[RECORDS_READ]);
//! metrics.save_to_file("read-metrics.json")?;
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{Value, json};

/// Records delivered to the caller.
pub const RECORDS_READ: &str = "records_read";
/// Partitions whose completion sentinel was consumed.
pub const PARTITIONS_COMPLETED: &str = "partitions_completed";
/// Partitions that ended in a failure item.
pub const PARTITIONS_FAILED: &str = "partitions_failed";
/// Discovery failures collected across all streams.
pub const DISCOVERY_FAILURES: &str = "discovery_failures";
/// Streams that reached `Complete`.
pub const STREAMS_COMPLETED: &str = "streams_completed";
/// Reads that ended because the queue stayed silent too long.
pub const STALL_TIMEOUTS: &str = "stall_timeouts";

/// Something the collector can report.
pub trait Metric: Send + Sync + Any {
    fn name(&self) -> &str;

    /// The current value as JSON.
    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }

    /// Cast to Any for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Thread-safe container for read metrics. Clones share the same storage.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsCollectorInner>>,
}

struct MetricsCollectorInner {
    metrics: HashMap<String, Box<dyn Metric>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsCollectorInner {
                metrics: HashMap::new(),
                start_time: None,
                end_time: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsCollectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a metric, replacing any metric with the same name.
    pub fn register(&self, metric: Box<dyn Metric>) {
        self.lock().metrics.insert(metric.name().to_string(), metric);
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    /// Time between [`record_start`](Self::record_start) and
    /// [`record_end`](Self::record_end), once both happened.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Add `value` to the counter `name`, creating it at zero first if needed.
    ///
    /// A non-counter metric registered under the same name is left alone.
    pub fn increment_counter(&self, name: &str, value: u64) {
        let mut inner = self.lock();
        match inner.metrics.get(name) {
            Some(metric) => {
                if let Some(counter) = metric.as_any().downcast_ref::<CounterMetric>() {
                    counter.add(value);
                }
            }
            None => {
                inner
                    .metrics
                    .insert(name.to_string(), Box::new(CounterMetric::with_value(name, value)));
            }
        }
    }

    /// Set the counter `name` to `value`.
    pub fn set_counter(&self, name: &str, value: u64) {
        self.register(Box::new(CounterMetric::with_value(name, value)));
    }

    /// Current value of a counter, if one is registered under `name`.
    #[must_use]
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.lock()
            .metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>())
            .map(CounterMetric::get)
    }

    /// All metrics as a JSON object, plus `execution_time_ms` once the read
    /// has ended.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut metrics_json = serde_json::Map::new();

        for (name, metric) in &inner.metrics {
            let mut metric_obj = serde_json::Map::new();
            metric_obj.insert("value".to_string(), metric.value());
            if let Some(desc) = metric.description() {
                metric_obj.insert("description".to_string(), json!(desc));
            }
            metrics_json.insert(name.clone(), Value::Object(metric_obj));
        }

        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            metrics_json.insert(
                "execution_time_ms".to_string(),
                json!({
                    "value": end.duration_since(start).as_millis(),
                    "description": "Total read time in milliseconds",
                }),
            );
        }
        drop(inner);
        Value::Object(metrics_json)
    }

    /// Save all metrics to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written to.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path)?;
        file.write_all(formatted.as_bytes())?;
        Ok(())
    }

    /// Snapshot of every metric name and value.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.lock()
            .metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.value()))
            .collect()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// A monotonically increasing counter.
pub struct CounterMetric {
    name: String,
    count: AtomicU64,
}

impl CounterMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_value(name, 0)
    }

    pub fn with_value(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            count: AtomicU64::new(count),
        }
    }

    pub fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.get())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A gauge metric that holds a single numeric value.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
