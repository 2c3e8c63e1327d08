//! Read configuration.
//!
//! Both configs are plain structs with public fields and sensible defaults, so
//! the usual way to build one is struct-update syntax:
//!
//! ```
//! use partiflow::ReadConfig;
//! use std::time::Duration;
//!
//! let config = ReadConfig {
//!     max_workers: 4,
//!     read_timeout: Some(Duration::from_secs(3600)),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! They also deserialize from JSON, with timeouts given in seconds:
//!
//! ```
//! use partiflow::ReadConfig;
//!
//! let config = ReadConfig::from_json(r#"{ "max_workers": 8, "stall_timeout_secs": 30 }"#).unwrap();
//! assert_eq!(config.max_workers, 8);
//! assert_eq!(config.generator_limit(), 4);
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ReadError;

const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(900);
const DEFAULT_BRIDGE_STREAMS: usize = 10;

/// Configuration for [`read`](crate::read).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadConfig {
    /// Size of the worker pool running discovery and partition readers.
    pub max_workers: usize,
    /// Capacity of the shared queue. Workers block when it is full.
    pub queue_capacity: usize,
    /// Longest the consumer waits for the next queue item.
    #[serde(rename = "stall_timeout_secs", deserialize_with = "de_secs")]
    pub stall_timeout: Duration,
    /// Ceiling on the whole read's wall-clock time.
    #[serde(rename = "read_timeout_secs", deserialize_with = "de_opt_secs")]
    pub read_timeout: Option<Duration>,
    /// Streams generating partitions at once. Defaults to half the pool.
    pub max_concurrent_generators: Option<usize>,
    /// Partitions dispatched but not yet resolved. Defaults to twice the pool;
    /// the remainder waits in the dispatch table.
    pub max_in_flight_partitions: Option<usize>,
    /// Emit a [`Message::Log`](crate::Message::Log) for every dispatched
    /// partition.
    pub log_partitions: bool,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().max(2),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            read_timeout: None,
            max_concurrent_generators: None,
            max_in_flight_partitions: None,
            log_partitions: false,
        }
    }
}

impl ReadConfig {
    /// Parse a JSON config. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::Config`] if the JSON is malformed or names an
    /// unknown field.
    pub fn from_json(json: &str) -> Result<Self, ReadError> {
        serde_json::from_str(json).map_err(|e| ReadError::Config(e.to_string()))
    }

    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    #[must_use]
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    /// Effective number of concurrent partition generators.
    #[must_use]
    pub fn generator_limit(&self) -> usize {
        self.max_concurrent_generators
            .unwrap_or(self.max_workers / 2)
            .max(1)
    }

    /// Effective number of partitions allowed in flight.
    #[must_use]
    pub fn in_flight_limit(&self) -> usize {
        self.max_in_flight_partitions
            .unwrap_or(self.max_workers.saturating_mul(2))
            .max(1)
    }

    /// Check the configuration before anything is started.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ReadError> {
        if self.max_workers == 0 {
            return Err(ReadError::Config("max_workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ReadError::Config("queue_capacity must be at least 1".into()));
        }
        if self.stall_timeout.is_zero() {
            return Err(ReadError::Config("stall_timeout must be positive".into()));
        }
        if self.read_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ReadError::Config("read_timeout must be positive".into()));
        }
        if self.max_concurrent_generators == Some(0) {
            return Err(ReadError::Config(
                "max_concurrent_generators must be at least 1".into(),
            ));
        }
        if self.max_in_flight_partitions == Some(0) {
            return Err(ReadError::Config(
                "max_in_flight_partitions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the async/sync bridge reader.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    #[serde(rename = "stall_timeout_secs", deserialize_with = "de_secs")]
    pub stall_timeout: Duration,
    /// Streams read concurrently by the background loop.
    pub max_concurrent_streams: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            max_concurrent_streams: DEFAULT_BRIDGE_STREAMS,
        }
    }
}

impl BridgeConfig {
    /// # Errors
    ///
    /// Returns [`ReadError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ReadError> {
        if self.queue_capacity == 0 {
            return Err(ReadError::Config("queue_capacity must be at least 1".into()));
        }
        if self.stall_timeout.is_zero() {
            return Err(ReadError::Config("stall_timeout must be positive".into()));
        }
        if self.max_concurrent_streams == 0 {
            return Err(ReadError::Config(
                "max_concurrent_streams must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn de_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

fn de_opt_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
    Option::<f64>::deserialize(deserializer)?
        .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
        .transpose()
}
