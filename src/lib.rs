//! # Partiflow
//!
//! A **concurrent partition-reading engine**. Partiflow reads many logical
//! streams at once by splitting each into independently fetchable partitions,
//! reading those partitions on a fixed-size worker pool, and funnelling every
//! record back through one bounded queue to a single consumer on the caller's
//! thread.
//!
//! ## Key Features
//!
//! - **Pipelined discovery** - partitions are read while later ones are still being found
//! - **Per-partition ordering** - records of one partition arrive in order; partitions interleave freely
//! - **Fail-fast reads** - the first failed partition ends the read, naming the stream and partition
//! - **Best-effort discovery** - discovery failures are collected and reported once the rest is read
//! - **Cursor state** - an incremental stream's high-water mark only reflects delivered records
//! - **Bounded everything** - queue capacity, in-flight partitions, concurrent generators, stall and read timeouts
//! - **Async/sync bridge** - drive an async multi-stream source from a plain iterator (feature: `async-bridge`)
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use partiflow::testing::{ScriptedFetcher, StaticDiscovery, row};
//! use partiflow::{Message, ReadConfig, StreamDefinition, read};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let discovery = StaticDiscovery::new().with_stream("orders", [json!("2024-01"), json!("2024-02")]);
//! let fetcher = ScriptedFetcher::new()
//!     .with_partition(json!("2024-01"), vec![row(json!({"id": 1, "updated": 10}))])
//!     .with_partition(json!("2024-02"), vec![row(json!({"id": 2, "updated": 20}))]);
//! let orders = StreamDefinition::new("orders", Arc::new(discovery), Arc::new(fetcher))
//!     .incremental("updated");
//!
//! let mut run = read(vec![orders], ReadConfig::default().with_max_workers(2))?;
//! for message in run.by_ref() {
//!     if let Message::Record(record) = message? {
//!         println!("{}: {:?}", record.stream, record.data);
//!     }
//! }
//! assert_eq!(run.get_updated_state("orders"), Some(json!(20)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Streams and partitions
//!
//! A [`StreamDefinition`] names a stream and supplies its collaborators: a
//! [`PartitionDiscovery`] that enumerates [`Partition`]s and a
//! [`RecordFetcher`] that reads one partition. An optional
//! [`AvailabilityStrategy`] can take the stream out of the read up front.
//!
//! ### The shared queue
//!
//! Workers only push [`QueueItem`]s: records, one terminal item per
//! partition, and wake-ups from discovery. The consumer pops them one at a
//! time and keeps an [`OutstandingSet`] of partitions still running. A second
//! terminal item for the same partition is a [`ProtocolViolation`], never a
//! silent miscount.
//!
//! ### Reading
//!
//! - [`read`] runs the full orchestration and yields [`Message`]s: records,
//!   stream status events, state checkpoints and optional partition log lines
//! - [`drain`] is the bare consumer loop over a queue you fed yourself
//! - [`BridgeReader`] wraps an async source (feature: `async-bridge`)
//!
//! ### Errors
//!
//! Every engine error is a [`ReadError`]. Collaborators return
//! [`anyhow::Result`] and their errors travel as the `source` of the
//! corresponding variant.
//!
//! ## Feature Flags
//!
//! - `async-bridge` (default) - the tokio-backed [`BridgeReader`]
//!
//! ## Logging
//!
//! Partiflow logs through [`tracing`] and never installs a subscriber.

pub mod config;
pub mod consumer;
pub mod cursor;
pub mod error;
pub mod generator;
pub mod metrics;
pub mod orchestrator;
pub mod partition;
pub mod pool;
pub mod queue;
pub mod reader;
pub mod record;
pub mod stream;
pub mod testing;

#[cfg(feature = "async-bridge")]
pub mod bridge;

// General re-exports
pub use config::{BridgeConfig, ReadConfig};
pub use consumer::{Drain, drain};
pub use cursor::{CursorAccumulator, CursorField, CursorValue};
pub use error::{DiscoveryFailure, ProtocolViolation, ReadError};
pub use generator::PartitionGenerator;
pub use metrics::MetricsCollector;
pub use orchestrator::{ConcurrentRead, Records, SkippedStream, read};
pub use partition::{Partition, PartitionId, StreamPartition, SyncMode};
pub use pool::{TaskHandle, WorkerPool};
pub use queue::{OutstandingSet, Pop, QueueItem, QueueReceiver, QueueSender, work_queue};
pub use reader::PartitionReader;
pub use record::{LogMessage, Message, Record, StateCheckpoint, StreamStatus, StreamStatusEvent};
pub use stream::{
    AlwaysAvailable, Availability, AvailabilityStrategy, PartitionDiscovery, PartitionStream,
    RecordFetcher, RecordStream, StreamDefinition,
};

// Gated re-exports
#[cfg(feature = "async-bridge")]
pub use bridge::{AsyncStreamReader, BridgeReader, BridgeState, RecordSink, StreamSession};
