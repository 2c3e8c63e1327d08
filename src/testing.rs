//! Testing utilities for partiflow reads.
//!
//! In-memory collaborators stand in for real sources so a test can script
//! exactly which partitions exist, what they yield and how they fail:
//!
//! - [`StaticDiscovery`] and [`FailingDiscovery`] for partition discovery
//! - [`ScriptedFetcher`] for partition contents, failures and panics
//! - [`Gate`] to hold a partition open until the test lets it go
//! - [`StaticAvailability`] to mark streams unavailable
//! - [`ScriptedAsyncReader`] and [`RecordingSession`] for the bridge reader
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use partiflow::testing::*;
//! use partiflow::{ReadConfig, StreamDefinition, read};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let discovery = StaticDiscovery::new().with_stream("users", [json!("a"), json!("b")]);
//! let fetcher = ScriptedFetcher::new()
//!     .with_partition(json!("a"), vec![row(json!({"id": 1}))])
//!     .with_partition(json!("b"), vec![row(json!({"id": 2}))]);
//! let stream = StreamDefinition::new("users", Arc::new(discovery), Arc::new(fetcher));
//!
//! let mut run = read(vec![stream], ReadConfig::default().with_max_workers(2))?;
//! let records = run.records().collect::<Result<Vec<_>, _>>()?;
//! assert_eq!(field_values(&records, "id").len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod collaborators;

#[cfg(feature = "async-bridge")]
pub mod async_source;

pub use assertions::*;
pub use collaborators::*;

#[cfg(feature = "async-bridge")]
pub use async_source::*;

