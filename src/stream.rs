//! Streams and the collaborators that give them data.
//!
//! The engine does not know how partitions are discovered or how their bytes
//! are fetched. A [`StreamDefinition`] bundles a stream's name, sync mode and
//! cursor field with three collaborators:
//!
//! - [`PartitionDiscovery`] enumerates the stream's partitions
//! - [`RecordFetcher`] turns one partition into records
//! - [`AvailabilityStrategy`] decides up front whether the stream is readable
//!
//! Collaborators are called from worker threads, hence `Send + Sync`, and
//! report failures as [`anyhow::Error`].

use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::cursor::CursorField;
use crate::partition::{Partition, SyncMode};

/// Records of one partition, in the order the partition defines.
pub type RecordStream<'a> = Box<dyn Iterator<Item = anyhow::Result<Map<String, Value>>> + 'a>;

/// Partitions of one stream, as they are discovered.
pub type PartitionStream<'a> = Box<dyn Iterator<Item = anyhow::Result<Partition>> + 'a>;

/// Transport/extraction collaborator.
pub trait RecordFetcher: Send + Sync {
    /// Open a partition for reading.
    ///
    /// Errors from opening and errors yielded mid-iteration are both turned
    /// into that partition's failure. Retries, if any, belong in here.
    fn fetch<'a>(&'a self, partition: &'a Partition) -> anyhow::Result<RecordStream<'a>>;
}

/// Discovery collaborator.
pub trait PartitionDiscovery: Send + Sync {
    /// Enumerate the partitions of `stream`.
    ///
    /// An `Err` element is recorded as a discovery failure and enumeration
    /// carries on with the next element.
    fn enumerate_partitions<'a>(
        &'a self,
        stream: &'a str,
        sync_mode: SyncMode,
        cursor_field: Option<&'a CursorField>,
    ) -> anyhow::Result<PartitionStream<'a>>;
}

/// Outcome of an availability check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<String>,
}

impl Availability {
    #[must_use]
    pub fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Health check consulted before any work is dispatched for a stream.
pub trait AvailabilityStrategy: Send + Sync {
    fn check(&self, stream: &str) -> Availability;
}

/// The default: every stream is available.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAvailable;

impl AvailabilityStrategy for AlwaysAvailable {
    fn check(&self, _stream: &str) -> Availability {
        Availability::available()
    }
}

/// One stream to read.
#[derive(Clone)]
pub struct StreamDefinition {
    name: String,
    sync_mode: SyncMode,
    cursor_field: Option<CursorField>,
    state: Option<Value>,
    discovery: Arc<dyn PartitionDiscovery>,
    fetcher: Arc<dyn RecordFetcher>,
    availability: Arc<dyn AvailabilityStrategy>,
}

impl StreamDefinition {
    pub fn new(
        name: impl Into<String>,
        discovery: Arc<dyn PartitionDiscovery>,
        fetcher: Arc<dyn RecordFetcher>,
    ) -> Self {
        Self {
            name: name.into(),
            sync_mode: SyncMode::FullRefresh,
            cursor_field: None,
            state: None,
            discovery,
            fetcher,
            availability: Arc::new(AlwaysAvailable),
        }
    }

    /// Track a cursor for this stream without changing its sync mode.
    #[must_use]
    pub fn with_cursor_field(mut self, field: impl Into<CursorField>) -> Self {
        self.cursor_field = Some(field.into());
        self
    }

    /// Sync incrementally on `field`; state checkpoints will be emitted.
    #[must_use]
    pub fn incremental(mut self, field: impl Into<CursorField>) -> Self {
        self.sync_mode = SyncMode::Incremental;
        self.cursor_field = Some(field.into());
        self
    }

    /// Resume from a previous read's cursor value.
    ///
    /// Records at or below `state` never advance the cursor, so no checkpoint
    /// is emitted until the stream moves past it. A value that is not a
    /// number or a string is ignored.
    #[must_use]
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    #[must_use]
    pub fn with_availability(mut self, availability: Arc<dyn AvailabilityStrategy>) -> Self {
        self.availability = availability;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    #[must_use]
    pub fn cursor_field(&self) -> Option<&CursorField> {
        self.cursor_field.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub(crate) fn discovery(&self) -> Arc<dyn PartitionDiscovery> {
        Arc::clone(&self.discovery)
    }

    pub(crate) fn fetcher(&self) -> Arc<dyn RecordFetcher> {
        Arc::clone(&self.fetcher)
    }

    #[must_use]
    pub fn check_availability(&self) -> Availability {
        self.availability.check(&self.name)
    }
}

impl Debug for StreamDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_struct("StreamDefinition")
            .field("name", &self.name)
            .field("sync_mode", &self.sync_mode)
            .field("cursor_field", &self.cursor_field)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
