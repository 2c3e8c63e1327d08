//! Partitions and the identifiers the engine attaches to them.
//!
//! A [`Partition`] is what discovery produces: an immutable, repeatable handle to
//! one independently fetchable chunk of a stream (a date slice, a page token, a
//! parent-record id). When the orchestrator dispatches it, it becomes a
//! [`StreamPartition`] with a [`PartitionId`] that is unique for the lifetime of
//! one read. Sentinels, failures and the outstanding set all refer to that id.

use std::fmt::{Display, Formatter, Result as FormatResult};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cursor::CursorField;

/// Identifier of a dispatched partition, unique within one read.
///
/// Small, `Copy` and hashable so it can travel inside every queue item and key
/// the outstanding set.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PartitionId(u64);

impl PartitionId {
    pub fn new(v: u64) -> Self {
        Self(v)
    }

    /// Return the underlying numeric value.
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "#{}", self.0)
    }
}

/// How a stream is being synced. Incremental streams emit state checkpoints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    FullRefresh,
    Incremental,
}

/// An opaque, immutable handle to one chunk of a stream's data.
///
/// The key is whatever the discovery collaborator needs to find the chunk
/// again; the engine never looks inside it. Cloning is cheap enough to hand the
/// same partition to a retry elsewhere.
#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    stream: Arc<str>,
    key: Value,
}

impl Partition {
    pub fn new(stream: impl Into<Arc<str>>, key: Value) -> Self {
        Self {
            stream: stream.into(),
            key,
        }
    }

    /// Name of the stream this partition belongs to.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    #[must_use]
    pub fn key(&self) -> &Value {
        &self.key
    }
}

impl Display for Partition {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "{}[{}]", self.stream, self.key)
    }
}

/// A dispatched partition: the partition itself plus the bookkeeping the
/// consumer needs when its records and terminal item come back.
#[derive(Clone, Debug)]
pub struct StreamPartition {
    pub id: PartitionId,
    pub partition: Partition,
    /// Index of the owning stream in the read's stream list.
    pub stream_index: usize,
    pub cursor_field: Option<CursorField>,
}

impl StreamPartition {
    pub fn new(
        id: PartitionId,
        partition: Partition,
        stream_index: usize,
        cursor_field: Option<CursorField>,
    ) -> Self {
        Self {
            id,
            partition,
            stream_index,
            cursor_field,
        }
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        self.partition.stream()
    }
}
