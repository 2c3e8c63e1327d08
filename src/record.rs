//! Records and the messages a concurrent read emits alongside them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One record: an opaque key/value mapping tagged with its owning stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub stream: String,
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(stream: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            stream: stream.into(),
            data,
        }
    }

    /// Look up a top-level field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// Lifecycle of a stream within one read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    /// Partition generation has started.
    Started,
    /// The first record has been delivered.
    Running,
    /// Every discovered partition was read and discovery had no failures.
    Complete,
    /// The stream was skipped, its discovery failed, or the read failed first.
    Incomplete,
}

impl StreamStatus {
    /// Whether no further status can follow this one.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Incomplete)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatusEvent {
    pub stream: String,
    pub status: StreamStatus,
}

/// The high-water mark of an incremental stream after a partition closed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateCheckpoint {
    pub stream: String,
    pub cursor_field: String,
    pub value: Value,
}

/// A human-readable line about a stream's progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub stream: String,
    pub message: String,
}

/// Everything a concurrent read yields, in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Record(Record),
    Status(StreamStatusEvent),
    State(StateCheckpoint),
    Log(LogMessage),
}

impl Message {
    pub(crate) fn status(stream: impl Into<String>, status: StreamStatus) -> Self {
        Self::Status(StreamStatusEvent {
            stream: stream.into(),
            status,
        })
    }

    #[must_use]
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_record(self) -> Option<Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }
}
