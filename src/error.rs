//! Error model for a concurrent read.
//!
//! Collaborators (fetchers, discovery, async readers) speak [`anyhow::Error`].
//! The engine itself surfaces a typed [`ReadError`] so callers can tell a
//! fail-fast partition failure from a best-effort discovery failure, a stalled
//! pool or an internal bookkeeping bug.

use std::fmt::{Display, Formatter, Result as FormatResult};
use std::time::Duration;

use thiserror::Error;

use crate::partition::PartitionId;

/// Every way a read can end other than running to completion.
#[derive(Debug, Error)]
pub enum ReadError {
    /// A partition reader failed while iterating its partition.
    ///
    /// Raised in-band and fail-fast: the drain loop stops at the first one.
    #[error("partition {partition} of stream '{stream}' failed: {source:#}")]
    PartitionRead {
        stream: String,
        partition: String,
        #[source]
        source: anyhow::Error,
    },

    /// An asynchronous stream read failed inside the bridge reader.
    #[error("stream '{stream}' failed: {source:#}")]
    StreamRead {
        stream: String,
        #[source]
        source: anyhow::Error,
    },

    /// One or more partition discoveries failed. Collected out-of-band and
    /// raised only once everything that was discovered has been read.
    #[error("partition discovery failed for {}", DiscoverySummary(.failures))]
    Discovery { failures: Vec<DiscoveryFailure> },

    /// Internal bookkeeping went wrong; never recoverable by the caller.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// No queue item arrived within the stall timeout.
    #[error("no progress for {waited:?} with {outstanding} partition(s) outstanding")]
    StallTimeout { waited: Duration, outstanding: usize },

    /// The overall read ceiling was exceeded.
    #[error("read did not finish within {limit:?}")]
    ReadTimeout { limit: Duration },

    /// A stream's resource handle failed to close.
    #[error("failed to close session for stream '{stream}': {source:#}")]
    SessionClose {
        stream: String,
        #[source]
        source: anyhow::Error,
    },

    /// Invalid configuration, detected before any work is started.
    #[error("invalid read configuration: {0}")]
    Config(String),

    /// The worker pool could not be built.
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    /// The bridge runtime could not be built.
    #[error("failed to build bridge runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

impl ReadError {
    /// Whether the caller may reasonably retry the whole read.
    ///
    /// Timeouts are retryable: the workers are slow or stuck, not necessarily
    /// broken. Everything else reflects a real failure or a bug.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StallTimeout { .. } | Self::ReadTimeout { .. })
    }

    /// Returns the protocol violation if this is one.
    #[must_use]
    pub fn as_protocol_violation(&self) -> Option<&ProtocolViolation> {
        match self {
            Self::Protocol(violation) => Some(violation),
            _ => None,
        }
    }
}

/// A broken producer/consumer contract.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A second terminal item arrived for a partition that was already resolved.
    #[error("duplicate terminal item for partition {partition}")]
    DuplicateSentinel { partition: PartitionId },

    /// An item referenced a partition that was never dispatched.
    #[error("item for unknown partition {partition}")]
    UnknownPartition { partition: PartitionId },

    /// A record arrived after its partition's terminal item.
    #[error("record for partition {partition} after its completion")]
    RecordAfterCompletion { partition: PartitionId },

    /// A bridge item referenced a stream that is not being read.
    #[error("item for unknown stream '{stream}'")]
    UnknownStream { stream: String },

    /// A second completion sentinel arrived for a stream.
    #[error("duplicate completion sentinel for stream '{stream}'")]
    DuplicateStreamSentinel { stream: String },

    /// The background reader finished without completing a stream.
    #[error("stream '{stream}' ended without a completion sentinel")]
    MissingStreamSentinel { stream: String },

    /// Every producer hung up while work was still outstanding.
    #[error("work queue disconnected with work outstanding")]
    QueueDisconnected,
}

/// A single failed discovery task.
#[derive(Debug)]
pub struct DiscoveryFailure {
    pub stream: String,
    pub error: anyhow::Error,
}

impl DiscoveryFailure {
    pub fn new(stream: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            stream: stream.into(),
            error,
        }
    }
}

impl Display for DiscoveryFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "'{}': {:#}", self.stream, self.error)
    }
}

struct DiscoverySummary<'a>(&'a [DiscoveryFailure]);

impl Display for DiscoverySummary<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}
