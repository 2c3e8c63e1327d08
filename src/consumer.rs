//! The serial drain loop.
//!
//! [`drain`] pulls one [`QueueItem`] at a time off the shared queue:
//!
//! - a record is yielded as-is
//! - a completion sentinel removes its partition from the outstanding set
//! - a failure ends the drain with that partition's error
//!
//! The drain ends by itself once the outstanding set is empty, without another
//! wait. Partitions still running when a failure is observed are not
//! cancelled; their later output is simply never looked at.
//!
//! The orchestrator builds its richer loop on the same [`settle`] step.

use std::time::Duration;

use crate::error::{ProtocolViolation, ReadError};
use crate::partition::StreamPartition;
use crate::queue::{OutstandingSet, Pop, QueueItem, QueueReceiver};
use crate::record::Record;

/// What one queue item amounted to once checked against the outstanding set.
#[derive(Debug)]
pub(crate) enum Step {
    Record { stream_index: usize, record: Record },
    Closed(StreamPartition),
    Wake,
}

/// Apply one queue item to the outstanding set.
///
/// A failure item resolves its partition and comes back as
/// [`ReadError::PartitionRead`]; protocol violations come back as
/// [`ReadError::Protocol`].
pub(crate) fn settle(outstanding: &mut OutstandingSet, item: QueueItem) -> Result<Step, ReadError> {
    match item {
        QueueItem::Record { partition, record } => {
            let stream_index = outstanding.get(partition)?.stream_index;
            Ok(Step::Record {
                stream_index,
                record,
            })
        }
        QueueItem::PartitionComplete { partition } => Ok(Step::Closed(outstanding.resolve(partition)?)),
        QueueItem::PartitionFailed { partition, error } => {
            let failed = outstanding.resolve(partition)?;
            Err(ReadError::PartitionRead {
                stream: failed.stream().to_string(),
                partition: failed.partition.key().to_string(),
                source: error,
            })
        }
        QueueItem::Wake => Ok(Step::Wake),
    }
}

/// Wait at most `wait` for the next item, turning a timeout into
/// [`ReadError::StallTimeout`].
pub(crate) fn next_item(
    queue: &QueueReceiver,
    wait: Duration,
    outstanding: &OutstandingSet,
) -> Result<QueueItem, ReadError> {
    match queue.pop(wait) {
        Pop::Item(item) => Ok(item),
        Pop::TimedOut => Err(ReadError::StallTimeout {
            waited: wait,
            outstanding: outstanding.len(),
        }),
        Pop::Closed => Err(ProtocolViolation::QueueDisconnected.into()),
    }
}

/// Drain `queue` until every partition in `outstanding` has resolved.
///
/// Not restartable: once it has returned `None` or an error, re-arm a new
/// drain with a fresh outstanding set.
pub fn drain(queue: &QueueReceiver, outstanding: OutstandingSet, stall_timeout: Duration) -> Drain<'_> {
    Drain {
        queue,
        outstanding,
        stall_timeout,
        finished: false,
    }
}

/// Lazy record sequence returned by [`drain`].
pub struct Drain<'q> {
    queue: &'q QueueReceiver,
    outstanding: OutstandingSet,
    stall_timeout: Duration,
    finished: bool,
}

impl Drain<'_> {
    /// Partitions that have not produced a terminal item yet.
    #[must_use]
    pub fn outstanding(&self) -> &OutstandingSet {
        &self.outstanding
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn fail(&mut self, error: ReadError) -> Option<Result<Record, ReadError>> {
        self.finished = true;
        Some(Err(error))
    }
}

impl Iterator for Drain<'_> {
    type Item = Result<Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            if self.outstanding.is_empty() {
                self.finished = true;
                break;
            }
            let item = match next_item(self.queue, self.stall_timeout, &self.outstanding) {
                Ok(item) => item,
                Err(error) => return self.fail(error),
            };
            match settle(&mut self.outstanding, item) {
                Ok(Step::Record { record, .. }) => return Some(Ok(record)),
                Ok(Step::Closed(_) | Step::Wake) => {}
                Err(error) => return self.fail(error),
            }
        }
        None
    }
}
