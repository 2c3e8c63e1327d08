//! Partition reader: drains one partition onto the shared queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::partition::StreamPartition;
use crate::pool::panic_message;
use crate::queue::{QueueItem, QueueSender};
use crate::record::Record;
use crate::stream::RecordFetcher;

/// How reading a partition ended, short of an error.
enum Drained {
    Exhausted(u64),
    ConsumerGone,
}

/// Reads partitions through a [`RecordFetcher`] and pushes what it finds.
///
/// For every partition it processes the reader pushes its records in order,
/// then exactly one terminal item: `PartitionComplete` on exhaustion,
/// `PartitionFailed` on the first error. It never retries and never touches
/// any state other than the queue.
#[derive(Clone)]
pub struct PartitionReader {
    queue: QueueSender,
    fetcher: Arc<dyn RecordFetcher>,
}

impl PartitionReader {
    pub fn new(queue: QueueSender, fetcher: Arc<dyn RecordFetcher>) -> Self {
        Self { queue, fetcher }
    }

    /// Read `partition` to the end. Runs on a pool worker.
    ///
    /// Panics in the fetcher are reported as the partition's failure. If the
    /// consumer has already gone away the reader stops quietly.
    pub fn process(&self, partition: &StreamPartition) {
        let id = partition.id;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.drain(partition)));
        let terminal = match outcome {
            Ok(Ok(Drained::Exhausted(records))) => {
                debug!(stream = partition.stream(), partition = %id, records, "partition exhausted");
                QueueItem::PartitionComplete { partition: id }
            }
            Ok(Ok(Drained::ConsumerGone)) => {
                debug!(stream = partition.stream(), partition = %id, "consumer gone, abandoning partition");
                return;
            }
            Ok(Err(error)) => QueueItem::PartitionFailed {
                partition: id,
                error,
            },
            Err(payload) => QueueItem::PartitionFailed {
                partition: id,
                error: anyhow!("partition reader panicked: {}", panic_message(payload.as_ref())),
            },
        };
        if self.queue.push(terminal).is_err() {
            debug!(stream = partition.stream(), partition = %id, "consumer gone before terminal item");
        }
    }

    fn drain(&self, partition: &StreamPartition) -> anyhow::Result<Drained> {
        let rows = self
            .fetcher
            .fetch(&partition.partition)
            .with_context(|| format!("failed to open partition {}", partition.partition))?;
        let mut emitted = 0u64;
        for row in rows {
            let record = Record::new(partition.stream(), row?);
            let item = QueueItem::Record {
                partition: partition.id,
                record,
            };
            if self.queue.push(item).is_err() {
                return Ok(Drained::ConsumerGone);
            }
            emitted += 1;
        }
        Ok(Drained::Exhausted(emitted))
    }
}
