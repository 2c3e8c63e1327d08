//! The shared queue and the outstanding set.
//!
//! Workers only ever push [`QueueItem`]s; exactly one consumer pops them. The
//! queue is a bounded channel, so a slow consumer backpressures the pool, and
//! it is the only object in a read touched by more than one thread.
//!
//! The [`OutstandingSet`] lives entirely on the consumer side. It tracks which
//! dispatched partitions have not yet produced their terminal item and turns a
//! second terminal item, or an item for a partition nobody dispatched, into a
//! [`ProtocolViolation`].

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use thiserror::Error;

use crate::error::ProtocolViolation;
use crate::partition::{PartitionId, StreamPartition};
use crate::record::Record;

/// What a worker can put on the shared queue.
///
/// For any partition, every `Record` precedes its one terminal item
/// (`PartitionComplete` or `PartitionFailed`).
#[derive(Debug)]
pub enum QueueItem {
    Record {
        partition: PartitionId,
        record: Record,
    },
    /// Completion sentinel: the partition was read to exhaustion.
    PartitionComplete { partition: PartitionId },
    /// The partition failed; no further items will follow for it.
    PartitionFailed {
        partition: PartitionId,
        error: anyhow::Error,
    },
    /// Discovery progress. Carries no data; it only ends the consumer's wait
    /// so freshly discovered partitions get dispatched without delay.
    Wake,
}

impl QueueItem {
    /// The partition this item belongs to, if any.
    #[must_use]
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            Self::Record { partition, .. }
            | Self::PartitionComplete { partition }
            | Self::PartitionFailed { partition, .. } => Some(*partition),
            Self::Wake => None,
        }
    }
}

/// The consumer hung up; the item was not delivered.
#[derive(Debug, Error)]
#[error("work queue consumer has gone away")]
pub struct QueueClosed;

/// Producer side of the shared queue. Cheap to clone, one per worker task.
#[derive(Clone)]
pub struct QueueSender {
    tx: SyncSender<QueueItem>,
}

impl QueueSender {
    /// Push an item, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] once the consumer has dropped its receiver.
    pub fn push(&self, item: QueueItem) -> Result<(), QueueClosed> {
        self.tx.send(item).map_err(|_| QueueClosed)
    }
}

/// Result of a bounded wait on the queue.
#[derive(Debug)]
pub enum Pop {
    Item(QueueItem),
    TimedOut,
    /// Every sender is gone and the queue is empty.
    Closed,
}

/// Consumer side of the shared queue.
pub struct QueueReceiver {
    rx: Receiver<QueueItem>,
}

impl QueueReceiver {
    /// Wait at most `wait` for the next item.
    pub fn pop(&self, wait: Duration) -> Pop {
        match self.rx.recv_timeout(wait) {
            Ok(item) => Pop::Item(item),
            Err(RecvTimeoutError::Timeout) => Pop::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Pop::Closed,
        }
    }
}

/// Create a bounded shared queue.
#[must_use]
pub fn work_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Dispatched partitions still waiting for their terminal item.
#[derive(Debug, Default)]
pub struct OutstandingSet {
    running: HashMap<PartitionId, StreamPartition>,
    resolved: HashSet<PartitionId>,
}

impl OutstandingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the set with a partition about to be dispatched.
    pub fn insert(&mut self, partition: StreamPartition) {
        self.running.insert(partition.id, partition);
    }

    /// Look up a running partition for one of its records.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::RecordAfterCompletion`] if the partition already
    /// resolved, [`ProtocolViolation::UnknownPartition`] if it never existed.
    pub fn get(&self, id: PartitionId) -> Result<&StreamPartition, ProtocolViolation> {
        if let Some(partition) = self.running.get(&id) {
            return Ok(partition);
        }
        if self.resolved.contains(&id) {
            Err(ProtocolViolation::RecordAfterCompletion { partition: id })
        } else {
            Err(ProtocolViolation::UnknownPartition { partition: id })
        }
    }

    /// Remove a partition on its terminal item.
    ///
    /// # Errors
    ///
    /// [`ProtocolViolation::DuplicateSentinel`] if it was already resolved,
    /// [`ProtocolViolation::UnknownPartition`] if it never existed.
    pub fn resolve(&mut self, id: PartitionId) -> Result<StreamPartition, ProtocolViolation> {
        if let Some(partition) = self.running.remove(&id) {
            self.resolved.insert(id);
            return Ok(partition);
        }
        if self.resolved.contains(&id) {
            Err(ProtocolViolation::DuplicateSentinel { partition: id })
        } else {
            Err(ProtocolViolation::UnknownPartition { partition: id })
        }
    }

    #[must_use]
    pub fn contains(&self, id: PartitionId) -> bool {
        self.running.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.running.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Ids still running, in dispatch order.
    #[must_use]
    pub fn ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of running partitions owned by one stream.
    #[must_use]
    pub fn count_for_stream(&self, stream_index: usize) -> usize {
        self.running
            .values()
            .filter(|p| p.stream_index == stream_index)
            .count()
    }
}
