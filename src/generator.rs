//! Partition generator: discovers a stream's partitions on the worker pool.
//!
//! Discovery publishes each partition to a ready-list the moment it is known,
//! so the orchestrator can start reading early partitions while later ones are
//! still being enumerated. After every publish, and once when a discovery task
//! ends, the generator pushes a [`QueueItem::Wake`] so the consumer's bounded
//! wait ends promptly.
//!
//! Failures are handled differently from partition reads. A failed discovery
//! is *not* pushed in-band; it is recorded and handed out by
//! [`PartitionGenerator::collect_failures`] once discovery is over, so one bad
//! sub-resource does not abort partitions already found for its siblings.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow};
use tracing::{debug, warn};

use crate::cursor::CursorField;
use crate::error::DiscoveryFailure;
use crate::partition::{Partition, SyncMode};
use crate::pool::{TaskHandle, WorkerPool, panic_message};
use crate::queue::{QueueItem, QueueSender};
use crate::stream::PartitionDiscovery;

#[derive(Default)]
struct Shared {
    ready: Mutex<VecDeque<Partition>>,
    failures: Mutex<Vec<DiscoveryFailure>>,
    running: AtomicUsize,
}

impl Shared {
    fn publish(&self, partition: Partition) {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(partition);
    }

    fn record_failure(&self, stream: &str, error: anyhow::Error) {
        warn!(stream, error = %format!("{error:#}"), "partition discovery failed");
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DiscoveryFailure::new(stream, error));
    }
}

pub struct PartitionGenerator {
    pool: Arc<WorkerPool>,
    discovery: Arc<dyn PartitionDiscovery>,
    wake: QueueSender,
    shared: Arc<Shared>,
    tasks: Vec<TaskHandle>,
}

impl PartitionGenerator {
    pub fn new(
        pool: Arc<WorkerPool>,
        discovery: Arc<dyn PartitionDiscovery>,
        wake: QueueSender,
    ) -> Self {
        Self {
            pool,
            discovery,
            wake,
            shared: Arc::new(Shared::default()),
            tasks: Vec::new(),
        }
    }

    /// Start one discovery task for `stream` on the pool.
    ///
    /// May be called more than once, e.g. once per sub-resource; the generator
    /// is done only when every task has finished.
    pub fn discover(&mut self, stream: &str, sync_mode: SyncMode, cursor_field: Option<CursorField>) {
        let shared = Arc::clone(&self.shared);
        let discovery = Arc::clone(&self.discovery);
        let wake = self.wake.clone();
        let stream = stream.to_string();

        // Counted here, on the consumer thread, so `is_done` cannot observe a
        // submitted-but-not-yet-started task as finished.
        shared.running.fetch_add(1, Ordering::AcqRel);
        let handle = self.pool.submit(format!("discover:{stream}"), move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                enumerate(&shared, discovery.as_ref(), &wake, &stream, sync_mode, cursor_field.as_ref())
            }));
            match outcome {
                Ok(Ok(published)) => debug!(stream = %stream, published, "partition discovery finished"),
                Ok(Err(error)) => shared.record_failure(&stream, error),
                Err(payload) => shared.record_failure(
                    &stream,
                    anyhow!("partition discovery panicked: {}", panic_message(payload.as_ref())),
                ),
            }
            // Failures are recorded before the task counts as finished.
            shared.running.fetch_sub(1, Ordering::AcqRel);
            // A closed queue means the read is over; nobody is waiting.
            let _ = wake.push(QueueItem::Wake);
            Ok(())
        });
        self.tasks.push(handle);
    }

    /// Take the next discovered partition, if one is ready.
    pub fn get_next_ready(&self) -> Option<Partition> {
        self.shared
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// True once every discovery task has finished and nothing is left to take.
    #[must_use]
    pub fn is_done(&self) -> bool {
        // Check `running` first: a task publishes before it stops running.
        self.shared.running.load(Ordering::Acquire) == 0
            && self
                .shared
                .ready
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }

    /// Drain the failures recorded so far.
    pub fn collect_failures(&self) -> Vec<DiscoveryFailure> {
        std::mem::take(&mut *self.shared.failures.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Handles of every discovery task started by this generator.
    #[must_use]
    pub fn tasks(&self) -> &[TaskHandle] {
        &self.tasks
    }
}

/// Body of one discovery task. Returns the number of partitions published.
fn enumerate(
    shared: &Shared,
    discovery: &dyn PartitionDiscovery,
    wake: &QueueSender,
    stream: &str,
    sync_mode: SyncMode,
    cursor_field: Option<&CursorField>,
) -> anyhow::Result<usize> {
    let partitions = discovery
        .enumerate_partitions(stream, sync_mode, cursor_field)
        .with_context(|| format!("failed to start partition discovery for '{stream}'"))?;
    let mut published = 0;
    for partition in partitions {
        match partition {
            Ok(partition) => {
                shared.publish(partition);
                published += 1;
                if wake.push(QueueItem::Wake).is_err() {
                    break;
                }
            }
            Err(error) => shared.record_failure(stream, error),
        }
    }
    Ok(published)
}
