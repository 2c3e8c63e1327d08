//! Concurrent stream orchestrator.
//!
//! [`read`] fans the partitions of many streams out over one worker pool and
//! back in through one shared queue. The returned [`ConcurrentRead`] is the
//! consumer: it runs on the caller's thread and owns every piece of
//! bookkeeping (outstanding set, dispatch table, cursors, counters, statuses),
//! so none of it needs a lock.
//!
//! Each call to `next` performs one scheduling round before it blocks:
//!
//! 1. drain the ready-lists of running generators into the dispatch table
//! 2. retire generators whose discovery is over
//! 3. start waiting streams' generators, up to the generator limit
//! 4. dispatch partitions from the table, up to the in-flight limit
//!
//! and then waits for one queue item. Partition failures, protocol violations
//! and timeouts end the read at once; discovery failures are held back until
//! everything that *was* discovered has been read.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::ReadConfig;
use crate::consumer::{Step, settle};
use crate::cursor::{CursorAccumulator, CursorValue};
use crate::error::{DiscoveryFailure, ProtocolViolation, ReadError};
use crate::generator::PartitionGenerator;
use crate::metrics::{
    DISCOVERY_FAILURES, MetricsCollector, PARTITIONS_COMPLETED, PARTITIONS_FAILED, RECORDS_READ,
    STALL_TIMEOUTS, STREAMS_COMPLETED,
};
use crate::partition::{PartitionId, StreamPartition, SyncMode};
use crate::pool::WorkerPool;
use crate::queue::{OutstandingSet, Pop, QueueItem, QueueReceiver, QueueSender, work_queue};
use crate::reader::PartitionReader;
use crate::record::{LogMessage, Message, Record, StateCheckpoint, StreamStatus};
use crate::stream::StreamDefinition;

/// A stream that was not read because its availability check failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedStream {
    pub stream: String,
    pub reason: String,
}

/// Consumer-side state of one stream.
struct StreamRun {
    definition: StreamDefinition,
    generator: Option<PartitionGenerator>,
    status: Option<StreamStatus>,
    generation_done: bool,
    /// Discovered partitions not yet closed, whether dispatched or waiting.
    pending_partitions: usize,
    records: u64,
    cursor: Option<CursorAccumulator>,
    discovery_failed: bool,
}

impl StreamRun {
    fn new(definition: StreamDefinition) -> Self {
        let start = definition.state().and_then(CursorValue::from_json);
        let cursor = definition.cursor_field().cloned().map(|field| {
            let cursor = CursorAccumulator::new(field);
            match start {
                Some(value) => cursor.with_start(value),
                None => cursor,
            }
        });
        Self {
            definition,
            generator: None,
            status: None,
            generation_done: false,
            pending_partitions: 0,
            records: 0,
            cursor,
            discovery_failed: false,
        }
    }

    fn name(&self) -> &str {
        self.definition.name()
    }

    fn is_terminal(&self) -> bool {
        self.status.is_some_and(StreamStatus::is_terminal)
    }
}

/// Read `streams` concurrently.
///
/// Nothing is started until the first call to `next`, apart from the worker
/// pool itself. Unavailable streams are skipped with an `Incomplete` status
/// and never reach the pool; if no stream is available no pool is built.
///
/// # Errors
///
/// Returns [`ReadError::Config`] for an invalid config or a repeated stream
/// name, and [`ReadError::Pool`] if the worker threads cannot be spawned.
pub fn read(streams: Vec<StreamDefinition>, config: ReadConfig) -> Result<ConcurrentRead, ReadError> {
    config.validate()?;
    {
        let mut seen = HashSet::new();
        if let Some(dup) = streams.iter().find(|s| !seen.insert(s.name())) {
            return Err(ReadError::Config(format!("stream '{}' is listed twice", dup.name())));
        }
    }

    let mut runs = Vec::with_capacity(streams.len());
    let mut waiting = VecDeque::new();
    let mut skipped = Vec::new();
    let mut messages = VecDeque::new();
    for (index, definition) in streams.into_iter().enumerate() {
        let availability = definition.check_availability();
        let mut run = StreamRun::new(definition);
        if availability.available {
            waiting.push_back(index);
        } else {
            let reason = availability.reason.unwrap_or_else(|| "stream is unavailable".to_string());
            warn!(stream = run.name(), reason = %reason, "skipping unavailable stream");
            run.status = Some(StreamStatus::Incomplete);
            run.generation_done = true;
            messages.push_back(Message::status(run.name(), StreamStatus::Incomplete));
            skipped.push(SkippedStream {
                stream: run.name().to_string(),
                reason,
            });
        }
        runs.push(run);
    }

    let pool = if waiting.is_empty() {
        None
    } else {
        Some(Arc::new(WorkerPool::new(config.max_workers)?))
    };
    let (sender, receiver) = work_queue(config.queue_capacity);
    debug!(
        streams = runs.len(),
        skipped = skipped.len(),
        max_workers = config.max_workers,
        "concurrent read prepared"
    );

    Ok(ConcurrentRead {
        config,
        pool,
        sender: Some(sender),
        receiver: Some(receiver),
        streams: runs,
        waiting,
        generating: Vec::new(),
        dispatch: VecDeque::new(),
        outstanding: OutstandingSet::new(),
        next_partition: 1,
        messages,
        terminal: None,
        discovery_failures: Vec::new(),
        skipped,
        started_at: Instant::now(),
        metrics: None,
        finished: false,
    })
}

/// A running concurrent read: an iterator over [`Message`]s.
///
/// An `Err` is always the last element. State accessors such as
/// [`get_updated_state`](Self::get_updated_state) may be called at any point.
/// Drive the read with `while let Some(message) = run.next()` to call them
/// between messages; a `for` loop over `by_ref()` holds the borrow.
pub struct ConcurrentRead {
    config: ReadConfig,
    pool: Option<Arc<WorkerPool>>,
    sender: Option<QueueSender>,
    receiver: Option<QueueReceiver>,
    streams: Vec<StreamRun>,
    /// Streams whose generator has not started yet, in order.
    waiting: VecDeque<usize>,
    generating: Vec<usize>,
    /// Discovered partitions waiting for an in-flight slot.
    dispatch: VecDeque<StreamPartition>,
    outstanding: OutstandingSet,
    next_partition: u64,
    messages: VecDeque<Message>,
    terminal: Option<ReadError>,
    discovery_failures: Vec<DiscoveryFailure>,
    skipped: Vec<SkippedStream>,
    started_at: Instant,
    metrics: Option<MetricsCollector>,
    finished: bool,
}

impl ConcurrentRead {
    /// Attach a metrics collector; its start time is recorded now.
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        metrics.record_start();
        self.metrics = Some(metrics);
        self
    }

    /// Records only, skipping status, state and log messages.
    pub fn records(&mut self) -> Records<'_> {
        Records { read: self }
    }

    /// Current high-water mark of `stream`'s cursor.
    ///
    /// Starts at the stream's resume state, if it has one, and reflects every
    /// record yielded since.
    #[must_use]
    pub fn get_updated_state(&self, stream: &str) -> Option<Value> {
        self.run(stream)?
            .cursor
            .as_ref()?
            .value()
            .map(CursorValue::to_json)
    }

    /// Records yielded so far for `stream`.
    #[must_use]
    pub fn record_count(&self, stream: &str) -> Option<u64> {
        self.run(stream).map(|run| run.records)
    }

    /// Last status emitted for `stream`, `None` before it started.
    #[must_use]
    pub fn status(&self, stream: &str) -> Option<StreamStatus> {
        self.run(stream)?.status
    }

    #[must_use]
    pub fn skipped_streams(&self) -> &[SkippedStream] {
        &self.skipped
    }

    /// Partitions dispatched and not yet resolved.
    ///
    /// After a failure ends the read this still lists the partitions that
    /// were running at that moment.
    #[must_use]
    pub fn outstanding_partitions(&self) -> Vec<PartitionId> {
        self.outstanding.ids()
    }

    fn run(&self, stream: &str) -> Option<&StreamRun> {
        self.streams.iter().find(|run| run.name() == stream)
    }

    fn bump_counter(&self, name: &str, value: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(name, value);
        }
    }

    /// One scheduling round, then at most one queue item.
    fn step(&mut self) -> Result<(), ReadError> {
        self.collect_ready_partitions();
        self.finish_generations();
        self.start_generators();
        self.dispatch_ready();

        if self.is_done() {
            return self.finish();
        }
        // Yield status changes from this round before blocking.
        if !self.messages.is_empty() {
            return Ok(());
        }
        let item = self.next_item()?;
        self.apply(item)
    }

    fn collect_ready_partitions(&mut self) {
        for &index in &self.generating {
            let run = &mut self.streams[index];
            let Some(generator) = &run.generator else {
                continue;
            };
            while let Some(partition) = generator.get_next_ready() {
                let id = PartitionId::new(self.next_partition);
                self.next_partition += 1;
                run.pending_partitions += 1;
                let cursor_field = run.definition.cursor_field().cloned();
                self.dispatch
                    .push_back(StreamPartition::new(id, partition, index, cursor_field));
            }
        }
    }

    fn finish_generations(&mut self) {
        for index in std::mem::take(&mut self.generating) {
            let run = &mut self.streams[index];
            if !run.generator.as_ref().is_none_or(PartitionGenerator::is_done) {
                self.generating.push(index);
                continue;
            }
            if let Some(generator) = run.generator.take() {
                let failures = generator.collect_failures();
                run.discovery_failed = !failures.is_empty();
                self.discovery_failures.extend(failures);
            }
            run.generation_done = true;
            debug!(
                stream = run.name(),
                partitions = run.pending_partitions,
                "partition generation finished"
            );
            self.maybe_complete(index);
        }
    }

    fn start_generators(&mut self) {
        let (Some(pool), Some(sender)) = (&self.pool, &self.sender) else {
            return;
        };
        while self.generating.len() < self.config.generator_limit() {
            let Some(index) = self.waiting.pop_front() else {
                break;
            };
            let run = &mut self.streams[index];
            let mut generator =
                PartitionGenerator::new(Arc::clone(pool), run.definition.discovery(), sender.clone());
            generator.discover(
                run.definition.name(),
                run.definition.sync_mode(),
                run.definition.cursor_field().cloned(),
            );
            run.generator = Some(generator);
            run.status = Some(StreamStatus::Started);
            info!(stream = run.name(), "stream started");
            self.messages
                .push_back(Message::status(run.name(), StreamStatus::Started));
            self.generating.push(index);
        }
    }

    fn dispatch_ready(&mut self) {
        let (Some(pool), Some(sender)) = (&self.pool, &self.sender) else {
            return;
        };
        let limit = self.config.in_flight_limit();
        while self.outstanding.len() < limit {
            let Some(partition) = self.dispatch.pop_front() else {
                break;
            };
            let reader = PartitionReader::new(
                sender.clone(),
                self.streams[partition.stream_index].definition.fetcher(),
            );
            debug!(
                stream = partition.stream(),
                partition = %partition.id,
                key = %partition.partition.key(),
                "dispatching partition"
            );
            if self.config.log_partitions {
                self.messages.push_back(Message::Log(LogMessage {
                    stream: partition.stream().to_string(),
                    message: format!("slice:{}", partition.partition.key()),
                }));
            }
            // Armed before submission, so even an immediate terminal item
            // finds its partition outstanding.
            self.outstanding.insert(partition.clone());
            pool.submit(format!("read:{}", partition.partition), move || {
                reader.process(&partition);
                Ok(())
            });
        }
    }

    fn is_done(&self) -> bool {
        self.waiting.is_empty()
            && self.generating.is_empty()
            && self.dispatch.is_empty()
            && self.outstanding.is_empty()
    }

    /// Wait for the next item, bounded by the stall timeout and by what is
    /// left of the read timeout.
    fn next_item(&mut self) -> Result<QueueItem, ReadError> {
        let stall = self.config.stall_timeout;
        let (wait, deadline) = match self.config.read_timeout {
            Some(limit) => {
                let remaining = limit
                    .checked_sub(self.started_at.elapsed())
                    .ok_or(ReadError::ReadTimeout { limit })?;
                if remaining < stall {
                    (remaining, Some(limit))
                } else {
                    (stall, None)
                }
            }
            None => (stall, None),
        };
        let receiver = self
            .receiver
            .as_ref()
            .ok_or(ProtocolViolation::QueueDisconnected)?;
        match receiver.pop(wait) {
            Pop::Item(item) => Ok(item),
            Pop::TimedOut => match deadline {
                Some(limit) => Err(ReadError::ReadTimeout { limit }),
                None => {
                    self.bump_counter(STALL_TIMEOUTS, 1);
                    Err(ReadError::StallTimeout {
                        waited: wait,
                        outstanding: self.outstanding.len(),
                    })
                }
            },
            Pop::Closed => Err(ProtocolViolation::QueueDisconnected.into()),
        }
    }

    fn apply(&mut self, item: QueueItem) -> Result<(), ReadError> {
        match settle(&mut self.outstanding, item) {
            Ok(Step::Record {
                stream_index,
                record,
            }) => {
                self.on_record(stream_index, record);
                Ok(())
            }
            Ok(Step::Closed(partition)) => {
                self.on_partition_closed(&partition);
                Ok(())
            }
            Ok(Step::Wake) => Ok(()),
            Err(error) => {
                if matches!(error, ReadError::PartitionRead { .. }) {
                    self.bump_counter(PARTITIONS_FAILED, 1);
                }
                Err(error)
            }
        }
    }

    fn on_record(&mut self, stream_index: usize, record: Record) {
        let run = &mut self.streams[stream_index];
        if run.records == 0 {
            run.status = Some(StreamStatus::Running);
            self.messages
                .push_back(Message::status(run.name(), StreamStatus::Running));
        }
        run.records += 1;
        // The mark only ever reflects records that are about to be yielded.
        if let Some(cursor) = &mut run.cursor {
            cursor.observe(&record);
        }
        self.messages.push_back(Message::Record(record));
        self.bump_counter(RECORDS_READ, 1);
    }

    fn on_partition_closed(&mut self, partition: &StreamPartition) {
        let index = partition.stream_index;
        let run = &mut self.streams[index];
        run.pending_partitions = run.pending_partitions.saturating_sub(1);
        debug!(stream = run.name(), partition = %partition.id, "partition closed");
        if let Some(cursor) = &mut run.cursor {
            let advanced = cursor.close_partition();
            if let (SyncMode::Incremental, Some(value)) = (run.definition.sync_mode(), advanced) {
                self.messages.push_back(Message::State(StateCheckpoint {
                    stream: run.definition.name().to_string(),
                    cursor_field: cursor.field().to_string(),
                    value: value.to_json(),
                }));
            }
        }
        self.bump_counter(PARTITIONS_COMPLETED, 1);
        self.maybe_complete(index);
    }

    fn maybe_complete(&mut self, index: usize) {
        let run = &mut self.streams[index];
        if !run.generation_done || run.pending_partitions > 0 || run.is_terminal() {
            return;
        }
        let status = if run.discovery_failed {
            warn!(
                stream = run.name(),
                records = run.records,
                "stream incomplete: partition discovery failed"
            );
            StreamStatus::Incomplete
        } else {
            info!(stream = run.name(), records = run.records, "stream complete");
            StreamStatus::Complete
        };
        run.status = Some(status);
        self.messages.push_back(Message::status(run.name(), status));
        if status == StreamStatus::Complete {
            self.bump_counter(STREAMS_COMPLETED, 1);
        }
    }

    fn finish(&mut self) -> Result<(), ReadError> {
        self.finished = true;
        self.release();
        if self.discovery_failures.is_empty() {
            info!(elapsed = ?self.started_at.elapsed(), "concurrent read finished");
            return Ok(());
        }
        let failures = std::mem::take(&mut self.discovery_failures);
        self.bump_counter(DISCOVERY_FAILURES, failures.len() as u64);
        Err(ReadError::Discovery { failures })
    }

    /// End the read with `error`, after marking unfinished streams incomplete.
    fn abort(&mut self, error: ReadError) {
        error!(
            error = %error,
            outstanding = self.outstanding.len(),
            "concurrent read failed"
        );
        for run in &mut self.streams {
            if !run.is_terminal() {
                run.status = Some(StreamStatus::Incomplete);
                self.messages
                    .push_back(Message::status(run.name(), StreamStatus::Incomplete));
            }
        }
        self.waiting.clear();
        self.dispatch.clear();
        self.finished = true;
        self.release();
        self.terminal = Some(error);
    }

    /// Hang up on the workers. Anything still running sees its next push
    /// fail and stops quietly.
    fn release(&mut self) {
        self.receiver = None;
        self.sender = None;
        self.pool = None;
        if let Some(metrics) = &self.metrics {
            metrics.record_end();
        }
    }
}

impl Iterator for ConcurrentRead {
    type Item = Result<Message, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(message) = self.messages.pop_front() {
                return Some(Ok(message));
            }
            if let Some(error) = self.terminal.take() {
                return Some(Err(error));
            }
            if self.finished {
                return None;
            }
            if let Err(error) = self.step() {
                self.abort(error);
            }
        }
    }
}

/// Record-only view of a [`ConcurrentRead`], see [`ConcurrentRead::records`].
pub struct Records<'r> {
    read: &'r mut ConcurrentRead,
}

impl Iterator for Records<'_> {
    type Item = Result<Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.read.next()? {
                Ok(Message::Record(record)) => return Some(Ok(record)),
                Ok(Message::Status(_) | Message::State(_) | Message::Log(_)) => {}
                Err(error) => return Some(Err(error)),
            }
        }
    }
}
