//! Async/sync bridge reader.
//!
//! Some sources are naturally asynchronous: many streams multiplexed over one
//! connection, each with a resource handle that must stay open while its
//! records are in flight. [`BridgeReader`] drives such a source on a private
//! tokio runtime and hands the records to a synchronous caller as a plain
//! iterator.
//!
//! The background loop reads up to `max_concurrent_streams` streams at once
//! and tags every record with its stream. A finished stream publishes a
//! stream-scoped completion sentinel carrying how many records it sent. The
//! consumer closes a stream's session only once that many of its records have
//! been dequeued, so no record ever outlives the handle it was read through.
//!
//! Items cross into the caller over a bounded std channel and the caller
//! waits on it with its own timer. A source that blocks the runtime's worker
//! thread still trips the stall timeout.
//!
//! ```text
//! Starting ──> Streaming ──> DrainingRemnants ──> Done
//!     └────────────┴──────────────┴─────────────> Failed
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SendError, SyncSender, sync_channel};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{ProtocolViolation, ReadError};
use crate::record::Record;

/// A stream's resource handle: a cursor, a subscription, a file.
pub trait StreamSession: Send + Sync {
    /// Release the handle. Called at most once.
    fn close(&self) -> anyhow::Result<()>;
}

/// An asynchronous multi-stream source.
#[async_trait]
pub trait AsyncStreamReader: Send + Sync {
    /// Open the resource handle for `stream`. Called on the caller's thread
    /// before any reading starts.
    fn open_session(&self, stream: &str) -> anyhow::Result<Arc<dyn StreamSession>>;

    /// Read `stream` to the end, emitting every record through `sink`.
    async fn read_stream(
        &self,
        stream: &str,
        session: Arc<dyn StreamSession>,
        sink: &mut RecordSink,
    ) -> anyhow::Result<()>;
}

/// Where a stream read sends its records.
pub struct RecordSink {
    stream: String,
    tx: SyncSender<BridgeItem>,
    emitted: u64,
}

impl RecordSink {
    /// Send one record, waiting while the bridge queue is full.
    ///
    /// # Errors
    ///
    /// Fails once the consuming iterator has been dropped or has failed.
    pub async fn emit(&mut self, data: Map<String, Value>) -> anyhow::Result<()> {
        let record = Record::new(self.stream.as_str(), data);
        send_blocking(&self.tx, BridgeItem::Record(record))
            .map_err(|_| anyhow!("bridge consumer for '{}' has gone away", self.stream))?;
        self.emitted += 1;
        Ok(())
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Records successfully handed to the bridge queue so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

enum BridgeItem {
    Record(Record),
    StreamComplete { stream: String, emitted: u64 },
    StreamFailed { stream: String, error: anyhow::Error },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    /// Nothing dequeued yet.
    Starting,
    Streaming,
    /// Every stream has sent its sentinel; buffered items are being drained.
    DrainingRemnants,
    Done,
    Failed,
}

struct SessionEntry {
    handle: Option<Arc<dyn StreamSession>>,
    dequeued: u64,
    expected: Option<u64>,
}

/// Consumer-owned registry of open sessions.
///
/// A session closes once its stream's sentinel has arrived and every record
/// the sentinel accounts for has been dequeued, whichever happens last.
#[derive(Default)]
pub(crate) struct SessionLedger {
    entries: HashMap<String, SessionEntry>,
    order: Vec<String>,
}

impl SessionLedger {
    pub(crate) fn open(&mut self, stream: &str, handle: Arc<dyn StreamSession>) {
        self.order.push(stream.to_string());
        self.entries.insert(
            stream.to_string(),
            SessionEntry {
                handle: Some(handle),
                dequeued: 0,
                expected: None,
            },
        );
    }

    fn entry(&mut self, stream: &str) -> Result<&mut SessionEntry, ReadError> {
        self.entries.get_mut(stream).ok_or_else(|| {
            ProtocolViolation::UnknownStream {
                stream: stream.to_string(),
            }
            .into()
        })
    }

    /// Count one dequeued record.
    pub(crate) fn dequeued(&mut self, stream: &str) -> Result<(), ReadError> {
        self.entry(stream)?.dequeued += 1;
        self.close_if_drained(stream)
    }

    /// Register `stream`'s sentinel.
    pub(crate) fn complete(&mut self, stream: &str, emitted: u64) -> Result<(), ReadError> {
        let entry = self.entry(stream)?;
        if entry.expected.is_some() {
            return Err(ProtocolViolation::DuplicateStreamSentinel {
                stream: stream.to_string(),
            }
            .into());
        }
        entry.expected = Some(emitted);
        if entry.dequeued < emitted {
            debug!(stream, dequeued = entry.dequeued, emitted, "deferring session close");
        }
        self.close_if_drained(stream)
    }

    fn close_if_drained(&mut self, stream: &str) -> Result<(), ReadError> {
        let entry = self.entry(stream)?;
        if !entry.expected.is_some_and(|expected| entry.dequeued >= expected) {
            return Ok(());
        }
        let Some(handle) = entry.handle.take() else {
            return Ok(());
        };
        debug!(stream, records = entry.dequeued, "closing stream session");
        handle.close().map_err(|source| ReadError::SessionClose {
            stream: stream.to_string(),
            source,
        })
    }

    pub(crate) fn is_open(&self, stream: &str) -> bool {
        self.entries
            .get(stream)
            .is_some_and(|entry| entry.handle.is_some())
    }

    /// Whether every stream has sent its sentinel.
    pub(crate) fn all_complete(&self) -> bool {
        self.entries.values().all(|entry| entry.expected.is_some())
    }

    /// Streams still waiting for their sentinel.
    pub(crate) fn unfinished(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.expected.is_none())
            .count()
    }

    /// First stream, in start order, that never sent a sentinel.
    pub(crate) fn missing_sentinel(&self) -> Option<&str> {
        self.order
            .iter()
            .find(|stream| {
                self.entries
                    .get(stream.as_str())
                    .is_some_and(|entry| entry.expected.is_none())
            })
            .map(String::as_str)
    }

    /// Close every session still open, logging failures.
    pub(crate) fn close_remaining(&mut self) {
        for stream in &self.order {
            let Some(handle) = self
                .entries
                .get_mut(stream)
                .and_then(|entry| entry.handle.take())
            else {
                continue;
            };
            if let Err(error) = handle.close() {
                warn!(stream = %stream, error = %format!("{error:#}"), "failed to close stream session");
            }
        }
    }
}

/// Synchronous iterator over the records of an asynchronous source.
///
/// Dropping the reader before it is exhausted stops the background loop at
/// its next send and closes every open session.
pub struct BridgeReader {
    runtime: Option<Runtime>,
    rx: Option<Receiver<BridgeItem>>,
    worker: Option<JoinHandle<()>>,
    ledger: SessionLedger,
    state: BridgeState,
    stall_timeout: Duration,
    pending: Option<ReadError>,
}

impl BridgeReader {
    /// Open a session per stream and start reading in the background.
    ///
    /// # Errors
    ///
    /// [`ReadError::Config`] for an invalid config or a repeated stream name,
    /// [`ReadError::Runtime`] if the runtime cannot be built, and
    /// [`ReadError::StreamRead`] if a session fails to open. Sessions opened
    /// before the failing one are closed again.
    pub fn start(
        reader: Arc<dyn AsyncStreamReader>,
        streams: Vec<String>,
        config: BridgeConfig,
    ) -> Result<Self, ReadError> {
        config.validate()?;
        let mut seen = HashSet::new();
        if let Some(dup) = streams.iter().find(|s| !seen.insert(s.as_str())) {
            return Err(ReadError::Config(format!("stream '{dup}' is listed twice")));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("partiflow-bridge")
            .enable_time()
            .build()
            .map_err(ReadError::Runtime)?;

        let mut ledger = SessionLedger::default();
        let mut jobs = Vec::with_capacity(streams.len());
        for stream in streams {
            match reader.open_session(&stream) {
                Ok(session) => {
                    ledger.open(&stream, Arc::clone(&session));
                    jobs.push((stream, session));
                }
                Err(error) => {
                    ledger.close_remaining();
                    return Err(ReadError::StreamRead {
                        source: error.context("failed to open stream session"),
                        stream,
                    });
                }
            }
        }

        info!(streams = jobs.len(), "bridge reader starting");
        let (tx, rx) = sync_channel(config.queue_capacity);
        let worker = runtime.spawn(read_streams(reader, jobs, tx, config.max_concurrent_streams));
        Ok(Self {
            runtime: Some(runtime),
            rx: Some(rx),
            worker: Some(worker),
            ledger,
            state: BridgeState::Starting,
            stall_timeout: config.stall_timeout,
            pending: None,
        })
    }

    #[must_use]
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Whether `stream`'s session is still open.
    #[must_use]
    pub fn is_session_open(&self, stream: &str) -> bool {
        self.ledger.is_open(stream)
    }

    fn fail(&mut self, error: ReadError) -> ReadError {
        error!(error = %error, state = ?self.state, "bridge reader failed");
        self.state = BridgeState::Failed;
        self.rx = None;
        self.ledger.close_remaining();
        error
    }

    /// A stream failed: stop the loop, join it, then surface the error.
    fn fail_stream(&mut self, stream: String, source: anyhow::Error) -> ReadError {
        self.rx = None;
        if let (Some(worker), Some(runtime)) = (self.worker.take(), self.runtime.as_ref()) {
            if let Err(join) = runtime.block_on(worker) {
                warn!(error = %join, "bridge worker did not shut down cleanly");
            }
        }
        self.fail(ReadError::StreamRead { stream, source })
    }

    /// Every producer has hung up.
    fn finish(&mut self) -> Result<(), ReadError> {
        if let Some(stream) = self.ledger.missing_sentinel() {
            let violation = ProtocolViolation::MissingStreamSentinel {
                stream: stream.to_string(),
            };
            return Err(self.fail(violation.into()));
        }
        self.worker = None;
        self.state = BridgeState::Done;
        info!("bridge reader finished");
        Ok(())
    }
}

impl Iterator for BridgeReader {
    type Item = Result<Record, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(error) = self.pending.take() {
                return Some(Err(self.fail(error)));
            }
            if matches!(self.state, BridgeState::Done | BridgeState::Failed) {
                return None;
            }

            let wait = self.stall_timeout;
            let Some(rx) = self.rx.as_ref() else {
                return None;
            };
            match rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {
                    // The loop is stuck; it is not joined.
                    self.worker = None;
                    let error = ReadError::StallTimeout {
                        waited: wait,
                        outstanding: self.ledger.unfinished(),
                    };
                    return Some(Err(self.fail(error)));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return self.finish().err().map(Err);
                }
                Ok(BridgeItem::Record(record)) => {
                    if self.state == BridgeState::Starting {
                        self.state = BridgeState::Streaming;
                    }
                    // A close failure is reported after the record it followed.
                    if let Err(error) = self.ledger.dequeued(&record.stream) {
                        self.pending = Some(error);
                    }
                    return Some(Ok(record));
                }
                Ok(BridgeItem::StreamComplete { stream, emitted }) => {
                    debug!(stream = %stream, emitted, "stream sentinel received");
                    if let Err(error) = self.ledger.complete(&stream, emitted) {
                        return Some(Err(self.fail(error)));
                    }
                    if self.ledger.all_complete() {
                        self.state = BridgeState::DrainingRemnants;
                    }
                }
                Ok(BridgeItem::StreamFailed { stream, error }) => {
                    return Some(Err(self.fail_stream(stream, error)));
                }
            }
        }
    }
}

impl Drop for BridgeReader {
    fn drop(&mut self) {
        self.rx = None;
        self.ledger.close_remaining();
        // A stuck source must not hang the caller on drop.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Hand `item` to the consumer, parking the worker while the queue is full.
fn send_blocking(
    tx: &SyncSender<BridgeItem>,
    item: BridgeItem,
) -> Result<(), SendError<BridgeItem>> {
    tokio::task::block_in_place(|| tx.send(item))
}

/// The background loop: one task per stream, bounded by a semaphore.
async fn read_streams(
    reader: Arc<dyn AsyncStreamReader>,
    jobs: Vec<(String, Arc<dyn StreamSession>)>,
    tx: SyncSender<BridgeItem>,
    max_concurrent: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut tasks = JoinSet::new();
    for (stream, session) in jobs {
        let reader = Arc::clone(&reader);
        let tx = tx.clone();
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let mut sink = RecordSink {
                stream: stream.clone(),
                tx: tx.clone(),
                emitted: 0,
            };
            let name = stream.clone();
            // Run the read in its own task so a panic comes back as a JoinError.
            let read = tokio::spawn(async move {
                let result = reader.read_stream(&name, session, &mut sink).await;
                (result, sink.emitted)
            });
            let item = match read.await {
                Ok((Ok(()), emitted)) => BridgeItem::StreamComplete { stream, emitted },
                Ok((Err(error), _)) => BridgeItem::StreamFailed { stream, error },
                Err(join) => BridgeItem::StreamFailed {
                    stream,
                    error: anyhow!("stream read panicked: {join}"),
                },
            };
            // A closed channel means the consumer is gone.
            let _ = send_blocking(&tx, item);
        });
    }
    drop(tx);
    while tasks.join_next().await.is_some() {}
}
