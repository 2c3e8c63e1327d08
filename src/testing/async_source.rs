//! A scripted asynchronous source for exercising the bridge reader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::bridge::{AsyncStreamReader, RecordSink, StreamSession};

/// A session that remembers how often it was closed.
#[derive(Debug)]
pub struct RecordingSession {
    stream: String,
    closes: AtomicUsize,
    close_error: Option<String>,
}

impl RecordingSession {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            closes: AtomicUsize::new(0),
            close_error: None,
        }
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl StreamSession for RecordingSession {
    fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match &self.close_error {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Default)]
struct StreamScript {
    rows: Vec<Map<String, Value>>,
    read_error: Option<String>,
    open_error: Option<String>,
    close_error: Option<String>,
    panics: bool,
}

/// Replays scripted rows per stream, optionally pausing between records.
///
/// Every emit checks that the stream's session is still open, so a premature
/// close shows up as a read failure.
#[derive(Default)]
pub struct ScriptedAsyncReader {
    streams: HashMap<String, StreamScript>,
    record_delay: Option<Duration>,
    blocking_delay: Option<Duration>,
    sessions: Mutex<HashMap<String, Arc<RecordingSession>>>,
}

impl ScriptedAsyncReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stream(mut self, stream: &str, rows: Vec<Map<String, Value>>) -> Self {
        self.streams.entry(stream.to_string()).or_default().rows = rows;
        self
    }

    /// Emit `rows`, then fail with `message`.
    #[must_use]
    pub fn failing_after(mut self, stream: &str, rows: Vec<Map<String, Value>>, message: &str) -> Self {
        let script = self.streams.entry(stream.to_string()).or_default();
        script.rows = rows;
        script.read_error = Some(message.to_string());
        self
    }

    #[must_use]
    pub fn failing_to_open(mut self, stream: &str, message: &str) -> Self {
        self.streams.entry(stream.to_string()).or_default().open_error = Some(message.to_string());
        self
    }

    #[must_use]
    pub fn failing_close(mut self, stream: &str, message: &str) -> Self {
        self.streams.entry(stream.to_string()).or_default().close_error = Some(message.to_string());
        self
    }

    #[must_use]
    pub fn panicking(mut self, stream: &str) -> Self {
        self.streams.entry(stream.to_string()).or_default().panics = true;
        self
    }

    #[must_use]
    pub fn with_record_delay(mut self, delay: Duration) -> Self {
        self.record_delay = Some(delay);
        self
    }

    /// Block the worker thread for `delay` before each stream's first record,
    /// the way a synchronous driver call would.
    #[must_use]
    pub fn blocking_for(mut self, delay: Duration) -> Self {
        self.blocking_delay = Some(delay);
        self
    }

    /// The session opened for `stream`, once the bridge has opened it.
    #[must_use]
    pub fn session(&self, stream: &str) -> Option<Arc<RecordingSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream)
            .cloned()
    }

    fn script(&self, stream: &str) -> anyhow::Result<&StreamScript> {
        self.streams
            .get(stream)
            .ok_or_else(|| anyhow!("no rows scripted for stream '{stream}'"))
    }
}

#[async_trait]
impl AsyncStreamReader for ScriptedAsyncReader {
    fn open_session(&self, stream: &str) -> anyhow::Result<Arc<dyn StreamSession>> {
        let script = self.script(stream)?;
        if let Some(message) = &script.open_error {
            bail!("{message}");
        }
        let session = Arc::new(RecordingSession {
            close_error: script.close_error.clone(),
            ..RecordingSession::new(stream)
        });
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream.to_string(), Arc::clone(&session));
        Ok(session)
    }

    async fn read_stream(
        &self,
        stream: &str,
        _session: Arc<dyn StreamSession>,
        sink: &mut RecordSink,
    ) -> anyhow::Result<()> {
        let script = self.script(stream)?;
        if script.panics {
            panic!("scripted panic in stream '{stream}'");
        }
        let session = self
            .session(stream)
            .ok_or_else(|| anyhow!("stream '{stream}' read without a session"))?;
        if let Some(delay) = self.blocking_delay {
            std::thread::sleep(delay);
        }
        for row in &script.rows {
            if let Some(delay) = self.record_delay {
                tokio::time::sleep(delay).await;
            }
            if session.is_closed() {
                bail!("stream '{stream}' emitted a record after its session closed");
            }
            sink.emit(row.clone()).await?;
        }
        if let Some(message) = &script.read_error {
            bail!("{message}");
        }
        Ok(())
    }
}
