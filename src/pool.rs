//! Fixed-size worker pool for discovery tasks and partition readers.
//!
//! A thin layer over a dedicated rayon [`ThreadPool`]: every submitted task
//! gets a [`TaskHandle`] the consumer can poll without blocking. Tasks never
//! bring down the pool; a panic is caught and recorded as the task's error.
//!
//! Dropping the pool does not wait for running tasks. They finish in the
//! background, which is what a timed-out or failed read wants.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::ReadError;

pub struct WorkerPool {
    pool: ThreadPool,
    size: usize,
}

impl WorkerPool {
    /// Build a pool with exactly `size` worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::Config`] for a zero size and [`ReadError::Pool`]
    /// if the threads cannot be spawned.
    pub fn new(size: usize) -> Result<Self, ReadError> {
        if size == 0 {
            return Err(ReadError::Config("worker pool needs at least one thread".into()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("partiflow-worker-{i}"))
            .build()?;
        Ok(Self { pool, size })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `task` on a worker.
    pub fn submit<F>(&self, name: impl Into<String>, task: F) -> TaskHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let handle = TaskHandle::new(name.into());
        let slot = Arc::clone(&handle.slot);
        self.pool.spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(result) => result,
                Err(payload) => Err(anyhow!(
                    "task '{}' panicked: {}",
                    slot.name,
                    panic_message(payload.as_ref())
                )),
            };
            slot.finish(outcome.err());
        });
        handle
    }
}

struct TaskSlot {
    name: String,
    finished: AtomicBool,
    error: Mutex<Option<anyhow::Error>>,
}

impl TaskSlot {
    fn finish(&self, error: Option<anyhow::Error>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = error;
        self.finished.store(true, Ordering::Release);
    }
}

/// Handle to one submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    slot: Arc<TaskSlot>,
}

impl TaskHandle {
    fn new(name: String) -> Self {
        Self {
            slot: Arc::new(TaskSlot {
                name,
                finished: AtomicBool::new(false),
                error: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// Whether the task has returned (or panicked).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.slot.finished.load(Ordering::Acquire)
    }

    /// The error the task ended with, rendered, if it has finished with one.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        if !self.is_finished() {
            return None;
        }
        self.slot
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|e| format!("{e:#}"))
    }

    /// Take ownership of the task's error, leaving `None` behind.
    pub fn take_error(&self) -> Option<anyhow::Error> {
        if !self.is_finished() {
            return None;
        }
        self.slot
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
