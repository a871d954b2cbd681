//! Batched persistence of user decisions about suggestions.
//!
//! Records are buffered in memory and appended to the [`LearningRecordStore`]
//! in batches, either when the batch threshold is reached (the caller submits
//! a [`FlushEventLogTask`]) or on a periodic timer. At most one flush runs at
//! a time.
//!
//! Records added while a flush is in flight are not part of that flush, and a
//! flush trigger that finds another flush running is dropped. Both wait for
//! the next trigger; the periodic timer bounds how long that takes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_core::defaults;
use tessera_core::{LearningRecord, LearningRecordStore, ProjectId, Result, TaskKind, WorkKey};

use crate::task::{Coalescing, Task};

/// Event log batching configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Buffered records that trigger a flush.
    pub batch_size: usize,
    /// Interval of the periodic flush in milliseconds.
    pub flush_interval_ms: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::EVENT_LOG_BATCH_SIZE,
            flush_interval_ms: defaults::EVENT_LOG_FLUSH_INTERVAL_MS,
        }
    }
}

impl EventLogConfig {
    /// Read `EVENT_LOG_BATCH_SIZE` and `EVENT_LOG_FLUSH_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let batch_size = std::env::var("EVENT_LOG_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.batch_size)
            .max(1);
        let flush_interval_ms = std::env::var("EVENT_LOG_FLUSH_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.flush_interval_ms)
            .max(1);
        Self {
            batch_size,
            flush_interval_ms,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Buffered writer of learning records.
pub struct EventLog {
    buffer: Mutex<Vec<LearningRecord>>,
    flushing: Mutex<bool>,
    store: Arc<dyn LearningRecordStore>,
    config: EventLogConfig,
}

/// Clears the in-flight flag when the flush ends, including on early return.
struct FlushGuard<'a>(&'a Mutex<bool>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

impl EventLog {
    pub fn new(store: Arc<dyn LearningRecordStore>, config: EventLogConfig) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            flushing: Mutex::new(false),
            store,
            config,
        }
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    /// Buffer a record. Returns true when the batch threshold is reached and
    /// a flush should be scheduled.
    pub fn record(&self, record: LearningRecord) -> bool {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push(record);
        buffer.len() >= self.config.batch_size
    }

    /// Number of buffered records.
    pub fn pending(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_flushing(&self) -> bool {
        *self.flushing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append the buffered records to the store.
    ///
    /// Returns the number of records written; `Ok(0)` when the buffer was
    /// empty or another flush is already running. On failure the batch is put
    /// back in front of anything recorded since.
    pub async fn flush(&self) -> Result<usize> {
        {
            let mut flushing = self.flushing.lock().unwrap_or_else(PoisonError::into_inner);
            if *flushing {
                debug!("Flush already in progress, skipping");
                return Ok(0);
            }
            *flushing = true;
        }
        let _guard = FlushGuard(&self.flushing);

        let batch = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        match self.store.append(batch.clone()).await {
            Ok(()) => {
                debug!(count, "Flushed event log");
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, count, "Event log flush failed, records kept for retry");
                let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                Err(e)
            }
        }
    }

    /// Flush on a fixed interval until the returned handle is aborted.
    pub fn start_periodic_flush(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.flush_interval();
        info!(interval_ms = interval.as_millis() as u64, "Starting periodic event log flush");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush().await {
                    debug!(error = %e, "Periodic flush failed");
                }
            }
        })
    }

    /// Task that flushes this log on behalf of `project_id`.
    ///
    /// The buffer is shared by all projects, so every queued flush coalesces
    /// with every other one regardless of the requesting project.
    pub fn flush_task(self: &Arc<Self>, project_id: ProjectId) -> FlushEventLogTask {
        FlushEventLogTask {
            key: WorkKey::project(project_id),
            log: self.clone(),
        }
    }
}

/// Project id of the single coalescing key used by all flush tasks.
const SHARED_BUFFER_PROJECT: ProjectId = 0;

/// Scheduler task wrapping [`EventLog::flush`].
pub struct FlushEventLogTask {
    key: WorkKey,
    log: Arc<EventLog>,
}

#[async_trait]
impl Task for FlushEventLogTask {
    fn kind(&self) -> TaskKind {
        TaskKind::FlushEventLog
    }

    fn work_key(&self) -> &WorkKey {
        &self.key
    }

    fn coalescing(&self) -> Coalescing {
        Coalescing::ByKey(WorkKey::project(SHARED_BUFFER_PROJECT))
    }

    async fn run(&self) -> Result<()> {
        self.log.flush().await.map(|_| ())
    }
}
