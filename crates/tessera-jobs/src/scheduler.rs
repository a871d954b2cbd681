//! Coalescing task scheduler with a fixed pool of worker lanes.
//!
//! Every task is pinned to one lane by `hash(key) mod workers`, so matching
//! work is serialized without a separate lock while unrelated work runs in
//! parallel. `submit` only holds the queue mutex for the duration of a map
//! lookup and a push; tasks run outside any scheduler lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, field, info, info_span, instrument, warn, Instrument};

use tessera_core::{logging, new_v7, Error, TaskKind, WorkKey};

use crate::queue::{CoalescingQueue, PushOutcome, QueuedTask};
use crate::task::{Task, TaskId, TaskState};

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker lanes.
    pub workers: usize,
    /// Maximum number of queued tasks before the oldest is evicted.
    pub queue_capacity: usize,
    /// Broadcast buffer for scheduler events.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: tessera_core::defaults::SCHEDULER_WORKERS,
            queue_capacity: tessera_core::defaults::SCHEDULER_QUEUE_CAPACITY,
            event_capacity: tessera_core::defaults::EVENT_BUS_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `SCHEDULER_WORKERS` | `4` | Worker lanes |
    /// | `SCHEDULER_QUEUE_CAPACITY` | `1024` | Queued tasks before eviction |
    /// | `SCHEDULER_EVENT_CAPACITY` | `256` | Event broadcast buffer |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let workers = std::env::var("SCHEDULER_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.workers)
            .max(1);

        let queue_capacity = std::env::var("SCHEDULER_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.queue_capacity)
            .max(1);

        let event_capacity = std::env::var("SCHEDULER_EVENT_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.event_capacity)
            .max(1);

        Self {
            workers,
            queue_capacity,
            event_capacity,
        }
    }

    /// Set the number of worker lanes.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the queue capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the event broadcast buffer.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> tessera_core::Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("scheduler needs at least one worker".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Result of a submission. Duplicates are a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued as new work.
    Queued { id: TaskId },
    /// Took over the queue slot of a matching pending task.
    Replaced { id: TaskId, replaced: TaskId },
    /// Queued after evicting the oldest pending task (queue full).
    QueuedEvictedOldest { id: TaskId, evicted: TaskId },
    /// The scheduler is shutting down; the task was discarded.
    Rejected,
}

impl SubmitOutcome {
    /// Id of the accepted task, if it was accepted.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            SubmitOutcome::Queued { id }
            | SubmitOutcome::Replaced { id, .. }
            | SubmitOutcome::QueuedEvictedOldest { id, .. } => Some(*id),
            SubmitOutcome::Rejected => None,
        }
    }

    /// Id of the accepted task, or [`Error::SchedulerShutdown`].
    pub fn accepted(self) -> tessera_core::Result<TaskId> {
        self.task_id().ok_or(Error::SchedulerShutdown)
    }
}

/// Event emitted by the scheduler.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SchedulerEvent {
    TaskQueued {
        task_id: TaskId,
        kind: TaskKind,
        key: WorkKey,
    },
    TaskReplaced {
        task_id: TaskId,
        replaced_by: TaskId,
        kind: TaskKind,
    },
    TaskEvicted {
        task_id: TaskId,
        kind: TaskKind,
    },
    TaskDropped {
        task_id: TaskId,
        kind: TaskKind,
    },
    TaskStarted {
        task_id: TaskId,
        kind: TaskKind,
        lane: usize,
    },
    TaskCompleted {
        task_id: TaskId,
        kind: TaskKind,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        kind: TaskKind,
        error: String,
    },
    SchedulerStarted {
        workers: usize,
    },
    SchedulerStopped,
}

impl SchedulerEvent {
    /// Task this event is about, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            SchedulerEvent::TaskQueued { task_id, .. }
            | SchedulerEvent::TaskReplaced { task_id, .. }
            | SchedulerEvent::TaskEvicted { task_id, .. }
            | SchedulerEvent::TaskDropped { task_id, .. }
            | SchedulerEvent::TaskStarted { task_id, .. }
            | SchedulerEvent::TaskCompleted { task_id, .. }
            | SchedulerEvent::TaskFailed { task_id, .. } => Some(*task_id),
            SchedulerEvent::SchedulerStarted { .. } | SchedulerEvent::SchedulerStopped => None,
        }
    }

    /// State the task entered with this event.
    pub fn task_state(&self) -> Option<TaskState> {
        match self {
            SchedulerEvent::TaskQueued { .. } => Some(TaskState::Queued),
            SchedulerEvent::TaskReplaced { .. } => Some(TaskState::Replaced),
            SchedulerEvent::TaskEvicted { .. } | SchedulerEvent::TaskDropped { .. } => {
                Some(TaskState::Dropped)
            }
            SchedulerEvent::TaskStarted { .. } => Some(TaskState::Running),
            SchedulerEvent::TaskCompleted { .. } => Some(TaskState::Done),
            SchedulerEvent::TaskFailed { .. } => Some(TaskState::Failed),
            SchedulerEvent::SchedulerStarted { .. } | SchedulerEvent::SchedulerStopped => None,
        }
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Tasks currently queued.
    pub pending: usize,
    /// Tasks currently running.
    pub running: usize,
    pub submitted: u64,
    pub replaced: u64,
    pub evicted: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Run what is queued, then stop.
    Draining,
    /// Finish in-flight tasks, then stop.
    Stopping,
}

struct State {
    queue: CoalescingQueue,
    phase: Phase,
    paused: bool,
    stats: SchedulerStats,
}

struct Shared {
    state: Mutex<State>,
    wakers: Vec<Notify>,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Critical sections only touch plain data; a poisoned lock still
        // holds a consistent queue.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn wake_all(&self) {
        for waker in &self.wakers {
            waker.notify_one();
        }
    }

    /// Next task for `lane`, `Ok(None)` to wait, `Err(())` to exit.
    fn next_for(&self, lane: usize) -> Result<Option<QueuedTask>, ()> {
        let mut state = self.lock();
        let may_run = match state.phase {
            Phase::Running => !state.paused,
            Phase::Draining => true,
            Phase::Stopping => false,
        };
        if may_run {
            if let Some(queued) = state.queue.pop(lane) {
                state.stats.pending = state.queue.len();
                state.stats.running += 1;
                return Ok(Some(queued));
            }
        }
        if state.phase == Phase::Running {
            Ok(None)
        } else {
            Err(())
        }
    }

    async fn execute(&self, lane: usize, queued: QueuedTask) {
        let QueuedTask { id, task, .. } = queued;
        let kind = task.kind();
        let span = info_span!(
            "task",
            task_id = field::Empty,
            task_kind = field::Empty,
            project_id = field::Empty,
            document_id = field::Empty,
            lane = field::Empty
        );
        span.record(logging::TASK_ID, field::display(id));
        span.record(logging::TASK_KIND, kind.as_str());
        span.record(logging::PROJECT_ID, task.work_key().project_id);
        if let Some(document_id) = task.work_key().document_id {
            span.record(logging::DOCUMENT_ID, document_id);
        }
        span.record(logging::LANE, lane as u64);

        async {
            let start = Instant::now();
            debug!("Task started");
            self.emit(SchedulerEvent::TaskStarted {
                task_id: id,
                kind,
                lane,
            });

            // Spawned so a panicking task fails alone instead of taking the
            // lane down with it.
            let timeout = task.timeout();
            let handle = tokio::spawn(async move {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, task.run()).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::TaskExecution(format!(
                            "exceeded timeout of {}ms",
                            limit.as_millis()
                        ))),
                    },
                    None => task.run().await,
                }
            });

            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => Err(Error::TaskExecution(format!(
                    "task panicked: {}",
                    panic_message(join_error.into_panic())
                ))),
                Err(join_error) => Err(Error::TaskExecution(join_error.to_string())),
            };
            let duration_ms = start.elapsed().as_millis() as u64;

            {
                let mut state = self.lock();
                state.stats.running = state.stats.running.saturating_sub(1);
                match result {
                    Ok(()) => state.stats.completed += 1,
                    Err(_) => state.stats.failed += 1,
                }
            }

            match result {
                Ok(()) => {
                    info!(duration_ms, "Task completed");
                    self.emit(SchedulerEvent::TaskCompleted {
                        task_id: id,
                        kind,
                        duration_ms,
                    });
                }
                Err(e) => {
                    warn!(error = %e, duration_ms, "Task failed");
                    self.emit(SchedulerEvent::TaskFailed {
                        task_id: id,
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[instrument(skip(shared), fields(subsystem = "scheduler"))]
async fn run_lane(shared: Arc<Shared>, lane: usize) {
    debug!("Worker lane started");
    loop {
        match shared.next_for(lane) {
            Ok(Some(queued)) => shared.execute(lane, queued).await,
            Ok(None) => shared.wakers[lane].notified().await,
            Err(()) => break,
        }
    }
    debug!("Worker lane stopped");
}

/// Coalescing background task scheduler.
///
/// ```ignore
/// let scheduler = Scheduler::start(SchedulerConfig::from_env())?;
/// scheduler.submit(IndexDocumentTask::new(snapshot, indexer));
/// scheduler.shutdown_and_flush().await;
/// ```
pub struct Scheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start the worker lanes. Must be called within a Tokio runtime.
    pub fn start(config: SchedulerConfig) -> tessera_core::Result<Self> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: CoalescingQueue::new(config.workers, config.queue_capacity),
                phase: Phase::Running,
                paused: false,
                stats: SchedulerStats::default(),
            }),
            wakers: (0..config.workers).map(|_| Notify::new()).collect(),
            event_tx,
        });

        let workers = (0..config.workers)
            .map(|lane| tokio::spawn(run_lane(shared.clone(), lane)))
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Scheduler started"
        );
        shared.emit(SchedulerEvent::SchedulerStarted {
            workers: config.workers,
        });

        Ok(Self {
            shared,
            config,
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submit a task.
    pub fn submit<T: Task>(&self, task: T) -> SubmitOutcome {
        self.submit_shared(Arc::new(task))
    }

    /// Submit an already shared task.
    ///
    /// If a matching task is queued, the new task takes over its queue
    /// position and the old one is silently discarded.
    pub fn submit_shared(&self, task: Arc<dyn Task>) -> SubmitOutcome {
        let id = new_v7();
        let kind = task.kind();
        let key = task.work_key().clone();
        let queued = QueuedTask::new(id, task, self.config.workers);
        let lane = queued.lane;

        let mut evicted_kind = kind;
        let outcome = {
            let mut state = self.shared.lock();
            if state.phase != Phase::Running {
                state.stats.rejected += 1;
                drop(state);
                debug!(task_kind = %kind, %key, "Scheduler shutting down, task rejected");
                return SubmitOutcome::Rejected;
            }
            let pushed = state.queue.push(queued);
            state.stats.submitted += 1;
            state.stats.pending = state.queue.len();
            match pushed {
                PushOutcome::Enqueued => {
                    SubmitOutcome::Queued { id }
                }
                PushOutcome::Replaced(old) => {
                    state.stats.replaced += 1;
                    SubmitOutcome::Replaced {
                        id,
                        replaced: old.id,
                    }
                }
                PushOutcome::EnqueuedEvicting(old) => {
                    state.stats.evicted += 1;
                    evicted_kind = old.task.kind();
                    SubmitOutcome::QueuedEvictedOldest {
                        id,
                        evicted: old.id,
                    }
                }
            }
        };

        match outcome {
            SubmitOutcome::Queued { .. } => {
                debug!(task_id = %id, task_kind = %kind, %key, lane, "Task queued");
                self.shared.emit(SchedulerEvent::TaskQueued { task_id: id, kind, key });
                self.shared.wakers[lane].notify_one();
            }
            SubmitOutcome::Replaced { replaced, .. } => {
                debug!(task_id = %id, replaced = %replaced, task_kind = %kind, %key, "Queued task replaced");
                self.shared.emit(SchedulerEvent::TaskReplaced {
                    task_id: replaced,
                    replaced_by: id,
                    kind,
                });
            }
            SubmitOutcome::QueuedEvictedOldest { evicted, .. } => {
                warn!(
                    task_id = %id,
                    evicted = %evicted,
                    evicted_kind = %evicted_kind,
                    capacity = self.config.queue_capacity,
                    "Queue full, evicted oldest task"
                );
                self.shared.emit(SchedulerEvent::TaskEvicted {
                    task_id: evicted,
                    kind: evicted_kind,
                });
                self.shared.emit(SchedulerEvent::TaskQueued { task_id: id, kind, key });
                self.shared.wakers[lane].notify_one();
            }
            SubmitOutcome::Rejected => {}
        }

        outcome
    }

    /// Stop handing out queued tasks. Running tasks are unaffected.
    pub fn pause(&self) {
        self.shared.lock().paused = true;
        info!("Scheduler PAUSED");
    }

    /// Resume handing out queued tasks.
    pub fn resume(&self) {
        self.shared.lock().paused = false;
        info!("Scheduler RESUMED");
        self.shared.wake_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Current counters.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        SchedulerStats {
            pending: state.queue.len(),
            ..state.stats.clone()
        }
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Subscribe to scheduler events.
    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Stop accepting tasks, let in-flight tasks finish, drop the rest.
    pub async fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.lock();
            if state.phase == Phase::Running || state.phase == Phase::Draining {
                state.phase = Phase::Stopping;
            }
            let dropped = state.queue.drain();
            state.stats.dropped += dropped.len() as u64;
            state.stats.pending = 0;
            dropped
        };

        if !dropped.is_empty() {
            info!(count = dropped.len(), "Dropping queued tasks on shutdown");
        }
        for queued in dropped {
            self.shared.emit(SchedulerEvent::TaskDropped {
                task_id: queued.id,
                kind: queued.task.kind(),
            });
        }
        self.join_workers().await;
    }

    /// Stop accepting tasks and run everything already queued before
    /// stopping. Used at process teardown so the last indexing or event-log
    /// state is not lost.
    pub async fn shutdown_and_flush(&self) {
        let pending = {
            let mut state = self.shared.lock();
            if state.phase == Phase::Running {
                state.phase = Phase::Draining;
            }
            state.queue.len()
        };
        info!(pending, "Flushing queued tasks before shutdown");
        self.join_workers().await;
    }

    async fn join_workers(&self) {
        self.shared.wake_all();
        let workers = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *workers)
        };
        if workers.is_empty() {
            return;
        }
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!(error = ?e, "Worker lane panicked");
            }
        }
        info!("Scheduler stopped");
        self.shared.emit(SchedulerEvent::SchedulerStopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.event_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = SchedulerConfig::default()
            .with_workers(8)
            .with_capacity(16)
            .with_event_capacity(32);

        assert_eq!(config.workers, 8);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.event_capacity, 32);
    }

    #[test]
    fn test_scheduler_config_validate_rejects_zero() {
        assert!(SchedulerConfig::default().with_workers(0).validate().is_err());
        assert!(SchedulerConfig::default().with_capacity(0).validate().is_err());
        assert!(SchedulerConfig::default()
            .with_event_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_scheduler_config_deserialize_with_defaults() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"workers": 2}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn test_submit_outcome_task_id() {
        let id = new_v7();
        assert_eq!(SubmitOutcome::Queued { id }.task_id(), Some(id));
        assert_eq!(
            SubmitOutcome::Replaced {
                id,
                replaced: new_v7()
            }
            .task_id(),
            Some(id)
        );
        assert_eq!(SubmitOutcome::Rejected.task_id(), None);
        assert!(matches!(
            SubmitOutcome::Rejected.accepted(),
            Err(Error::SchedulerShutdown)
        ));
        assert_eq!(SubmitOutcome::Queued { id }.accepted().unwrap(), id);
    }

    #[test]
    fn test_event_task_state_mapping() {
        let id = new_v7();
        let event = SchedulerEvent::TaskReplaced {
            task_id: id,
            replaced_by: new_v7(),
            kind: TaskKind::Predict,
        };
        assert_eq!(event.task_id(), Some(id));
        assert_eq!(event.task_state(), Some(TaskState::Replaced));
        assert_eq!(SchedulerEvent::SchedulerStopped.task_state(), None);
    }

    #[test]
    fn test_event_serialization() {
        let event = SchedulerEvent::TaskFailed {
            task_id: Uuid::nil(),
            kind: TaskKind::Train,
            error: "boom".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"TaskFailed\""));
        assert!(json.contains("\"kind\":\"train\""));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(3_u8)), "unknown panic payload");
    }
}
