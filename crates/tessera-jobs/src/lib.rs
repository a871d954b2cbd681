//! # tessera-jobs
//!
//! Background task scheduling for tessera.
//!
//! This crate provides:
//! - A fixed pool of worker lanes, each serving its own FIFO queue
//! - Coalescing of duplicate queued work (last write wins, queue position kept)
//! - Task lifecycle events via broadcast channels
//! - Batched persistence of learning records
//!
//! ## Example
//!
//! ```ignore
//! use tessera_jobs::{IndexDocumentTask, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::start(SchedulerConfig::from_env())?;
//!
//! // Listen for events
//! let mut events = scheduler.events();
//!
//! // Three quick edits collapse into one indexing run of the latest version
//! for snapshot in [v1, v2, v3] {
//!     scheduler.submit(IndexDocumentTask::new(snapshot, indexer.clone()));
//! }
//!
//! // Graceful shutdown
//! scheduler.shutdown().await;
//! ```

pub mod event_log;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod tasks;

// Re-export core types
pub use tessera_core::*;

pub use event_log::{EventLog, EventLogConfig, FlushEventLogTask};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerEvent, SchedulerStats, SubmitOutcome};
pub use task::{CoalesceKey, Coalescing, Task, TaskId, TaskState};
pub use tasks::{IndexDocumentTask, ReindexProjectTask};

/// Default number of worker lanes.
pub const DEFAULT_WORKERS: usize = tessera_core::defaults::SCHEDULER_WORKERS;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = tessera_core::defaults::SCHEDULER_QUEUE_CAPACITY;
