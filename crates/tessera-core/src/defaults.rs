//! Centralized default constants for tessera.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates should reference these constants instead of defining their own
//! magic numbers.

// =============================================================================
// SCHEDULER
// =============================================================================

/// Default number of scheduler worker lanes.
pub const SCHEDULER_WORKERS: usize = 4;

/// Default maximum number of queued (not yet running) tasks.
///
/// Replacing a matching task never counts against this limit.
pub const SCHEDULER_QUEUE_CAPACITY: usize = 1024;

/// Default broadcast capacity for scheduler events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// SUGGESTIONS
// =============================================================================

/// Default number of suggestions shown per position.
pub const MAX_SUGGESTIONS_PER_USER: usize = 3;

/// Default minimum confidence for a suggestion to be shown.
pub const SUGGESTION_MIN_CONFIDENCE: f64 = 0.0;

/// Tolerance used when comparing confidence values.
pub const CONFIDENCE_EPSILON: f64 = 1e-9;

// =============================================================================
// EVENT LOG
// =============================================================================

/// Number of buffered learning records that triggers an immediate flush.
pub const EVENT_LOG_BATCH_SIZE: usize = 64;

/// Periodic event log flush interval in milliseconds.
pub const EVENT_LOG_FLUSH_INTERVAL_MS: u64 = 1_000;
