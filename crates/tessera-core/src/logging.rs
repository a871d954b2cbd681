//! Structured logging field name constants for tessera.
//!
//! All crates use these constants for consistent structured logging fields
//! so log aggregation tools can query by the same names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue: failed task, dropped suggestion, store outage |
//! | INFO  | Lifecycle events (startup, shutdown), snapshot publication |
//! | DEBUG | Decision points: task replaced, lane assignment, verdict counts |
//! | TRACE | Per-item iteration (individual suggestions, records) |

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Task UUID being processed.
pub const TASK_ID: &str = "task_id";

/// Task kind.
pub const TASK_KIND: &str = "task_kind";

/// Project the work belongs to.
pub const PROJECT_ID: &str = "project_id";

/// Document the work belongs to.
pub const DOCUMENT_ID: &str = "document_id";

/// User the work is performed for.
pub const USER: &str = "user";

/// Worker lane index.
pub const LANE: &str = "lane";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Number of suggestions handled.
pub const SUGGESTION_COUNT: &str = "suggestion_count";

/// Number of suggestion groups handled.
pub const GROUP_COUNT: &str = "group_count";
