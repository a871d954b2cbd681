//! The unit of background work and its coalescing policy.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use tessera_core::{Result, TaskKind, WorkKey};

/// Identifier assigned to every accepted submission (UUIDv7).
pub type TaskId = Uuid;

/// How a task decides whether it duplicates another queued task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coalescing {
    /// Never merged with other work.
    Never,
    /// Merged with any queued task of the same kind that projects to the
    /// same key. The projection decides which `WorkKey` fields matter, e.g.
    /// a project-wide reindex keeps only the project id.
    ByKey(WorkKey),
}

/// Canonical identity of "the same work" used by the queue's duplicate map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CoalesceKey {
    pub kind: TaskKind,
    pub key: WorkKey,
}

impl CoalesceKey {
    pub fn new(kind: TaskKind, key: WorkKey) -> Self {
        Self { kind, key }
    }

    /// Worker lane this key is pinned to.
    pub fn lane(&self, lanes: usize) -> usize {
        lane_for(self, lanes)
    }
}

impl fmt::Display for CoalesceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// Deterministic `hash(value) mod lanes`.
pub(crate) fn lane_for<T: Hash + ?Sized>(value: &T, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Lifecycle of a submitted task.
///
/// `Queued → (Replaced | Running → Done | Running → Failed)`. `Replaced`,
/// `Dropped`, `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    /// Absorbed by a newer matching submission before it ran.
    Replaced,
    /// Removed from the queue without running (eviction or shutdown).
    Dropped,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }
}

/// A unit of asynchronous work.
///
/// Tasks are immutable once constructed; the payload (e.g. a document
/// snapshot) is captured at submission time.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn kind(&self) -> TaskKind;

    fn work_key(&self) -> &WorkKey;

    /// Coalescing policy; tasks are never merged by default.
    fn coalescing(&self) -> Coalescing {
        Coalescing::Never
    }

    /// Upper bound on a single run. Exceeding it fails the task.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the task once. Errors mark the task as failed; they are logged and
    /// never retried by the scheduler.
    async fn run(&self) -> Result<()>;

    fn coalesce_key(&self) -> Option<CoalesceKey> {
        match self.coalescing() {
            Coalescing::Never => None,
            Coalescing::ByKey(key) => Some(CoalesceKey::new(self.kind(), key)),
        }
    }

    /// True if `other` is a duplicate of this task.
    fn matches(&self, other: &dyn Task) -> bool {
        match (self.coalesce_key(), other.coalesce_key()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Worker lane for this task: its coalescing key if any, else its work key.
    fn lane(&self, lanes: usize) -> usize {
        match self.coalesce_key() {
            Some(key) => key.lane(lanes),
            None => lane_for(self.work_key(), lanes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubTask {
        kind: TaskKind,
        key: WorkKey,
        coalescing: Coalescing,
    }

    #[async_trait]
    impl Task for StubTask {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        fn work_key(&self) -> &WorkKey {
            &self.key
        }

        fn coalescing(&self) -> Coalescing {
            self.coalescing.clone()
        }

        async fn run(&self) -> Result<()> {
            Ok(())
        }
    }

    fn reindex(project: i64) -> StubTask {
        StubTask {
            kind: TaskKind::ReindexProject,
            key: WorkKey::project(project).with_user("someone"),
            coalescing: Coalescing::ByKey(WorkKey::project(project)),
        }
    }

    #[test]
    fn test_matches_same_projection() {
        let a = reindex(1);
        let mut b = reindex(1);
        b.key = WorkKey::project(1).with_user("other");
        assert!(a.matches(&b));
        assert!(!a.matches(&reindex(2)));
    }

    #[test]
    fn test_matches_requires_same_kind() {
        let a = reindex(1);
        let b = StubTask {
            kind: TaskKind::IndexDocument,
            ..reindex(1)
        };
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_never_coalescing_never_matches() {
        let a = StubTask {
            coalescing: Coalescing::Never,
            ..reindex(1)
        };
        let b = StubTask {
            coalescing: Coalescing::Never,
            ..reindex(1)
        };
        assert!(!a.matches(&b));
        assert!(a.coalesce_key().is_none());
    }

    #[test]
    fn test_matching_tasks_share_a_lane() {
        let a = reindex(42);
        let b = reindex(42);
        for lanes in 1..8 {
            assert_eq!(a.lane(lanes), b.lane(lanes));
            assert!(a.lane(lanes) < lanes);
        }
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Replaced.is_terminal());
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Failed.is_terminal());
    }
}
