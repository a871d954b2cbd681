//! Index maintenance tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use tessera_core::{DocumentSnapshot, Indexer, ProjectId, Result, TaskKind, WorkKey};

use crate::task::{Coalescing, Task};

/// Re-index one document from the snapshot captured at submission.
///
/// Queued index tasks for the same document coalesce, so a burst of edits
/// results in one indexing run over the latest snapshot.
pub struct IndexDocumentTask {
    key: WorkKey,
    snapshot: DocumentSnapshot,
    indexer: Arc<dyn Indexer>,
    timeout: Option<Duration>,
}

impl IndexDocumentTask {
    pub fn new(snapshot: DocumentSnapshot, indexer: Arc<dyn Indexer>) -> Self {
        Self {
            key: WorkKey::project(snapshot.project_id).with_document(snapshot.document_id),
            snapshot,
            indexer,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn snapshot(&self) -> &DocumentSnapshot {
        &self.snapshot
    }
}

#[async_trait]
impl Task for IndexDocumentTask {
    fn kind(&self) -> TaskKind {
        TaskKind::IndexDocument
    }

    fn work_key(&self) -> &WorkKey {
        &self.key
    }

    fn coalescing(&self) -> Coalescing {
        Coalescing::ByKey(self.key.clone())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run(&self) -> Result<()> {
        debug!(
            document = %self.snapshot.document_name,
            version = self.snapshot.version,
            "Indexing document"
        );
        self.indexer.index_document(&self.snapshot).await
    }
}

/// Rebuild the index of a whole project.
pub struct ReindexProjectTask {
    key: WorkKey,
    indexer: Arc<dyn Indexer>,
}

impl ReindexProjectTask {
    pub fn new(project_id: ProjectId, indexer: Arc<dyn Indexer>) -> Self {
        Self {
            key: WorkKey::project(project_id),
            indexer,
        }
    }

    /// Same as [`ReindexProjectTask::new`] but remembers who asked for it.
    /// The requester does not affect coalescing.
    pub fn requested_by(project_id: ProjectId, user: &str, indexer: Arc<dyn Indexer>) -> Self {
        Self {
            key: WorkKey::project(project_id).with_user(user),
            indexer,
        }
    }
}

#[async_trait]
impl Task for ReindexProjectTask {
    fn kind(&self) -> TaskKind {
        TaskKind::ReindexProject
    }

    fn work_key(&self) -> &WorkKey {
        &self.key
    }

    fn coalescing(&self) -> Coalescing {
        Coalescing::ByKey(self.key.project_only())
    }

    async fn run(&self) -> Result<()> {
        self.indexer.reindex_project(self.key.project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::mock::RecordingIndexer;

    fn snapshot(document_id: i64, version: u64) -> DocumentSnapshot {
        DocumentSnapshot::new(1, document_id, format!("doc-{document_id}"), version, "text")
    }

    #[test]
    fn test_index_tasks_match_per_document() {
        let indexer: Arc<dyn Indexer> = Arc::new(RecordingIndexer::new());
        let v1 = IndexDocumentTask::new(snapshot(7, 1), indexer.clone());
        let v2 = IndexDocumentTask::new(snapshot(7, 2), indexer.clone());
        let other = IndexDocumentTask::new(snapshot(8, 1), indexer);

        assert!(v1.matches(&v2));
        assert!(!v1.matches(&other));
    }

    #[test]
    fn test_reindex_ignores_requester() {
        let indexer: Arc<dyn Indexer> = Arc::new(RecordingIndexer::new());
        let a = ReindexProjectTask::requested_by(1, "alice", indexer.clone());
        let b = ReindexProjectTask::requested_by(1, "bob", indexer.clone());
        let index = IndexDocumentTask::new(snapshot(7, 1), indexer);

        assert!(a.matches(&b));
        assert!(!a.matches(&index));
    }

    #[tokio::test]
    async fn test_index_task_uses_captured_snapshot() {
        let indexer = RecordingIndexer::new();
        let task = IndexDocumentTask::new(snapshot(7, 3), Arc::new(indexer.clone()));
        task.run().await.unwrap();
        assert_eq!(indexer.indexed_versions("doc-7"), vec![3]);
    }
}
