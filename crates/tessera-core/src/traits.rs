//! Interfaces to the external collaborators of tessera.
//!
//! The document store, the learning-record store, recommenders and indexers
//! all live outside this workspace; these traits are the seams at which they
//! are plugged in.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// STORES
// =============================================================================

/// Read access to the committed annotations of a document.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Annotations currently committed by `user` in `document_name`.
    async fn current_annotations(&self, document_name: &str, user: &str)
        -> Result<Vec<Annotation>>;
}

/// Access to a user's prior decisions about suggestions.
#[async_trait]
pub trait LearningRecordStore: Send + Sync {
    /// Records of `user` in `project_id`, optionally limited to one layer.
    async fn list_records(
        &self,
        user: &str,
        project_id: ProjectId,
        layer_id: Option<LayerId>,
    ) -> Result<Vec<LearningRecord>>;

    /// Append a batch of records.
    async fn append(&self, records: Vec<LearningRecord>) -> Result<()>;
}

// =============================================================================
// RECOMMENDERS & INDEXERS
// =============================================================================

/// Who a training or prediction run is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecommenderContext {
    pub user: String,
    pub project_id: ProjectId,
}

impl RecommenderContext {
    pub fn new(user: impl Into<String>, project_id: ProjectId) -> Self {
        Self {
            user: user.into(),
            project_id,
        }
    }
}

/// A trainable classifier, gazetteer or external NLP service.
#[async_trait]
pub trait Recommender: Send + Sync {
    fn id(&self) -> RecommenderId;

    fn name(&self) -> &str;

    /// Produce raw suggestions for one document.
    async fn predict(
        &self,
        ctx: &RecommenderContext,
        document: &DocumentSnapshot,
    ) -> Result<Vec<Suggestion>>;

    /// Train on the given documents. Recommenders that need no training keep
    /// the default.
    async fn train(&self, _ctx: &RecommenderContext, _documents: &[DocumentSnapshot]) -> Result<()> {
        Ok(())
    }
}

/// Search index maintained in the background.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index_document(&self, document: &DocumentSnapshot) -> Result<()>;

    async fn reindex_project(&self, project_id: ProjectId) -> Result<()>;
}
