//! Recommender tasks run on the scheduler.
//!
//! All three tasks coalesce per user and project (refresh also per
//! document): a newer request supersedes one that has not started yet.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, field, info, info_span, warn, Instrument};

use tessera_core::{
    logging, DocumentId, DocumentSnapshot, Error, ProjectId, Recommender, RecommenderContext,
    Result, TaskKind, WorkKey,
};
use tessera_jobs::{Coalescing, Task};

use crate::group::group_suggestions;
use crate::predictions::{LogLevel, PredictionsBuilder};
use crate::store::PredictionStore;
use crate::visibility::VisibilityEngine;

/// Predict suggestions for a set of documents and publish a new snapshot.
///
/// Documents not in this run are carried over from the current snapshot.
/// A failing recommender is reported in the snapshot's log and does not fail
/// the run.
pub struct PredictTask {
    key: WorkKey,
    ctx: RecommenderContext,
    documents: Vec<DocumentSnapshot>,
    recommenders: Vec<Arc<dyn Recommender>>,
    engine: Arc<VisibilityEngine>,
    store: Arc<PredictionStore>,
}

impl PredictTask {
    pub fn new(
        ctx: RecommenderContext,
        documents: Vec<DocumentSnapshot>,
        recommenders: Vec<Arc<dyn Recommender>>,
        engine: Arc<VisibilityEngine>,
        store: Arc<PredictionStore>,
    ) -> Self {
        Self {
            key: WorkKey::project(ctx.project_id).with_user(ctx.user.clone()),
            ctx,
            documents,
            recommenders,
            engine,
            store,
        }
    }
}

#[async_trait]
impl Task for PredictTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Predict
    }

    fn work_key(&self) -> &WorkKey {
        &self.key
    }

    fn coalescing(&self) -> Coalescing {
        Coalescing::ByKey(self.key.clone())
    }

    async fn run(&self) -> Result<()> {
        let span = info_span!(
            "predict",
            user = field::Empty,
            project_id = field::Empty,
            group_count = field::Empty,
            suggestion_count = field::Empty
        );
        span.record(logging::USER, self.ctx.user.as_str());
        span.record(logging::PROJECT_ID, self.ctx.project_id);

        async {
            let mut fresh = Vec::with_capacity(self.documents.len());
            let mut log = Vec::new();

            for document in &self.documents {
                let ctx = &self.ctx;
                let results = join_all(self.recommenders.iter().map(|recommender| async move {
                    (recommender, recommender.predict(ctx, document).await)
                }))
                .await;

                let mut raw = Vec::new();
                for (recommender, result) in results {
                    match result {
                        Ok(suggestions) => {
                            debug!(
                                recommender_id = recommender.id(),
                                suggestion_count = suggestions.len(),
                                document = %document.document_name,
                                "Recommender returned suggestions"
                            );
                            raw.extend(suggestions);
                        }
                        Err(e) => {
                            warn!(
                                recommender_id = recommender.id(),
                                document = %document.document_name,
                                error = %e,
                                "Recommender failed"
                            );
                            log.push((recommender.name().to_string(), e.to_string()));
                        }
                    }
                }

                let groups = group_suggestions(raw);
                let visibility = self
                    .engine
                    .refresh(
                        &self.ctx.user,
                        self.ctx.project_id,
                        &document.document_name,
                        &groups,
                        0,
                        document.text.len(),
                    )
                    .await;
                fresh.push((document.document_name.clone(), groups, visibility));
            }

            let groups: usize = fresh.iter().map(|(_, groups, _)| groups.len()).sum();
            let suggestions: usize = fresh
                .iter()
                .flat_map(|(_, groups, _)| groups.iter())
                .map(|group| group.len())
                .sum();
            let current = tracing::Span::current();
            current.record(logging::GROUP_COUNT, groups as u64);
            current.record(logging::SUGGESTION_COUNT, suggestions as u64);

            // Inherit from whatever is current at publish time, so a refresh
            // published while the recommenders ran is carried over.
            loop {
                let previous = self.store.get_current(&self.ctx.user, self.ctx.project_id);
                let mut builder = PredictionsBuilder::new(&self.ctx.user, self.ctx.project_id);
                if let Some(previous) = &previous {
                    builder = builder.inherit_from(previous.clone());
                }
                for (name, groups, visibility) in &fresh {
                    builder = builder.add_document(name.clone(), groups.clone(), visibility.clone());
                }
                for (source, message) in &log {
                    builder = builder.log(LogLevel::Warn, source.clone(), message.clone());
                }

                let predictions = builder.build();
                let generation = predictions.generation();
                match self.store.publish_if_current(previous.as_ref(), predictions) {
                    Ok(_) => {
                        debug!(
                            generation,
                            documents = self.documents.len(),
                            "Prediction run finished"
                        );
                        return Ok(());
                    }
                    Err(_) => debug!("Predictions changed during run, rebuilding"),
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Train every recommender on the given documents.
///
/// All recommenders are attempted; the task fails if any of them failed.
pub struct TrainTask {
    key: WorkKey,
    ctx: RecommenderContext,
    documents: Vec<DocumentSnapshot>,
    recommenders: Vec<Arc<dyn Recommender>>,
}

impl TrainTask {
    pub fn new(
        ctx: RecommenderContext,
        documents: Vec<DocumentSnapshot>,
        recommenders: Vec<Arc<dyn Recommender>>,
    ) -> Self {
        Self {
            key: WorkKey::project(ctx.project_id).with_user(ctx.user.clone()),
            ctx,
            documents,
            recommenders,
        }
    }
}

#[async_trait]
impl Task for TrainTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Train
    }

    fn work_key(&self) -> &WorkKey {
        &self.key
    }

    fn coalescing(&self) -> Coalescing {
        Coalescing::ByKey(self.key.clone())
    }

    async fn run(&self) -> Result<()> {
        let ctx = &self.ctx;
        let documents = self.documents.as_slice();
        let results = join_all(self.recommenders.iter().map(|recommender| async move {
            (recommender, recommender.train(ctx, documents).await)
        }))
        .await;

        let failed: Vec<String> = results
            .into_iter()
            .filter_map(|(recommender, result)| {
                result.err().map(|e| {
                    warn!(recommender_id = recommender.id(), error = %e, "Training failed");
                    recommender.name().to_string()
                })
            })
            .collect();

        if failed.is_empty() {
            info!(
                user = %self.ctx.user,
                project_id = self.ctx.project_id,
                recommenders = self.recommenders.len(),
                documents = self.documents.len(),
                "Training finished"
            );
            Ok(())
        } else {
            Err(Error::TaskExecution(format!(
                "training failed for {}",
                failed.join(", ")
            )))
        }
    }
}

/// Recalculate visibility of one document in the current snapshot, e.g.
/// after the user committed or deleted an annotation.
pub struct RefreshVisibilityTask {
    key: WorkKey,
    user: String,
    document_name: String,
    engine: Arc<VisibilityEngine>,
    store: Arc<PredictionStore>,
}

impl RefreshVisibilityTask {
    pub fn new(
        user: impl Into<String>,
        project_id: ProjectId,
        document_id: DocumentId,
        document_name: impl Into<String>,
        engine: Arc<VisibilityEngine>,
        store: Arc<PredictionStore>,
    ) -> Self {
        let user = user.into();
        Self {
            key: WorkKey::project(project_id)
                .with_user(user.clone())
                .with_document(document_id),
            user,
            document_name: document_name.into(),
            engine,
            store,
        }
    }
}

#[async_trait]
impl Task for RefreshVisibilityTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Custom("refresh_visibility")
    }

    fn work_key(&self) -> &WorkKey {
        &self.key
    }

    fn coalescing(&self) -> Coalescing {
        Coalescing::ByKey(self.key.clone())
    }

    async fn run(&self) -> Result<()> {
        let project_id = self.key.project_id;
        let Some(current) = self.store.get_current(&self.user, project_id) else {
            debug!(user = %self.user, project_id, "No predictions to refresh");
            return Ok(());
        };

        let groups = current.groups(&self.document_name);
        let window_end = groups
            .iter()
            .filter_map(|g| match g.position() {
                tessera_core::Position::Span(span) => Some(span.end),
                tessera_core::Position::Relation { source, target } => {
                    Some(source.end.max(target.end))
                }
            })
            .max()
            .unwrap_or(0);

        let visibility = self
            .engine
            .refresh(&self.user, project_id, &self.document_name, groups, 0, window_end)
            .await;
        let next = current.with_visibility(&self.document_name, visibility);
        if !self.store.replace_if_current(&current, next) {
            debug!(document = %self.document_name, "Predictions replaced during refresh");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visibility::VisibilityConfig;
    use tessera_core::mock::MockRecommender;
    use tessera_core::{InMemoryAnnotationStore, InMemoryLearningRecordStore, Position, Suggestion};

    fn engine() -> Arc<VisibilityEngine> {
        Arc::new(VisibilityEngine::new(
            VisibilityConfig::default(),
            Arc::new(InMemoryAnnotationStore::new()),
            Arc::new(InMemoryLearningRecordStore::new()),
        ))
    }

    #[test]
    fn test_predict_tasks_coalesce_per_user() {
        let store = Arc::new(PredictionStore::new());
        let task = |user: &str| {
            PredictTask::new(
                RecommenderContext::new(user, 1),
                Vec::new(),
                Vec::new(),
                engine(),
                store.clone(),
            )
        };
        assert!(task("alice").matches(&task("alice")));
        assert!(!task("alice").matches(&task("bob")));
    }

    #[test]
    fn test_train_and_predict_do_not_match() {
        let store = Arc::new(PredictionStore::new());
        let ctx = RecommenderContext::new("alice", 1);
        let predict = PredictTask::new(ctx.clone(), Vec::new(), Vec::new(), engine(), store);
        let train = TrainTask::new(ctx, Vec::new(), Vec::new());
        assert!(!predict.matches(&train));
    }

    #[tokio::test]
    async fn test_train_task_reports_failures() {
        let ok: Arc<dyn Recommender> = Arc::new(MockRecommender::new(1, "gazetteer"));
        let broken = MockRecommender::new(2, "crf").failing_train();
        let broken_shared: Arc<dyn Recommender> = Arc::new(broken.clone());
        let task = TrainTask::new(
            RecommenderContext::new("alice", 1),
            Vec::new(),
            vec![ok, broken_shared],
        );

        let err = task.run().await.unwrap_err();
        assert!(err.to_string().contains("crf"));
        assert_eq!(broken.train_call_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_predictions_is_noop() {
        let store = Arc::new(PredictionStore::new());
        let task = RefreshVisibilityTask::new("alice", 1, 7, "doc.txt", engine(), store.clone());
        task.run().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_predict_publishes_snapshot() {
        let recommender = MockRecommender::new(1, "gazetteer").with_suggestion(Suggestion::new(
            1,
            1,
            "doc.txt",
            Position::span(0, 5),
            "value",
            "PER",
            0.8,
        ));
        let recommender: Arc<dyn Recommender> = Arc::new(recommender);
        let store = Arc::new(PredictionStore::new());
        let task = PredictTask::new(
            RecommenderContext::new("alice", 1),
            vec![DocumentSnapshot::new(1, 7, "doc.txt", 1, "Alice went home")],
            vec![recommender],
            engine(),
            store.clone(),
        );

        task.run().await.unwrap();
        let predictions = store.get_current("alice", 1).unwrap();
        assert_eq!(predictions.visible_suggestions("doc.txt").len(), 1);
    }
}
