//! Line-delimited JSON requests fed to the worker on stdin.
//!
//! Each line is one [`WorkerRequest`], e.g.
//!
//! ```text
//! {"type":"annotate","user":"alice","project_id":1,"document_id":7,"annotation":{...}}
//! ```
//!
//! Annotation changes are applied to the annotation store and followed by a
//! visibility refresh of the affected document. Learning records go to the
//! event log; a flush is queued once the batch threshold is reached.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use tessera_core::{
    Annotation, DocumentId, InMemoryAnnotationStore, LearningRecord, Position, ProjectId,
};
use tessera_jobs::{EventLog, Scheduler, SubmitOutcome};
use tessera_recommend::{PredictionStore, RefreshVisibilityTask, VisibilityEngine};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// The user committed an annotation.
    Annotate {
        user: String,
        project_id: ProjectId,
        document_id: DocumentId,
        annotation: Annotation,
    },
    /// The user deleted their annotations at a position.
    DeleteAnnotation {
        user: String,
        project_id: ProjectId,
        document_id: DocumentId,
        document_name: String,
        position: Position,
    },
    /// The user accepted, rejected, skipped or corrected a suggestion.
    Record { record: LearningRecord },
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> tessera_core::Result<Option<WorkerRequest>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Applies requests and submits the follow-up work.
pub struct RequestHandler {
    annotations: Arc<InMemoryAnnotationStore>,
    engine: Arc<VisibilityEngine>,
    predictions: Arc<PredictionStore>,
    event_log: Arc<EventLog>,
}

impl RequestHandler {
    pub fn new(
        annotations: Arc<InMemoryAnnotationStore>,
        engine: Arc<VisibilityEngine>,
        predictions: Arc<PredictionStore>,
        event_log: Arc<EventLog>,
    ) -> Self {
        Self {
            annotations,
            engine,
            predictions,
            event_log,
        }
    }

    /// Apply `request` and return the outcome of the submitted task, if any.
    pub fn handle(&self, scheduler: &Scheduler, request: WorkerRequest) -> Option<SubmitOutcome> {
        match request {
            WorkerRequest::Annotate {
                user,
                project_id,
                document_id,
                annotation,
            } => {
                let document_name = annotation.document_name.clone();
                self.annotations.add(&user, annotation);
                Some(self.refresh(scheduler, user, project_id, document_id, document_name))
            }
            WorkerRequest::DeleteAnnotation {
                user,
                project_id,
                document_id,
                document_name,
                position,
            } => {
                let removed = self.annotations.remove_at(&document_name, &user, &position);
                if removed == 0 {
                    debug!(%user, document = %document_name, "No annotation at position");
                    return None;
                }
                Some(self.refresh(scheduler, user, project_id, document_id, document_name))
            }
            WorkerRequest::Record { record } => {
                let project_id = record.project_id;
                if self.event_log.record(record) {
                    Some(scheduler.submit(self.event_log.flush_task(project_id)))
                } else {
                    None
                }
            }
        }
    }

    fn refresh(
        &self,
        scheduler: &Scheduler,
        user: String,
        project_id: ProjectId,
        document_id: DocumentId,
        document_name: String,
    ) -> SubmitOutcome {
        let outcome = scheduler.submit(RefreshVisibilityTask::new(
            user,
            project_id,
            document_id,
            document_name,
            self.engine.clone(),
            self.predictions.clone(),
        ));
        if matches!(outcome, SubmitOutcome::Rejected) {
            warn!(project_id, document_id, "Visibility refresh rejected");
        }
        outcome
    }
}
