//! Core data models for tessera.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Project identifier.
pub type ProjectId = i64;
/// Source document identifier.
pub type DocumentId = i64;
/// Recommender identifier.
pub type RecommenderId = i64;
/// Annotation layer identifier.
pub type LayerId = i64;
/// Suggestion identifier, unique within one prediction run.
pub type SuggestionId = i64;

// =============================================================================
// WORK KEYS & TASK KINDS
// =============================================================================

/// Identifies "the same piece of work".
///
/// Absent fields act as wildcards in [`WorkKey::overlaps`]. Whether two
/// tasks actually coalesce is decided by the task's coalescing policy, not by
/// the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkKey {
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<DocumentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommender_id: Option<RecommenderId>,
}

impl WorkKey {
    /// Key covering a whole project.
    pub fn project(project_id: ProjectId) -> Self {
        Self {
            project_id,
            document_id: None,
            user: None,
            recommender_id: None,
        }
    }

    pub fn with_document(mut self, document_id: DocumentId) -> Self {
        self.document_id = Some(document_id);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_recommender(mut self, recommender_id: RecommenderId) -> Self {
        self.recommender_id = Some(recommender_id);
        self
    }

    /// True if every field present in both keys is equal.
    pub fn overlaps(&self, other: &WorkKey) -> bool {
        fn compatible<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        self.project_id == other.project_id
            && compatible(&self.document_id, &other.document_id)
            && compatible(&self.user, &other.user)
            && compatible(&self.recommender_id, &other.recommender_id)
    }

    /// The same key reduced to its project.
    pub fn project_only(&self) -> Self {
        Self::project(self.project_id)
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project={}", self.project_id)?;
        if let Some(doc) = self.document_id {
            write!(f, " document={}", doc)?;
        }
        if let Some(ref user) = self.user {
            write!(f, " user={}", user)?;
        }
        if let Some(rec) = self.recommender_id {
            write!(f, " recommender={}", rec)?;
        }
        Ok(())
    }
}

/// Kind of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Update the search index for one document
    IndexDocument,
    /// Rebuild the search index for a whole project
    ReindexProject,
    /// Train the recommenders of a project for a user
    Train,
    /// Run the recommenders and publish a new predictions snapshot
    Predict,
    /// Flush buffered learning records
    FlushEventLog,
    /// Application-defined work
    Custom(&'static str),
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::IndexDocument => "index_document",
            TaskKind::ReindexProject => "reindex_project",
            TaskKind::Train => "train",
            TaskKind::Predict => "predict",
            TaskKind::FlushEventLog => "flush_event_log",
            TaskKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// Immutable view of a document's content at submission time.
///
/// Cloning is cheap; the text is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub project_id: ProjectId,
    pub document_id: DocumentId,
    pub document_name: String,
    /// Monotonic content version, bumped by the document store on every edit.
    pub version: u64,
    pub text: Arc<str>,
    pub captured_at: DateTime<Utc>,
}

impl DocumentSnapshot {
    pub fn new(
        project_id: ProjectId,
        document_id: DocumentId,
        document_name: impl Into<String>,
        version: u64,
        text: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            project_id,
            document_id,
            document_name: document_name.into(),
            version,
            text: text.into(),
            captured_at: Utc::now(),
        }
    }

    /// Text covered by `span`, or `None` if the span is out of bounds or not
    /// on a character boundary.
    pub fn covered_text(&self, span: Span) -> Option<&str> {
        self.text.get(span.begin..span.end)
    }
}

// =============================================================================
// POSITIONS
// =============================================================================

/// Character offsets `[begin, end)` within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub begin: usize,
    pub end: usize,
}

impl Span {
    pub fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    /// Half-open overlap; zero-width spans overlap when they share an offset.
    pub fn overlaps(&self, other: &Span) -> bool {
        if self.begin == self.end || other.begin == other.end {
            return self.begin <= other.end && other.begin <= self.end;
        }
        self.begin < other.end && other.begin < self.end
    }

    pub fn is_valid(&self) -> bool {
        self.begin <= self.end
    }
}

/// Where a suggestion or annotation sits in a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Position {
    Span(Span),
    Relation { source: Span, target: Span },
}

impl Position {
    pub fn span(begin: usize, end: usize) -> Self {
        Position::Span(Span::new(begin, end))
    }

    pub fn relation(source: Span, target: Span) -> Self {
        Position::Relation { source, target }
    }

    /// Span position overlap, or identical endpoints for relations.
    pub fn overlaps(&self, other: &Position) -> bool {
        match (self, other) {
            (Position::Span(a), Position::Span(b)) => a.overlaps(b),
            (
                Position::Relation { source, target },
                Position::Relation {
                    source: other_source,
                    target: other_target,
                },
            ) => source == other_source && target == other_target,
            _ => false,
        }
    }

    /// True if any part of the position lies within `window`.
    pub fn intersects(&self, window: &Span) -> bool {
        match self {
            Position::Span(span) => span.overlaps(window),
            Position::Relation { source, target } => {
                source.overlaps(window) || target.overlaps(window)
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Position::Span(span) => span.is_valid(),
            Position::Relation { source, target } => source.is_valid() && target.is_valid(),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Span(s) => write!(f, "[{}-{}]", s.begin, s.end),
            Position::Relation { source, target } => write!(
                f,
                "[{}-{}]->[{}-{}]",
                source.begin, source.end, target.begin, target.end
            ),
        }
    }
}

// =============================================================================
// SUGGESTIONS
// =============================================================================

/// One candidate label at one position, proposed by one recommender.
///
/// Suggestions are immutable once produced. Identity and equality are by
/// `id`; visibility is tracked outside the suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: SuggestionId,
    pub recommender_id: RecommenderId,
    pub recommender_name: String,
    pub layer_id: LayerId,
    pub feature: String,
    pub label: String,
    pub ui_label: String,
    pub document_name: String,
    pub position: Position,
    pub covered_text: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Where the suggestion came from, e.g. the recommender tool name.
    pub source: String,
    /// Number of prediction runs this suggestion has been carried over.
    #[serde(default)]
    pub age: u32,
}

impl Suggestion {
    /// Create a suggestion with the required fields; the rest default to
    /// values derived from them.
    pub fn new(
        id: SuggestionId,
        recommender_id: RecommenderId,
        document_name: impl Into<String>,
        position: Position,
        feature: impl Into<String>,
        label: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let label = label.into();
        Self {
            id,
            recommender_id,
            recommender_name: format!("recommender-{}", recommender_id),
            layer_id: 0,
            feature: feature.into(),
            ui_label: label.clone(),
            label,
            document_name: document_name.into(),
            position,
            covered_text: String::new(),
            confidence,
            explanation: None,
            source: String::new(),
            age: 0,
        }
    }

    pub fn with_recommender_name(mut self, name: impl Into<String>) -> Self {
        self.recommender_name = name.into();
        self
    }

    pub fn with_layer(mut self, layer_id: LayerId) -> Self {
        self.layer_id = layer_id;
        self
    }

    pub fn with_ui_label(mut self, ui_label: impl Into<String>) -> Self {
        self.ui_label = ui_label.into();
        self
    }

    pub fn with_covered_text(mut self, text: impl Into<String>) -> Self {
        self.covered_text = text.into();
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// A copy carried over into a newer prediction run.
    pub fn aged(&self) -> Self {
        let mut next = self.clone();
        next.age = self.age.saturating_add(1);
        next
    }

    /// Check the per-suggestion invariants.
    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::MalformedSuggestion(format!(
                "suggestion {} has confidence {} outside [0, 1]",
                self.id, self.confidence
            )));
        }
        if !self.position.is_valid() {
            return Err(Error::MalformedSuggestion(format!(
                "suggestion {} has inverted position {}",
                self.id, self.position
            )));
        }
        if self.document_name.is_empty() {
            return Err(Error::MalformedSuggestion(format!(
                "suggestion {} has no document",
                self.id
            )));
        }
        Ok(())
    }

    /// Natural ordering: `(recommender_id, id)` ascending.
    pub fn natural_cmp(&self, other: &Suggestion) -> Ordering {
        (self.recommender_id, self.id).cmp(&(other.recommender_id, other.id))
    }

    /// True if `annotation` sits on the same layer/feature and position.
    pub fn overlaps_annotation(&self, annotation: &Annotation) -> bool {
        annotation.document_name == self.document_name
            && annotation.layer_id == self.layer_id
            && annotation.feature == self.feature
            && annotation.position.overlaps(&self.position)
    }

    /// True if `record` is about this suggestion's position and label.
    pub fn matches_record(&self, record: &LearningRecord) -> bool {
        record.document_name == self.document_name
            && record.layer_id == self.layer_id
            && record.feature == self.feature
            && record.position == self.position
            && record.label == self.label
    }
}

impl PartialEq for Suggestion {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Suggestion {}

impl Hash for Suggestion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// =============================================================================
// ANNOTATIONS & LEARNING RECORDS
// =============================================================================

/// A committed annotation as read from the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub document_name: String,
    pub layer_id: LayerId,
    pub feature: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Annotation {
    pub fn new(
        document_name: impl Into<String>,
        layer_id: LayerId,
        feature: impl Into<String>,
        position: Position,
        value: Option<String>,
    ) -> Self {
        Self {
            document_name: document_name.into(),
            layer_id,
            feature: feature.into(),
            position,
            value,
        }
    }
}

/// What a user did with a suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    Accepted,
    Rejected,
    Skipped,
    Corrected,
}

/// A prior accept/reject/skip decision of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub user: String,
    pub project_id: ProjectId,
    pub document_name: String,
    pub layer_id: LayerId,
    pub feature: String,
    pub position: Position,
    pub label: String,
    pub action: UserAction,
    pub recorded_at: DateTime<Utc>,
}

impl LearningRecord {
    /// Record the user's decision about `suggestion`.
    pub fn for_suggestion(
        user: impl Into<String>,
        project_id: ProjectId,
        suggestion: &Suggestion,
        action: UserAction,
    ) -> Self {
        Self {
            user: user.into(),
            project_id,
            document_name: suggestion.document_name.clone(),
            layer_id: suggestion.layer_id,
            feature: suggestion.feature.clone(),
            position: suggestion.position,
            label: suggestion.label.clone(),
            action,
            recorded_at: Utc::now(),
        }
    }
}
