//! Immutable prediction snapshots.
//!
//! A [`Predictions`] value is everything one prediction run produced for one
//! user in one project. It is assembled privately with a
//! [`PredictionsBuilder`] and never changes after it is published; updated
//! visibility produces a new snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use tessera_core::{ProjectId, Suggestion, SuggestionId};

use crate::group::SuggestionGroup;
use crate::visibility::{VisibilityMap, VisibilityVerdict};

/// Severity of a prediction log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Message recorded during a prediction run, shown to the user with the
/// results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

/// Result of one prediction run.
#[derive(Debug, Clone, Serialize)]
pub struct Predictions {
    user: String,
    project_id: ProjectId,
    generation: u64,
    generated_at: DateTime<Utc>,
    documents: BTreeMap<String, Vec<SuggestionGroup>>,
    visibility: VisibilityMap,
    log: Vec<LogMessage>,
}

impl Predictions {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Run counter; each run that builds on a previous snapshot increments it.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Names of documents with predictions, ascending.
    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    /// Groups of `document` in position order.
    pub fn groups(&self, document: &str) -> &[SuggestionGroup] {
        self.documents
            .get(document)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn all_groups(&self) -> impl Iterator<Item = &SuggestionGroup> {
        self.documents.values().flatten()
    }

    pub fn suggestion_count(&self) -> usize {
        self.all_groups().map(SuggestionGroup::len).sum()
    }

    pub fn suggestion(&self, id: SuggestionId) -> Option<&Suggestion> {
        self.all_groups().flat_map(|g| g.iter()).find(|s| s.id == id)
    }

    pub fn visibility(&self) -> &VisibilityMap {
        &self.visibility
    }

    pub fn verdict(&self, id: SuggestionId) -> VisibilityVerdict {
        self.visibility.verdict(id)
    }

    /// Visible suggestions of `document`: groups in position order, members
    /// in display order.
    pub fn visible_suggestions(&self, document: &str) -> Vec<&Suggestion> {
        self.groups(document)
            .iter()
            .flat_map(|g| g.iter())
            .filter(|s| self.visibility.is_visible(s.id))
            .collect()
    }

    /// Highest-confidence visible member of `group`.
    pub fn best_visible<'a>(&self, group: &'a SuggestionGroup) -> Option<&'a Suggestion> {
        group.iter().find(|s| self.visibility.is_visible(s.id))
    }

    pub fn log(&self) -> &[LogMessage] {
        &self.log
    }

    /// Copy of this snapshot with `document`'s verdicts replaced.
    pub fn with_visibility(&self, document: &str, visibility: VisibilityMap) -> Predictions {
        let mut next = self.clone();
        let ids: Vec<SuggestionId> = next
            .groups(document)
            .iter()
            .flat_map(|g| g.iter().map(|s| s.id))
            .collect();
        let mut retained = VisibilityMap::new();
        for (id, verdict) in next.visibility.iter() {
            if !ids.contains(&id) {
                retained.insert(id, verdict);
            }
        }
        retained.extend(visibility);
        next.visibility = retained;
        next
    }
}

/// Assembles a [`Predictions`] snapshot.
///
/// ```
/// use tessera_recommend::{PredictionsBuilder, VisibilityMap};
///
/// let predictions = PredictionsBuilder::new("alice", 1)
///     .add_document("doc.txt", Vec::new(), VisibilityMap::new())
///     .build();
/// assert_eq!(predictions.generation(), 1);
/// ```
pub struct PredictionsBuilder {
    user: String,
    project_id: ProjectId,
    generation: u64,
    documents: BTreeMap<String, Vec<SuggestionGroup>>,
    visibility: VisibilityMap,
    log: Vec<LogMessage>,
    previous: Option<std::sync::Arc<Predictions>>,
}

impl PredictionsBuilder {
    pub fn new(user: impl Into<String>, project_id: ProjectId) -> Self {
        Self {
            user: user.into(),
            project_id,
            generation: 1,
            documents: BTreeMap::new(),
            visibility: VisibilityMap::new(),
            log: Vec::new(),
            previous: None,
        }
    }

    /// Carry over documents this run does not predict from `previous`, with
    /// each suggestion's age incremented.
    pub fn inherit_from(mut self, previous: std::sync::Arc<Predictions>) -> Self {
        self.generation = previous.generation + 1;
        self.previous = Some(previous);
        self
    }

    /// Results of this run for one document.
    pub fn add_document(
        mut self,
        document: impl Into<String>,
        groups: Vec<SuggestionGroup>,
        visibility: VisibilityMap,
    ) -> Self {
        self.documents.insert(document.into(), groups);
        self.visibility.extend(visibility);
        self
    }

    pub fn log(mut self, level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        self.log.push(LogMessage {
            level,
            source: source.into(),
            message: message.into(),
        });
        self
    }

    pub fn build(mut self) -> Predictions {
        if let Some(previous) = self.previous.take() {
            for (document, groups) in &previous.documents {
                if self.documents.contains_key(document) {
                    continue;
                }
                let aged: Vec<SuggestionGroup> = groups.iter().filter_map(age_group).collect();
                for suggestion in aged.iter().flat_map(|g| g.iter()) {
                    if previous.visibility.contains(suggestion.id) {
                        self.visibility
                            .insert(suggestion.id, previous.visibility.verdict(suggestion.id));
                    }
                }
                self.documents.insert(document.clone(), aged);
            }
        }

        Predictions {
            user: self.user,
            project_id: self.project_id,
            generation: self.generation,
            generated_at: Utc::now(),
            documents: self.documents,
            visibility: self.visibility,
            log: self.log,
        }
    }
}

/// Re-insert aged copies; insertion in display order keeps the order.
fn age_group(group: &SuggestionGroup) -> Option<SuggestionGroup> {
    let mut aged = SuggestionGroup::new(group.key().clone());
    for suggestion in group {
        aged.add(suggestion.aged()).ok()?;
    }
    Some(aged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::group_suggestions;
    use crate::visibility::HideReason;
    use std::sync::Arc;
    use tessera_core::Position;

    fn suggestion(id: SuggestionId, document: &str, begin: usize, confidence: f64) -> Suggestion {
        Suggestion::new(id, 1, document, Position::span(begin, begin + 3), "value", "PER", confidence)
    }

    fn visible(ids: &[SuggestionId]) -> VisibilityMap {
        let mut map = VisibilityMap::new();
        for id in ids {
            map.insert(*id, VisibilityVerdict::VISIBLE);
        }
        map
    }

    #[test]
    fn test_visible_suggestions_in_display_order() {
        let groups = group_suggestions(vec![
            suggestion(1, "a.txt", 10, 0.5),
            suggestion(2, "a.txt", 0, 0.4),
            suggestion(3, "a.txt", 0, 0.9),
        ]);
        let mut visibility = visible(&[1, 2, 3]);
        visibility.insert(2, VisibilityVerdict::hidden(HideReason::BelowThreshold));

        let predictions = PredictionsBuilder::new("alice", 1)
            .add_document("a.txt", groups, visibility)
            .build();

        let ids: Vec<SuggestionId> = predictions
            .visible_suggestions("a.txt")
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(predictions.suggestion_count(), 3);
        assert!(predictions.visible_suggestions("missing.txt").is_empty());
    }

    #[test]
    fn test_best_visible_skips_hidden() {
        let groups = group_suggestions(vec![
            suggestion(1, "a.txt", 0, 0.9),
            suggestion(2, "a.txt", 0, 0.4),
        ]);
        let mut visibility = visible(&[2]);
        visibility.insert(1, VisibilityVerdict::hidden(HideReason::Rejected));
        let predictions = PredictionsBuilder::new("alice", 1)
            .add_document("a.txt", groups, visibility)
            .build();

        let group = &predictions.groups("a.txt")[0];
        assert_eq!(predictions.best_visible(group).map(|s| s.id), Some(2));
    }

    #[test]
    fn test_inherit_ages_unpredicted_documents() {
        let first = Arc::new(
            PredictionsBuilder::new("alice", 1)
                .add_document("a.txt", group_suggestions(vec![suggestion(1, "a.txt", 0, 0.9)]), visible(&[1]))
                .add_document("b.txt", group_suggestions(vec![suggestion(2, "b.txt", 0, 0.8)]), visible(&[2]))
                .build(),
        );

        let second = PredictionsBuilder::new("alice", 1)
            .inherit_from(first.clone())
            .add_document("a.txt", group_suggestions(vec![suggestion(3, "a.txt", 0, 0.7)]), visible(&[3]))
            .build();

        assert_eq!(second.generation(), 2);
        assert_eq!(second.documents().collect::<Vec<_>>(), vec!["a.txt", "b.txt"]);
        assert!(second.suggestion(1).is_none());
        assert_eq!(second.suggestion(3).map(|s| s.age), Some(0));
        assert_eq!(second.suggestion(2).map(|s| s.age), Some(1));
        assert!(second.verdict(2).visible);
        // The previous snapshot is untouched.
        assert_eq!(first.suggestion(2).map(|s| s.age), Some(0));
    }

    #[test]
    fn test_with_visibility_replaces_document_verdicts() {
        let predictions = PredictionsBuilder::new("alice", 1)
            .add_document("a.txt", group_suggestions(vec![suggestion(1, "a.txt", 0, 0.9)]), visible(&[1]))
            .add_document("b.txt", group_suggestions(vec![suggestion(2, "b.txt", 0, 0.8)]), visible(&[2]))
            .build();

        let mut hidden = VisibilityMap::new();
        hidden.insert(1, VisibilityVerdict::hidden(HideReason::Overlapping));
        let updated = predictions.with_visibility("a.txt", hidden);

        assert!(!updated.verdict(1).visible);
        assert!(updated.verdict(2).visible);
        assert!(predictions.verdict(1).visible);
        assert_eq!(updated.generation(), predictions.generation());
    }

    #[test]
    fn test_log_messages() {
        let predictions = PredictionsBuilder::new("alice", 1)
            .log(LogLevel::Warn, "gazetteer", "recommender failed")
            .build();
        assert_eq!(predictions.log().len(), 1);
        assert_eq!(predictions.log()[0].level, LogLevel::Warn);
    }
}
