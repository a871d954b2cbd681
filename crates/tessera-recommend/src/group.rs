//! Grouping of suggestions that compete for the same slot.
//!
//! All suggestions for one `(document, position, layer, feature)` form a
//! group. Within a group suggestions are kept in display order: confidence
//! descending, ties in insertion order.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{trace, warn};

use tessera_core::{Error, LayerId, Position, RecommenderId, Result, Suggestion, SuggestionId};

/// Slot shared by every member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupKey {
    pub document_name: String,
    pub position: Position,
    pub layer_id: LayerId,
    pub feature: String,
}

impl GroupKey {
    pub fn of(suggestion: &Suggestion) -> Self {
        Self {
            document_name: suggestion.document_name.clone(),
            position: suggestion.position,
            layer_id: suggestion.layer_id,
            feature: suggestion.feature.clone(),
        }
    }

    fn admits(&self, suggestion: &Suggestion) -> bool {
        self.document_name == suggestion.document_name
            && self.position == suggestion.position
            && self.layer_id == suggestion.layer_id
            && self.feature == suggestion.feature
    }
}

/// Append-only, confidence-ordered set of suggestions for one slot.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestionGroup {
    key: GroupKey,
    suggestions: Vec<Suggestion>,
}

impl SuggestionGroup {
    pub fn new(key: GroupKey) -> Self {
        Self {
            key,
            suggestions: Vec::new(),
        }
    }

    /// Start a group from its first suggestion.
    pub fn with_first(suggestion: Suggestion) -> Result<Self> {
        let mut group = Self::new(GroupKey::of(&suggestion));
        group.add(suggestion)?;
        Ok(group)
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn document_name(&self) -> &str {
        &self.key.document_name
    }

    pub fn position(&self) -> &Position {
        &self.key.position
    }

    /// Insert `suggestion` after every member with equal or higher
    /// confidence.
    ///
    /// Fails with [`Error::MalformedSuggestion`] if the suggestion is invalid
    /// or belongs to a different slot; the group is left unchanged.
    pub fn add(&mut self, suggestion: Suggestion) -> Result<()> {
        suggestion.validate()?;
        if !self.key.admits(&suggestion) {
            return Err(Error::MalformedSuggestion(format!(
                "suggestion {} at {} {} does not belong to group {} {}",
                suggestion.id,
                suggestion.document_name,
                suggestion.position,
                self.key.document_name,
                self.key.position
            )));
        }

        let index = self
            .suggestions
            .iter()
            .position(|existing| existing.confidence < suggestion.confidence)
            .unwrap_or(self.suggestions.len());
        self.suggestions.insert(index, suggestion);
        Ok(())
    }

    /// Members in display order.
    pub fn iter(&self) -> std::slice::Iter<'_, Suggestion> {
        self.suggestions.iter()
    }

    pub fn len(&self) -> usize {
        self.suggestions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suggestions.is_empty()
    }

    /// Highest-confidence member.
    pub fn best(&self) -> Option<&Suggestion> {
        self.suggestions.first()
    }

    pub fn get(&self, id: SuggestionId) -> Option<&Suggestion> {
        self.suggestions.iter().find(|s| s.id == id)
    }

    /// Distinct recommenders contributing to the group, ascending.
    pub fn recommender_ids(&self) -> Vec<RecommenderId> {
        let mut ids: Vec<RecommenderId> = self.suggestions.iter().map(|s| s.recommender_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Per recommender, how far its best suggestion leads its runner-up
    /// (`best - 0` for a single suggestion).
    pub fn top_deltas(&self) -> BTreeMap<RecommenderId, f64> {
        debug_assert!(
            self.suggestions.iter().all(|s| self.key.admits(s)),
            "group {:?} holds a suggestion for another slot",
            self.key
        );

        let mut ranked: BTreeMap<RecommenderId, (f64, Option<f64>)> = BTreeMap::new();
        for suggestion in &self.suggestions {
            ranked
                .entry(suggestion.recommender_id)
                .and_modify(|(_, second)| {
                    if second.is_none() {
                        *second = Some(suggestion.confidence);
                    }
                })
                .or_insert((suggestion.confidence, None));
        }

        ranked
            .into_iter()
            .map(|(id, (best, second))| (id, best - second.unwrap_or(0.0)))
            .collect()
    }
}

impl<'a> IntoIterator for &'a SuggestionGroup {
    type Item = &'a Suggestion;
    type IntoIter = std::slice::Iter<'a, Suggestion>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Bucket raw recommender output into groups.
///
/// Malformed suggestions are logged and dropped. Groups come back ordered by
/// document, then position, then layer and feature.
pub fn group_suggestions(suggestions: impl IntoIterator<Item = Suggestion>) -> Vec<SuggestionGroup> {
    let mut groups: BTreeMap<GroupKey, SuggestionGroup> = BTreeMap::new();
    let mut dropped = 0usize;

    for suggestion in suggestions {
        let key = GroupKey::of(&suggestion);
        let id = suggestion.id;
        let group = groups
            .entry(key.clone())
            .or_insert_with(|| SuggestionGroup::new(key));
        if let Err(e) = group.add(suggestion) {
            warn!(suggestion_id = id, error = %e, "Dropping malformed suggestion");
            dropped += 1;
        }
    }

    groups.retain(|_, group| !group.is_empty());
    trace!(group_count = groups.len(), dropped, "Grouped suggestions");
    groups.into_values().collect()
}
