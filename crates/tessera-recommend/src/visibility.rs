//! Visibility of suggestions for one user.
//!
//! Visibility is never stored on a suggestion. A recalculation produces a
//! fresh [`VisibilityMap`] from the user's committed annotations, their
//! learning records and the current groups, so the same inputs always give
//! the same map and removing an annotation restores what it hid.
//!
//! When several reasons apply to one suggestion the strongest wins:
//! `Rejected > Skipped > Overlapping > BelowThreshold`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use tessera_core::defaults;
use tessera_core::{
    Annotation, AnnotationStore, LayerId, LearningRecord, LearningRecordStore, Position, ProjectId,
    Span, Suggestion, SuggestionId, UserAction,
};

use crate::group::SuggestionGroup;

/// Why a suggestion is hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HideReason {
    /// A committed annotation already covers the slot.
    Overlapping,
    /// The user rejected this label here before.
    Rejected,
    /// The user skipped this label here before.
    Skipped,
    /// Outranked within its group, or below the minimum confidence.
    BelowThreshold,
    /// Could not be evaluated (other document, store outage, unknown id).
    Unresolved,
}

impl HideReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HideReason::Overlapping => "overlapping",
            HideReason::Rejected => "rejected",
            HideReason::Skipped => "skipped",
            HideReason::BelowThreshold => "below_threshold",
            HideReason::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for HideReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a recalculation for one suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityVerdict {
    pub visible: bool,
    pub reason: Option<HideReason>,
}

impl VisibilityVerdict {
    pub const VISIBLE: Self = Self {
        visible: true,
        reason: None,
    };

    pub fn hidden(reason: HideReason) -> Self {
        Self {
            visible: false,
            reason: Some(reason),
        }
    }
}

/// Side table `SuggestionId → VisibilityVerdict`.
///
/// Suggestions outside the recalculated window have no entry; looking them
/// up yields a hidden `Unresolved` verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VisibilityMap {
    verdicts: HashMap<SuggestionId, VisibilityVerdict>,
}

impl VisibilityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SuggestionId, verdict: VisibilityVerdict) {
        self.verdicts.insert(id, verdict);
    }

    /// Verdict for `id`; unknown ids are hidden as `Unresolved`.
    pub fn verdict(&self, id: SuggestionId) -> VisibilityVerdict {
        self.verdicts
            .get(&id)
            .copied()
            .unwrap_or(VisibilityVerdict::hidden(HideReason::Unresolved))
    }

    pub fn contains(&self, id: SuggestionId) -> bool {
        self.verdicts.contains_key(&id)
    }

    pub fn is_visible(&self, id: SuggestionId) -> bool {
        self.verdict(id).visible
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    pub fn visible_count(&self) -> usize {
        self.verdicts.values().filter(|v| v.visible).count()
    }

    /// Number of suggestions hidden for `reason`.
    pub fn hidden_count(&self, reason: HideReason) -> usize {
        self.verdicts
            .values()
            .filter(|v| v.reason == Some(reason))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SuggestionId, VisibilityVerdict)> + '_ {
        self.verdicts.iter().map(|(id, v)| (*id, *v))
    }

    /// Merge the verdicts of another recalculation, replacing overlaps.
    pub fn extend(&mut self, other: VisibilityMap) {
        self.verdicts.extend(other.verdicts);
    }
}

/// Visibility configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    /// Visible suggestions per group.
    pub max_suggestions: usize,
    /// Suggestions below this confidence are never shown.
    pub min_confidence: f64,
    /// Per-user override of `max_suggestions`.
    pub user_limits: HashMap<String, usize>,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            max_suggestions: defaults::MAX_SUGGESTIONS_PER_USER,
            min_confidence: defaults::SUGGESTION_MIN_CONFIDENCE,
            user_limits: HashMap::new(),
        }
    }
}

impl VisibilityConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// - `MAX_SUGGESTIONS_PER_USER` (default: 3)
    /// - `SUGGESTION_MIN_CONFIDENCE` (default: 0.0)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_suggestions = std::env::var("MAX_SUGGESTIONS_PER_USER")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.max_suggestions);

        let min_confidence = std::env::var("SUGGESTION_MIN_CONFIDENCE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| (0.0..=1.0).contains(v))
            .unwrap_or(defaults.min_confidence);

        Self {
            max_suggestions,
            min_confidence,
            user_limits: HashMap::new(),
        }
    }

    pub fn with_max_suggestions(mut self, max: usize) -> Self {
        self.max_suggestions = max;
        self
    }

    pub fn with_min_confidence(mut self, min: f64) -> Self {
        self.min_confidence = min;
        self
    }

    /// Override the per-group limit for one user.
    pub fn with_user_limit(mut self, user: impl Into<String>, max: usize) -> Self {
        self.user_limits.insert(user.into(), max);
        self
    }

    pub fn max_suggestions_for(&self, user: &str) -> usize {
        self.user_limits
            .get(user)
            .copied()
            .unwrap_or(self.max_suggestions)
    }
}

/// Rejections and skips indexed by the exact slot and label they refer to.
#[derive(Default)]
struct Decisions<'a> {
    by_slot: HashMap<(&'a str, LayerId, &'a str, Position, &'a str), (bool, bool)>,
}

impl<'a> Decisions<'a> {
    fn index(user: &str, records: &'a [LearningRecord]) -> Self {
        let mut decisions = Self::default();
        for record in records.iter().filter(|r| r.user == user) {
            let (rejected, skipped) = match record.action {
                UserAction::Rejected => (true, false),
                UserAction::Skipped => (false, true),
                UserAction::Accepted | UserAction::Corrected => continue,
            };
            let entry = decisions
                .by_slot
                .entry((
                    record.document_name.as_str(),
                    record.layer_id,
                    record.feature.as_str(),
                    record.position,
                    record.label.as_str(),
                ))
                .or_default();
            entry.0 |= rejected;
            entry.1 |= skipped;
        }
        decisions
    }

    fn reason(&self, suggestion: &Suggestion) -> Option<HideReason> {
        let key = (
            suggestion.document_name.as_str(),
            suggestion.layer_id,
            suggestion.feature.as_str(),
            suggestion.position,
            suggestion.label.as_str(),
        );
        match self.by_slot.get(&key) {
            Some((true, _)) => Some(HideReason::Rejected),
            Some((false, true)) => Some(HideReason::Skipped),
            _ => None,
        }
    }
}

/// Compute visibility of every suggestion of `document` inside
/// `[window_begin, window_end]`.
///
/// Pure: the result depends only on the arguments.
#[allow(clippy::too_many_arguments)]
pub fn recalculate(
    config: &VisibilityConfig,
    user: &str,
    document: &str,
    annotations: &[Annotation],
    records: &[LearningRecord],
    groups: &[SuggestionGroup],
    window_begin: usize,
    window_end: usize,
) -> VisibilityMap {
    let mut map = VisibilityMap::new();
    if window_begin > window_end {
        warn!(window_begin, window_end, "Inverted visibility window, nothing recalculated");
        return map;
    }
    let window = Span::new(window_begin, window_end);
    let decisions = Decisions::index(user, records);
    let limit = config.max_suggestions_for(user);

    for group in groups {
        if group.document_name() != document {
            warn!(
                document,
                group_document = group.document_name(),
                count = group.len(),
                "Suggestions reference another document"
            );
            for suggestion in group {
                map.insert(suggestion.id, VisibilityVerdict::hidden(HideReason::Unresolved));
            }
            continue;
        }
        if !group.position().intersects(&window) {
            continue;
        }

        let mut shown = 0usize;
        for suggestion in group {
            let reason = decisions
                .reason(suggestion)
                .or_else(|| {
                    annotations
                        .iter()
                        .any(|a| suggestion.overlaps_annotation(a))
                        .then_some(HideReason::Overlapping)
                })
                .or_else(|| {
                    (suggestion.confidence + defaults::CONFIDENCE_EPSILON < config.min_confidence)
                        .then_some(HideReason::BelowThreshold)
                })
                .or_else(|| (shown >= limit).then_some(HideReason::BelowThreshold));

            let verdict = match reason {
                Some(reason) => VisibilityVerdict::hidden(reason),
                None => {
                    shown += 1;
                    VisibilityVerdict::VISIBLE
                }
            };
            trace!(suggestion_id = suggestion.id, ?verdict, "Visibility decided");
            map.insert(suggestion.id, verdict);
        }
    }

    map
}

/// Hide every in-window suggestion of `document` as `Unresolved`.
fn unresolved(groups: &[SuggestionGroup], document: &str, window: Span) -> VisibilityMap {
    let mut map = VisibilityMap::new();
    for group in groups
        .iter()
        .filter(|g| g.document_name() != document || g.position().intersects(&window))
    {
        for suggestion in group {
            map.insert(suggestion.id, VisibilityVerdict::hidden(HideReason::Unresolved));
        }
    }
    map
}

/// Recalculates visibility against the live stores.
pub struct VisibilityEngine {
    config: VisibilityConfig,
    annotations: Arc<dyn AnnotationStore>,
    records: Arc<dyn LearningRecordStore>,
}

impl VisibilityEngine {
    pub fn new(
        config: VisibilityConfig,
        annotations: Arc<dyn AnnotationStore>,
        records: Arc<dyn LearningRecordStore>,
    ) -> Self {
        Self {
            config,
            annotations,
            records,
        }
    }

    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }

    /// [`recalculate`] with this engine's configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn recalculate(
        &self,
        user: &str,
        document: &str,
        annotations: &[Annotation],
        records: &[LearningRecord],
        groups: &[SuggestionGroup],
        window_begin: usize,
        window_end: usize,
    ) -> VisibilityMap {
        recalculate(
            &self.config,
            user,
            document,
            annotations,
            records,
            groups,
            window_begin,
            window_end,
        )
    }

    /// Load the user's annotations and records and recalculate.
    ///
    /// If either store is unreachable the affected suggestions are hidden as
    /// `Unresolved`; the next refresh retries.
    #[instrument(skip(self, groups), fields(subsystem = "visibility", group_count = groups.len()))]
    pub async fn refresh(
        &self,
        user: &str,
        project_id: ProjectId,
        document: &str,
        groups: &[SuggestionGroup],
        window_begin: usize,
        window_end: usize,
    ) -> VisibilityMap {
        let loaded = futures::try_join!(
            self.annotations.current_annotations(document, user),
            self.records.list_records(user, project_id, None),
        );

        match loaded {
            Ok((annotations, records)) => {
                let map = self.recalculate(
                    user,
                    document,
                    &annotations,
                    &records,
                    groups,
                    window_begin,
                    window_end,
                );
                debug!(
                    visible = map.visible_count(),
                    hidden = map.len() - map.visible_count(),
                    "Visibility recalculated"
                );
                map
            }
            Err(e) => {
                warn!(error = %e, "Store unavailable, hiding suggestions as unresolved");
                unresolved(groups, document, Span::new(window_begin, window_end))
            }
        }
    }
}
