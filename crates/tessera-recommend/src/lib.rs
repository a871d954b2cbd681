//! # tessera-recommend
//!
//! Suggestion handling for tessera.
//!
//! This crate provides:
//! - Grouping of competing suggestions in stable confidence order
//! - Visibility recalculation against committed annotations and user decisions
//! - Immutable prediction snapshots and a store that swaps them atomically
//! - Train, predict and visibility-refresh tasks for the scheduler
//!
//! ## Example
//!
//! ```ignore
//! use tessera_recommend::{PredictTask, PredictionStore, VisibilityConfig, VisibilityEngine};
//!
//! let engine = Arc::new(VisibilityEngine::new(VisibilityConfig::from_env(), annotations, records));
//! let store = Arc::new(PredictionStore::new());
//!
//! scheduler.submit(PredictTask::new(ctx, documents, recommenders, engine, store.clone()));
//!
//! if let Some(predictions) = store.get_current("alice", project_id) {
//!     for suggestion in predictions.visible_suggestions("doc.txt") {
//!         println!("{} {}", suggestion.position, suggestion.ui_label);
//!     }
//! }
//! ```

pub mod group;
pub mod predictions;
pub mod store;
pub mod tasks;
pub mod visibility;

pub use group::{group_suggestions, GroupKey, SuggestionGroup};
pub use predictions::{LogLevel, LogMessage, Predictions, PredictionsBuilder};
pub use store::PredictionStore;
pub use tasks::{PredictTask, RefreshVisibilityTask, TrainTask};
pub use visibility::{
    recalculate, HideReason, VisibilityConfig, VisibilityEngine, VisibilityMap, VisibilityVerdict,
};
