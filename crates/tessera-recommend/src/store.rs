//! Current prediction snapshot per user and project.
//!
//! Readers get an `Arc` to a complete snapshot and keep it as long as they
//! like; publishing swaps the pointer under a short write lock, so a reader
//! never observes a partially updated snapshot.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use tessera_core::ProjectId;

use crate::predictions::Predictions;

type StoreKey = (String, ProjectId);

/// Latest published [`Predictions`] for every `(user, project)`.
#[derive(Default)]
pub struct PredictionStore {
    current: RwLock<HashMap<StoreKey, Arc<Predictions>>>,
}

impl PredictionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_current(&self, user: &str, project_id: ProjectId) -> Option<Arc<Predictions>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(user.to_string(), project_id))
            .cloned()
    }

    /// Make `predictions` the current snapshot of its user and project.
    /// Returns the snapshot it replaced.
    pub fn publish(&self, predictions: Predictions) -> Option<Arc<Predictions>> {
        let key = (predictions.user().to_string(), predictions.project_id());
        let generation = predictions.generation();
        let suggestions = predictions.suggestion_count();
        let visible = predictions.visibility().visible_count();

        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), Arc::new(predictions));

        info!(
            user = %key.0,
            project_id = key.1,
            generation,
            suggestion_count = suggestions,
            visible,
            "Predictions published"
        );
        previous
    }

    /// Publish `next` only if `expected` is still current. Returns false and
    /// drops `next` if another snapshot was published in the meantime.
    pub fn replace_if_current(&self, expected: &Arc<Predictions>, next: Predictions) -> bool {
        let key = (next.user().to_string(), next.project_id());
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let unchanged = current
            .get(&key)
            .is_some_and(|existing| Arc::ptr_eq(existing, expected));
        if unchanged {
            current.insert(key, Arc::new(next));
        } else {
            debug!(user = %key.0, project_id = key.1, "Snapshot changed, update discarded");
        }
        unchanged
    }

    /// Publish `next` only if the current snapshot is still `expected`
    /// (`None`: nothing published yet). On a conflict `next` is handed back
    /// so the caller can rebuild it on top of the newer snapshot.
    pub fn publish_if_current(
        &self,
        expected: Option<&Arc<Predictions>>,
        next: Predictions,
    ) -> std::result::Result<Option<Arc<Predictions>>, Predictions> {
        let key = (next.user().to_string(), next.project_id());
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let unchanged = match (current.get(&key), expected) {
            (None, None) => true,
            (Some(existing), Some(expected)) => Arc::ptr_eq(existing, expected),
            _ => false,
        };
        if !unchanged {
            return Err(next);
        }

        let generation = next.generation();
        let suggestions = next.suggestion_count();
        let visible = next.visibility().visible_count();
        let previous = current.insert(key.clone(), Arc::new(next));
        drop(current);

        info!(
            user = %key.0,
            project_id = key.1,
            generation,
            suggestion_count = suggestions,
            visible,
            "Predictions published"
        );
        Ok(previous)
    }

    /// Forget the snapshot of one user in one project.
    pub fn clear(&self, user: &str, project_id: ProjectId) -> Option<Arc<Predictions>> {
        let removed = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(user.to_string(), project_id));
        if removed.is_some() {
            debug!(user, project_id, "Predictions cleared");
        }
        removed
    }

    /// Forget every snapshot of a project. Returns how many were removed.
    pub fn clear_project(&self, project_id: ProjectId) -> usize {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let before = current.len();
        current.retain(|(_, project), _| *project != project_id);
        let removed = before - current.len();
        debug!(project_id, removed, "Project predictions cleared");
        removed
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
