//! In-memory implementations of the store traits.
//!
//! Used when tessera runs standalone and as test doubles. Both stores can be
//! switched to "unavailable" to exercise the store-outage path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::trace;

use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::{AnnotationStore, LearningRecordStore};

/// Annotations keyed by `(document_name, user)`.
#[derive(Default)]
pub struct InMemoryAnnotationStore {
    annotations: RwLock<HashMap<(String, String), Vec<Annotation>>>,
    unavailable: AtomicBool,
}

impl InMemoryAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit an annotation for `user`.
    pub fn add(&self, user: &str, annotation: Annotation) {
        let key = (annotation.document_name.clone(), user.to_string());
        self.annotations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .push(annotation);
    }

    /// Remove every annotation of `user` in `document_name` at `position`.
    /// Returns the number of removed annotations.
    pub fn remove_at(&self, document_name: &str, user: &str, position: &Position) -> usize {
        let key = (document_name.to_string(), user.to_string());
        let mut annotations = self.annotations.write().unwrap_or_else(PoisonError::into_inner);
        match annotations.get_mut(&key) {
            Some(list) => {
                let before = list.len();
                list.retain(|a| a.position != *position);
                before - list.len()
            }
            None => 0,
        }
    }

    /// Simulate an outage of the backing store.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl AnnotationStore for InMemoryAnnotationStore {
    async fn current_annotations(
        &self,
        document_name: &str,
        user: &str,
    ) -> Result<Vec<Annotation>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("annotation store offline".into()));
        }
        let annotations = self.annotations.read().unwrap_or_else(PoisonError::into_inner);
        let found = annotations
            .get(&(document_name.to_string(), user.to_string()))
            .cloned()
            .unwrap_or_default();
        trace!(document_name, user, count = found.len(), "Loaded annotations");
        Ok(found)
    }
}

/// Learning records in insertion order.
#[derive(Default)]
pub struct InMemoryLearningRecordStore {
    records: RwLock<Vec<LearningRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryLearningRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate an outage of the backing store.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("learning record store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LearningRecordStore for InMemoryLearningRecordStore {
    async fn list_records(
        &self,
        user: &str,
        project_id: ProjectId,
        layer_id: Option<LayerId>,
    ) -> Result<Vec<LearningRecord>> {
        self.check_available()?;
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .filter(|r| r.user == user && r.project_id == project_id)
            .filter(|r| layer_id.map_or(true, |layer| r.layer_id == layer))
            .cloned()
            .collect())
    }

    async fn append(&self, batch: Vec<LearningRecord>) -> Result<()> {
        self.check_available()?;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(batch);
        Ok(())
    }
}
