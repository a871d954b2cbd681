//! Mock recommenders and indexers for deterministic testing.
//!
//! ## Usage
//!
//! ```rust
//! use tessera_core::mock::MockRecommender;
//! use tessera_core::{Position, Suggestion};
//!
//! let recommender = MockRecommender::new(1, "gazetteer").with_suggestion(Suggestion::new(
//!     1, 1, "doc.txt", Position::span(0, 5), "value", "PER", 0.8,
//! ));
//! assert_eq!(recommender.predict_call_count(), 0);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::{Indexer, Recommender, RecommenderContext};

/// A logged call against a mock.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub operation: String,
    pub document: Option<String>,
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct MockConfig {
    suggestions: HashMap<String, Vec<Suggestion>>,
    latency: Duration,
    fail_predict: bool,
    fail_train: bool,
}

/// Recommender returning scripted suggestions per document.
#[derive(Clone)]
pub struct MockRecommender {
    id: RecommenderId,
    name: String,
    config: Arc<MockConfig>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
}

impl MockRecommender {
    pub fn new(id: RecommenderId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            config: Arc::new(MockConfig::default()),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a suggestion returned for its document.
    pub fn with_suggestion(mut self, suggestion: Suggestion) -> Self {
        Arc::make_mut(&mut self.config)
            .suggestions
            .entry(suggestion.document_name.clone())
            .or_default()
            .push(suggestion);
        self
    }

    /// Set simulated latency for predict and train.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        Arc::make_mut(&mut self.config).latency = latency;
        self
    }

    /// Make every predict call fail.
    pub fn failing_predict(mut self) -> Self {
        Arc::make_mut(&mut self.config).fail_predict = true;
        self
    }

    /// Make every train call fail.
    pub fn failing_train(mut self) -> Self {
        Arc::make_mut(&mut self.config).fail_train = true;
        self
    }

    /// Get all logged calls for assertion.
    pub fn get_calls(&self) -> Vec<MockCall> {
        self.call_log.lock().unwrap().clone()
    }

    pub fn predict_call_count(&self) -> usize {
        self.count("predict")
    }

    pub fn train_call_count(&self) -> usize {
        self.count("train")
    }

    fn count(&self, operation: &str) -> usize {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn log_call(&self, operation: &str, document: Option<&DocumentSnapshot>) {
        self.call_log.lock().unwrap().push(MockCall {
            operation: operation.to_string(),
            document: document.map(|d| d.document_name.clone()),
            version: document.map(|d| d.version),
        });
    }

    async fn simulate_latency(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }
}

#[async_trait]
impl Recommender for MockRecommender {
    fn id(&self) -> RecommenderId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(
        &self,
        _ctx: &RecommenderContext,
        document: &DocumentSnapshot,
    ) -> Result<Vec<Suggestion>> {
        self.log_call("predict", Some(document));
        self.simulate_latency().await;

        if self.config.fail_predict {
            return Err(Error::TaskExecution(format!(
                "{} failed to predict {}",
                self.name, document.document_name
            )));
        }

        Ok(self
            .config
            .suggestions
            .get(&document.document_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn train(&self, _ctx: &RecommenderContext, _documents: &[DocumentSnapshot]) -> Result<()> {
        self.log_call("train", None);
        self.simulate_latency().await;

        if self.config.fail_train {
            return Err(Error::TaskExecution(format!("{} failed to train", self.name)));
        }
        Ok(())
    }
}

/// Indexer that records what it was asked to index.
#[derive(Clone, Default)]
pub struct RecordingIndexer {
    call_log: Arc<Mutex<Vec<MockCall>>>,
    latency: Duration,
    fail: bool,
}

impl RecordingIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.call_log.lock().unwrap().clone()
    }

    /// Versions indexed for `document_name`, in call order.
    pub fn indexed_versions(&self, document_name: &str) -> Vec<u64> {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.operation == "index_document")
            .filter(|c| c.document.as_deref() == Some(document_name))
            .filter_map(|c| c.version)
            .collect()
    }

    async fn run(&self, call: MockCall) -> Result<()> {
        self.call_log.lock().unwrap().push(call);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail {
            return Err(Error::TaskExecution("index unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Indexer for RecordingIndexer {
    async fn index_document(&self, document: &DocumentSnapshot) -> Result<()> {
        self.run(MockCall {
            operation: "index_document".to_string(),
            document: Some(document.document_name.clone()),
            version: Some(document.version),
        })
        .await
    }

    async fn reindex_project(&self, project_id: ProjectId) -> Result<()> {
        self.run(MockCall {
            operation: "reindex_project".to_string(),
            document: None,
            version: Some(project_id as u64),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_recommender_returns_scripted_suggestions() {
        let recommender = MockRecommender::new(1, "gazetteer")
            .with_suggestion(Suggestion::new(1, 1, "a.txt", Position::span(0, 3), "v", "PER", 0.7))
            .with_suggestion(Suggestion::new(2, 1, "b.txt", Position::span(0, 3), "v", "ORG", 0.4));

        let ctx = RecommenderContext::new("alice", 1);
        let doc = DocumentSnapshot::new(1, 1, "a.txt", 3, "abc");
        let out = recommender.predict(&ctx, &doc).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "PER");
        assert_eq!(recommender.predict_call_count(), 1);
        assert_eq!(recommender.get_calls()[0].version, Some(3));
    }

    #[tokio::test]
    async fn test_mock_recommender_failure() {
        let recommender = MockRecommender::new(1, "broken").failing_predict();
        let ctx = RecommenderContext::new("alice", 1);
        let doc = DocumentSnapshot::new(1, 1, "a.txt", 1, "abc");
        assert!(matches!(
            recommender.predict(&ctx, &doc).await,
            Err(Error::TaskExecution(_))
        ));
    }

    #[tokio::test]
    async fn test_recording_indexer_versions() {
        let indexer = RecordingIndexer::new();
        indexer
            .index_document(&DocumentSnapshot::new(1, 7, "doc7", 2, "x"))
            .await
            .unwrap();
        indexer.reindex_project(1).await.unwrap();

        assert_eq!(indexer.indexed_versions("doc7"), vec![2]);
        assert_eq!(indexer.get_calls().len(), 2);
    }
}
