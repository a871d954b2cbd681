//! # tessera-core
//!
//! Core types, traits, and abstractions for tessera, the suggestion and
//! background-work backend of a collaborative annotation platform.
//!
//! This crate provides the data model shared by the scheduler and the
//! recommendation engine, and the traits behind which the external document
//! store, learning-record store, recommenders and indexers are plugged in.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod memory;
// Mock recommender and indexer for testing
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use memory::{InMemoryAnnotationStore, InMemoryLearningRecordStore};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
