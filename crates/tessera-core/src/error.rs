//! Error types for tessera.

use thiserror::Error;

/// Result type alias using tessera's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tessera operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An external collaborator (recommender, indexer) failed while a task ran
    #[error("Task execution error: {0}")]
    TaskExecution(String),

    /// A suggestion violated a group invariant and was dropped
    #[error("Malformed suggestion: {0}")]
    MalformedSuggestion(String),

    /// The document or learning-record store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The scheduler no longer accepts work
    #[error("Scheduler is shut down")]
    SchedulerShutdown,

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_task_execution() {
        let err = Error::TaskExecution("recommender timed out".to_string());
        assert_eq!(err.to_string(), "Task execution error: recommender timed out");
    }

    #[test]
    fn test_error_display_malformed_suggestion() {
        let err = Error::MalformedSuggestion("confidence out of range".to_string());
        assert_eq!(
            err.to_string(),
            "Malformed suggestion: confidence out of range"
        );
    }

    #[test]
    fn test_error_display_store_unavailable() {
        let err = Error::StoreUnavailable("annotation store".to_string());
        assert_eq!(err.to_string(), "Store unavailable: annotation store");
    }

    #[test]
    fn test_error_display_scheduler_shutdown() {
        assert_eq!(Error::SchedulerShutdown.to_string(), "Scheduler is shut down");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("worker pool must not be empty".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: worker pool must not be empty"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number");
        assert!(json_err.is_err());

        let err: Error = json_err.unwrap_err().into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn test_error_debug_format() {
        let err = Error::NotFound("document 7".to_string());
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("NotFound"));
    }
}
