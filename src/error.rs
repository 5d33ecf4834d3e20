//! Error types for mpwork.

use thiserror::Error;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Work item callback panicked: {message}")]
    WorkerPanicked { message: String },

    #[error("Interrupted while waiting for the work queue to drain")]
    Interrupted,

    #[error("Queue accounting error: {0}")]
    Queue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// The only error a work item callback may return to signal an anticipated failure.
///
/// The item is still accounted for in the drain, but it is left out of the returned items.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_precondition_error_message() {
        let err = PoolError::Precondition("Must supply work items".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Precondition"));
        assert!(msg.contains("Must supply work items"));
    }

    #[test]
    fn test_worker_panicked_message() {
        let err = PoolError::WorkerPanicked {
            message: "index out of bounds".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("panicked"));
        assert!(msg.contains("index out of bounds"));
    }

    #[test]
    fn test_interrupted_message() {
        let msg = PoolError::Interrupted.to_string();
        assert!(msg.contains("Interrupted"));
        assert!(msg.contains("drain"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PoolError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let err: PoolError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_callback_error_passthrough() {
        let err = CallbackError::new("device offline");
        assert_eq!(err.to_string(), "device offline");
        assert_eq!(err.message(), "device offline");

        let from_str: CallbackError = "timeout".into();
        assert_eq!(from_str, CallbackError::new("timeout"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(PoolError::Interrupted)
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
