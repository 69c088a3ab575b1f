//! Error types for tasksync.

use thiserror::Error;

/// Result type alias using tasksync's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tasksync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Scheduled job not found
    #[error("Scheduled job not found: {0}")]
    JobNotFound(String),

    /// Envelope failed validation (missing user, malformed payload)
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Publish to the event bus failed
    #[error("Publish error: {0}")]
    Publish(String),

    /// Scheduler operation failed
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("test resource".to_string());
        assert_eq!(err.to_string(), "Not found: test resource");
    }

    #[test]
    fn test_error_display_job_not_found() {
        let err = Error::JobNotFound("reminder:42".to_string());
        assert_eq!(err.to_string(), "Scheduled job not found: reminder:42");
    }

    #[test]
    fn test_error_display_invalid_envelope() {
        let err = Error::InvalidEnvelope("missing user_id".to_string());
        assert_eq!(err.to_string(), "Invalid envelope: missing user_id");
    }

    #[test]
    fn test_error_display_publish() {
        let err = Error::Publish("broker unavailable".to_string());
        assert_eq!(err.to_string(), "Publish error: broker unavailable");
    }

    #[test]
    fn test_error_display_scheduler() {
        let err = Error::Scheduler("claim failed".to_string());
        assert_eq!(err.to_string(), "Scheduler error: claim failed");
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing DATABASE_URL".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing DATABASE_URL");
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
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn test_result_type_ok() {
        fn get_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(get_result().unwrap(), 42);
    }
}
