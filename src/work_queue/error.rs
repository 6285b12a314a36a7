//! Work queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkQueueError {
    #[error("Cannot send jobs of type '{0}'")]
    InvalidJobType(String),
    #[error("Malformed job payload: {0}")]
    MalformedPayload(String),
    #[error("Received {0} messages in one poll; expected at most one")]
    ProtocolViolation(usize),
    #[error("Job has already been deleted")]
    DoubleDelete,
    #[error("Job cannot be re-sent before it has been deleted")]
    NotDeleted,
    #[error("Job has already been settled")]
    AlreadySettled,
    #[error("Unknown receipt handle: {0}")]
    UnknownReceipt(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for WorkQueueError {
    fn from(e: rusqlite::Error) -> Self {
        WorkQueueError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for WorkQueueError {
    fn from(e: serde_json::Error) -> Self {
        WorkQueueError::MalformedPayload(e.to_string())
    }
}
