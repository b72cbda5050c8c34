use thiserror::Error;

use crate::core::message::MessageId;

/// Failure raised by the durable message store.
#[derive(Debug, Error)]
#[error("store failure: {reason}")]
pub struct StoreError {
    pub reason: String,
}

impl StoreError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure raised by a pending cursor append.
///
/// Transient failures are worth retrying; fatal ones mean the entry is lost
/// to that cursor.
#[derive(Debug, Error)]
pub enum CursorError {
    #[error("transient cursor failure: {0}")]
    Transient(String),
    #[error("fatal cursor failure: {0}")]
    Fatal(String),
}

/// Errors surfaced by the queue's producer-facing and administrative
/// operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The usage accountant is full and the send was configured to fail
    /// fast instead of blocking.
    #[error("memory limit reached on queue {0}")]
    ResourceExhausted(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cursor(#[from] CursorError),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("failed to load the body of message {0}")]
    LoadFailure(MessageId),
}
