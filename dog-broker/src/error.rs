use thiserror::Error;

use crate::transport::TransportError;

/// Result type for broker operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by brokers, queues, iterators and acknowledgers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Publish attempted with a zero-length payload
    #[error("invalid empty job")]
    EmptyJob,

    #[error("failed to declare queue {queue}: {reason}")]
    Declaration { queue: String, reason: String },

    #[error("connection error: {0}")]
    Connection(String),

    /// Operation attempted after the owning broker, queue or iterator was closed
    #[error("already closed")]
    Closed,

    /// Commit or rollback of a transactional channel failed
    #[error("transaction {op} failed: {reason}")]
    Transaction { op: &'static str, reason: String },

    /// The delivery stream is exhausted after the iterator was closed
    #[error("job iterator closed")]
    IteratorClosed,

    #[error("nested transactions are not supported")]
    NestedTransaction,

    /// Ack/reject called on a job that was never delivered by a consumer
    #[error("job was not delivered by a consumer and cannot be acknowledged")]
    NotDelivered,

    #[error("transport {op} failed: {reason}")]
    Transport { op: &'static str, reason: String },

    #[error("unsupported broker url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Wrap a transport failure with the name of the operation that produced it
    pub fn transport(op: &'static str, err: TransportError) -> Self {
        Self::Transport {
            op,
            reason: err.to_string(),
        }
    }

    pub fn declaration(queue: impl Into<String>, err: TransportError) -> Self {
        Self::Declaration {
            queue: queue.into(),
            reason: err.to_string(),
        }
    }

    pub fn transaction(op: &'static str, err: TransportError) -> Self {
        Self::Transaction {
            op,
            reason: err.to_string(),
        }
    }

    /// Check if this error means the handle can no longer be used
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::IteratorClosed)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
