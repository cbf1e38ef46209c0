//! Error types for broker connections.

/// Errors raised by a broker connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// A blocking poll was interrupted through the connection's [`Waker`](crate::Waker)
    #[error("Poll interrupted by wakeup")]
    Interrupted,

    /// A synchronous offset commit was rejected
    #[error("Offset commit failed: {0}")]
    CommitFailed(String),

    /// Fetching records failed
    #[error("Poll failed: {0}")]
    Poll(String),

    /// Sending a record failed
    #[error("Send failed: {0}")]
    Send(String),

    /// Updating the subscription failed
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// A pause, resume or seek over a partition set failed
    #[error("Partition operation failed: {0}")]
    Partition(String),

    /// The connection has been closed
    #[error("Connection is closed")]
    Closed,

    /// Any other failure reported by the underlying client
    #[error("Client error: {0}")]
    Client(String),
}

impl ConnectionError {
    /// Whether this error only signals that a poll ended early.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ConnectionError::Interrupted)
    }
}

/// Convenience type alias for Results using ConnectionError.
pub type Result<T> = std::result::Result<T, ConnectionError>;
