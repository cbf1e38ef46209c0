//! Error types for the lane scheduler.

use lane_broker::ConnectionError;

use crate::codec::CodecError;
use crate::lane::Lane;

/// Errors returned by [`LaneScheduler`](crate::LaneScheduler) operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A connection of one lane failed
    #[error("Connection error on {lane} lane: {source}")]
    Connection {
        lane: Lane,
        #[source]
        source: ConnectionError,
    },

    /// An offset commit failed. The scheduler has shut down and cannot be reused.
    #[error("Offset commit failed on {lane} lane, scheduler stopped: {source}")]
    CommitFailed {
        lane: Lane,
        #[source]
        source: ConnectionError,
    },

    /// The outbound connection could not be opened
    #[error("Failed to open producer connection: {0}")]
    ProducerConnection(#[source] ConnectionError),

    /// Sending on the outbound connection failed
    #[error("Failed to publish to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: ConnectionError,
    },

    /// A payload could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Background heartbeat requested without a configured interval
    #[error("No background heartbeat interval configured for this scheduler")]
    HeartbeatNotConfigured,

    /// The background heartbeat thread could not be started
    #[error("Failed to start background heartbeat: {0}")]
    HeartbeatWorker(String),

    /// The scheduler was stopped, explicitly or after a commit failure
    #[error("Scheduler has been stopped")]
    Stopped,

    /// A callback called back into an operation that needs the scheduler lock
    #[error("Scheduler operation called from inside one of its callbacks")]
    Reentrant,

    /// A thread panicked while holding a scheduler lock
    #[error("Scheduler lock poisoned")]
    LockPoisoned,
}

impl SchedulerError {
    /// Whether the scheduler is unusable after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerError::CommitFailed { .. } | SchedulerError::Stopped
        )
    }
}

/// Convenience type alias for Results using SchedulerError.
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_error_display() {
        let error = SchedulerError::Connection {
            lane: Lane::Priority,
            source: ConnectionError::Poll("broker down".to_string()),
        };
        assert_eq!(
            error.to_string(),
            "Connection error on PRIORITY lane: Poll failed: broker down"
        );

        let error = SchedulerError::CommitFailed {
            lane: Lane::Normal,
            source: ConnectionError::CommitFailed("rebalance".to_string()),
        };
        assert!(error.to_string().contains("NORMAL lane"));
        assert!(error.to_string().contains("scheduler stopped"));

        let error = SchedulerError::Publish {
            topic: "orders-ERROR".to_string(),
            source: ConnectionError::Closed,
        };
        assert_eq!(
            error.to_string(),
            "Failed to publish to orders-ERROR: Connection is closed"
        );

        assert_eq!(SchedulerError::Stopped.to_string(), "Scheduler has been stopped");
        assert_eq!(
            SchedulerError::ProducerConnection(ConnectionError::Client("no brokers".to_string()))
                .to_string(),
            "Failed to open producer connection: Client error: no brokers"
        );
    }

    #[test]
    fn test_terminal_errors() {
        assert!(SchedulerError::Stopped.is_terminal());
        assert!(SchedulerError::CommitFailed {
            lane: Lane::Error,
            source: ConnectionError::CommitFailed("x".to_string()),
        }
        .is_terminal());
        assert!(!SchedulerError::HeartbeatNotConfigured.is_terminal());
        assert!(!SchedulerError::Configuration("x".to_string()).is_terminal());
    }
}
