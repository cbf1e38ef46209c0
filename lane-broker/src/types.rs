//! Value types exchanged with broker connections.

use std::fmt;
use std::sync::Arc;

/// A single partition of a topic.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition index within the topic
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic partition.
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// A record received from a consumer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The physical topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: i32,
    /// Offset of the record within its partition
    pub offset: i64,
    /// Optional record key
    pub key: Option<Vec<u8>>,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl Record {
    /// The partition this record belongs to.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Thread-safe handle that interrupts a connection's blocking poll.
///
/// A waker is taken from a connection once and may then be used from any
/// thread without access to the connection itself. If no poll is in flight
/// when [`Waker::wake`] is called, the next poll returns
/// [`ConnectionError::Interrupted`](crate::ConnectionError::Interrupted).
#[derive(Clone)]
pub struct Waker {
    wake: Arc<dyn Fn() + Send + Sync>,
}

impl Waker {
    /// Create a waker from the function that signals the connection.
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            wake: Arc::new(wake),
        }
    }

    /// A waker that does nothing, for connections whose polls cannot be interrupted.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Interrupt the connection's current or next poll.
    pub fn wake(&self) {
        (self.wake)()
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker").finish_non_exhaustive()
    }
}
