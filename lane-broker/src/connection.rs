//! Connection traits implemented by every broker backend.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Record, TopicPartition, Waker};

/// An inbound broker session.
///
/// Implementations are not expected to be safe for concurrent use; callers
/// serialize access. Only the [`Waker`] returned by [`waker`](Self::waker) may
/// be used concurrently with a blocking [`poll`](Self::poll).
pub trait ConsumerConnection: Send {
    /// Replace the subscription with `topics`.
    ///
    /// Callers wanting additive semantics pass the union of the current
    /// [`subscription`](Self::subscription) and the new topics.
    fn subscribe(&mut self, topics: &BTreeSet<String>) -> Result<()>;

    /// Topics currently subscribed.
    fn subscription(&self) -> BTreeSet<String>;

    /// Fetch records, waiting up to `timeout` for the first one.
    ///
    /// Returns [`ConnectionError::Interrupted`](crate::ConnectionError::Interrupted)
    /// when woken through the connection's waker.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>>;

    /// Synchronously commit the positions of all assigned partitions.
    fn commit(&mut self) -> Result<()>;

    /// Partitions currently assigned to this session.
    fn assignment(&self) -> BTreeSet<TopicPartition>;

    /// Stop fetching from `partitions` without giving up their assignment.
    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()>;

    /// Resume fetching from previously paused `partitions`.
    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()>;

    /// Move the read position of `partitions` to the earliest available offset.
    fn seek_to_beginning(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()>;

    /// Move the read position of one assigned partition to `offset`.
    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<()>;

    /// Handle that interrupts a blocking poll from another thread.
    fn waker(&self) -> Waker;

    /// Close the session. Later operations fail with `ConnectionError::Closed`.
    fn close(&mut self);
}

/// An outbound broker session.
pub trait ProducerConnection: Send {
    /// Send a payload to `topic`, optionally keyed.
    fn send(&mut self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<()>;

    /// Block until every sent record has been handed to the broker.
    fn flush(&mut self) -> Result<()>;

    /// Close the session. Later operations fail with `ConnectionError::Closed`.
    fn close(&mut self);
}

impl<C: ConsumerConnection + ?Sized> ConsumerConnection for Box<C> {
    fn subscribe(&mut self, topics: &BTreeSet<String>) -> Result<()> {
        (**self).subscribe(topics)
    }

    fn subscription(&self) -> BTreeSet<String> {
        (**self).subscription()
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        (**self).poll(timeout)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn assignment(&self) -> BTreeSet<TopicPartition> {
        (**self).assignment()
    }

    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        (**self).pause(partitions)
    }

    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        (**self).resume(partitions)
    }

    fn seek_to_beginning(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        (**self).seek_to_beginning(partitions)
    }

    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<()> {
        (**self).seek(partition, offset)
    }

    fn waker(&self) -> Waker {
        (**self).waker()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<P: ProducerConnection + ?Sized> ProducerConnection for Box<P> {
    fn send(&mut self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<()> {
        (**self).send(topic, key, payload)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
