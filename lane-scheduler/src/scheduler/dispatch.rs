//! Processing of one lane: poll, run callbacks, route failures, commit.

use std::collections::BTreeMap;
use std::time::Duration;

use lane_broker::{ConsumerConnection, Record, TopicPartition};

use super::state::SchedulerCore;
use crate::callback::Outcome;
use crate::connections::Outbound;
use crate::error::{Result, SchedulerError};
use crate::lane::{combine, Lane};
use crate::registry::CallbackRegistry;

/// Poll `lane` once for up to `timeout` and dispatch what arrived.
///
/// Returns whether any record was received. An interrupted poll counts as an
/// empty poll. If a record cannot be dispatched, the connection is rewound to
/// that record so the rest of the batch is fetched again, and nothing is
/// committed. A failed commit is returned as [`SchedulerError::CommitFailed`];
/// the caller is expected to shut down.
pub(crate) fn process(
    core: &mut SchedulerCore,
    outbound: &Outbound,
    lane: Lane,
    timeout: Duration,
    auto_commit: bool,
) -> Result<bool> {
    tracing::debug!("Polling {} lane ({:?})", lane, timeout);

    let records = match core.consumers.get_mut(lane).poll(timeout) {
        Ok(records) => records,
        Err(e) if e.is_interrupted() => {
            tracing::debug!("Poll on {} lane interrupted", lane);
            return Ok(false);
        }
        Err(source) => return Err(SchedulerError::Connection { lane, source }),
    };

    for (index, record) in records.iter().enumerate() {
        if let Err(e) = dispatch_record(&core.registry, outbound, lane, record) {
            let pending = &records[index..];
            tracing::warn!(
                "Dispatch failed on {} at offset {}, rewinding {} record(s): {}",
                record.topic,
                record.offset,
                pending.len(),
                e
            );
            if let Err(rewind_error) = rewind(core.consumers.get_mut(lane), lane, pending) {
                tracing::warn!("Failed to rewind {} lane: {}", lane, rewind_error);
            }
            return Err(e);
        }
    }

    if auto_commit {
        match core.consumers.get_mut(lane).commit() {
            Ok(()) => {}
            Err(e) if e.is_interrupted() => {
                tracing::debug!("Commit on {} lane interrupted", lane);
            }
            Err(source) => return Err(SchedulerError::CommitFailed { lane, source }),
        }
    }

    Ok(!records.is_empty())
}

/// Seek every partition in `records` back to the lowest offset it has there.
pub(crate) fn rewind(conn: &mut dyn ConsumerConnection, lane: Lane, records: &[Record]) -> Result<()> {
    let mut first_offsets: BTreeMap<TopicPartition, i64> = BTreeMap::new();
    for record in records {
        first_offsets
            .entry(record.topic_partition())
            .and_modify(|offset| *offset = (*offset).min(record.offset))
            .or_insert(record.offset);
    }
    for (tp, offset) in &first_offsets {
        conn.seek(tp, *offset)
            .map_err(|source| SchedulerError::Connection { lane, source })?;
    }
    Ok(())
}

fn dispatch_record(
    registry: &CallbackRegistry,
    outbound: &Outbound,
    lane: Lane,
    record: &Record,
) -> Result<()> {
    tracing::debug!(
        "Received message on {} (partition {}, offset {}), invoking callbacks",
        record.topic,
        record.partition,
        record.offset
    );

    let (Some(callbacks), Some(base_topic)) = (
        registry.callbacks(&record.topic),
        registry.base_topic(&record.topic),
    ) else {
        tracing::warn!(
            "No callback registered for {}, skipping offset {}",
            record.topic,
            record.offset
        );
        return Ok(());
    };

    for callback in callbacks {
        if let Outcome::Republish(payload) = callback.dispatch(record, lane) {
            let error_topic = combine(base_topic, Lane::Error);
            outbound.send(error_topic.as_str(), None, &payload)?;
            tracing::debug!("Published failure of {} to {}", record.topic, error_topic);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{Callback, ErrorAction};
    use crate::connections::Consumers;
    use lane_broker::memory::{MemoryBroker, MemoryConsumer, MemoryProducer};
    use lane_broker::{ConnectionError, ProducerConnection, Waker};
    use serde::Deserialize;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Deserialize)]
    struct Order {
        id: u64,
    }

    const POLL: Duration = Duration::from_millis(5);

    fn setup(broker: &MemoryBroker) -> (SchedulerCore, Outbound) {
        let core = SchedulerCore::new(Consumers::new(
            Box::new(broker.consumer("g-NORMAL")),
            Box::new(broker.consumer("g-PRIORITY")),
            Box::new(broker.consumer("g-ERROR")),
        ));
        (core, Outbound::new(Box::new(broker.producer())))
    }

    #[test]
    fn test_process_invokes_every_callback() {
        let broker = MemoryBroker::new();
        let (mut core, outbound) = setup(&broker);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let cb = Callback::json(move |_: &Order, lane| {
                assert_eq!(lane, Lane::Normal);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            core.subscribe("orders", Lane::Normal, Arc::new(cb)).unwrap();
        }
        broker.producer().send("orders-NORMAL", None, br#"{"id":1}"#).unwrap();

        assert!(process(&mut core, &outbound, Lane::Normal, POLL, false).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!process(&mut core, &outbound, Lane::Normal, POLL, false).unwrap());
    }

    #[test]
    fn test_failure_is_routed_to_base_topic_error_lane() {
        let broker = MemoryBroker::new();
        let (mut core, outbound) = setup(&broker);
        let cb = Callback::json(|_: &Order, _| Ok(())).on_error(|_: Option<&Order>, err| {
            ErrorAction::Republish(err.to_string())
        });
        core.subscribe("orders", Lane::Priority, Arc::new(cb)).unwrap();
        broker.producer().send("orders-PRIORITY", None, b"garbage").unwrap();

        assert!(process(&mut core, &outbound, Lane::Priority, POLL, false).unwrap());
        let errors = broker.records("orders-ERROR");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].payload_lossy().contains("Failed to decode message"));
        assert!(broker.records("orders-PRIORITY-ERROR").is_empty());
    }

    #[test]
    fn test_auto_commit_after_batch() {
        let broker = MemoryBroker::new();
        let (mut core, outbound) = setup(&broker);
        core.subscribe("orders", Lane::Normal, Arc::new(Callback::json(|_: &Order, _| Ok(()))))
            .unwrap();
        let mut producer = broker.producer();
        producer.send("orders-NORMAL", None, br#"{"id":1}"#).unwrap();
        producer.send("orders-NORMAL", None, br#"{"id":2}"#).unwrap();

        process(&mut core, &outbound, Lane::Normal, POLL, true).unwrap();
        let tp = TopicPartition::new("orders-NORMAL", 0);
        assert_eq!(broker.committed("g-NORMAL", &tp), Some(2));
    }

    #[test]
    fn test_commit_failure_is_reported() {
        let broker = MemoryBroker::new();
        let (mut core, outbound) = setup(&broker);
        broker.fail_commits("g-NORMAL", true);

        let err = process(&mut core, &outbound, Lane::Normal, POLL, true).unwrap_err();
        assert!(matches!(err, SchedulerError::CommitFailed { lane: Lane::Normal, .. }));
    }

    #[test]
    fn test_interrupted_poll_counts_as_empty() {
        let broker = MemoryBroker::new();
        let (mut core, outbound) = setup(&broker);
        core.consumers.get(Lane::Normal).waker().wake();
        assert!(!process(&mut core, &outbound, Lane::Normal, Duration::from_secs(5), false).unwrap());
    }

    /// Producer whose first send to an ERROR lane fails.
    struct FlakyProducer {
        inner: MemoryProducer,
        failed: bool,
    }

    impl ProducerConnection for FlakyProducer {
        fn send(&mut self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> lane_broker::Result<()> {
            if topic.ends_with(Lane::Error.suffix()) && !self.failed {
                self.failed = true;
                return Err(ConnectionError::Send("leader not available".to_string()));
            }
            self.inner.send(topic, key, payload)
        }

        fn flush(&mut self) -> lane_broker::Result<()> {
            self.inner.flush()
        }

        fn close(&mut self) {
            self.inner.close()
        }
    }

    #[test]
    fn test_failed_republish_rewinds_rest_of_batch() {
        let broker = MemoryBroker::new();
        let (mut core, _) = setup(&broker);
        let outbound = Outbound::new(Box::new(FlakyProducer {
            inner: broker.producer(),
            failed: false,
        }));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cb = Callback::json(move |order: &Order, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            if order.id == 1 {
                return Err("out of stock".into());
            }
            Ok(())
        })
        .on_error(|_: Option<&Order>, err| ErrorAction::Republish(err.to_string()));
        core.subscribe("orders", Lane::Normal, Arc::new(cb)).unwrap();

        let mut producer = broker.producer();
        for id in 1..=3 {
            producer
                .send("orders-NORMAL", None, format!(r#"{{"id":{id}}}"#).as_bytes())
                .unwrap();
        }

        let err = process(&mut core, &outbound, Lane::Normal, POLL, true).unwrap_err();
        assert!(matches!(err, SchedulerError::Publish { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let tp = TopicPartition::new("orders-NORMAL", 0);
        assert_eq!(broker.committed("g-NORMAL", &tp), None);

        assert!(process(&mut core, &outbound, Lane::Normal, POLL, true).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(broker.records("orders-ERROR").len(), 1);
        assert_eq!(broker.committed("g-NORMAL", &tp), Some(3));
    }

    /// Consumer whose commits are always interrupted.
    struct InterruptedCommits(MemoryConsumer);

    impl ConsumerConnection for InterruptedCommits {
        fn subscribe(&mut self, topics: &BTreeSet<String>) -> lane_broker::Result<()> {
            self.0.subscribe(topics)
        }

        fn subscription(&self) -> BTreeSet<String> {
            self.0.subscription()
        }

        fn poll(&mut self, timeout: Duration) -> lane_broker::Result<Vec<Record>> {
            self.0.poll(timeout)
        }

        fn commit(&mut self) -> lane_broker::Result<()> {
            Err(ConnectionError::Interrupted)
        }

        fn assignment(&self) -> BTreeSet<TopicPartition> {
            self.0.assignment()
        }

        fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> lane_broker::Result<()> {
            self.0.pause(partitions)
        }

        fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> lane_broker::Result<()> {
            self.0.resume(partitions)
        }

        fn seek_to_beginning(&mut self, partitions: &BTreeSet<TopicPartition>) -> lane_broker::Result<()> {
            self.0.seek_to_beginning(partitions)
        }

        fn seek(&mut self, partition: &TopicPartition, offset: i64) -> lane_broker::Result<()> {
            self.0.seek(partition, offset)
        }

        fn waker(&self) -> Waker {
            self.0.waker()
        }

        fn close(&mut self) {
            self.0.close()
        }
    }

    #[test]
    fn test_interrupted_commit_still_reports_records() {
        let broker = MemoryBroker::new();
        let mut core = SchedulerCore::new(Consumers::new(
            Box::new(InterruptedCommits(broker.consumer("g-NORMAL"))),
            Box::new(broker.consumer("g-PRIORITY")),
            Box::new(broker.consumer("g-ERROR")),
        ));
        let outbound = Outbound::new(Box::new(broker.producer()));
        core.subscribe("orders", Lane::Normal, Arc::new(Callback::json(|_: &Order, _| Ok(()))))
            .unwrap();
        broker.producer().send("orders-NORMAL", None, br#"{"id":1}"#).unwrap();

        assert!(process(&mut core, &outbound, Lane::Normal, POLL, true).unwrap());
    }
}
