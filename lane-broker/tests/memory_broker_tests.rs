//! Integration tests for the in-memory broker backend.
//!
//! These exercise the backend only through the connection traits, the same way
//! the lane scheduler drives it.

use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

use lane_broker::memory::MemoryBroker;
use lane_broker::{ConnectionError, ConsumerConnection, ProducerConnection, TopicPartition};
use rstest::rstest;

fn topics(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[test]
fn test_blocking_poll_returns_when_data_arrives() {
    let broker = MemoryBroker::new();
    let mut consumer = broker.consumer("g");
    consumer.subscribe(&topics(&["orders-NORMAL"])).unwrap();
    assert!(consumer.poll(Duration::from_millis(1)).unwrap().is_empty());

    let producer_broker = broker.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        producer_broker
            .producer()
            .send("orders-NORMAL", None, b"{\"id\":1}")
            .unwrap();
    });

    let started = Instant::now();
    let records = consumer.poll(Duration::from_secs(10)).unwrap();
    handle.join().unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].topic, "orders-NORMAL");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_groups_track_offsets_independently() {
    let broker = MemoryBroker::new();
    let mut producer = broker.producer();
    producer.send("a", None, b"1").unwrap();

    let mut billing = broker.consumer("billing");
    let mut audit = broker.consumer("audit");
    billing.subscribe(&topics(&["a"])).unwrap();
    audit.subscribe(&topics(&["a"])).unwrap();

    assert_eq!(billing.poll(Duration::from_millis(1)).unwrap().len(), 1);
    billing.commit().unwrap();
    assert_eq!(audit.poll(Duration::from_millis(1)).unwrap().len(), 1);

    let tp = TopicPartition::new("a", 0);
    assert_eq!(broker.committed("billing", &tp), Some(1));
    assert_eq!(broker.committed("audit", &tp), None);
}

#[test]
fn test_resubscribe_keeps_positions_of_retained_topics() {
    let broker = MemoryBroker::new();
    let mut producer = broker.producer();
    producer.send("a", None, b"a1").unwrap();

    let mut consumer = broker.consumer("g");
    consumer.subscribe(&topics(&["a"])).unwrap();
    assert_eq!(consumer.poll(Duration::from_millis(1)).unwrap().len(), 1);

    producer.send("b", None, b"b1").unwrap();
    consumer.subscribe(&topics(&["a", "b"])).unwrap();
    let records = consumer.poll(Duration::from_millis(1)).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].topic, "b");
    assert_eq!(consumer.subscription(), topics(&["a", "b"]));
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(8)]
fn test_all_partitions_are_assigned(#[case] partitions: i32) {
    let broker = MemoryBroker::with_default_partitions(partitions);
    let mut producer = broker.producer();
    for i in 0..(partitions * 2) {
        producer.send("a", None, format!("{i}").as_bytes()).unwrap();
    }

    let mut consumer = broker.consumer("g");
    consumer.subscribe(&topics(&["a"])).unwrap();
    let records = consumer.poll(Duration::from_millis(1)).unwrap();

    assert_eq!(consumer.assignment().len(), partitions as usize);
    assert_eq!(records.len(), (partitions * 2) as usize);
}

#[test]
fn test_wake_from_other_thread_leaves_connection_usable() {
    let broker = MemoryBroker::new();
    let mut consumer = broker.consumer("g");
    consumer.subscribe(&topics(&["a"])).unwrap();
    let waker = consumer.waker();

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        waker.wake();
    });
    assert_eq!(
        consumer.poll(Duration::from_secs(10)).unwrap_err(),
        ConnectionError::Interrupted
    );
    handle.join().unwrap();

    broker.producer().send("a", None, b"x").unwrap();
    assert_eq!(consumer.poll(Duration::from_millis(10)).unwrap().len(), 1);
}
