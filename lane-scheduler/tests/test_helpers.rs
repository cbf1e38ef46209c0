//! Shared fixtures for the lane-scheduler integration tests.
//!
//! Every test runs a scheduler against an in-process memory broker with short
//! timeouts, so an empty lane costs milliseconds instead of seconds.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lane_broker::memory::MemoryBroker;
use lane_broker::TopicPartition;
use lane_scheduler::{Callback, Lane, LaneScheduler, MemoryConnector, SchedulerConfig};
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "shop";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
}

/// Failure report republished to the error lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOrder {
    pub id: Option<u64>,
    pub reason: String,
}

/// Short timeouts for tests.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_poll_timeouts(Duration::from_millis(1), Duration::from_millis(50))
        .with_drain_timeout(Duration::from_millis(20))
}

pub struct Harness {
    pub broker: MemoryBroker,
    pub scheduler: LaneScheduler,
}

impl Harness {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_broker(MemoryBroker::new(), config)
    }

    pub fn with_broker(broker: MemoryBroker, config: SchedulerConfig) -> Self {
        let connector = MemoryConnector::new(broker.clone(), GROUP);
        let scheduler = LaneScheduler::connect(&connector, config).unwrap();
        Self { broker, scheduler }
    }

    /// Payloads stored on the physical topic of `base` on `lane`.
    pub fn stored<T: serde::de::DeserializeOwned>(&self, base: &str, lane: Lane) -> Vec<T> {
        let topic = lane_scheduler::combine(base, lane);
        self.broker
            .records(topic.as_str())
            .iter()
            .map(|r| serde_json::from_slice(&r.payload).unwrap())
            .collect()
    }

    /// Offset committed by the scheduler's group of `lane` on partition 0.
    pub fn committed(&self, base: &str, lane: Lane) -> Option<i64> {
        let group = format!("{GROUP}{}", lane.suffix());
        let tp = TopicPartition::new(lane_scheduler::combine(base, lane).to_string(), 0);
        self.broker.committed(&group, &tp)
    }
}

/// Collects every value a callback receives, with its lane.
#[derive(Clone)]
pub struct Recorder<T> {
    seen: Arc<Mutex<Vec<(T, Lane)>>>,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> Callback<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let seen = Arc::clone(&self.seen);
        Callback::json(move |value: &T, lane: Lane| {
            seen.lock().unwrap().push((value.clone(), lane));
            Ok(())
        })
    }

    pub fn seen(&self) -> Vec<(T, Lane)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn values(&self) -> Vec<T> {
        self.seen().into_iter().map(|(value, _)| value).collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}
