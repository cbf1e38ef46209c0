//! In-process broker backend.
//!
//! [`MemoryBroker`] keeps partitioned topic logs, per-group committed offsets
//! and log-start offsets in shared memory. Consumers and producers created
//! from the same broker handle see each other's data, which makes the backend
//! suitable for tests, demos and local development without a cluster.
//!
//! Group membership is simple: every consumer is the only member
//! of its group and receives all partitions of its subscribed topics on the
//! first poll after (re)subscribing, the same moment a Kafka consumer would
//! complete its rebalance.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::connection::{ConsumerConnection, ProducerConnection};
use crate::error::{ConnectionError, Result};
use crate::partitioner::compute_partition;
use crate::types::{Record, TopicPartition, Waker};

/// Where a consumer starts reading a partition its group never committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Start at the log-start offset
    #[default]
    Earliest,
    /// Start at the end of the log, skipping existing records
    Latest,
}

/// Settings for a [`MemoryConsumer`].
#[derive(Debug, Clone)]
pub struct MemoryConsumerConfig {
    /// Upper bound on the number of records a single poll returns
    /// Default: 500
    pub max_poll_records: usize,

    /// Starting position for partitions without a committed offset
    /// Default: Earliest
    pub offset_reset: OffsetReset,
}

impl Default for MemoryConsumerConfig {
    fn default() -> Self {
        Self {
            max_poll_records: 500,
            offset_reset: OffsetReset::Earliest,
        }
    }
}

impl MemoryConsumerConfig {
    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max.max(1);
        self
    }

    pub fn with_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.offset_reset = reset;
        self
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct PartitionLog {
    log_start: i64,
    records: VecDeque<StoredRecord>,
}

impl PartitionLog {
    fn end_offset(&self) -> i64 {
        self.log_start + self.records.len() as i64
    }

    fn get(&self, offset: i64) -> Option<&StoredRecord> {
        if offset < self.log_start {
            return None;
        }
        self.records.get((offset - self.log_start) as usize)
    }

    fn truncate_before(&mut self, offset: i64) {
        let target = offset.min(self.end_offset());
        while self.log_start < target {
            self.records.pop_front();
            self.log_start += 1;
        }
    }
}

#[derive(Debug)]
struct TopicLog {
    partitions: Vec<PartitionLog>,
    round_robin: u64,
}

impl TopicLog {
    fn new(partitions: i32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| PartitionLog::default()).collect(),
            round_robin: 0,
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    default_partitions: i32,
    topics: HashMap<String, TopicLog>,
    committed: HashMap<String, HashMap<TopicPartition, i64>>,
    failing_commit_groups: HashSet<String>,
}

impl BrokerState {
    fn ensure_topic(&mut self, topic: &str) -> &mut TopicLog {
        let partitions = self.default_partitions;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(partitions))
    }

    fn partition(&self, tp: &TopicPartition) -> Option<&PartitionLog> {
        self.topics
            .get(&tp.topic)
            .and_then(|t| t.partitions.get(tp.partition as usize))
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BrokerState>,
    arrivals: Condvar,
}

impl Shared {
    // No update spans a panic point, so poisoned state is still consistent
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to an in-process broker. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a broker whose auto-created topics have a single partition.
    pub fn new() -> Self {
        Self::with_default_partitions(1)
    }

    /// Create a broker whose auto-created topics have `partitions` partitions.
    pub fn with_default_partitions(partitions: i32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    default_partitions: partitions.max(1),
                    topics: HashMap::new(),
                    committed: HashMap::new(),
                    failing_commit_groups: HashSet::new(),
                }),
                arrivals: Condvar::new(),
            }),
        }
    }

    /// Create `topic` with an explicit partition count.
    ///
    /// Returns `false` if the topic already exists; its partitions are left unchanged.
    pub fn create_topic(&self, topic: &str, partitions: i32) -> bool {
        let mut state = self.shared.lock();
        if state.topics.contains_key(topic) {
            return false;
        }
        state
            .topics
            .insert(topic.to_string(), TopicLog::new(partitions));
        tracing::debug!("Created topic {} with {} partitions", topic, partitions.max(1));
        true
    }

    /// Names of all existing topics.
    pub fn topics(&self) -> BTreeSet<String> {
        self.shared.lock().topics.keys().cloned().collect()
    }

    /// Create a consumer in `group_id` with default settings.
    pub fn consumer(&self, group_id: impl Into<String>) -> MemoryConsumer {
        self.consumer_with(group_id, MemoryConsumerConfig::default())
    }

    /// Create a consumer in `group_id`.
    pub fn consumer_with(
        &self,
        group_id: impl Into<String>,
        config: MemoryConsumerConfig,
    ) -> MemoryConsumer {
        MemoryConsumer {
            shared: Arc::clone(&self.shared),
            group_id: group_id.into(),
            config,
            subscription: BTreeSet::new(),
            assignment: BTreeSet::new(),
            positions: HashMap::new(),
            paused: BTreeSet::new(),
            rebalance_pending: false,
            wakeup: Arc::new(AtomicBool::new(false)),
            closed: false,
        }
    }

    /// Create a producer.
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            shared: Arc::clone(&self.shared),
            closed: false,
        }
    }

    /// Every retained record of `topic`, ordered by partition then offset.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.shared.lock();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for (index, partition) in log.partitions.iter().enumerate() {
            for (i, stored) in partition.records.iter().enumerate() {
                out.push(Record {
                    topic: topic.to_string(),
                    partition: index as i32,
                    offset: partition.log_start + i as i64,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                });
            }
        }
        out
    }

    /// Offset committed by `group_id` for `tp`, if any.
    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        self.shared
            .lock()
            .committed
            .get(group_id)
            .and_then(|offsets| offsets.get(tp).copied())
    }

    /// Earliest offset still retained in `tp`.
    pub fn log_start_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.shared.lock().partition(tp).map(|p| p.log_start)
    }

    /// Offset the next record appended to `tp` will receive.
    pub fn end_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.shared.lock().partition(tp).map(PartitionLog::end_offset)
    }

    /// Drop records of `tp` below `offset`, as log retention would.
    ///
    /// Returns `false` if the partition does not exist.
    pub fn truncate_before(&self, tp: &TopicPartition, offset: i64) -> bool {
        let mut state = self.shared.lock();
        match state
            .topics
            .get_mut(&tp.topic)
            .and_then(|t| t.partitions.get_mut(tp.partition as usize))
        {
            Some(partition) => {
                partition.truncate_before(offset);
                tracing::debug!("Truncated {} to log start {}", tp, partition.log_start);
                true
            }
            None => false,
        }
    }

    /// Make every commit by `group_id` fail (or succeed again).
    pub fn fail_commits(&self, group_id: &str, fail: bool) {
        let mut state = self.shared.lock();
        if fail {
            state.failing_commit_groups.insert(group_id.to_string());
        } else {
            state.failing_commit_groups.remove(group_id);
        }
    }
}

/// Consumer session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    group_id: String,
    config: MemoryConsumerConfig,
    subscription: BTreeSet<String>,
    assignment: BTreeSet<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    paused: BTreeSet<TopicPartition>,
    rebalance_pending: bool,
    wakeup: Arc<AtomicBool>,
    closed: bool,
}

impl MemoryConsumer {
    /// The consumer group this session belongs to.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Next offset this session will read from `tp`.
    pub fn position(&self, tp: &TopicPartition) -> Option<i64> {
        self.positions.get(tp).copied()
    }

    /// Partitions currently paused.
    pub fn paused(&self) -> BTreeSet<TopicPartition> {
        self.paused.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_assigned(&self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        match partitions.iter().find(|tp| !self.assignment.contains(*tp)) {
            Some(tp) => Err(ConnectionError::Partition(format!(
                "partition {tp} is not assigned to this consumer"
            ))),
            None => Ok(()),
        }
    }

    fn rebalance(&mut self, state: &BrokerState) {
        let assignment: BTreeSet<TopicPartition> = self
            .subscription
            .iter()
            .filter_map(|topic| state.topics.get(topic).map(|log| (topic, log)))
            .flat_map(|(topic, log)| {
                (0..log.partitions.len() as i32).map(move |p| TopicPartition::new(topic.clone(), p))
            })
            .collect();

        self.positions.retain(|tp, _| assignment.contains(tp));
        self.paused.retain(|tp| assignment.contains(tp));

        let committed = state.committed.get(&self.group_id);
        for tp in &assignment {
            if self.positions.contains_key(tp) {
                continue;
            }
            let start = committed.and_then(|c| c.get(tp).copied()).unwrap_or_else(|| {
                let log = state.partition(tp);
                match self.config.offset_reset {
                    OffsetReset::Earliest => log.map_or(0, |p| p.log_start),
                    OffsetReset::Latest => log.map_or(0, PartitionLog::end_offset),
                }
            });
            self.positions.insert(tp.clone(), start);
        }

        tracing::debug!(
            "Group {} assigned {} partition(s)",
            self.group_id,
            assignment.len()
        );
        self.assignment = assignment;
        self.rebalance_pending = false;
    }

    fn fetch(&mut self, state: &BrokerState) -> Vec<Record> {
        let mut out = Vec::new();
        for tp in &self.assignment {
            if self.paused.contains(tp) {
                continue;
            }
            let Some(log) = state.partition(tp) else {
                continue;
            };
            let Some(position) = self.positions.get_mut(tp) else {
                continue;
            };
            // Retention may have removed records below our position
            if *position < log.log_start {
                *position = log.log_start;
            }
            while out.len() < self.config.max_poll_records {
                let Some(stored) = log.get(*position) else {
                    break;
                };
                out.push(Record {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: *position,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                });
                *position += 1;
            }
            if out.len() >= self.config.max_poll_records {
                break;
            }
        }
        out
    }
}

impl ConsumerConnection for MemoryConsumer {
    fn subscribe(&mut self, topics: &BTreeSet<String>) -> Result<()> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            for topic in topics {
                state.ensure_topic(topic);
            }
        }
        if *topics != self.subscription {
            self.subscription = topics.clone();
            self.rebalance_pending = true;
        }
        Ok(())
    }

    fn subscription(&self) -> BTreeSet<String> {
        self.subscription.clone()
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();

        if self.rebalance_pending {
            self.rebalance(&state);
        }

        loop {
            if self.wakeup.swap(false, Ordering::SeqCst) {
                return Err(ConnectionError::Interrupted);
            }

            let records = self.fetch(&state);
            if !records.is_empty() {
                return Ok(records);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            state = shared
                .arrivals
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if state.failing_commit_groups.contains(&self.group_id) {
            return Err(ConnectionError::CommitFailed(format!(
                "group {} is rebalancing",
                self.group_id
            )));
        }

        let offsets = state.committed.entry(self.group_id.clone()).or_default();
        for tp in &self.assignment {
            if let Some(position) = self.positions.get(tp) {
                offsets.insert(tp.clone(), *position);
            }
        }
        Ok(())
    }

    fn assignment(&self) -> BTreeSet<TopicPartition> {
        self.assignment.clone()
    }

    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        self.ensure_open()?;
        self.ensure_assigned(partitions)?;
        self.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        self.ensure_open()?;
        self.ensure_assigned(partitions)?;
        for tp in partitions {
            self.paused.remove(tp);
        }
        Ok(())
    }

    fn seek_to_beginning(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        self.ensure_open()?;
        self.ensure_assigned(partitions)?;
        let state = self.shared.lock();
        for tp in partitions {
            let start = state.partition(tp).map_or(0, |p| p.log_start);
            self.positions.insert(tp.clone(), start);
        }
        Ok(())
    }

    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<()> {
        self.ensure_open()?;
        self.ensure_assigned(&BTreeSet::from([partition.clone()]))?;
        self.positions.insert(partition.clone(), offset.max(0));
        Ok(())
    }

    fn waker(&self) -> Waker {
        let flag = Arc::clone(&self.wakeup);
        let shared = Arc::clone(&self.shared);
        Waker::new(move || {
            flag.store(true, Ordering::SeqCst);
            // Hold the lock so a poll between its flag check and its wait cannot miss this
            let _state = shared.lock();
            shared.arrivals.notify_all();
        })
    }

    fn close(&mut self) {
        if !self.closed {
            tracing::debug!("Closing consumer for group {}", self.group_id);
        }
        self.closed = true;
    }
}

/// Producer session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryProducer {
    shared: Arc<Shared>,
    closed: bool,
}

impl ProducerConnection for MemoryProducer {
    fn send(&mut self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        {
            let mut state = self.shared.lock();
            let log = state.ensure_topic(topic);
            let partition = compute_partition(key, log.partitions.len() as i32, log.round_robin);
            log.round_robin = log.round_robin.wrapping_add(1);
            log.partitions[partition as usize].records.push_back(StoredRecord {
                key: key.map(<[u8]>::to_vec),
                payload: payload.to_vec(),
            });
        }
        self.shared.arrivals.notify_all();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
