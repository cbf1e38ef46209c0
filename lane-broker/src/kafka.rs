//! Kafka backend built on `rdkafka`'s `BaseConsumer` and `BaseProducer`.
//!
//! Enabled with the `kafka` cargo feature.
//!
//! `BaseConsumer` hands out one message per poll, so [`KafkaConsumer::poll`]
//! waits for the first message and then drains whatever is immediately
//! available up to `max_batch`. The blocking wait is cut into short slices so
//! that a [`Waker`] can interrupt it; librdkafka offers no wakeup of its own.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};

use crate::connection::{ConsumerConnection, ProducerConnection};
use crate::error::{ConnectionError, Result};
use crate::types::{Record, TopicPartition, Waker};

const WAKEUP_SLICE: Duration = Duration::from_millis(100);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

fn partition_list(partitions: &BTreeSet<TopicPartition>) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        tpl.add_partition(&tp.topic, tp.partition);
    }
    tpl
}

/// Consumer session backed by `rdkafka::consumer::BaseConsumer`.
pub struct KafkaConsumer {
    consumer: Option<BaseConsumer>,
    subscription: BTreeSet<String>,
    max_batch: usize,
    wakeup: Arc<AtomicBool>,
}

impl KafkaConsumer {
    /// Create a consumer from a client configuration.
    ///
    /// The configuration should set `enable.auto.commit=false`; offsets are
    /// committed explicitly through [`ConsumerConnection::commit`].
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let consumer: BaseConsumer = config
            .create()
            .map_err(|e| ConnectionError::Client(e.to_string()))?;

        Ok(Self {
            consumer: Some(consumer),
            subscription: BTreeSet::new(),
            max_batch: 500,
            wakeup: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Set the upper bound on records returned by a single poll.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    fn consumer(&self) -> Result<&BaseConsumer> {
        self.consumer.as_ref().ok_or(ConnectionError::Closed)
    }

    fn to_record<M: Message>(msg: &M) -> Record {
        Record {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            payload: msg.payload().unwrap_or_default().to_vec(),
        }
    }
}

impl ConsumerConnection for KafkaConsumer {
    fn subscribe(&mut self, topics: &BTreeSet<String>) -> Result<()> {
        let consumer = self.consumer()?;
        if topics.is_empty() {
            consumer.unsubscribe();
        } else {
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&names)
                .map_err(|e| ConnectionError::Subscribe(e.to_string()))?;
        }
        self.subscription = topics.clone();
        Ok(())
    }

    fn subscription(&self) -> BTreeSet<String> {
        self.subscription.clone()
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        let consumer = self.consumer()?;
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        loop {
            if self.wakeup.swap(false, Ordering::SeqCst) {
                return Err(ConnectionError::Interrupted);
            }
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(WAKEUP_SLICE);

            match consumer.poll(slice) {
                Some(Ok(msg)) => {
                    batch.push(Self::to_record(&msg));
                    break;
                }
                Some(Err(e)) => return Err(ConnectionError::Poll(e.to_string())),
                None if Instant::now() >= deadline => return Ok(batch),
                None => {}
            }
        }

        // Drain immediately available messages without blocking
        while batch.len() < self.max_batch {
            match consumer.poll(Duration::ZERO) {
                Some(Ok(msg)) => batch.push(Self::to_record(&msg)),
                Some(Err(e)) => {
                    tracing::warn!("Error while draining Kafka batch: {}", e);
                    break;
                }
                None => break,
            }
        }
        Ok(batch)
    }

    fn commit(&mut self) -> Result<()> {
        match self.consumer()?.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // Nothing consumed since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(ConnectionError::CommitFailed(e.to_string())),
        }
    }

    fn assignment(&self) -> BTreeSet<TopicPartition> {
        let Ok(consumer) = self.consumer() else {
            return BTreeSet::new();
        };
        match consumer.assignment() {
            Ok(tpl) => tpl
                .elements()
                .iter()
                .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to read Kafka assignment: {}", e);
                BTreeSet::new()
            }
        }
    }

    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        self.consumer()?
            .pause(&partition_list(partitions))
            .map_err(|e| ConnectionError::Partition(e.to_string()))
    }

    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        self.consumer()?
            .resume(&partition_list(partitions))
            .map_err(|e| ConnectionError::Partition(e.to_string()))
    }

    fn seek_to_beginning(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<()> {
        let consumer = self.consumer()?;
        for tp in partitions {
            consumer
                .seek(&tp.topic, tp.partition, Offset::Beginning, SEEK_TIMEOUT)
                .map_err(|e| ConnectionError::Partition(format!("seek {tp}: {e}")))?;
        }
        Ok(())
    }

    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> Result<()> {
        self.consumer()?
            .seek(
                &partition.topic,
                partition.partition,
                Offset::Offset(offset),
                SEEK_TIMEOUT,
            )
            .map_err(|e| ConnectionError::Partition(format!("seek {partition}: {e}")))
    }

    fn waker(&self) -> Waker {
        let flag = Arc::clone(&self.wakeup);
        Waker::new(move || flag.store(true, Ordering::SeqCst))
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            tracing::debug!("Closed Kafka consumer");
        }
    }
}

/// Producer session backed by `rdkafka::producer::BaseProducer`.
pub struct KafkaProducer {
    producer: Option<BaseProducer>,
}

impl KafkaProducer {
    /// Create a producer from a client configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let producer: BaseProducer = config
            .create()
            .map_err(|e| ConnectionError::Client(e.to_string()))?;
        Ok(Self {
            producer: Some(producer),
        })
    }

    fn producer(&self) -> Result<&BaseProducer> {
        self.producer.as_ref().ok_or(ConnectionError::Closed)
    }
}

impl ProducerConnection for KafkaProducer {
    fn send(&mut self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<()> {
        let producer = self.producer()?;
        let mut record = BaseRecord::<[u8], [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        producer
            .send(record)
            .map_err(|(e, _)| ConnectionError::Send(e.to_string()))?;
        // Serve delivery callbacks
        producer.poll(Duration::ZERO);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.producer()?
            .flush(FLUSH_TIMEOUT)
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.flush(FLUSH_TIMEOUT) {
                tracing::warn!("Failed to flush Kafka producer on close: {}", e);
            }
        }
    }
}
