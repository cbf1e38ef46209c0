//! Broker connections held by a scheduler.
//!
//! A scheduler owns one inbound connection per [`Lane`] and one outbound
//! connection shared by all publishes. They are handed over as a
//! [`ConnectionSet`], either assembled by hand or created by a [`Connector`].

use std::fmt;
use std::sync::{Mutex, PoisonError};

use lane_broker::memory::{MemoryBroker, MemoryConsumerConfig};
use lane_broker::{ConnectionError, ConsumerConnection, ProducerConnection};

use crate::error::{Result, SchedulerError};
use crate::lane::Lane;

/// Creates the broker connections for a scheduler.
pub trait Connector {
    /// Open the inbound connection of `lane`.
    fn consumer_connection(
        &self,
        lane: Lane,
    ) -> std::result::Result<Box<dyn ConsumerConnection>, ConnectionError>;

    /// Open the outbound connection.
    fn producer_connection(&self) -> std::result::Result<Box<dyn ProducerConnection>, ConnectionError>;
}

/// One inbound connection per lane plus the shared outbound connection.
pub struct ConnectionSet {
    pub normal: Box<dyn ConsumerConnection>,
    pub priority: Box<dyn ConsumerConnection>,
    pub error: Box<dyn ConsumerConnection>,
    pub producer: Box<dyn ProducerConnection>,
}

impl ConnectionSet {
    pub fn new(
        normal: Box<dyn ConsumerConnection>,
        priority: Box<dyn ConsumerConnection>,
        error: Box<dyn ConsumerConnection>,
        producer: Box<dyn ProducerConnection>,
    ) -> Self {
        Self {
            normal,
            priority,
            error,
            producer,
        }
    }

    /// Open every connection through `connector`.
    pub fn from_connector<C: Connector + ?Sized>(connector: &C) -> Result<Self> {
        let open = |lane: Lane| {
            connector
                .consumer_connection(lane)
                .map_err(|source| SchedulerError::Connection { lane, source })
        };

        let normal = open(Lane::Normal)?;
        let priority = open(Lane::Priority)?;
        let error = open(Lane::Error)?;
        let producer = connector
            .producer_connection()
            .map_err(SchedulerError::ProducerConnection)?;

        Ok(Self::new(normal, priority, error, producer))
    }
}

impl fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSet").finish_non_exhaustive()
    }
}

/// The inbound connections, addressed by lane.
pub(crate) struct Consumers {
    normal: Box<dyn ConsumerConnection>,
    priority: Box<dyn ConsumerConnection>,
    error: Box<dyn ConsumerConnection>,
}

impl Consumers {
    pub fn new(
        normal: Box<dyn ConsumerConnection>,
        priority: Box<dyn ConsumerConnection>,
        error: Box<dyn ConsumerConnection>,
    ) -> Self {
        Self {
            normal,
            priority,
            error,
        }
    }

    pub fn get(&self, lane: Lane) -> &dyn ConsumerConnection {
        match lane {
            Lane::Normal => &*self.normal,
            Lane::Priority => &*self.priority,
            Lane::Error => &*self.error,
        }
    }

    pub fn get_mut(&mut self, lane: Lane) -> &mut dyn ConsumerConnection {
        match lane {
            Lane::Normal => &mut *self.normal,
            Lane::Priority => &mut *self.priority,
            Lane::Error => &mut *self.error,
        }
    }
}

struct OutboundState {
    producer: Box<dyn ProducerConnection>,
    closed: bool,
}

/// The outbound connection.
///
/// Guarded by its own lock, separate from the polling lock, so that
/// callbacks running inside a poll can publish.
pub(crate) struct Outbound {
    state: Mutex<OutboundState>,
}

impl Outbound {
    pub fn new(producer: Box<dyn ProducerConnection>) -> Self {
        Self {
            state: Mutex::new(OutboundState {
                producer,
                closed: false,
            }),
        }
    }

    /// Send `payload` to `topic` and flush.
    pub fn send(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| SchedulerError::LockPoisoned)?;
        if state.closed {
            return Err(SchedulerError::Stopped);
        }

        let publish_error = |source| SchedulerError::Publish {
            topic: topic.to_string(),
            source,
        };
        state.producer.send(topic, key, payload).map_err(publish_error)?;
        state.producer.flush().map_err(publish_error)
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.closed {
            state.producer.close();
            state.closed = true;
        }
    }
}

/// Connector backed by an in-process [`MemoryBroker`].
///
/// Each lane gets its own consumer group, `<group_id>-<LANE>`.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    group_id: String,
    consumer_config: MemoryConsumerConfig,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker, group_id: impl Into<String>) -> Self {
        Self {
            broker,
            group_id: group_id.into(),
            consumer_config: MemoryConsumerConfig::default(),
        }
    }

    pub fn with_consumer_config(mut self, config: MemoryConsumerConfig) -> Self {
        self.consumer_config = config;
        self
    }

    /// Consumer group used for `lane`.
    pub fn group_id(&self, lane: Lane) -> String {
        format!("{}{}", self.group_id, lane.suffix())
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

impl Connector for MemoryConnector {
    fn consumer_connection(
        &self,
        lane: Lane,
    ) -> std::result::Result<Box<dyn ConsumerConnection>, ConnectionError> {
        Ok(Box::new(
            self.broker
                .consumer_with(self.group_id(lane), self.consumer_config.clone()),
        ))
    }

    fn producer_connection(&self) -> std::result::Result<Box<dyn ProducerConnection>, ConnectionError> {
        Ok(Box::new(self.broker.producer()))
    }
}

#[cfg(feature = "kafka")]
pub use kafka_connector::KafkaConnector;

#[cfg(feature = "kafka")]
mod kafka_connector {
    use lane_broker::kafka::{KafkaConsumer, KafkaProducer};
    use lane_broker::{ConnectionError, ConsumerConnection, ProducerConnection};
    use rdkafka::ClientConfig;

    use super::Connector;
    use crate::lane::Lane;

    /// Connector for a Kafka cluster.
    ///
    /// Each lane gets its own consumer group, `<group_id>-<LANE>`. Offsets are
    /// never auto-committed by the client; the scheduler commits them.
    #[derive(Debug, Clone)]
    pub struct KafkaConnector {
        bootstrap_servers: String,
        group_id: String,
        properties: Vec<(String, String)>,
        max_batch: usize,
    }

    impl KafkaConnector {
        pub fn new(bootstrap_servers: impl Into<String>, group_id: impl Into<String>) -> Self {
            Self {
                bootstrap_servers: bootstrap_servers.into(),
                group_id: group_id.into(),
                properties: Vec::new(),
                max_batch: 500,
            }
        }

        /// Add a librdkafka client property applied to every connection.
        pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.properties.push((key.into(), value.into()));
            self
        }

        pub fn with_max_batch(mut self, max_batch: usize) -> Self {
            self.max_batch = max_batch;
            self
        }

        fn client_config(&self) -> ClientConfig {
            let mut config = ClientConfig::new();
            config.set("bootstrap.servers", &self.bootstrap_servers);
            for (key, value) in &self.properties {
                config.set(key, value);
            }
            config
        }
    }

    impl Connector for KafkaConnector {
        fn consumer_connection(
            &self,
            lane: Lane,
        ) -> Result<Box<dyn ConsumerConnection>, ConnectionError> {
            let mut config = self.client_config();
            config
                .set("group.id", format!("{}{}", self.group_id, lane.suffix()))
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", "earliest");

            let consumer = KafkaConsumer::new(&config)?.with_max_batch(self.max_batch);
            Ok(Box::new(consumer))
        }

        fn producer_connection(&self) -> Result<Box<dyn ProducerConnection>, ConnectionError> {
            Ok(Box::new(KafkaProducer::new(&self.client_config())?))
        }
    }
}
