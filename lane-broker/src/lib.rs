//! # lane-broker
//!
//! The broker connection capability consumed by `lane-scheduler`.
//!
//! A lane scheduler never speaks a broker wire protocol itself. It drives
//! connections through the [`ConsumerConnection`] and [`ProducerConnection`]
//! traits defined here, and this crate ships the backends that implement them:
//!
//! - [`memory`]: an in-process broker with partitions, per-group committed
//!   offsets, pause/resume, log retention and fault injection. Used by tests,
//!   demos and local development.
//! - `kafka` (cargo feature `kafka`): adapters over `rdkafka`'s
//!   `BaseConsumer` and `BaseProducer`.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeSet;
//! use std::time::Duration;
//! use lane_broker::memory::MemoryBroker;
//! use lane_broker::{ConsumerConnection, ProducerConnection};
//!
//! let broker = MemoryBroker::new();
//! let mut producer = broker.producer();
//! producer.send("orders-NORMAL", None, br#"{"id":1}"#).unwrap();
//!
//! let mut consumer = broker.consumer("billing");
//! consumer
//!     .subscribe(&BTreeSet::from(["orders-NORMAL".to_string()]))
//!     .unwrap();
//! let records = consumer.poll(Duration::from_millis(10)).unwrap();
//! assert_eq!(records.len(), 1);
//! ```

mod connection;
mod error;
mod partitioner;
mod types;

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use connection::{ConsumerConnection, ProducerConnection};
pub use error::{ConnectionError, Result};
pub use partitioner::compute_partition;
pub use types::{Record, TopicPartition, Waker};
