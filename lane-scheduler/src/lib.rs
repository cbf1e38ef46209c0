//! # lane-scheduler
//!
//! Lane-aware message consumption on top of a publish/subscribe broker.
//!
//! Every logical ("base") topic is multiplexed onto three physical topics,
//! one per [`Lane`]:
//!
//! | lane     | physical topic     | polled by                                  |
//! |----------|--------------------|--------------------------------------------|
//! | NORMAL   | `<topic>-NORMAL`   | `poll`, `poll_all_lanes`                   |
//! | PRIORITY | `<topic>-PRIORITY` | `poll` (always first), `poll_all_lanes`    |
//! | ERROR    | `<topic>-ERROR`    | `poll_all_lanes`, `poll_all_errors`        |
//!
//! A [`LaneScheduler`] owns one inbound connection per lane plus an outbound
//! connection. Callbacks registered with [`LaneScheduler::subscribe`] decode
//! payloads into a typed value and run synchronously inside the polling call.
//! When a callback fails, its error handler decides whether the failure is
//! only logged or republished to the ERROR lane of the base topic.
//!
//! Long-running processing can starve a connection of polls and get its
//! session evicted by the broker. The scheduler substitutes heartbeats (a
//! poll with every partition paused) for skipped polls, and can send them on
//! a background timer as well.
//!
//! ## Example
//!
//! ```rust
//! use lane_broker::memory::MemoryBroker;
//! use lane_scheduler::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Order {
//!     id: u64,
//! }
//!
//! # fn main() -> lane_scheduler::Result<()> {
//! let broker = MemoryBroker::new();
//! let scheduler = LaneScheduler::connect(
//!     &MemoryConnector::new(broker.clone(), "shop"),
//!     SchedulerConfig::low_latency().with_drain_timeout(Duration::from_millis(50)),
//! )?;
//!
//! scheduler.subscribe(
//!     "orders",
//!     Callback::json(|order: &Order, _lane: Lane| {
//!         if order.id == 0 {
//!             return Err("order id must not be zero".into());
//!         }
//!         Ok(())
//!     })
//!     .on_error(|order: Option<&Order>, err| {
//!         ErrorAction::Republish(serde_json::json!({
//!             "id": order.map(|o| o.id),
//!             "error": err.to_string(),
//!         }))
//!     }),
//! )?;
//!
//! scheduler.publish(&Order { id: 0 }, "orders", Lane::Normal)?;
//! scheduler.poll_all_lanes()?;
//! assert_eq!(broker.records("orders-ERROR").len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod codec;
pub mod config;
pub mod connections;
pub mod error;
pub mod lane;
pub mod logging;

mod registry;
mod scheduler;

pub use callback::{Callback, CallbackError, ErrorAction, HandlerError};
pub use codec::CodecError;
pub use config::SchedulerConfig;
#[cfg(feature = "kafka")]
pub use connections::KafkaConnector;
pub use connections::{ConnectionSet, Connector, MemoryConnector};
pub use error::{Result, SchedulerError};
pub use lane::{combine, CombinedTopic, Lane, ParseLaneError};
pub use scheduler::LaneScheduler;

/// Everything needed to subscribe, publish and poll.
pub mod prelude {
    pub use crate::callback::{Callback, CallbackError, ErrorAction};
    pub use crate::config::SchedulerConfig;
    pub use crate::connections::{ConnectionSet, Connector, MemoryConnector};
    pub use crate::error::SchedulerError;
    pub use crate::lane::Lane;
    pub use crate::scheduler::LaneScheduler;
}
