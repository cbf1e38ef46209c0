//! Orders pipeline on the in-memory broker.
//!
//! Publishes a mix of normal and priority orders, processes them with the
//! adaptive poll loop, routes failed orders to the error lane and finally
//! replays the error lane.
//!
//! Run with:
//!
//! ```text
//! LANES_LOG_MODE=development cargo run -p lane-sdk-scheduler --example orders_demo
//! ```

use std::time::Duration;

use lane_broker::memory::MemoryBroker;
use lane_scheduler::logging;
use lane_scheduler::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u64,
    quantity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct FailedOrder {
    id: Option<u64>,
    reason: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging_from_env()?;

    let broker = MemoryBroker::with_default_partitions(3);
    let config = SchedulerConfig::low_latency()
        .with_drain_timeout(Duration::from_millis(200))
        .with_background_heartbeat(Duration::from_secs(1));
    let scheduler = LaneScheduler::connect(&MemoryConnector::new(broker, "warehouse"), config)?;

    scheduler.subscribe(
        "orders",
        Callback::json(|order: &Order, lane: Lane| {
            if order.quantity == 0 {
                return Err(format!("order {} has no items", order.id).into());
            }
            println!("[{lane}] shipping order {} ({} items)", order.id, order.quantity);
            Ok(())
        })
        .on_error(|order: Option<&Order>, err: &CallbackError| {
            ErrorAction::Republish(FailedOrder {
                id: order.map(|o| o.id),
                reason: err.to_string(),
            })
        }),
    )?;
    scheduler.subscribe_errors("orders", |failed: &FailedOrder| {
        println!("[ERROR] order {:?} failed: {}", failed.id, failed.reason);
        Ok(())
    })?;

    for id in 1..=6 {
        let lane = if id % 3 == 0 { Lane::Priority } else { Lane::Normal };
        let quantity = if id == 4 { 0 } else { id as u32 };
        scheduler.publish_keyed(id.to_string(), &Order { id, quantity }, "orders", lane)?;
    }

    println!("-- adaptive poll");
    while scheduler.poll()? {}

    println!("-- replaying error lane");
    scheduler.poll_all_errors()?;

    scheduler.commit()?;
    scheduler.stop();
    Ok(())
}
