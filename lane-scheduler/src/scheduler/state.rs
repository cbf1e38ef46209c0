//! State guarded by the scheduler lock.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::callback::Dispatch;
use crate::connections::Consumers;
use crate::error::{Result, SchedulerError};
use crate::lane::{combine, Lane};
use crate::registry::CallbackRegistry;

/// The scheduler lock, shared with the background heartbeat.
pub(crate) type SharedCore = Arc<Mutex<SchedulerCore>>;

pub(crate) type CoreGuard<'a> = MutexGuard<'a, SchedulerCore>;

pub(crate) struct SchedulerCore {
    pub consumers: Consumers,
    pub registry: CallbackRegistry,
    /// Whether the last poll cycle received any record
    pub had_messages: bool,
    pub stopped: bool,
}

impl SchedulerCore {
    pub fn new(consumers: Consumers) -> Self {
        Self {
            consumers,
            registry: CallbackRegistry::new(),
            had_messages: true,
            stopped: false,
        }
    }

    /// Register `callback` for `base_topic` on `lane` and add the combined
    /// topic to that lane's subscription.
    pub fn subscribe(
        &mut self,
        base_topic: &str,
        lane: Lane,
        callback: Arc<dyn Dispatch>,
    ) -> Result<()> {
        self.subscribe_lanes(base_topic, &[lane], callback)
    }

    /// Subscribe `callback` on every lane in `lanes`, or on none of them.
    ///
    /// Connections are updated first. If one fails, the subscriptions already
    /// changed are put back and nothing is registered.
    pub fn subscribe_lanes(
        &mut self,
        base_topic: &str,
        lanes: &[Lane],
        callback: Arc<dyn Dispatch>,
    ) -> Result<()> {
        let mut changed: Vec<(Lane, BTreeSet<String>)> = Vec::new();
        for &lane in lanes {
            match self.add_topic(base_topic, lane) {
                Ok(Some(previous)) => changed.push((lane, previous)),
                Ok(None) => {}
                Err(e) => {
                    self.restore_subscriptions(changed);
                    return Err(e);
                }
            }
        }

        for &lane in lanes {
            let combined = self.registry.register(base_topic, lane, Arc::clone(&callback));
            tracing::debug!(
                "Subscribed ({}): {:?}, {} callback(s) on {}",
                lane,
                self.consumers.get(lane).subscription(),
                self.registry.callback_count(combined.as_str()),
                combined
            );
        }
        Ok(())
    }

    /// Add the combined topic to `lane`'s subscription. Returns the previous
    /// subscription when it changed.
    fn add_topic(&mut self, base_topic: &str, lane: Lane) -> Result<Option<BTreeSet<String>>> {
        let conn = self.consumers.get_mut(lane);
        let previous = conn.subscription();
        let mut topics = previous.clone();
        if !topics.insert(combine(base_topic, lane).to_string()) {
            return Ok(None);
        }
        conn.subscribe(&topics)
            .map_err(|source| SchedulerError::Connection { lane, source })?;
        Ok(Some(previous))
    }

    fn restore_subscriptions(&mut self, changed: Vec<(Lane, BTreeSet<String>)>) {
        for (lane, previous) in changed.into_iter().rev() {
            if let Err(e) = self.consumers.get_mut(lane).subscribe(&previous) {
                tracing::warn!("Failed to restore {} lane subscription: {}", lane, e);
            }
        }
    }

    /// Close every inbound connection and mark the scheduler stopped.
    pub fn close_all(&mut self) {
        for lane in Lane::ALL {
            self.consumers.get_mut(lane).close();
        }
        self.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Callback;
    use lane_broker::memory::MemoryBroker;
    use lane_broker::ConsumerConnection;

    fn core(broker: &MemoryBroker) -> SchedulerCore {
        SchedulerCore::new(Consumers::new(
            Box::new(broker.consumer("g-NORMAL")),
            Box::new(broker.consumer("g-PRIORITY")),
            Box::new(broker.consumer("g-ERROR")),
        ))
    }

    fn noop() -> Arc<dyn Dispatch> {
        Arc::new(Callback::json(|_: &serde_json::Value, _| Ok(())))
    }

    #[test]
    fn test_subscribe_is_additive() {
        let broker = MemoryBroker::new();
        let mut core = core(&broker);
        core.subscribe("orders", Lane::Normal, noop()).unwrap();
        core.subscribe("users", Lane::Normal, noop()).unwrap();
        core.subscribe("orders", Lane::Normal, noop()).unwrap();

        let expected: BTreeSet<String> = ["orders-NORMAL", "users-NORMAL"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(core.consumers.get(Lane::Normal).subscription(), expected);
        assert_eq!(core.registry.callback_count("orders-NORMAL"), 2);
        assert!(core.consumers.get(Lane::Error).subscription().is_empty());
    }

    #[test]
    fn test_failed_lane_rolls_back_earlier_lanes() {
        let broker = MemoryBroker::new();
        let mut priority = broker.consumer("g-PRIORITY");
        priority.close();
        let mut core = SchedulerCore::new(Consumers::new(
            Box::new(broker.consumer("g-NORMAL")),
            Box::new(priority),
            Box::new(broker.consumer("g-ERROR")),
        ));
        core.subscribe("users", Lane::Normal, noop()).unwrap();

        let err = core
            .subscribe_lanes("orders", &[Lane::Normal, Lane::Priority], noop())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Connection { lane: Lane::Priority, .. }));

        let expected = BTreeSet::from(["users-NORMAL".to_string()]);
        assert_eq!(core.consumers.get(Lane::Normal).subscription(), expected);
        assert_eq!(core.registry.callback_count("orders-NORMAL"), 0);
        assert_eq!(core.registry.callback_count("users-NORMAL"), 1);
    }

    #[test]
    fn test_close_all_marks_stopped() {
        let broker = MemoryBroker::new();
        let mut core = core(&broker);
        assert!(core.had_messages);
        core.close_all();
        assert!(core.stopped);

        let err = core.subscribe("orders", Lane::Error, noop()).unwrap_err();
        assert!(matches!(err, SchedulerError::Connection { lane: Lane::Error, .. }));
    }
}
