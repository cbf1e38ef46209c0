//! Core LaneScheduler implementation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use lane_broker::Waker;
use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::dispatch::process;
use super::heartbeat::{send_heartbeat, HeartbeatWorker};
use super::state::{CoreGuard, SchedulerCore, SharedCore};
use crate::callback::{Callback, Dispatch, HandlerError};
use crate::codec;
use crate::config::SchedulerConfig;
use crate::connections::{ConnectionSet, Connector, Consumers, Outbound};
use crate::error::{Result, SchedulerError};
use crate::lane::{combine, Lane};

/// Lane-aware consumer and producer over one [`ConnectionSet`].
///
/// Every base topic is spread over three physical topics, one per [`Lane`].
/// Subscribers listen on the NORMAL and PRIORITY lanes of a topic; failures
/// their error handlers choose to republish land on its ERROR lane.
///
/// The host drives consumption by calling one of the polling operations in
/// its own loop:
///
/// - [`poll`](Self::poll): one adaptive cycle, PRIORITY before NORMAL
/// - [`poll_all_lanes`](Self::poll_all_lanes): drain every lane until quiet
/// - [`poll_all_errors`](Self::poll_all_errors): replay the ERROR lane from
///   the earliest offset
///
/// All operations take `&self`. Operations touching inbound connections are
/// serialized by one lock, so the scheduler can be shared across threads.
/// Callbacks run while that lock is held: from a callback, only the publishing
/// operations, [`stop`](Self::stop) and the heartbeat switches may be called.
/// Anything else fails with [`SchedulerError::Reentrant`].
///
/// # Example
///
/// ```rust
/// use lane_broker::memory::MemoryBroker;
/// use lane_scheduler::{Callback, Lane, LaneScheduler, MemoryConnector, SchedulerConfig};
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize, Deserialize)]
/// struct Order {
///     id: u64,
/// }
///
/// # fn main() -> lane_scheduler::Result<()> {
/// let broker = MemoryBroker::new();
/// let scheduler = LaneScheduler::connect(
///     &MemoryConnector::new(broker, "shop"),
///     SchedulerConfig::low_latency().with_drain_timeout(Duration::from_millis(50)),
/// )?;
///
/// scheduler.subscribe(
///     "orders",
///     Callback::json(|order: &Order, lane: Lane| {
///         println!("order {} on {lane}", order.id);
///         Ok(())
///     }),
/// )?;
/// scheduler.publish(&Order { id: 1 }, "orders", Lane::Priority)?;
/// scheduler.poll_all_lanes()?;
/// scheduler.stop();
/// # Ok(())
/// # }
/// ```
pub struct LaneScheduler {
    core: SharedCore,
    /// Thread currently holding the scheduler lock inside `run`
    owner: Mutex<Option<ThreadId>>,
    outbound: Outbound,
    wakers: Vec<(Lane, Waker)>,
    heartbeat: Mutex<Option<HeartbeatWorker>>,
    stopping: AtomicBool,
    config: SchedulerConfig,
}

impl LaneScheduler {
    /// Create a scheduler over `connections`.
    ///
    /// Starts the background heartbeat when the configuration sets an interval.
    pub fn new(connections: ConnectionSet, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let ConnectionSet {
            normal,
            priority,
            error,
            producer,
        } = connections;
        let wakers = vec![
            (Lane::Normal, normal.waker()),
            (Lane::Priority, priority.waker()),
            (Lane::Error, error.waker()),
        ];

        let scheduler = Self {
            core: Arc::new(Mutex::new(SchedulerCore::new(Consumers::new(
                normal, priority, error,
            )))),
            owner: Mutex::new(None),
            outbound: Outbound::new(producer),
            wakers,
            heartbeat: Mutex::new(None),
            stopping: AtomicBool::new(false),
            config,
        };

        if scheduler.config.background_heartbeat_interval.is_some() {
            scheduler.enable_background_heartbeat()?;
        }

        tracing::info!(
            "Lane scheduler started (auto_commit: {})",
            scheduler.config.auto_commit
        );
        Ok(scheduler)
    }

    /// Create a scheduler with connections opened by `connector`.
    pub fn connect<C: Connector + ?Sized>(connector: &C, config: SchedulerConfig) -> Result<Self> {
        Self::new(ConnectionSet::from_connector(connector)?, config)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Subscribe `callback` to the NORMAL and PRIORITY lanes of `topic`.
    ///
    /// Either both lanes are subscribed or, on error, neither is.
    pub fn subscribe<T: 'static>(&self, topic: &str, callback: Callback<T>) -> Result<()> {
        let callback: Arc<dyn Dispatch> = Arc::new(callback);
        self.run(|core| core.subscribe_lanes(topic, &[Lane::Normal, Lane::Priority], callback))
    }

    /// Subscribe a JSON handler to the ERROR lane of `topic`.
    pub fn subscribe_errors<T, F>(&self, topic: &str, on_message: F) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        F: Fn(&T) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_errors_with(topic, Callback::json(move |value: &T, _| on_message(value)))
    }

    /// Subscribe `callback` to the ERROR lane of `topic`.
    pub fn subscribe_errors_with<T: 'static>(&self, topic: &str, callback: Callback<T>) -> Result<()> {
        let callback: Arc<dyn Dispatch> = Arc::new(callback);
        self.run(|core| core.subscribe(topic, Lane::Error, callback))
    }

    /// Publish `payload` as JSON to `lane` of `topic`.
    pub fn publish<T: Serialize + ?Sized>(&self, payload: &T, topic: &str, lane: Lane) -> Result<()> {
        self.send(None, payload, topic, lane)
    }

    /// Publish `payload` as JSON to `lane` of `topic` with a record key.
    pub fn publish_keyed<K, T>(&self, key: K, payload: &T, topic: &str, lane: Lane) -> Result<()>
    where
        K: AsRef<[u8]>,
        T: Serialize + ?Sized,
    {
        self.send(Some(key.as_ref()), payload, topic, lane)
    }

    fn send<T: Serialize + ?Sized>(
        &self,
        key: Option<&[u8]>,
        payload: &T,
        topic: &str,
        lane: Lane,
    ) -> Result<()> {
        tracing::debug!("Publishing to {} ({})", topic, lane);
        let bytes = codec::encode(payload)?;
        self.outbound.send(combine(topic, lane).as_str(), key, &bytes)
    }

    /// Run one adaptive poll cycle.
    ///
    /// PRIORITY is polled first, briefly when the previous cycle saw traffic
    /// and for the idle timeout otherwise. If PRIORITY delivered records,
    /// NORMAL only gets a heartbeat this cycle; otherwise NORMAL is polled
    /// briefly. The ERROR lane is never polled here.
    ///
    /// Returns whether any record was received.
    pub fn poll(&self) -> Result<bool> {
        let config = &self.config;
        self.run(|core| {
            let timeout = if core.had_messages {
                config.busy_poll_timeout
            } else {
                config.idle_poll_timeout
            };

            let priority = process(core, &self.outbound, Lane::Priority, timeout, config.auto_commit)?;
            let normal = if priority {
                send_heartbeat(
                    core.consumers.get_mut(Lane::Normal),
                    Lane::Normal,
                    config.heartbeat_poll_timeout,
                )?;
                false
            } else {
                process(
                    core,
                    &self.outbound,
                    Lane::Normal,
                    config.busy_poll_timeout,
                    config.auto_commit,
                )?
            };

            core.had_messages = priority || normal;
            Ok(core.had_messages)
        })
    }

    /// Poll every lane in turn until a full pass receives nothing.
    pub fn poll_all_lanes(&self) -> Result<()> {
        let config = &self.config;
        self.run(|core| {
            let mut passes = 0usize;
            loop {
                passes += 1;
                self.yield_lock(core)?;
                let mut had_messages = false;
                for lane in Lane::ALL {
                    self.ensure_running()?;
                    had_messages |=
                        process(core, &self.outbound, lane, config.drain_poll_timeout, config.auto_commit)?;
                }
                if !had_messages {
                    break;
                }
            }
            tracing::debug!("All lanes drained after {} pass(es)", passes);
            core.had_messages = false;
            Ok(())
        })
    }

    /// Replay the ERROR lane from the earliest available offset until it is quiet.
    ///
    /// Waits for the ERROR connection to receive a partition assignment first.
    /// That wait has no deadline: with no ERROR subscription, or a broker that
    /// never assigns, this only returns once [`stop`](Self::stop) is called.
    pub fn poll_all_errors(&self) -> Result<()> {
        let config = &self.config;
        self.run(|core| {
            if core.consumers.get(Lane::Error).subscription().is_empty() {
                tracing::warn!("No ERROR lane subscriptions, waiting for an assignment that may never come");
            }

            loop {
                self.yield_lock(core)?;
                let conn = core.consumers.get_mut(Lane::Error);
                if !conn.assignment().is_empty() {
                    break;
                }
                // Records fetched here are read again after the seek below
                match conn.poll(config.busy_poll_timeout) {
                    Ok(_) => {}
                    Err(e) if e.is_interrupted() => {}
                    Err(source) => {
                        return Err(SchedulerError::Connection {
                            lane: Lane::Error,
                            source,
                        })
                    }
                }
            }

            let conn = core.consumers.get_mut(Lane::Error);
            let assigned = conn.assignment();
            tracing::debug!("Seeking {} ERROR partition(s) to the beginning", assigned.len());
            conn.seek_to_beginning(&assigned)
                .map_err(|source| SchedulerError::Connection {
                    lane: Lane::Error,
                    source,
                })?;

            loop {
                self.yield_lock(core)?;
                if !process(
                    core,
                    &self.outbound,
                    Lane::Error,
                    config.drain_poll_timeout,
                    config.auto_commit,
                )? {
                    break;
                }
            }
            core.had_messages = false;
            Ok(())
        })
    }

    /// Synchronously commit the positions of every lane.
    pub fn commit(&self) -> Result<()> {
        self.run(|core| {
            tracing::debug!("Committing all lanes");
            for lane in Lane::ALL {
                match core.consumers.get_mut(lane).commit() {
                    Ok(()) => {}
                    Err(e) if e.is_interrupted() => {
                        tracing::debug!("Commit on {} lane interrupted", lane);
                    }
                    Err(source) => return Err(SchedulerError::CommitFailed { lane, source }),
                }
            }
            Ok(())
        })
    }

    /// Send a heartbeat on every lane's connection.
    pub fn send_heartbeat(&self) -> Result<()> {
        let timeout = self.config.heartbeat_poll_timeout;
        self.run(|core| {
            for lane in Lane::ALL {
                send_heartbeat(core.consumers.get_mut(lane), lane, timeout)?;
            }
            Ok(())
        })
    }

    /// Start the background heartbeat, replacing a running one.
    ///
    /// Fails with [`SchedulerError::HeartbeatNotConfigured`] when the
    /// configuration has no heartbeat interval.
    pub fn enable_background_heartbeat(&self) -> Result<()> {
        let every = self
            .config
            .background_heartbeat_interval
            .ok_or(SchedulerError::HeartbeatNotConfigured)?;

        let mut slot = self.heartbeat.lock();
        self.ensure_running()?;
        if let Some(previous) = slot.take() {
            previous.shutdown();
        }
        *slot = Some(HeartbeatWorker::spawn(
            Arc::clone(&self.core),
            every,
            self.config.heartbeat_poll_timeout,
        )?);
        Ok(())
    }

    /// Stop the background heartbeat if it is running.
    pub fn disable_background_heartbeat(&self) -> Result<()> {
        if self.config.background_heartbeat_interval.is_none() {
            return Err(SchedulerError::HeartbeatNotConfigured);
        }
        self.shutdown_heartbeat();
        Ok(())
    }

    pub fn is_background_heartbeat_enabled(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .is_some_and(HeartbeatWorker::is_running)
    }

    /// Topics the connection of `lane` is subscribed to.
    pub fn subscriptions(&self, lane: Lane) -> Result<BTreeSet<String>> {
        self.run(|core| Ok(core.consumers.get(lane).subscription()))
    }

    /// Whether the scheduler was stopped, explicitly or after a commit failure.
    pub fn is_stopped(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Shut down: stop the background heartbeat, interrupt and close every
    /// inbound connection, then close the outbound connection.
    ///
    /// Safe to call more than once, from another thread while a poll is
    /// blocking, and from inside a callback. In the last case the connections
    /// are closed as soon as the running operation returns. Every later
    /// operation fails with [`SchedulerError::Stopped`].
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping lane scheduler");

        self.shutdown_heartbeat();
        for (lane, waker) in &self.wakers {
            tracing::trace!("Waking {} lane", lane);
            waker.wake();
        }

        if self.held_by_current_thread() {
            tracing::debug!("Stop requested from a callback, closing once the operation returns");
            return;
        }
        self.close(self.core.lock());
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(SchedulerError::Stopped)
        } else {
            Ok(())
        }
    }

    fn held_by_current_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    fn lock(&self) -> Result<CoreGuard<'_>> {
        if self.held_by_current_thread() {
            return Err(SchedulerError::Reentrant);
        }
        self.ensure_running()?;
        let core = self.core.lock();
        if core.stopped {
            return Err(SchedulerError::Stopped);
        }
        Ok(core)
    }

    /// Run `op` under the scheduler lock.
    ///
    /// A commit failure shuts everything down, as does a `stop` issued from a
    /// callback while `op` ran. The lock is released fairly so a waiting
    /// background heartbeat goes before this thread's next operation.
    fn run<R>(&self, op: impl FnOnce(&mut CoreGuard<'_>) -> Result<R>) -> Result<R> {
        let mut core = self.lock()?;
        let result = {
            let _owner = OwnerMark::enter(&self.owner);
            op(&mut core)
        };

        if let Err(SchedulerError::CommitFailed { lane, source }) = &result {
            tracing::warn!("Offset commit failed on {} lane, stopping: {}", lane, source);
            self.stopping.store(true, Ordering::SeqCst);
        }
        if self.is_stopped() {
            self.close(core);
            self.shutdown_heartbeat();
        } else {
            MutexGuard::unlock_fair(core);
        }
        result
    }

    /// Let threads waiting for the lock take a turn, then check for a stop.
    fn yield_lock(&self, core: &mut CoreGuard<'_>) -> Result<()> {
        {
            let _released = OwnerMark::leave(&self.owner);
            MutexGuard::unlocked_fair(core, || {});
        }
        self.ensure_running()?;
        if core.stopped {
            return Err(SchedulerError::Stopped);
        }
        Ok(())
    }

    /// Close the inbound connections under `core`, then the outbound one.
    fn close(&self, mut core: CoreGuard<'_>) {
        if !core.stopped {
            core.close_all();
        }
        drop(core);
        self.outbound.close();
    }

    fn shutdown_heartbeat(&self) {
        let worker = self.heartbeat.lock().take();
        if let Some(worker) = worker {
            worker.shutdown();
        }
    }
}

/// Marks the current thread as the holder of the scheduler lock.
struct OwnerMark<'a> {
    owner: &'a Mutex<Option<ThreadId>>,
    restore: Option<ThreadId>,
}

impl<'a> OwnerMark<'a> {
    fn enter(owner: &'a Mutex<Option<ThreadId>>) -> Self {
        Self::set(owner, Some(thread::current().id()))
    }

    /// Clear the mark while the lock is briefly given up.
    fn leave(owner: &'a Mutex<Option<ThreadId>>) -> Self {
        Self::set(owner, None)
    }

    fn set(owner: &'a Mutex<Option<ThreadId>>, value: Option<ThreadId>) -> Self {
        let restore = std::mem::replace(&mut *owner.lock(), value);
        Self { owner, restore }
    }
}

impl Drop for OwnerMark<'_> {
    fn drop(&mut self) {
        *self.owner.lock() = self.restore;
    }
}

impl Drop for LaneScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LaneScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaneScheduler")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
