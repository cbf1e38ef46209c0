//! Session keepalive for inbound connections.
//!
//! A heartbeat pauses every assigned partition, polls once and resumes them.
//! The broker sees a live session without any record being consumed.
//!
//! [`HeartbeatWorker`] issues heartbeats on a timer from a dedicated thread
//! running a single-threaded tokio runtime. Each tick waits for the scheduler
//! lock. Foreground operations release it fairly, so a waiting tick gets the
//! lock between two poll cycles even when the host polls in a tight loop.

use std::collections::BTreeSet;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lane_broker::{ConsumerConnection, Record, TopicPartition};
use parking_lot::MutexGuard;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::time::{interval, MissedTickBehavior};

use super::dispatch;
use super::state::SharedCore;
use crate::error::{Result, SchedulerError};
use crate::lane::Lane;

/// Send one heartbeat on `conn`. A connection without assignment is left alone.
pub(crate) fn send_heartbeat(
    conn: &mut dyn ConsumerConnection,
    lane: Lane,
    timeout: Duration,
) -> Result<()> {
    let assigned = conn.assignment();
    if assigned.is_empty() {
        tracing::trace!("No assignment on {} lane, skipping heartbeat", lane);
        return Ok(());
    }
    tracing::debug!("Sending heartbeat on {} lane", lane);

    let connection_error = |source| SchedulerError::Connection { lane, source };
    conn.pause(&assigned).map_err(connection_error)?;
    let polled = conn.poll(timeout);

    // The poll may have rebalanced; only resume what is still ours
    let still_assigned: BTreeSet<TopicPartition> =
        assigned.intersection(&conn.assignment()).cloned().collect();
    let resumed = conn.resume(&still_assigned).map_err(connection_error);

    match polled {
        Ok(records) if !records.is_empty() => rewind(conn, lane, &records)?,
        Ok(_) => {}
        Err(e) if e.is_interrupted() => {
            tracing::debug!("Heartbeat on {} lane interrupted", lane);
        }
        Err(source) => return Err(connection_error(source)),
    }
    resumed
}

/// Seek back over records a heartbeat poll fetched from newly assigned partitions.
fn rewind(conn: &mut dyn ConsumerConnection, lane: Lane, records: &[Record]) -> Result<()> {
    tracing::warn!(
        "Heartbeat on {} lane fetched {} record(s) after a rebalance, rewinding",
        lane,
        records.len()
    );
    dispatch::rewind(conn, lane, records)
}

/// How long a tick waits for the scheduler lock before checking for shutdown.
const LOCK_WAIT_SLICE: Duration = Duration::from_millis(20);

/// Background thread sending heartbeats on every lane at a fixed interval.
pub(crate) struct HeartbeatWorker {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatWorker {
    pub fn spawn(
        core: SharedCore,
        every: Duration,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = thread::Builder::new()
            .name("lane-heartbeat".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("Failed to create tokio runtime for heartbeat worker: {}", e);
                        return;
                    }
                };
                rt.block_on(heartbeat_loop(core, every, poll_timeout, shutdown_rx));
            })
            .map_err(|e| SchedulerError::HeartbeatWorker(e.to_string()))?;

        tracing::debug!("Background heartbeat started ({:?})", every);
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the worker and wait for its thread to exit.
    pub fn shutdown(mut self) {
        self.signal();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Background heartbeat thread panicked");
            }
        }
        tracing::debug!("Background heartbeat stopped");
    }

    fn signal(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for HeartbeatWorker {
    fn drop(&mut self) {
        self.signal();
    }
}

async fn heartbeat_loop(
    core: SharedCore,
    every: Duration,
    poll_timeout: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticks.tick().await;

    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if !beat(&core, poll_timeout, &mut shutdown_rx) {
                    break;
                }
            }
            _ = &mut shutdown_rx => break,
        }
    }
}

/// One timer tick. Returns false once the worker should exit.
fn beat(
    core: &SharedCore,
    poll_timeout: Duration,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    let mut core = loop {
        if let Some(core) = core.try_lock_for(LOCK_WAIT_SLICE) {
            break core;
        }
        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
            return false;
        }
        tracing::trace!("Scheduler busy, still waiting to send background heartbeat");
    };
    if core.stopped {
        return false;
    }

    for lane in Lane::ALL {
        if let Err(e) = send_heartbeat(core.consumers.get_mut(lane), lane, poll_timeout) {
            tracing::warn!("Background heartbeat failed: {}", e);
        }
    }
    MutexGuard::unlock_fair(core);
    true
}
