//! Configuration for the lane scheduler
//!
//! Timeouts here drive the adaptive polling of [`LaneScheduler`](crate::LaneScheduler).
//! The broker connections themselves are configured by whoever creates them.

use std::time::Duration;

use crate::error::SchedulerError;

/// Configuration for a [`LaneScheduler`](crate::LaneScheduler)
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Commit offsets of a lane after every processed batch
    /// Default: false
    pub auto_commit: bool,

    /// Priority-lane poll timeout after a cycle without messages.
    /// Should stay below the broker's session timeout.
    /// Default: 10 seconds
    pub idle_poll_timeout: Duration,

    /// Poll timeout while traffic is flowing. Kept above zero because some
    /// clients treat a zero timeout specially.
    /// Default: 1 millisecond
    pub busy_poll_timeout: Duration,

    /// Per-lane poll timeout of `poll_all_lanes` and `poll_all_errors`
    /// Default: 10 seconds
    pub drain_poll_timeout: Duration,

    /// Timeout of the paused poll that keeps a session alive
    /// Default: 1 millisecond
    pub heartbeat_poll_timeout: Duration,

    /// Interval of the background heartbeat. When set, the heartbeat starts
    /// together with the scheduler.
    /// Default: None
    pub background_heartbeat_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_commit: false,
            idle_poll_timeout: Duration::from_secs(10),
            busy_poll_timeout: Duration::from_millis(1),
            drain_poll_timeout: Duration::from_secs(10),
            heartbeat_poll_timeout: Duration::from_millis(1),
            background_heartbeat_interval: None,
        }
    }
}

impl SchedulerConfig {
    /// Create a new SchedulerConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a SchedulerConfig that commits after every processed batch
    pub fn auto_commit() -> Self {
        Self {
            auto_commit: true,
            ..Default::default()
        }
    }

    /// Create a SchedulerConfig with short waits, for hosts that run other
    /// work between polls
    pub fn low_latency() -> Self {
        Self {
            idle_poll_timeout: Duration::from_millis(500),
            drain_poll_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.busy_poll_timeout.is_zero() {
            return Err(SchedulerError::Configuration(
                "Busy poll timeout must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_poll_timeout.is_zero() {
            return Err(SchedulerError::Configuration(
                "Heartbeat poll timeout must be greater than 0".to_string(),
            ));
        }

        if self.busy_poll_timeout >= self.idle_poll_timeout {
            return Err(SchedulerError::Configuration(
                "Invalid poll timeouts: busy must be less than idle".to_string(),
            ));
        }

        if self.drain_poll_timeout.is_zero() {
            return Err(SchedulerError::Configuration(
                "Drain poll timeout must be greater than 0".to_string(),
            ));
        }

        if self.background_heartbeat_interval == Some(Duration::ZERO) {
            return Err(SchedulerError::Configuration(
                "Background heartbeat interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    // Builder pattern methods for fluent configuration

    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    pub fn with_poll_timeouts(mut self, busy: Duration, idle: Duration) -> Self {
        self.busy_poll_timeout = busy;
        self.idle_poll_timeout = idle;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_poll_timeout = timeout;
        self
    }

    pub fn with_heartbeat_poll_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_poll_timeout = timeout;
        self
    }

    pub fn with_background_heartbeat(mut self, interval: Duration) -> Self {
        self.background_heartbeat_interval = Some(interval);
        self
    }
}
