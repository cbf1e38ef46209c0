//! The lane scheduler and its internals.
//!
//! - `core`: [`LaneScheduler`] and its public API
//! - `state`: connection and registry state guarded by the scheduler lock
//! - `dispatch`: polls one lane and feeds records to callbacks
//! - `heartbeat`: paused polls that keep idle sessions alive, and the
//!   background worker that issues them on a timer
//!
//! Every operation that touches an inbound connection runs under one mutex
//! around [`state::SchedulerCore`]. The outbound connection has its own lock,
//! so callbacks can publish while a poll holds the scheduler lock.

mod core;
mod dispatch;
mod heartbeat;
mod state;

pub use self::core::LaneScheduler;
