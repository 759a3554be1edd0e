//! Job scheduling and agent assignment for Cadence.
//!
//! The [`Scheduler`] wires every service over a shared
//! [`SchedulerContext`]: the agent registry, the pending job pool, the
//! assignment dispatcher, the elastic agent orchestrator, the stage
//! scheduler with its checkers, the schedule queue, and the hang monitor.

pub mod agents;
pub mod checkers;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod elastic;
pub mod events;
pub mod hang;
pub mod locks;
pub mod matcher;
pub mod pause;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod stages;
pub mod timers;

#[cfg(test)]
mod test_support;

pub use config::SchedulerConfig;
pub use context::{SchedulerContext, SchedulerContextBuilder};
pub use scheduler::Scheduler;
pub use timers::SchedulerTimers;
