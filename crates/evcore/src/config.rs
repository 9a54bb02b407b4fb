// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.
//!
//! Small, explicit config surface rather than a cascade of builder
//! methods or environment-variable lookups: the core has no on-disk or
//! environment state of its own (see the external-interfaces contract),
//! so everything a caller can tune is a field here.

use std::time::Duration;

/// Tunables for a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone)]
pub struct Config {
    /// Max epoll events drained per `poll_once` call. Matches the batch
    /// size the teacher reactor uses.
    pub fd_watcher_batch: usize,

    /// Default timeout for `shutdown`'s at-shutdown hook barrier.
    pub shutdown_timeout: Duration,

    /// Cycle budget for `Scheduler::run_until` before it gives up and
    /// returns `RuntimeError::Stalled`. Only consulted by the test-harness
    /// driver, never by `run_forever`.
    pub stall_budget_cycles: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fd_watcher_batch: 64,
            shutdown_timeout: Duration::from_secs(10),
            stall_budget_cycles: 1_000_000,
        }
    }
}
