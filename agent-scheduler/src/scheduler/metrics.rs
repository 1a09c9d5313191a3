//! Scheduler statistics.

use serde::{Deserialize, Serialize};

/// Point-in-time view of the scheduler, returned by
/// [`SchedulerHandle::stats`](super::SchedulerHandle::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Registered plugins.
    pub plugins: usize,
    /// Plugins referenced by at least one owner.
    pub active_plugins: usize,
    /// Plugins currently in the dispatch queue.
    pub queued_plugins: usize,
    /// Tasks waiting in plugin queues.
    pub pending_tasks: usize,
    /// Tasks dispatched and not finished yet.
    pub running_tasks: usize,
    pub owners: usize,
    /// Recurring items across all owners.
    pub items: usize,
    pub updates_processed: u64,
    pub tasks_dispatched: u64,
    pub tasks_finished: u64,
    pub tasks_failed: u64,
    /// Full queue rebuilds caused by clock changes.
    pub queue_rebuilds: u64,
}

/// Running totals kept by the manager.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub updates_processed: u64,
    pub tasks_dispatched: u64,
    pub tasks_finished: u64,
    pub tasks_failed: u64,
    pub queue_rebuilds: u64,
}
