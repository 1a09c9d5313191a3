//! Capacity-aware plugin task scheduler.
//!
//! # Architecture
//!
//! - [`Manager`]: state machine holding agents, tasks and owners
//! - [`SchedulerService`]: async loop owning the manager, driven by ticks and
//!   its mailbox
//! - [`SchedulerHandle`]: producer side of the mailbox
//!
//! Work is dispatched earliest-deadline-first across plugins, one task at a
//! time, as long as the plugin has free capacity for the task's weight.

mod agent;
mod handle;
mod heap;
mod job;
mod manager;
mod messages;
mod metrics;
mod owner;
mod queues;
mod service;
mod task;

pub use agent::PluginAgent;
pub use handle::{SchedulerHandle, SendError};
pub use heap::{HeapArena, IndexedHeap};
pub use job::{Job, JobAction};
pub use manager::Manager;
pub use messages::{
    DIRECT_OWNER_ID, ItemResult, ManagerMessage, Request, ResultWriter, TaskOutcome, TaskReport,
    UpdateRequest,
};
pub use metrics::SchedulerStats;
pub use owner::{DIRECT_OWNER_EXPIRY_HOURS, Owner, OwnerKind};
pub use service::SchedulerService;
pub use task::{Item, PluginId, Task, TaskArena, TaskId, TaskKind};
