//! Scheduled units of plugin work.
//!
//! # Kinds
//!
//! | Kind | Created | Reschedule policy | Weight |
//! |------|---------|-------------------|--------|
//! | Collector | first tenant of a collector plugin | every `period` seconds, phase staggered by a name seed | full capacity |
//! | Exporter | per item of an owner | next point on the item's interval grid | 1 |
//! | Starter / Stopper | plugin becomes used / unused | one-shot | full capacity |
//! | Watcher | per owner and plugin on each update | one-shot per batch | full capacity |
//! | Configurator | first tenant of a configurable plugin | one-shot | full capacity |
//!
//! Tasks falling on the same second are ordered by a fixed nanosecond offset
//! per kind (configurator first, stopper last), then by creation order.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rustc_hash::{FxHashMap, FxHasher};
use serde_json::Value;

use super::heap::HeapArena;
use super::messages::{Request, ResultWriter};
use crate::itemutil;
use crate::plugin::Plugin;
use crate::{Error, Result};

const PRIORITY_CONFIGURATOR_NS: u32 = 0;
const PRIORITY_STARTER_NS: u32 = 1;
const PRIORITY_COLLECTOR_NS: u32 = 2;
const PRIORITY_WATCHER_NS: u32 = 3;
const PRIORITY_EXPORTER_NS: u32 = 4;
const PRIORITY_STOPPER_NS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Position of a plugin agent in the manager's agent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(pub(crate) usize);

impl PluginId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A recurring request of an owner, bound to exactly one exporter task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub itemid: u64,
    pub key: String,
    pub delay: String,
    pub unsupported: bool,
    pub updated: DateTime<Utc>,
}

pub enum TaskKind {
    Collector {
        seed: u64,
        /// Set once the first run has been placed on the period grid.
        aligned: bool,
    },
    Exporter {
        item: Item,
        owner_id: u64,
        sink: Arc<dyn ResultWriter>,
    },
    Starter,
    Stopper,
    Watcher {
        requests: Vec<Request>,
        sink: Arc<dyn ResultWriter>,
    },
    Configurator {
        options: Value,
    },
}

impl TaskKind {
    /// Collector task for a plugin named `name`.
    pub fn collector(name: &str) -> Self {
        let mut hasher = FxHasher::default();
        name.hash(&mut hasher);
        Self::Collector {
            seed: hasher.finish(),
            aligned: false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Collector { .. } => "collector",
            Self::Exporter { .. } => "exporter",
            Self::Starter => "starter",
            Self::Stopper => "stopper",
            Self::Watcher { .. } => "watcher",
            Self::Configurator { .. } => "configurator",
        }
    }

    fn priority_ns(&self) -> u32 {
        match self {
            Self::Configurator { .. } => PRIORITY_CONFIGURATOR_NS,
            Self::Starter => PRIORITY_STARTER_NS,
            Self::Collector { .. } => PRIORITY_COLLECTOR_NS,
            Self::Watcher { .. } => PRIORITY_WATCHER_NS,
            Self::Exporter { .. } => PRIORITY_EXPORTER_NS,
            Self::Stopper => PRIORITY_STOPPER_NS,
        }
    }
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exporter { item, owner_id, .. } => f
                .debug_struct("Exporter")
                .field("item", item)
                .field("owner_id", owner_id)
                .finish(),
            Self::Watcher { requests, .. } => f
                .debug_struct("Watcher")
                .field("requests", &requests.len())
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug)]
pub struct Task {
    id: TaskId,
    plugin: PluginId,
    scheduled: DateTime<Utc>,
    active: bool,
    running: bool,
    pub(crate) index: Option<usize>,
    kind: TaskKind,
}

fn at_second(seconds: i64, nanos: u32) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, nanos)
        .single()
        .ok_or_else(|| Error::Other(format!("timestamp {seconds} out of range")))
}

impl Task {
    fn new(id: TaskId, plugin: PluginId, kind: TaskKind) -> Self {
        Self {
            id,
            plugin,
            scheduled: DateTime::<Utc>::MIN_UTC,
            active: true,
            running: false,
            index: None,
            kind,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn plugin(&self) -> PluginId {
        self.plugin
    }

    pub fn scheduled(&self) -> DateTime<Utc> {
        self.scheduled
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Dispatched and not finished yet.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_queued(&self) -> bool {
        self.index.is_some()
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut TaskKind {
        &mut self.kind
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Capacity units taken while the task runs.
    pub fn weight(&self, capacity: usize) -> usize {
        match self.kind {
            TaskKind::Exporter { .. } => 1,
            _ => capacity,
        }
    }

    /// Whether a finished task goes back to the queue.
    pub fn is_recurring(&self) -> bool {
        match &self.kind {
            TaskKind::Collector { .. } => true,
            TaskKind::Exporter { item, .. } => item.itemid != 0,
            _ => false,
        }
    }

    /// Computes the next run time relative to `now`.
    pub(crate) fn reschedule(&mut self, now: DateTime<Utc>, plugin: &dyn Plugin) -> Result<()> {
        let priority = self.kind.priority_ns();

        self.scheduled = match &mut self.kind {
            TaskKind::Collector { seed, aligned } => {
                let period = plugin.as_collector().map_or(0, |c| c.period());
                if period == 0 {
                    return Err(Error::Other(format!(
                        "plugin {} returned invalid collection period",
                        plugin.name()
                    )));
                }
                let period = i64::from(period);

                let next = self.scheduled + chrono::Duration::seconds(period);
                if *aligned && next > now {
                    next
                } else {
                    let seconds = now.timestamp();
                    let phase = (*seed % period as u64) as i64;
                    let mut next = period * seconds.div_euclid(period) + phase;
                    while next <= seconds {
                        next += period;
                    }
                    *aligned = true;
                    at_second(next, priority)?
                }
            }
            TaskKind::Exporter { item, .. } if item.itemid != 0 => {
                let next = itemutil::next_check(&item.delay, item.unsupported, now)?;
                at_second(next.timestamp(), priority)?
            }
            _ => at_second(now.timestamp(), priority)?,
        };
        Ok(())
    }

    /// Like [`reschedule`](Self::reschedule) but discards the previous run
    /// time, used after the system clock moved.
    pub(crate) fn realign(&mut self, now: DateTime<Utc>, plugin: &dyn Plugin) -> Result<()> {
        if let TaskKind::Collector { aligned, .. } = &mut self.kind {
            *aligned = false;
        }
        self.reschedule(now, plugin)
    }
}

/// Owner of all live tasks.
#[derive(Debug, Default)]
pub struct TaskArena {
    tasks: FxHashMap<TaskId, Task>,
    next_id: u64,
}

impl TaskArena {
    pub fn insert(&mut self, plugin: PluginId, kind: TaskKind) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.tasks.insert(id, Task::new(id, plugin, kind));
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        self.tasks.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}

impl HeapArena<TaskId> for TaskArena {
    type Key = (DateTime<Utc>, TaskId);

    fn heap_key(&self, id: TaskId) -> Self::Key {
        let scheduled = self
            .tasks
            .get(&id)
            .map_or(DateTime::<Utc>::MAX_UTC, |t| t.scheduled);
        (scheduled, id)
    }

    fn set_heap_index(&mut self, id: TaskId, index: Option<usize>) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.index = index;
        }
    }
}
