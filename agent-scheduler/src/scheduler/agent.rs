//! Per-plugin scheduling state.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::heap::IndexedHeap;
use super::task::{PluginId, TaskArena, TaskId};
use crate::plugin::{Capabilities, Plugin};

/// Scheduling state of one plugin.
///
/// Holds the plugin's pending tasks ordered by run time and the capacity
/// accounting that limits how many of them run at once. An agent lives for
/// the whole lifetime of the manager; it is *active* while at least one
/// owner references it.
pub struct PluginAgent {
    id: PluginId,
    plugin: Arc<dyn Plugin>,
    capabilities: Capabilities,
    pub(crate) tasks: IndexedHeap<TaskId>,
    capacity: usize,
    used_capacity: usize,
    /// Position in the global plugin queue.
    pub(crate) index: Option<usize>,
    ref_count: usize,
    pub(crate) collector: Option<TaskId>,
    pub(crate) stopper: Option<TaskId>,
    /// A starter has been dispatched since the last stop.
    pub(crate) started: bool,
    /// A configurator has been queued since the agent was last released.
    pub(crate) configured: bool,
    options: Option<Value>,
}

impl PluginAgent {
    pub(crate) fn new(
        id: PluginId,
        plugin: Arc<dyn Plugin>,
        capacity: usize,
        options: Option<Value>,
    ) -> Self {
        let capabilities = Capabilities::of(plugin.as_ref());
        Self {
            id,
            plugin,
            capabilities,
            tasks: IndexedHeap::new(),
            capacity,
            used_capacity: 0,
            index: None,
            ref_count: 0,
            collector: None,
            stopper: None,
            started: false,
            configured: false,
            options,
        }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn plugin(&self) -> &Arc<dyn Plugin> {
        &self.plugin
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_capacity(&self) -> usize {
        self.used_capacity
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Configured option set handed to the configurator.
    pub fn options(&self) -> Option<&Value> {
        self.options.as_ref()
    }

    /// Referenced by at least one owner.
    pub fn is_active(&self) -> bool {
        self.ref_count > 0
    }

    /// Present in the global plugin queue.
    pub fn is_queued(&self) -> bool {
        self.index.is_some()
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn peek_task(&self) -> Option<TaskId> {
        self.tasks.peek()
    }

    pub(crate) fn pop_task(&mut self, arena: &mut TaskArena) -> Option<TaskId> {
        self.tasks.pop(arena)
    }

    pub(crate) fn enqueue_task(&mut self, arena: &mut TaskArena, id: TaskId) {
        self.tasks.push(arena, id);
    }

    /// Removes a queued task, returns false if it was not queued.
    pub(crate) fn remove_task(&mut self, arena: &mut TaskArena, id: TaskId) -> bool {
        match arena.get(id).and_then(|t| t.index) {
            Some(index) => self.tasks.remove(arena, index).is_some(),
            None => false,
        }
    }

    /// Re-sorts a queued task after its run time changed.
    pub(crate) fn update_task(&mut self, arena: &mut TaskArena, id: TaskId) {
        if let Some(index) = arena.get(id).and_then(|t| t.index) {
            self.tasks.fix(arena, index);
        }
    }

    /// A task is pending and enough capacity is free to run it.
    pub(crate) fn has_capacity(&self, arena: &TaskArena) -> bool {
        self.peek_task()
            .and_then(|id| arena.get(id))
            .is_some_and(|task| {
                self.capacity.saturating_sub(self.used_capacity) >= task.weight(self.capacity)
            })
    }

    pub(crate) fn reserve_capacity(&mut self, weight: usize) {
        self.used_capacity += weight;
    }

    pub(crate) fn release_capacity(&mut self, weight: usize) {
        if weight > self.used_capacity {
            warn!(
                plugin = %self.name(),
                weight,
                used = self.used_capacity,
                "Releasing more capacity than reserved"
            );
        }
        self.used_capacity = self.used_capacity.saturating_sub(weight);
    }

    pub(crate) fn acquire(&mut self) {
        self.ref_count += 1;
    }

    /// Drops one reference, returns the remaining count.
    pub(crate) fn release(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

impl fmt::Debug for PluginAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginAgent")
            .field("name", &self.name())
            .field("capabilities", &self.capabilities)
            .field("pending", &self.tasks.len())
            .field("capacity", &self.capacity)
            .field("used_capacity", &self.used_capacity)
            .field("ref_count", &self.ref_count)
            .field("queued", &self.is_queued())
            .finish()
    }
}
