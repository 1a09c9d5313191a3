//! Two level scheduling queue.
//!
//! # Architecture
//!
//! ```text
//! plugin_queue (min-heap of agents, keyed by their earliest task)
//!     ├── agent A: tasks (min-heap keyed by run time)
//!     ├── agent B: tasks
//!     └── ...
//! ```
//!
//! An agent sits in `plugin_queue` exactly when it has a pending task it can
//! currently afford. Every mutation of an agent's task heap or capacity goes
//! through [`Queues::refresh_agent`] so this stays true.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::agent::PluginAgent;
use super::heap::{HeapArena, IndexedHeap};
use super::task::{PluginId, TaskArena, TaskId, TaskKind};
use crate::Result;

/// Orders agents by the key of their earliest pending task.
struct AgentKeys<'a> {
    agents: &'a mut [PluginAgent],
    tasks: &'a TaskArena,
}

impl HeapArena<PluginId> for AgentKeys<'_> {
    type Key = (DateTime<Utc>, TaskId);

    fn heap_key(&self, id: PluginId) -> Self::Key {
        match self.agents[id.0].peek_task() {
            Some(task) => self.tasks.heap_key(task),
            None => (DateTime::<Utc>::MAX_UTC, TaskId(u64::MAX)),
        }
    }

    fn set_heap_index(&mut self, id: PluginId, index: Option<usize>) {
        self.agents[id.0].index = index;
    }
}

#[derive(Debug, Default)]
pub(crate) struct Queues {
    pub(crate) agents: Vec<PluginAgent>,
    pub(crate) tasks: TaskArena,
    pub(crate) plugin_queue: IndexedHeap<PluginId>,
}

impl Queues {
    pub(crate) fn new(agents: Vec<PluginAgent>) -> Self {
        Self {
            agents,
            tasks: TaskArena::default(),
            plugin_queue: IndexedHeap::new(),
        }
    }

    pub(crate) fn agent(&self, id: PluginId) -> &PluginAgent {
        &self.agents[id.0]
    }

    pub(crate) fn agent_mut(&mut self, id: PluginId) -> &mut PluginAgent {
        &mut self.agents[id.0]
    }

    /// Brings the agent's membership and position in the plugin queue in
    /// line with its current tasks and capacity.
    pub(crate) fn refresh_agent(&mut self, id: PluginId) {
        let Self {
            agents,
            tasks,
            plugin_queue,
        } = self;

        let dispatchable = agents[id.0].has_capacity(tasks);
        let index = agents[id.0].index;
        let mut keys = AgentKeys { agents, tasks };

        match (index, dispatchable) {
            (Some(index), true) => plugin_queue.fix(&mut keys, index),
            (None, true) => plugin_queue.push(&mut keys, id),
            (Some(index), false) => {
                plugin_queue.remove(&mut keys, index);
            }
            (None, false) => {}
        }
    }

    /// Creates a task, computes its first run time and queues it.
    pub(crate) fn create_task(
        &mut self,
        plugin: PluginId,
        kind: TaskKind,
        now: DateTime<Utc>,
    ) -> Result<TaskId> {
        let handle = self.agents[plugin.0].plugin().clone();
        let id = self.tasks.insert(plugin, kind);

        let scheduled = match self.tasks.get_mut(id) {
            Some(task) => task.reschedule(now, handle.as_ref()),
            None => Ok(()),
        };
        if let Err(e) = scheduled {
            self.tasks.remove(id);
            return Err(e);
        }

        self.agents[plugin.0].enqueue_task(&mut self.tasks, id);
        self.refresh_agent(plugin);
        Ok(id)
    }

    /// Recomputes the run time of a queued task. On failure the task is
    /// deactivated and the error returned.
    pub(crate) fn reschedule_task(&mut self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        let Some(plugin) = self.tasks.get(id).map(|t| t.plugin()) else {
            return Ok(());
        };
        let handle = self.agents[plugin.0].plugin().clone();

        let result = match self.tasks.get_mut(id) {
            Some(task) => task.reschedule(now, handle.as_ref()),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.agents[plugin.0].update_task(&mut self.tasks, id);
                self.refresh_agent(plugin);
                Ok(())
            }
            Err(e) => {
                self.deactivate_task(id);
                Err(e)
            }
        }
    }

    /// Cancels a task. A running task is kept until its finish arrives.
    pub(crate) fn deactivate_task(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        task.deactivate();
        let plugin = task.plugin();
        let running = task.is_running();

        if self.agents[plugin.0].remove_task(&mut self.tasks, id) {
            self.refresh_agent(plugin);
        }
        if !running {
            self.drop_task(id);
        }
    }

    fn drop_task(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.remove(id) {
            let agent = &mut self.agents[task.plugin().0];
            if agent.collector == Some(id) {
                agent.collector = None;
            }
            if agent.stopper == Some(id) {
                agent.stopper = None;
            }
        }
    }

    /// Deactivates everything an agent without tenants still has pending,
    /// and queues a stopper for runners that were started.
    pub(crate) fn release_agent(&mut self, plugin: PluginId, now: DateTime<Utc>) {
        let agent = &mut self.agents[plugin.0];
        let pending = agent.tasks.clear(&mut self.tasks);
        let collector = agent.collector.take();
        let started = agent.capabilities().runner && agent.started;
        agent.configured = false;

        for id in pending {
            if let Some(task) = self.tasks.get_mut(id) {
                task.deactivate();
            }
            self.drop_task(id);
        }
        if let Some(id) = collector {
            self.deactivate_task(id);
        }

        if started {
            match self.create_task(plugin, TaskKind::Stopper, now) {
                Ok(id) => self.agents[plugin.0].stopper = Some(id),
                Err(e) => warn!(plugin = %self.agents[plugin.0].name(), error = %e, "Cannot create stopper task"),
            }
        }
        self.refresh_agent(plugin);
    }

    /// Pops the earliest due task that fits its plugin's free capacity and
    /// marks it running. Returns `None` once nothing is due.
    pub(crate) fn dispatch_next(&mut self, now: DateTime<Utc>) -> Option<TaskId> {
        loop {
            let plugin = self.plugin_queue.peek()?;
            let agent = &self.agents[plugin.0];

            let Some(next) = agent.peek_task().and_then(|id| self.tasks.get(id)) else {
                self.refresh_agent(plugin);
                continue;
            };
            if next.scheduled() > now {
                return None;
            }

            let agent = &mut self.agents[plugin.0];
            let Some(id) = agent.pop_task(&mut self.tasks) else {
                self.refresh_agent(plugin);
                continue;
            };
            let Some(task) = self.tasks.get_mut(id) else {
                self.refresh_agent(plugin);
                continue;
            };

            let weight = task.weight(agent.capacity());
            agent.reserve_capacity(weight);
            match task.kind() {
                TaskKind::Starter => agent.started = true,
                TaskKind::Stopper => agent.started = false,
                _ => {}
            }
            task.set_running(true);
            self.refresh_agent(plugin);
            return Some(id);
        }
    }

    /// Handles a task's completion: returns its capacity and queues its next
    /// run when the task is still wanted.
    pub(crate) fn finish_task(&mut self, id: TaskId, now: DateTime<Utc>) {
        let Some(task) = self.tasks.get_mut(id) else {
            warn!(task = %id, "Finish reported for unknown task");
            return;
        };
        task.set_running(false);

        let plugin = task.plugin();
        let agent = &mut self.agents[plugin.0];
        agent.release_capacity(task.weight(agent.capacity()));

        if agent.is_active() && task.is_active() && task.is_recurring() {
            match task.reschedule(now, agent.plugin().as_ref()) {
                Ok(()) => agent.enqueue_task(&mut self.tasks, id),
                Err(e) => {
                    warn!(plugin = %agent.name(), task = %id, error = %e, "Cannot reschedule task");
                    task.deactivate();
                    self.drop_task(id);
                }
            }
        } else {
            self.drop_task(id);
        }
        self.refresh_agent(plugin);
    }

    /// Recomputes every pending task against `now` and rebuilds the plugin
    /// queue. Tasks that cannot be rescheduled are dropped.
    pub(crate) fn reschedule_all(&mut self, now: DateTime<Utc>) {
        {
            let mut keys = AgentKeys {
                agents: &mut self.agents,
                tasks: &self.tasks,
            };
            self.plugin_queue.clear(&mut keys);
        }

        for index in 0..self.agents.len() {
            let agent = &mut self.agents[index];
            let handle = agent.plugin().clone();
            let pending = agent.tasks.clear(&mut self.tasks);

            for id in pending {
                let result = match self.tasks.get_mut(id) {
                    Some(task) => task.realign(now, handle.as_ref()),
                    None => continue,
                };
                match result {
                    Ok(()) => self.agents[index].enqueue_task(&mut self.tasks, id),
                    Err(e) => {
                        warn!(plugin = %handle.name(), task = %id, error = %e, "Dropping task after clock change");
                        if let Some(task) = self.tasks.get_mut(id) {
                            task.deactivate();
                        }
                        self.drop_task(id);
                    }
                }
            }
            self.refresh_agent(PluginId(index));
        }
        debug!(queued = self.plugin_queue.len(), "Rebuilt plugin queue");
    }

    pub(crate) fn pending_tasks(&self) -> usize {
        self.agents.iter().map(PluginAgent::pending_tasks).sum()
    }

    pub(crate) fn running_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_running()).count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::plugin::{Plugin, Runner};

    struct Service(&'static str);

    impl Plugin for Service {
        fn name(&self) -> &str {
            self.0
        }

        fn as_runner(&self) -> Option<&dyn Runner> {
            Some(self)
        }
    }

    impl Runner for Service {
        fn start(&self) {}
        fn stop(&self) {}
    }

    fn queues(capacities: &[usize]) -> Queues {
        let agents = capacities
            .iter()
            .enumerate()
            .map(|(i, &capacity)| {
                let name = if i == 0 { "first" } else { "second" };
                PluginAgent::new(PluginId(i), Arc::new(Service(name)), capacity, None)
            })
            .collect();
        Queues::new(agents)
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 500_000_000).unwrap()
    }

    #[test]
    fn test_agent_queued_only_when_dispatchable() {
        let mut q = queues(&[1]);
        let now = at(1_700_000_000);
        assert!(!q.agent(PluginId(0)).is_queued());

        let id = q.create_task(PluginId(0), TaskKind::Starter, now).unwrap();
        assert!(q.agent(PluginId(0)).is_queued());

        assert_eq!(q.dispatch_next(now), Some(id));
        assert!(!q.agent(PluginId(0)).is_queued());
        assert_eq!(q.running_tasks(), 1);

        q.finish_task(id, now);
        assert!(q.tasks.is_empty());
        assert!(!q.agent(PluginId(0)).is_queued());
    }

    #[test]
    fn test_dispatch_earliest_plugin_first() {
        let mut q = queues(&[1, 1]);
        let now = at(1_700_000_000);
        let late = q.create_task(PluginId(0), TaskKind::Stopper, now).unwrap();
        let early = q.create_task(PluginId(1), TaskKind::Starter, now).unwrap();
        assert_eq!(q.plugin_queue.len(), 2);

        assert_eq!(q.dispatch_next(now), Some(early));
        assert_eq!(q.dispatch_next(now), Some(late));
        assert_eq!(q.dispatch_next(now), None);
    }

    #[test]
    fn test_release_agent_queues_stopper() {
        let mut q = queues(&[1]);
        let now = at(1_700_000_000);
        q.agent_mut(PluginId(0)).acquire();
        let starter = q.create_task(PluginId(0), TaskKind::Starter, now).unwrap();
        assert_eq!(q.dispatch_next(now), Some(starter));
        q.finish_task(starter, now);
        assert!(q.agent(PluginId(0)).started);
        q.agent_mut(PluginId(0)).release();

        q.release_agent(PluginId(0), now);
        let agent = q.agent(PluginId(0));
        assert_eq!(agent.pending_tasks(), 1);
        assert!(agent.is_queued());
        let stopper = agent.stopper.unwrap();
        assert!(matches!(q.tasks.get(stopper).unwrap().kind(), TaskKind::Stopper));

        assert_eq!(q.dispatch_next(now), Some(stopper));
        q.finish_task(stopper, now);
        assert!(q.agent(PluginId(0)).stopper.is_none());
        assert!(!q.agent(PluginId(0)).started);
        assert!(q.tasks.is_empty());
    }

    #[test]
    fn test_release_unstarted_runner_queues_nothing() {
        let mut q = queues(&[1]);
        let now = at(1_700_000_000);
        q.agent_mut(PluginId(0)).acquire();
        q.create_task(PluginId(0), TaskKind::Starter, now).unwrap();
        q.agent_mut(PluginId(0)).release();

        q.release_agent(PluginId(0), now);
        let agent = q.agent(PluginId(0));
        assert_eq!(agent.pending_tasks(), 0);
        assert!(agent.stopper.is_none());
        assert!(!agent.is_queued());
        assert!(q.tasks.is_empty());
    }

    #[test]
    fn test_deactivate_running_task_waits_for_finish() {
        let mut q = queues(&[1]);
        let now = at(1_700_000_000);
        q.agent_mut(PluginId(0)).acquire();
        let id = q.create_task(PluginId(0), TaskKind::Starter, now).unwrap();
        assert_eq!(q.dispatch_next(now), Some(id));

        q.deactivate_task(id);
        assert!(q.tasks.get(id).is_some());
        assert_eq!(q.agent(PluginId(0)).used_capacity(), 1);

        q.finish_task(id, now);
        assert!(q.tasks.get(id).is_none());
        assert_eq!(q.agent(PluginId(0)).used_capacity(), 0);
    }
}
