//! Scheduler state machine.
//!
//! [`Manager`] owns every agent, task and owner. It is not thread-safe by
//! itself; [`SchedulerService`](super::SchedulerService) confines it to a
//! single loop and feeds it updates, finish reports and ticks in order.
//! Each entry point takes the current time explicitly, which keeps the state
//! machine deterministic under test.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::agent::PluginAgent;
use super::job::Job;
use super::messages::{ItemResult, TaskOutcome, TaskReport, UpdateRequest};
use super::metrics::{Counters, SchedulerStats};
use super::owner::Owner;
use super::queues::Queues;
use super::task::{PluginId, Task, TaskId, TaskKind};
use crate::alias::AliasResolver;
use crate::config::SchedulerConfig;
use crate::itemutil::parse_key;
use crate::plugin::PluginRegistry;
use crate::{Error, Result};

pub struct Manager {
    queues: Queues,
    metrics: FxHashMap<String, PluginId>,
    owners: FxHashMap<u64, Owner>,
    aliases: Arc<AliasResolver>,
    counters: Counters,
}

impl Manager {
    /// Builds one agent per registered plugin.
    ///
    /// Capacities and option sets come from `config`. Configurable plugins
    /// validate their options here; a rejected option set is an error.
    pub fn new(
        registry: PluginRegistry,
        config: &SchedulerConfig,
        aliases: Arc<AliasResolver>,
    ) -> Result<Self> {
        let mut agents = Vec::with_capacity(registry.len());
        let mut metrics = FxHashMap::default();

        for (index, registered) in registry.plugins().iter().enumerate() {
            let plugin = &registered.plugin;
            let name = plugin.name();
            let capacity = config.capacity_for(name, plugin.max_capacity());
            let options = config.options_for(name);

            if let (Some(options), Some(configurator)) = (&options, plugin.as_configurator()) {
                configurator.validate(options).map_err(|e| {
                    Error::config(format!("invalid configuration for plugin {name}: {e}"))
                })?;
            }

            for metric in &registered.metrics {
                metrics.insert(metric.clone(), PluginId(index));
            }
            debug!(plugin = %name, capacity, "Created plugin agent");
            agents.push(PluginAgent::new(PluginId(index), plugin.clone(), capacity, options));
        }

        info!(plugins = agents.len(), metrics = metrics.len(), "Scheduler initialized");
        Ok(Self {
            queues: Queues::new(agents),
            metrics,
            owners: FxHashMap::default(),
            aliases,
            counters: Counters::default(),
        })
    }

    /// Applies an owner's full request set.
    ///
    /// Requests that cannot be scheduled produce an error result on the
    /// update's sink; the remaining requests are still applied.
    pub fn process_update_request(&mut self, update: UpdateRequest, now: DateTime<Utc>) {
        self.counters.updates_processed += 1;
        let owner = self
            .owners
            .entry(update.owner_id)
            .or_insert_with(|| Owner::new(update.owner_id));

        for request in &update.requests {
            let key = self.aliases.resolve(&request.key);
            let result = parse_key(&key).and_then(|(metric, _)| {
                let plugin = *self
                    .metrics
                    .get(&metric)
                    .ok_or_else(|| Error::unknown_metric(metric.as_str()))?;
                owner.add_request(&mut self.queues, plugin, request, &key, &update.sink, now)
            });

            if let Err(e) = result {
                debug!(
                    owner = update.owner_id,
                    itemid = request.itemid,
                    key = %request.key,
                    error = %e,
                    "Cannot schedule request"
                );
                update
                    .sink
                    .write(ItemResult::error(request.itemid, e.to_string(), now));
            }
        }

        for plugin in owner.cleanup(&mut self.queues, now) {
            info!(plugin = %self.queues.agent(plugin).name(), "Plugin no longer used, deactivating");
            self.queues.release_agent(plugin, now);

            // An empty batch tells the watcher to drop everything it watches.
            if self.queues.agent(plugin).capabilities().watcher {
                let kind = TaskKind::Watcher {
                    requests: Vec::new(),
                    sink: update.sink.clone(),
                };
                if let Err(e) = self.queues.create_task(plugin, kind, now) {
                    warn!(plugin = %self.queues.agent(plugin).name(), error = %e, "Cannot create watcher task");
                }
            }
        }
    }

    /// Dispatches every task due at `now` that fits its plugin's capacity.
    pub fn process_queue(&mut self, now: DateTime<Utc>) -> Vec<Job> {
        let mut jobs = Vec::new();
        while let Some(id) = self.queues.dispatch_next(now) {
            let Some(task) = self.queues.tasks.get_mut(id) else {
                continue;
            };
            let plugin = self.queues.agents[task.plugin().0].plugin().clone();
            let job = Job::from_task(task, plugin, now);
            debug!(
                plugin = %job.plugin_name(),
                task = %id,
                action = job.action().name(),
                "Dispatching task"
            );
            jobs.push(job);
        }
        self.counters.tasks_dispatched += jobs.len() as u64;
        jobs
    }

    /// Accounts for a finished task and queues its next run if still wanted.
    pub fn process_finish(&mut self, report: TaskReport, now: DateTime<Utc>) {
        self.counters.tasks_finished += 1;
        let failed = matches!(report.outcome, TaskOutcome::Failed(_));
        if failed {
            self.counters.tasks_failed += 1;
        }

        if let Some(task) = self.queues.tasks.get_mut(report.task_id)
            && let TaskKind::Exporter { item, .. } = task.kind_mut()
            && item.itemid != 0
            && item.unsupported != failed
        {
            debug!(itemid = item.itemid, unsupported = failed, "Item support state changed");
            item.unsupported = failed;
        }

        self.queues.finish_task(report.task_id, now);
    }

    /// Recomputes every pending task against `now`. Called when the wall
    /// clock moved by more than the tick tolerance.
    pub fn reschedule_queue(&mut self, now: DateTime<Utc>) {
        warn!(pending = self.queues.pending_tasks(), "System clock changed, rescheduling tasks");
        self.counters.queue_rebuilds += 1;
        self.queues.reschedule_all(now);
    }

    /// Stop jobs for every runner that is still in use and was started.
    pub fn shutdown_jobs(&self, now: DateTime<Utc>) -> Vec<Job> {
        self.queues
            .agents
            .iter()
            .filter(|agent| agent.is_active() && agent.capabilities().runner && agent.started)
            .map(|agent| Job::stop(agent.plugin().clone(), now))
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            plugins: self.queues.agents.len(),
            active_plugins: self.queues.agents.iter().filter(|a| a.is_active()).count(),
            queued_plugins: self.queues.plugin_queue.len(),
            pending_tasks: self.queues.pending_tasks(),
            running_tasks: self.queues.running_tasks(),
            owners: self.owners.len(),
            items: self.owners.values().map(Owner::item_count).sum(),
            updates_processed: self.counters.updates_processed,
            tasks_dispatched: self.counters.tasks_dispatched,
            tasks_finished: self.counters.tasks_finished,
            tasks_failed: self.counters.tasks_failed,
            queue_rebuilds: self.counters.queue_rebuilds,
        }
    }

    /// Agent of the plugin named `name`.
    pub fn agent(&self, name: &str) -> Option<&PluginAgent> {
        self.queues.agents.iter().find(|a| a.name() == name)
    }

    pub fn owner(&self, id: u64) -> Option<&Owner> {
        self.owners.get(&id)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.queues.tasks.get(id)
    }

    /// Tasks pending for the plugin named `name`, in no particular order.
    pub fn pending_tasks(&self, name: &str) -> Vec<&Task> {
        self.agent(name)
            .map(|agent| {
                agent
                    .tasks
                    .iter()
                    .filter_map(|id| self.queues.tasks.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of plugins in the dispatch queue.
    pub fn queued_plugins(&self) -> usize {
        self.queues.plugin_queue.len()
    }

    /// Plugins in the dispatch queue, earliest first.
    pub fn queue_order(&self) -> Vec<&str> {
        let mut order: Vec<&PluginAgent> = self
            .queues
            .plugin_queue
            .iter()
            .map(|id| self.queues.agent(id))
            .collect();
        order.sort_by_key(|agent| {
            agent
                .peek_task()
                .and_then(|id| self.queues.tasks.get(id))
                .map(|task| (task.scheduled(), task.id()))
        });
        order.into_iter().map(PluginAgent::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Configurator, Exporter, ExportContext, Plugin, PluginError, PluginResult};
    use crate::scheduler::messages::{Request, ResultWriter};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use serde_json::Value;

    #[derive(Default)]
    struct Collected(Mutex<Vec<ItemResult>>);

    impl ResultWriter for Collected {
        fn write(&self, result: ItemResult) {
            self.0.lock().push(result);
        }
    }

    struct Echo(&'static str);

    impl Plugin for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn as_exporter(&self) -> Option<&dyn Exporter> {
            Some(self)
        }
    }

    impl Exporter for Echo {
        fn export(&self, key: &str, _: &[String], _: &ExportContext) -> PluginResult<Option<Value>> {
            Ok(Some(Value::String(key.to_string())))
        }
    }

    struct Strict;

    impl Plugin for Strict {
        fn name(&self) -> &str {
            "Strict"
        }

        fn as_configurator(&self) -> Option<&dyn Configurator> {
            Some(self)
        }
    }

    impl Configurator for Strict {
        fn validate(&self, options: &Value) -> PluginResult<()> {
            match options.get("Level") {
                Some(level) if level.is_u64() => Ok(()),
                _ => Err(PluginError::new("Level must be a number")),
            }
        }

        fn configure(&self, _options: &Value) {}
    }

    struct Capped;

    impl Plugin for Capped {
        fn name(&self) -> &str {
            "capped"
        }

        fn max_capacity(&self) -> Option<usize> {
            Some(4)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn manager() -> Manager {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Echo("debug1")), &["debug1"]).unwrap();
        registry.register(Arc::new(Echo("debug2")), &["debug2"]).unwrap();
        let aliases = Arc::new(AliasResolver::with_aliases(&["d2:debug2"]).unwrap());
        Manager::new(registry, &SchedulerConfig::default(), aliases).unwrap()
    }

    fn update(owner_id: u64, sink: &Arc<Collected>, requests: Vec<Request>) -> UpdateRequest {
        UpdateRequest {
            owner_id,
            sink: sink.clone(),
            requests,
        }
    }

    #[test]
    fn test_unknown_and_invalid_keys_write_errors() {
        let mut manager = manager();
        let sink = Arc::new(Collected::default());
        manager.process_update_request(
            update(
                1,
                &sink,
                vec![
                    Request::new(1, "missing", "10"),
                    Request::new(2, "debug1[", "10"),
                    Request::new(3, "debug1", "bogus"),
                    Request::new(4, "debug1", "10"),
                ],
            ),
            now(),
        );

        let results = sink.0.lock();
        let failed: Vec<u64> = results.iter().map(|r| r.itemid).collect();
        assert_eq!(failed, vec![1, 2, 3]);
        assert_eq!(
            results[0].value,
            Err("Unknown metric missing".to_string())
        );
        assert_eq!(manager.pending_tasks("debug1").len(), 1);
        assert_eq!(manager.stats().items, 1);
    }

    #[test]
    fn test_alias_routes_to_plugin() {
        let mut manager = manager();
        let sink = Arc::new(Collected::default());
        manager.process_update_request(update(1, &sink, vec![Request::new(1, "d2", "10")]), now());

        assert!(sink.0.lock().is_empty());
        let tasks = manager.pending_tasks("debug2");
        assert_eq!(tasks.len(), 1);
        match tasks[0].kind() {
            TaskKind::Exporter { item, .. } => assert_eq!(item.key, "debug2"),
            other => panic!("unexpected task {other:?}"),
        }
    }

    #[test]
    fn test_direct_request_runs_once() {
        let mut manager = manager();
        let sink = Arc::new(Collected::default());
        manager.process_update_request(update(0, &sink, vec![Request::new(0, "debug1", "")]), now());

        let later = now() + chrono::Duration::milliseconds(500);
        let jobs = manager.process_queue(later);
        assert_eq!(jobs.len(), 1);
        for job in jobs {
            let report = job.execute().unwrap();
            manager.process_finish(report, later);
        }

        assert_eq!(sink.0.lock().len(), 1);
        assert!(manager.pending_tasks("debug1").is_empty());
        assert!(manager.process_queue(now() + chrono::Duration::seconds(5)).is_empty());
        // The direct owner keeps the plugin referenced.
        assert_eq!(manager.agent("debug1").unwrap().ref_count(), 1);
    }

    #[test]
    fn test_plugin_capacity_clamped_to_declared_maximum() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Capped), &["capped"]).unwrap();
        registry.register(Arc::new(Echo("debug1")), &["debug1"]).unwrap();
        let config = SchedulerConfig::from_json(
            r#"{"plugins": {"capped": {"Capacity": 10}, "debug1": {"Capacity": 5000}}}"#,
        )
        .unwrap();

        let manager = Manager::new(registry, &config, Arc::new(AliasResolver::new())).unwrap();
        assert_eq!(manager.agent("capped").unwrap().capacity(), 4);
        assert_eq!(manager.agent("debug1").unwrap().capacity(), 1000);
    }

    #[test]
    fn test_rejected_plugin_options() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Strict), &["strict"]).unwrap();
        let config = SchedulerConfig::from_json(r#"{"plugins": {"strict": {"Level": "high"}}}"#).unwrap();

        let result = Manager::new(registry, &config, Arc::new(AliasResolver::new()));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_stats_track_updates() {
        let mut manager = manager();
        let sink = Arc::new(Collected::default());
        manager.process_update_request(
            update(5, &sink, vec![Request::new(1, "debug1", "1"), Request::new(2, "debug2", "1")]),
            now(),
        );

        let stats = manager.stats();
        assert_eq!(stats.plugins, 2);
        assert_eq!(stats.active_plugins, 2);
        assert_eq!(stats.queued_plugins, 2);
        assert_eq!(stats.pending_tasks, 2);
        assert_eq!(stats.owners, 1);
        assert_eq!(stats.updates_processed, 1);
    }
}
