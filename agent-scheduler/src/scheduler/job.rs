//! Task bodies executed outside the scheduler loop.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::messages::{ItemResult, Request, ResultWriter, TaskReport};
use super::task::{Task, TaskId, TaskKind};
use crate::itemutil::parse_key;
use crate::plugin::{ExportContext, Plugin};

pub enum JobAction {
    Collect,
    Export {
        itemid: u64,
        owner_id: u64,
        key: String,
        sink: Arc<dyn ResultWriter>,
    },
    Start,
    Stop,
    Watch {
        requests: Vec<Request>,
        sink: Arc<dyn ResultWriter>,
    },
    Configure {
        options: Value,
    },
}

impl JobAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Export { .. } => "export",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Watch { .. } => "watch",
            Self::Configure { .. } => "configure",
        }
    }
}

/// A dispatched unit of plugin work.
///
/// Owns everything it needs so it can run on a blocking worker thread.
/// Jobs built from a task report back with a [`TaskReport`] so the
/// scheduler can release the capacity they hold.
pub struct Job {
    task_id: Option<TaskId>,
    plugin: Arc<dyn Plugin>,
    action: JobAction,
    dispatched_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn from_task(task: &mut Task, plugin: Arc<dyn Plugin>, now: DateTime<Utc>) -> Self {
        let action = match task.kind_mut() {
            TaskKind::Collector { .. } => JobAction::Collect,
            TaskKind::Exporter {
                item,
                owner_id,
                sink,
            } => JobAction::Export {
                itemid: item.itemid,
                owner_id: *owner_id,
                key: item.key.clone(),
                sink: sink.clone(),
            },
            TaskKind::Starter => JobAction::Start,
            TaskKind::Stopper => JobAction::Stop,
            TaskKind::Watcher { requests, sink } => JobAction::Watch {
                requests: std::mem::take(requests),
                sink: sink.clone(),
            },
            TaskKind::Configurator { options } => JobAction::Configure {
                options: options.clone(),
            },
        };

        Self {
            task_id: Some(task.id()),
            plugin,
            action,
            dispatched_at: now,
        }
    }

    /// Stop job not tied to a queued task, used at shutdown.
    pub(crate) fn stop(plugin: Arc<dyn Plugin>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: None,
            plugin,
            action: JobAction::Stop,
            dispatched_at: now,
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin.name()
    }

    pub fn action(&self) -> &JobAction {
        &self.action
    }

    /// Runs the plugin call. Blocks for as long as the plugin does.
    pub fn execute(self) -> Option<TaskReport> {
        let name = self.plugin.name();
        trace!(plugin = %name, action = self.action.name(), "Executing job");

        let outcome = match &self.action {
            JobAction::Collect => match self.plugin.as_collector() {
                Some(collector) => collector.collect().map_err(|e| e.to_string()),
                None => Err(format!("plugin {name} cannot collect")),
            },
            JobAction::Export {
                itemid,
                owner_id,
                key,
                sink,
            } => self.export(*itemid, *owner_id, key, sink.as_ref()),
            JobAction::Start => match self.plugin.as_runner() {
                Some(runner) => {
                    debug!(plugin = %name, "Starting plugin");
                    runner.start();
                    Ok(())
                }
                None => Err(format!("plugin {name} cannot be started")),
            },
            JobAction::Stop => match self.plugin.as_runner() {
                Some(runner) => {
                    debug!(plugin = %name, "Stopping plugin");
                    runner.stop();
                    Ok(())
                }
                None => Err(format!("plugin {name} cannot be stopped")),
            },
            JobAction::Watch { requests, sink } => match self.plugin.as_watcher() {
                Some(watcher) => {
                    watcher.watch(requests, sink.clone());
                    Ok(())
                }
                None => Err(format!("plugin {name} cannot watch")),
            },
            JobAction::Configure { options } => match self.plugin.as_configurator() {
                Some(configurator) => {
                    configurator.configure(options);
                    Ok(())
                }
                None => Err(format!("plugin {name} cannot be configured")),
            },
        };

        if let Err(e) = &outcome {
            warn!(plugin = %name, action = self.action.name(), error = %e, "Plugin call failed");
        }

        let task_id = self.task_id?;
        Some(match outcome {
            Ok(()) => TaskReport::completed(task_id),
            Err(e) => TaskReport::failed(task_id, e),
        })
    }

    fn export(
        &self,
        itemid: u64,
        owner_id: u64,
        key: &str,
        sink: &dyn ResultWriter,
    ) -> Result<(), String> {
        let Some(exporter) = self.plugin.as_exporter() else {
            return Err(format!("plugin {} cannot export", self.plugin.name()));
        };

        let (metric, params) = match parse_key(key) {
            Ok(parsed) => parsed,
            Err(e) => {
                sink.write(ItemResult::error(itemid, e.to_string(), self.dispatched_at));
                return Err(e.to_string());
            }
        };

        let ctx = ExportContext {
            itemid,
            owner_id,
            dispatched_at: self.dispatched_at,
        };

        match exporter.export(&metric, &params, &ctx) {
            Ok(Some(Value::Array(values))) => {
                for value in values {
                    sink.write(ItemResult::value(itemid, value, self.dispatched_at));
                }
                Ok(())
            }
            Ok(Some(value)) => {
                sink.write(ItemResult::value(itemid, value, self.dispatched_at));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                sink.write(ItemResult::error(itemid, e.to_string(), self.dispatched_at));
                Err(e.to_string())
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("task_id", &self.task_id)
            .field("plugin", &self.plugin.name())
            .field("action", &self.action.name())
            .field("dispatched_at", &self.dispatched_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Exporter, PluginError, PluginResult};
    use crate::scheduler::messages::TaskOutcome;
    use crate::scheduler::task::{Item, PluginId, TaskArena};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Collected(Mutex<Vec<ItemResult>>);

    impl ResultWriter for Collected {
        fn write(&self, result: ItemResult) {
            self.0.lock().push(result);
        }
    }

    struct Lists;

    impl Plugin for Lists {
        fn name(&self) -> &str {
            "lists"
        }

        fn as_exporter(&self) -> Option<&dyn Exporter> {
            Some(self)
        }
    }

    impl Exporter for Lists {
        fn export(
            &self,
            key: &str,
            params: &[String],
            _ctx: &ExportContext,
        ) -> PluginResult<Option<Value>> {
            match key {
                "list" => Ok(Some(json!(params))),
                "none" => Ok(None),
                _ => Err(PluginError::new("unsupported")),
            }
        }
    }

    fn run(key: &str) -> (TaskReport, Vec<ItemResult>) {
        let sink = Arc::new(Collected::default());
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut arena = TaskArena::default();
        let id = arena.insert(
            PluginId(0),
            TaskKind::Exporter {
                item: Item {
                    itemid: 3,
                    key: key.to_string(),
                    delay: "1".to_string(),
                    unsupported: false,
                    updated: now,
                },
                owner_id: 1,
                sink: sink.clone(),
            },
        );

        let job = Job::from_task(arena.get_mut(id).unwrap(), Arc::new(Lists), now);
        assert_eq!(job.task_id(), Some(id));
        let report = job.execute().unwrap();
        let results = sink.0.lock().clone();
        (report, results)
    }

    #[test]
    fn test_export_array_writes_each_element() {
        let (report, results) = run("list[a,b,c]");
        assert_eq!(report.outcome, TaskOutcome::Completed);
        let values: Vec<Value> = results.into_iter().map(|r| r.value.unwrap()).collect();
        assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_export_nothing_to_report() {
        let (report, results) = run("none");
        assert_eq!(report.outcome, TaskOutcome::Completed);
        assert!(results.is_empty());
    }

    #[test]
    fn test_export_failure_writes_error() {
        let (report, results) = run("other");
        assert_eq!(report.outcome, TaskOutcome::Failed("unsupported".to_string()));
        assert_eq!(results.len(), 1);
        assert!(results[0].is_error());
        assert_eq!(results[0].itemid, 3);
    }

    #[test]
    fn test_shutdown_stop_job_has_no_report() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let job = Job::stop(Arc::new(Lists), now);
        assert_eq!(job.task_id(), None);
        assert!(job.execute().is_none());
    }
}
