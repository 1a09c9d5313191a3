//! Request owners.
//!
//! An owner is a source of metric requests (a server connection, the local
//! direct-request listener, ...). It tracks the items it requested and the
//! plugins it uses so that each update can retire what is no longer wanted.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::messages::{DIRECT_OWNER_ID, Request, ResultWriter};
use super::queues::Queues;
use super::task::{Item, PluginId, TaskId, TaskKind};
use crate::itemutil;
use crate::Result;

/// How long the direct owner keeps a plugin referenced after its last use.
pub const DIRECT_OWNER_EXPIRY_HOURS: i64 = 25;

/// Expiry policy of an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    /// One-shot requests arriving at low frequency. Plugins stay referenced
    /// for [`DIRECT_OWNER_EXPIRY_HOURS`] after their last request.
    Direct,
    /// Owners sending their full request set on every update. Plugins missing
    /// from an update are released right away.
    Scheduled,
}

impl OwnerKind {
    pub fn for_owner(owner_id: u64) -> Self {
        if owner_id == DIRECT_OWNER_ID {
            Self::Direct
        } else {
            Self::Scheduled
        }
    }

    /// Grace period between a plugin's last use and its release.
    pub fn expiry(self) -> Duration {
        match self {
            Self::Direct => Duration::hours(DIRECT_OWNER_EXPIRY_HOURS),
            Self::Scheduled => Duration::zero(),
        }
    }
}

#[derive(Debug, Clone)]
struct PluginUsage {
    used: DateTime<Utc>,
    /// Watcher task collecting this update's requests.
    watcher: Option<TaskId>,
}

#[derive(Debug)]
pub struct Owner {
    id: u64,
    kind: OwnerKind,
    exporters: FxHashMap<u64, TaskId>,
    plugins: FxHashMap<PluginId, PluginUsage>,
}

impl Owner {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            kind: OwnerKind::for_owner(id),
            exporters: FxHashMap::default(),
            plugins: FxHashMap::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OwnerKind {
        self.kind
    }

    /// Number of recurring items.
    pub fn item_count(&self) -> usize {
        self.exporters.len()
    }

    pub fn item_task(&self, itemid: u64) -> Option<TaskId> {
        self.exporters.get(&itemid).copied()
    }

    pub fn uses(&self, plugin: PluginId) -> bool {
        self.plugins.contains_key(&plugin)
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Registers one request for `plugin`; `key` is the request key after
    /// alias resolution.
    pub(crate) fn add_request(
        &mut self,
        queues: &mut Queues,
        plugin: PluginId,
        request: &Request,
        key: &str,
        sink: &Arc<dyn ResultWriter>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let agent = queues.agent(plugin);
        let caps = agent.capabilities();
        let idle = !agent.is_active();
        let name = agent.name().to_string();

        if caps.exporter
            && request.itemid != 0
            && let Err(e) = itemutil::parse_delay(&request.delay)
        {
            if let Some(id) = self.exporters.remove(&request.itemid) {
                queues.deactivate_task(id);
            }
            return Err(e);
        }

        if caps.collector && idle && queues.agent(plugin).collector.is_none() {
            match queues.create_task(plugin, TaskKind::collector(&name), now) {
                Ok(id) => queues.agent_mut(plugin).collector = Some(id),
                Err(e) => warn!(plugin = %name, error = %e, "Cannot create collector task"),
            }
        }

        if caps.exporter {
            self.add_exporter(queues, plugin, request, key, sink, now)?;
        }

        if caps.runner && idle {
            let pending_stop = queues
                .agent(plugin)
                .stopper
                .filter(|&id| queues.tasks.get(id).is_some_and(|t| t.is_queued()));
            if let Some(id) = pending_stop {
                debug!(plugin = %name, "Plugin reused before stopping, cancelling stop");
                queues.deactivate_task(id);
            }
            if !queues.agent(plugin).started {
                if let Err(e) = queues.create_task(plugin, TaskKind::Starter, now) {
                    warn!(plugin = %name, error = %e, "Cannot create starter task");
                }
            }
        }

        let mut new_watcher = None;
        if caps.watcher {
            let batch = Request {
                itemid: request.itemid,
                key: key.to_string(),
                delay: request.delay.clone(),
            };
            let current = self
                .plugins
                .get(&plugin)
                .and_then(|usage| usage.watcher)
                .filter(|&id| queues.tasks.get(id).is_some_and(|t| t.is_queued()));

            match current.and_then(|id| queues.tasks.get_mut(id)) {
                Some(task) => {
                    if let TaskKind::Watcher { requests, .. } = task.kind_mut() {
                        requests.push(batch);
                    }
                }
                None => {
                    let kind = TaskKind::Watcher {
                        requests: vec![batch],
                        sink: sink.clone(),
                    };
                    match queues.create_task(plugin, kind, now) {
                        Ok(id) => new_watcher = Some(id),
                        Err(e) => warn!(plugin = %name, error = %e, "Cannot create watcher task"),
                    }
                }
            }
        }

        if caps.configurator
            && self.kind == OwnerKind::Scheduled
            && !queues.agent(plugin).configured
            && let Some(options) = queues.agent(plugin).options().cloned()
        {
            match queues.create_task(plugin, TaskKind::Configurator { options }, now) {
                Ok(_) => queues.agent_mut(plugin).configured = true,
                Err(e) => warn!(plugin = %name, error = %e, "Cannot create configurator task"),
            }
        }

        match self.plugins.entry(plugin) {
            Entry::Occupied(mut entry) => {
                let usage = entry.get_mut();
                usage.used = now;
                if new_watcher.is_some() {
                    usage.watcher = new_watcher;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PluginUsage {
                    used: now,
                    watcher: new_watcher,
                });
                queues.agent_mut(plugin).acquire();
                debug!(owner = self.id, plugin = %name, "Owner started using plugin");
            }
        }
        Ok(())
    }

    fn add_exporter(
        &mut self,
        queues: &mut Queues,
        plugin: PluginId,
        request: &Request,
        key: &str,
        sink: &Arc<dyn ResultWriter>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let item = Item {
            itemid: request.itemid,
            key: key.to_string(),
            delay: request.delay.clone(),
            unsupported: false,
            updated: now,
        };

        if request.itemid == 0 {
            let kind = TaskKind::Exporter {
                item,
                owner_id: self.id,
                sink: sink.clone(),
            };
            queues.create_task(plugin, kind, now)?;
            return Ok(());
        }

        let existing = self.exporters.get(&request.itemid).copied().filter(|&id| {
            queues
                .tasks
                .get(id)
                .is_some_and(|t| t.is_active() && t.plugin() == plugin)
        });

        let Some(id) = existing else {
            if let Some(stale) = self.exporters.remove(&request.itemid) {
                queues.deactivate_task(stale);
            }
            let kind = TaskKind::Exporter {
                item,
                owner_id: self.id,
                sink: sink.clone(),
            };
            let id = queues.create_task(plugin, kind, now)?;
            self.exporters.insert(request.itemid, id);
            return Ok(());
        };

        let mut reschedule = false;
        if let Some(task) = queues.tasks.get_mut(id) {
            let queued = task.is_queued();
            if let TaskKind::Exporter {
                item: current,
                sink: current_sink,
                ..
            } = task.kind_mut()
            {
                current.key = item.key;
                current.updated = now;
                *current_sink = sink.clone();
                if current.delay != item.delay {
                    current.delay = item.delay;
                    reschedule = queued && !current.unsupported;
                }
            }
        }

        if reschedule && let Err(e) = queues.reschedule_task(id, now) {
            self.exporters.remove(&request.itemid);
            return Err(e);
        }
        Ok(())
    }

    /// Retires items not refreshed at `now` and releases plugins whose last
    /// use is past the owner's expiry horizon. Returns the plugins left
    /// without any tenant.
    pub(crate) fn cleanup(&mut self, queues: &mut Queues, now: DateTime<Utc>) -> Vec<PluginId> {
        for usage in self.plugins.values_mut() {
            usage.watcher = None;
        }

        let expired: Vec<u64> = self
            .exporters
            .iter()
            .filter(|&(_, &id)| {
                !queues.tasks.get(id).is_some_and(|task| {
                    task.is_active()
                        && matches!(task.kind(), TaskKind::Exporter { item, .. } if item.updated >= now)
                })
            })
            .map(|(&itemid, _)| itemid)
            .collect();

        for itemid in expired {
            if let Some(id) = self.exporters.remove(&itemid) {
                debug!(owner = self.id, itemid, "Removing item");
                queues.deactivate_task(id);
            }
        }

        let horizon = now - self.kind.expiry();
        let unused: Vec<PluginId> = self
            .plugins
            .iter()
            .filter(|(_, usage)| usage.used < horizon)
            .map(|(&plugin, _)| plugin)
            .collect();

        let mut released = Vec::new();
        for plugin in unused {
            self.plugins.remove(&plugin);
            let agent = queues.agent_mut(plugin);
            debug!(owner = self.id, plugin = %agent.name(), "Owner stopped using plugin");
            if agent.release() == 0 {
                released.push(plugin);
            }
        }
        released
    }
}
