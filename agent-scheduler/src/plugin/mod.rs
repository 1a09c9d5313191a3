//! Plugin capabilities and registry.
//!
//! A plugin implements [`Plugin`] and opts into any subset of the capability
//! traits by overriding the matching `as_*` accessor:
//!
//! - [`Collector`]: periodic background collection, one run at a time
//! - [`Exporter`]: on-demand export of a single metric value
//! - [`Runner`]: one-shot start and stop around the plugin's active period
//! - [`Watcher`]: receives the full set of watched requests of an owner
//! - [`Configurator`]: validates and applies plugin specific options
//!
//! Capability calls are blocking. The scheduler runs them outside of its
//! control loop, never more than the plugin's capacity at a time.

mod registry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::scheduler::{Request, ResultWriter};

pub use registry::{PluginRegistry, RegisteredPlugin};

/// Error reported by a plugin capability call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Request context handed to [`Exporter::export`].
#[derive(Debug, Clone)]
pub struct ExportContext {
    /// Item the value is exported for, zero for direct requests.
    pub itemid: u64,
    /// Owner that requested the item.
    pub owner_id: u64,
    /// Time the export was dispatched.
    pub dispatched_at: DateTime<Utc>,
}

/// Base plugin interface.
pub trait Plugin: Send + Sync {
    /// Unique plugin name, also used to look up its configuration.
    fn name(&self) -> &str;

    /// Largest capacity the plugin accepts. Configured capacities above it
    /// are clamped; `None` defers to the scheduler's default maximum.
    fn max_capacity(&self) -> Option<usize> {
        None
    }

    fn as_collector(&self) -> Option<&dyn Collector> {
        None
    }

    fn as_exporter(&self) -> Option<&dyn Exporter> {
        None
    }

    fn as_runner(&self) -> Option<&dyn Runner> {
        None
    }

    fn as_watcher(&self) -> Option<&dyn Watcher> {
        None
    }

    fn as_configurator(&self) -> Option<&dyn Configurator> {
        None
    }
}

pub trait Collector: Send + Sync {
    /// Gathers data for later exports.
    fn collect(&self) -> PluginResult<()>;

    /// Collection period in seconds. Zero is rejected by the scheduler.
    fn period(&self) -> u32;
}

pub trait Exporter: Send + Sync {
    /// Returns the value of metric `key`.
    ///
    /// `Ok(None)` means there is nothing to report. A JSON array is written
    /// as one result per element.
    fn export(
        &self,
        key: &str,
        params: &[String],
        ctx: &ExportContext,
    ) -> PluginResult<Option<Value>>;
}

pub trait Runner: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

pub trait Watcher: Send + Sync {
    /// Replaces the watched set with `requests`. Values are pushed to `sink`.
    fn watch(&self, requests: &[Request], sink: Arc<dyn ResultWriter>);
}

pub trait Configurator: Send + Sync {
    fn validate(&self, options: &Value) -> PluginResult<()>;
    fn configure(&self, options: &Value);
}

/// Capability set of a plugin, captured once at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub collector: bool,
    pub exporter: bool,
    pub runner: bool,
    pub watcher: bool,
    pub configurator: bool,
}

impl Capabilities {
    pub fn of(plugin: &dyn Plugin) -> Self {
        Self {
            collector: plugin.as_collector().is_some(),
            exporter: plugin.as_exporter().is_some(),
            runner: plugin.as_runner().is_some(),
            watcher: plugin.as_watcher().is_some(),
            configurator: plugin.as_configurator().is_some(),
        }
    }
}
