//! Scheduler configuration.
//!
//! Loaded from JSON. Every field has a default so an empty document is a
//! valid configuration:
//!
//! ```json
//! {
//!   "default_capacity": 100,
//!   "default_max_capacity": 1000,
//!   "tick_interval_ms": 1000,
//!   "aliases": ["cpu:system.cpu.util[,user]"],
//!   "plugins": {
//!     "Debug": { "capacity": 10, "Interval": 5 }
//!   }
//! }
//! ```
//!
//! Plugin entries may carry arbitrary extra keys; they form the option set
//! handed to the plugin's configurator.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{Error, Result};

pub const DEFAULT_PLUGIN_CAPACITY: usize = 100;
pub const DEFAULT_MAX_PLUGIN_CAPACITY: usize = 1000;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 100;

fn default_capacity() -> usize {
    DEFAULT_PLUGIN_CAPACITY
}

fn default_max_capacity() -> usize {
    DEFAULT_MAX_PLUGIN_CAPACITY
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}

fn default_send_timeout_ms() -> u64 {
    DEFAULT_SEND_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Capacity of plugins without a valid `capacity` setting.
    #[serde(default = "default_capacity")]
    pub default_capacity: usize,

    /// Upper bound on configured capacities for plugins that declare no
    /// maximum of their own.
    #[serde(default = "default_max_capacity")]
    pub default_max_capacity: usize,

    /// Interval between scheduling passes.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Allowed deviation of the measured tick interval before the queue is
    /// rebuilt. Defaults to the tick interval.
    #[serde(default)]
    pub clock_jump_tolerance_ms: Option<u64>,

    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// How long a producer waits on a full mailbox.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Key aliases in `name:key` form.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Per-plugin settings, keyed by plugin name.
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_capacity: default_capacity(),
            default_max_capacity: default_max_capacity(),
            tick_interval_ms: default_tick_interval_ms(),
            clock_jump_tolerance_ms: None,
            mailbox_capacity: default_mailbox_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            aliases: Vec::new(),
            plugins: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default, alias = "Capacity", skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i64>,

    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl SchedulerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_capacity == 0 {
            return Err(Error::config("default_capacity must be positive"));
        }
        if self.default_max_capacity == 0 {
            return Err(Error::config("default_max_capacity must be positive"));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::config("tick_interval_ms must be positive"));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::config("mailbox_capacity must be positive"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn clock_jump_tolerance(&self) -> Duration {
        Duration::from_millis(self.clock_jump_tolerance_ms.unwrap_or(self.tick_interval_ms))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Settings of plugin `name`, matched case-insensitively.
    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.get(name).or_else(|| {
            self.plugins
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, config)| config)
        })
    }

    /// Capacity of plugin `name`.
    ///
    /// Falls back to `default_capacity` when nothing is configured, with a
    /// warning when the configured value is not a positive integer. A
    /// configured value is clamped to `plugin_max`, the maximum declared by
    /// the plugin, or to `default_max_capacity` when it declares none.
    pub fn capacity_for(&self, name: &str, plugin_max: Option<usize>) -> usize {
        let configured = match self.plugin(name).and_then(|p| p.capacity) {
            Some(capacity) if capacity > 0 => {
                usize::try_from(capacity).unwrap_or(usize::MAX)
            }
            Some(capacity) => {
                warn!(
                    plugin = %name,
                    capacity,
                    default = self.default_capacity,
                    "Invalid plugin capacity, using default"
                );
                return self.default_capacity;
            }
            None => return self.default_capacity,
        };

        let max = plugin_max
            .filter(|&max| max > 0)
            .unwrap_or(self.default_max_capacity);
        if configured > max {
            warn!(
                plugin = %name,
                capacity = configured,
                max,
                "Plugin capacity exceeds maximum, using maximum"
            );
            return max;
        }
        configured
    }

    /// Option set of plugin `name`, `None` when nothing is configured.
    pub fn options_for(&self, name: &str) -> Option<Value> {
        self.plugin(name)
            .filter(|p| !p.options.is_empty())
            .map(|p| Value::Object(p.options.clone()))
    }
}
