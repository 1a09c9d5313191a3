//! Registry mapping metric keys to the plugins that serve them.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use super::Plugin;
use crate::{Error, Result};

/// A plugin together with the metric names it serves.
#[derive(Clone)]
pub struct RegisteredPlugin {
    pub plugin: Arc<dyn Plugin>,
    pub metrics: Vec<String>,
}

impl std::fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("name", &self.plugin.name())
            .field("metrics", &self.metrics)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: Vec<RegisteredPlugin>,
    metrics: FxHashMap<String, usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` as the provider of `metrics`.
    ///
    /// Fails when the plugin name is taken or a metric already has a provider;
    /// the registry is left unchanged in that case.
    pub fn register<S: AsRef<str>>(&mut self, plugin: Arc<dyn Plugin>, metrics: &[S]) -> Result<()> {
        let name = plugin.name().to_string();
        if self.plugins.iter().any(|p| p.plugin.name().eq_ignore_ascii_case(&name)) {
            return Err(Error::config(format!("plugin {name} is already registered")));
        }

        let mut keys = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let key = metric.as_ref().to_string();
            if let Some(&index) = self.metrics.get(&key) {
                return Err(Error::DuplicateMetric {
                    key,
                    plugin: self.plugins[index].plugin.name().to_string(),
                });
            }
            if keys.contains(&key) {
                return Err(Error::DuplicateMetric { key, plugin: name });
            }
            keys.push(key);
        }

        let index = self.plugins.len();
        for key in &keys {
            self.metrics.insert(key.clone(), index);
        }
        debug!(plugin = %name, metrics = keys.len(), "Registered plugin");
        self.plugins.push(RegisteredPlugin {
            plugin,
            metrics: keys,
        });
        Ok(())
    }

    /// Index of the plugin serving `metric`.
    pub fn lookup(&self, metric: &str) -> Option<usize> {
        self.metrics.get(metric).copied()
    }

    pub fn plugins(&self) -> &[RegisteredPlugin] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Named("a")), &["a.one", "a.two"]).unwrap();
        registry.register(Arc::new(Named("b")), &["b.one"]).unwrap();

        assert_eq!(registry.lookup("a.two"), Some(0));
        assert_eq!(registry.lookup("b.one"), Some(1));
        assert_eq!(registry.lookup("c"), None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_metric_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Named("a")), &["shared"]).unwrap();

        let err = registry
            .register(Arc::new(Named("b")), &["own", "shared"])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMetric { ref plugin, .. } if plugin == "a"));
        assert_eq!(registry.lookup("own"), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Named("Debug")), &["x"]).unwrap();
        assert!(registry.register(Arc::new(Named("debug")), &["y"]).is_err());
    }
}
