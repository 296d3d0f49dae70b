//! Lookup of plugin implementations by descriptor.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::builtin::FrameStatsPlugin;
use super::contract::ModelPlugin;
use super::descriptor::PluginDescriptor;

/// Named plugin implementations. Version-specific entries
/// (`name@version`) take precedence over plain names.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    entries: HashMap<String, Arc<dyn ModelPlugin>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the plugins shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(FrameStatsPlugin::NAME, Arc::new(FrameStatsPlugin));
        catalog
    }

    pub fn register(&mut self, name: impl Into<String>, plugin: Arc<dyn ModelPlugin>) {
        let name = name.into();
        debug!("Registered plugin implementation '{}'", name);
        self.entries.insert(name, plugin);
    }

    pub fn register_version(
        &mut self,
        name: &str,
        version: &semver::Version,
        plugin: Arc<dyn ModelPlugin>,
    ) {
        self.register(format!("{}@{}", name, version), plugin);
    }

    pub fn resolve(&self, descriptor: &PluginDescriptor) -> Option<Arc<dyn ModelPlugin>> {
        let versioned = format!("{}@{}", descriptor.plugin, descriptor.version);
        self.entries
            .get(&versioned)
            .or_else(|| self.entries.get(&descriptor.plugin))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}
