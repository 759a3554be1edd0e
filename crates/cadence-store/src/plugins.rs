use crate::{read, write};
use cadence_core::ports::{ElasticAgentPlugin, PluginRegistry};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Elastic agent plugins loaded into this process.
#[derive(Default)]
pub struct MemoryPluginRegistry {
    plugins: RwLock<BTreeMap<String, Arc<dyn ElasticAgentPlugin>>>,
}

impl MemoryPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: Arc<dyn ElasticAgentPlugin>) {
        let plugin_id = plugin.plugin_id().to_string();
        info!(plugin_id = %plugin_id, "Elastic agent plugin loaded");
        write(&self.plugins).insert(plugin_id, plugin);
    }

    pub fn unregister(&self, plugin_id: &str) -> bool {
        write(&self.plugins).remove(plugin_id).is_some()
    }
}

impl PluginRegistry for MemoryPluginRegistry {
    fn elastic_plugin(&self, plugin_id: &str) -> Option<Arc<dyn ElasticAgentPlugin>> {
        read(&self.plugins).get(plugin_id).cloned()
    }

    fn elastic_plugin_ids(&self) -> Vec<String> {
        read(&self.plugins).keys().cloned().collect()
    }
}
