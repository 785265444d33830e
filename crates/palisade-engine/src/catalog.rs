//! Plugin catalog
//!
//! Registered plugin binaries, persisted one entry per plugin under the
//! catalog prefix and loaded into memory after unseal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use palisade_core::{AesGcmBarrier, Entry};

use crate::error::Result;

/// Storage prefix for plugin catalog entries
pub const PLUGIN_CATALOG_PREFIX: &str = "core/plugin-catalog/";

/// One registered plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    /// Plugin name, unique in the catalog
    pub name: String,
    /// Command used to launch the plugin binary
    pub command: String,
    /// Hex SHA-256 of the binary
    pub sha256: String,
}

/// In-memory view of the persisted catalog
#[derive(Debug, Default)]
pub struct PluginCatalog {
    entries: HashMap<String, PluginEntry>,
}

impl PluginCatalog {
    /// Look up a plugin by name
    pub fn get(&self, name: &str) -> Option<&PluginEntry> {
        self.entries.get(name)
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load every catalog entry through the barrier
pub async fn load_catalog(barrier: &AesGcmBarrier) -> Result<PluginCatalog> {
    let mut entries = HashMap::new();
    for name in barrier.list(PLUGIN_CATALOG_PREFIX).await? {
        let path = format!("{}{}", PLUGIN_CATALOG_PREFIX, name);
        if let Some(entry) = barrier.get(&path).await? {
            let plugin: PluginEntry = serde_json::from_slice(&entry.value)?;
            entries.insert(plugin.name.clone(), plugin);
        }
    }
    Ok(PluginCatalog { entries })
}

/// Persist a catalog entry
pub async fn register_plugin(barrier: &AesGcmBarrier, plugin: &PluginEntry) -> Result<()> {
    let path = format!("{}{}", PLUGIN_CATALOG_PREFIX, plugin.name);
    let value = serde_json::to_vec(plugin)?;
    barrier.put(Entry::new(path, value)).await?;
    Ok(())
}
