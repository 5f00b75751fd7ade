//! Registry of in-process plugin filters.
//!
//! Plugins are compiled into the binary and registered by name before the
//! first snapshot is built; a `plugin` filter resource refers to one of
//! them by that name.

use std::collections::HashMap;
use std::sync::Arc;

use filter_api::Filter;

/// Plugins by name.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Filter>>,
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `filter` under `name`, replacing any earlier entry.
    pub fn register(&mut self, name: impl Into<String>, filter: Arc<dyn Filter>) -> &mut Self {
        self.plugins.insert(name.into(), filter);
        self
    }

    /// The plugin registered as `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.plugins.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
