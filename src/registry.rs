use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::config::{NodeConfig, NodeDefaults};
use crate::worker::NodeId;

/// Node configurations the cluster knows about, keyed by node id.
///
/// Ids are handed out here, so two configs never share one.
#[derive(Debug)]
pub struct NodeRegistry {
    next_id: AtomicU64,
    defaults: RwLock<NodeDefaults>,
    configs: RwLock<BTreeMap<NodeId, NodeConfig>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(NodeDefaults::default())
    }
}

impl NodeRegistry {
    pub fn new(defaults: NodeDefaults) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            defaults: RwLock::new(defaults),
            configs: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn defaults(&self) -> NodeDefaults {
        self.defaults.read().clone()
    }

    pub fn set_defaults(&self, defaults: NodeDefaults) {
        *self.defaults.write() = defaults;
    }

    /// Fresh id, unused by any config seen so far.
    pub fn next_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Build a config for `host` from the current defaults and record it.
    pub fn new_config(&self, host: impl Into<String>) -> NodeConfig {
        let config = NodeConfig::with_defaults(self.next_id(), host, &self.defaults.read());
        self.insert(config.clone());
        config
    }

    /// Record a config. Ids issued later will not collide with it.
    pub fn insert(&self, config: NodeConfig) -> Option<NodeConfig> {
        self.next_id.fetch_max(config.id + 1, Ordering::SeqCst);
        self.configs.write().insert(config.id, config)
    }

    pub fn get(&self, id: NodeId) -> Option<NodeConfig> {
        self.configs.read().get(&id).cloned()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.configs.read().contains_key(&id)
    }

    pub fn remove(&self, id: NodeId) -> Option<NodeConfig> {
        self.configs.write().remove(&id)
    }

    /// All configs ordered by id.
    pub fn configs(&self) -> Vec<NodeConfig> {
        self.configs.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.configs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.read().is_empty()
    }

    pub fn clear(&self) {
        self.configs.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_config_issues_unique_ids() {
        let registry = NodeRegistry::default();
        let a = registry.new_config("a");
        let b = registry.new_config("b");
        assert_ne!(a.id, b.id);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a.id).map(|c| c.host), Some("a".to_string()));
    }

    #[test]
    fn test_insert_bumps_next_id() {
        let registry = NodeRegistry::default();
        registry.insert(NodeConfig::new(10, "ten"));
        assert!(registry.new_config("next").id > 10);
    }

    #[test]
    fn test_defaults_apply_to_new_configs() {
        let registry = NodeRegistry::default();
        registry.set_defaults(NodeDefaults {
            thread_limit: 12,
            user: "worker".to_string(),
            ..NodeDefaults::default()
        });
        let cfg = registry.new_config("big");
        assert_eq!(cfg.thread_limit, 12);
        assert_eq!(cfg.user, "worker");
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = NodeRegistry::default();
        let a = registry.new_config("a");
        registry.new_config("b");
        assert!(registry.remove(a.id).is_some());
        assert!(!registry.contains(a.id));
        registry.clear();
        assert!(registry.is_empty());
    }
}
