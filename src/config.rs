use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::worker::NodeId;

/// Name of the built-in in-process transport.
pub const LOCAL_TRANSPORT: &str = "local";

/// Values applied to every node configuration created through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefaults {
    /// Remote user name. Empty means "whatever the transport logs in as".
    pub user: String,
    /// Directory on the node that holds the worker executables.
    pub exec_root: PathBuf,
    /// Directory on the node used for job input and output files.
    pub file_root: PathBuf,
    /// Registered transport used to reach the node.
    pub transport: String,
    /// Execution slots per node. 0 asks the node for its own count.
    pub thread_limit: u32,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            user: String::new(),
            exec_root: PathBuf::new(),
            file_root: PathBuf::new(),
            transport: LOCAL_TRANSPORT.to_string(),
            thread_limit: 0,
        }
    }
}

/// Desired description of one worker node.
///
/// A config exists independently of any live connection: it is queued for
/// bring-up, waits while a connection is attempted, and is dropped again when
/// its node stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub host: String,
    pub user: String,
    pub exec_root: PathBuf,
    pub file_root: PathBuf,
    pub transport: String,
    pub thread_limit: u32,
}

impl NodeConfig {
    pub fn new(id: NodeId, host: impl Into<String>) -> Self {
        Self::with_defaults(id, host, &NodeDefaults::default())
    }

    pub fn with_defaults(id: NodeId, host: impl Into<String>, defaults: &NodeDefaults) -> Self {
        Self {
            id,
            host: host.into(),
            user: defaults.user.clone(),
            exec_root: defaults.exec_root.clone(),
            file_root: defaults.file_root.clone(),
            transport: defaults.transport.clone(),
            thread_limit: defaults.thread_limit,
        }
    }

    pub fn with_thread_limit(mut self, thread_limit: u32) -> Self {
        self.thread_limit = thread_limit;
        self
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = transport.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Sleep between scheduler cycles.
    pub poll_interval_ms: u64,
    /// Upper bound on node bring-ups running at the same time.
    pub max_concurrent_bringups: usize,
    /// Time allowed for a single bring-up attempt.
    pub bringup_timeout_ms: u64,
    /// Name nodes use to reach this coordinator.
    pub local_host_name: String,
    pub node_defaults: NodeDefaults,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_concurrent_bringups: 8,
            bringup_timeout_ms: 30_000,
            local_host_name: "localhost".to_string(),
            node_defaults: NodeDefaults::default(),
        }
    }
}

impl ClusterConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn bringup_timeout(&self) -> Duration {
        Duration::from_millis(self.bringup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_defaults_default() {
        let defaults = NodeDefaults::default();
        assert_eq!(defaults.transport, "local");
        assert_eq!(defaults.thread_limit, 0);
        assert!(defaults.user.is_empty());
    }

    #[test]
    fn test_cluster_config_default() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.poll_interval_ms, 1000);
        assert_eq!(cfg.max_concurrent_bringups, 8);
        assert_eq!(cfg.bringup_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.local_host_name, "localhost");
    }

    #[test]
    fn test_cluster_config_with_poll_interval() {
        let cfg = ClusterConfig::default().with_poll_interval(Duration::from_millis(25));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(25));
    }

    #[test]
    fn test_node_config_new_uses_defaults() {
        let cfg = NodeConfig::new(7, "worker-7");
        assert_eq!(cfg.id, 7);
        assert_eq!(cfg.host, "worker-7");
        assert_eq!(cfg.transport, LOCAL_TRANSPORT);
        assert_eq!(cfg.thread_limit, 0);
    }

    #[test]
    fn test_node_config_with_defaults() {
        let defaults = NodeDefaults {
            user: "alice".to_string(),
            exec_root: PathBuf::from("/opt/worker"),
            file_root: PathBuf::from("/data"),
            transport: "ssh".to_string(),
            thread_limit: 16,
        };
        let cfg = NodeConfig::with_defaults(3, "gpu-3", &defaults);
        assert_eq!(cfg.user, "alice");
        assert_eq!(cfg.exec_root, PathBuf::from("/opt/worker"));
        assert_eq!(cfg.file_root, PathBuf::from("/data"));
        assert_eq!(cfg.transport, "ssh");
        assert_eq!(cfg.thread_limit, 16);
    }

    #[test]
    fn test_node_config_builders() {
        let cfg = NodeConfig::new(1, "a")
            .with_thread_limit(4)
            .with_transport("socket");
        assert_eq!(cfg.thread_limit, 4);
        assert_eq!(cfg.transport, "socket");
    }
}
