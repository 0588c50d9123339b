use serde::{Deserialize, Serialize};

/// Cluster lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Instantiated,
    Initialized,
    Started,
    Running,
    Stopping,
    Stopped,
    Unknown,
}

impl ClusterState {
    /// Legal transitions:
    ///
    /// ```text
    /// Instantiated -> Initialized -> Started <-> Running
    ///       any of the above -> Stopping -> Stopped
    /// ```
    ///
    /// `Stopped` and `Unknown` have no way out.
    pub fn can_transition_to(self, next: ClusterState) -> bool {
        use ClusterState::*;
        matches!(
            (self, next),
            (Instantiated, Initialized)
                | (Initialized, Started)
                | (Started, Running)
                | (Running, Started)
                | (Instantiated | Initialized | Started | Running, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ClusterState::Stopped | ClusterState::Unknown)
    }

    /// Shutdown has been requested or completed.
    pub fn is_shutdown(self) -> bool {
        matches!(self, ClusterState::Stopping | ClusterState::Stopped)
    }

    /// Nodes may join only between `start` and shutdown.
    pub fn accepts_nodes(self) -> bool {
        matches!(self, ClusterState::Started | ClusterState::Running)
    }

    /// Stable numeric code, for status output.
    pub fn code(self) -> i32 {
        match self {
            ClusterState::Instantiated => 0,
            ClusterState::Initialized => 1,
            ClusterState::Started => 2,
            ClusterState::Running => 3,
            ClusterState::Stopping => 4,
            ClusterState::Stopped => 5,
            ClusterState::Unknown => -1,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ClusterState::Instantiated,
            1 => ClusterState::Initialized,
            2 => ClusterState::Started,
            3 => ClusterState::Running,
            4 => ClusterState::Stopping,
            5 => ClusterState::Stopped,
            _ => ClusterState::Unknown,
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Instantiated => write!(f, "instantiated"),
            ClusterState::Initialized => write!(f, "initialized"),
            ClusterState::Started => write!(f, "started"),
            ClusterState::Running => write!(f, "running"),
            ClusterState::Stopping => write!(f, "stopping"),
            ClusterState::Stopped => write!(f, "stopped"),
            ClusterState::Unknown => write!(f, "unknown"),
        }
    }
}
