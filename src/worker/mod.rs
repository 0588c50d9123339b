//! Coordinator-side view of worker nodes.
//!
//! A node is reached through a transport (see [`crate::transport`]) and is
//! represented here by a [`NodeHandle`]: a local proxy that reports free
//! execution slots, accepts units of work and forwards cancellations.
//!
//! # Components
//!
//! - [`NodeHandle`]: the contract every transport's node proxy implements
//! - [`NodeEvents`]: the channel a handle uses to report lifecycle changes
//! - [`LocalNode`]: an in-process node that runs tasks on the Tokio runtime
//! - [`ShellTask`]: a task that runs a shell command and captures its output
//!
//! # Lifecycle
//!
//! 1. A transport connects and returns a handle that is already `Active`
//! 2. The coordinator registers it and treats that as the node joining
//! 3. `deactivate` moves it to `Inactive`: running work finishes, new work is refused
//! 4. `close` (or a transport failure) moves it to `Stopped`, which is final
//!
//! Every transition after registration is reported through [`NodeEvents`].

pub mod executor;
pub mod local;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cluster::CoordinatorEvent;
use crate::config::NodeConfig;
use crate::scheduler::{JobId, TaskResult, UnitOfWork};

pub use executor::ShellTask;
pub use local::LocalNode;

pub type NodeId = u64;

/// Callback a node invokes exactly once when a submitted unit finishes.
pub type Completion = Box<dyn FnOnce(TaskResult) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Inactive,
    Active,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Inactive => write!(f, "inactive"),
            NodeState::Active => write!(f, "active"),
            NodeState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStateChange {
    pub node_id: NodeId,
    pub new_state: NodeState,
    pub old_state: NodeState,
}

/// Sink for node lifecycle notifications.
///
/// Sending never blocks, so a handle may report from inside its own locks.
#[derive(Debug, Clone)]
pub struct NodeEvents {
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl NodeEvents {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        Self { tx }
    }

    /// Events sent here go nowhere. Useful for handles built outside a cluster.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn state_changed(&self, node_id: NodeId, new_state: NodeState, old_state: NodeState) {
        let change = NodeStateChange {
            node_id,
            new_state,
            old_state,
        };
        if self
            .tx
            .send(CoordinatorEvent::NodeStateChanged(change))
            .is_err()
        {
            tracing::debug!(node_id, state = %new_state, "Coordinator gone, dropping node state change");
        }
    }
}

/// Local proxy for one connected remote execution context.
///
/// No method may block: the coordinator calls these while holding its own
/// locks.
pub trait NodeHandle: Send + Sync + 'static {
    fn id(&self) -> NodeId;

    fn config(&self) -> &NodeConfig;

    fn host(&self) -> &str {
        &self.config().host
    }

    fn state(&self) -> NodeState;

    /// Total execution slots on the node.
    fn thread_limit(&self) -> u32;

    /// Slots not taken by running units.
    fn available_slots(&self) -> u32;

    /// Hand a unit to the node.
    ///
    /// Returns false when the node refuses it (not active, too few free slots,
    /// duplicate id or a send failure). `on_complete` is only invoked for
    /// accepted units, exactly once, and never from inside this call.
    fn submit(&self, unit: UnitOfWork, on_complete: Completion) -> bool;

    /// Best-effort cancel of a running unit. The unit's completion is dropped.
    fn cancel(&self, id: JobId) -> bool;

    /// Stop accepting new units but let running ones finish.
    fn deactivate(&self);

    /// Stop the node. Running units are abandoned.
    fn close(&self);

    fn running_units(&self) -> Vec<UnitOfWork>;
}

impl fmt::Debug for dyn NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.id())
            .field("host", &self.host())
            .field("state", &self.state())
            .field("available_slots", &self.available_slots())
            .finish()
    }
}

/// Shorthand used throughout the coordinator.
pub type SharedNode = Arc<dyn NodeHandle>;
