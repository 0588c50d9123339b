use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cluster::state::ClusterState;
use crate::cluster::CoordinatorEvent;
use crate::scheduler::promise::PromiseCell;
use crate::scheduler::JobId;
use crate::worker::{NodeId, NodeState, SharedNode};

/// Snapshot published to cluster listeners on every state or count change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub state: ClusterState,
    /// Units handed to nodes and not yet retired.
    pub running_jobs: i64,
    /// Registered nodes that have reported `Active`.
    pub running_nodes: usize,
    /// Registered nodes in any state.
    pub nodes: usize,
    /// Consistency failures detected so far.
    pub internal_errors: u64,
}

/// Shared coordinator bookkeeping: lifecycle state, nodes, promises and
/// counters. Every component holds the same `Arc<Ledger>`.
pub(crate) struct Ledger {
    state: Mutex<ClusterState>,
    nodes: Mutex<Vec<SharedNode>>,
    counted: Mutex<HashSet<NodeId>>,
    promises: Mutex<HashMap<JobId, Arc<PromiseCell>>>,
    next_job_id: AtomicU64,
    job_count: AtomicI64,
    internal_errors: AtomicU64,
    status: watch::Sender<ClusterStatus>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl Ledger {
    pub(crate) fn new(events: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        let (status, _) = watch::channel(ClusterStatus {
            state: ClusterState::Instantiated,
            running_jobs: 0,
            running_nodes: 0,
            nodes: 0,
            internal_errors: 0,
        });
        Self {
            state: Mutex::new(ClusterState::Instantiated),
            nodes: Mutex::new(Vec::new()),
            counted: Mutex::new(HashSet::new()),
            promises: Mutex::new(HashMap::new()),
            next_job_id: AtomicU64::new(1),
            job_count: AtomicI64::new(0),
            internal_errors: AtomicU64::new(0),
            status,
            events,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(tx)
    }

    pub(crate) fn events(&self) -> mpsc::UnboundedSender<CoordinatorEvent> {
        self.events.clone()
    }

    pub(crate) fn send(&self, event: CoordinatorEvent) {
        if self.events.send(event).is_err() {
            debug!("Coordinator event loop is gone");
        }
    }

    // ---- lifecycle state ----

    pub(crate) fn state(&self) -> ClusterState {
        *self.state.lock()
    }

    /// Move to `to` if the transition table allows it. Moving to the current
    /// state is accepted as a no-op.
    pub(crate) fn transition(&self, to: ClusterState) -> bool {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if from == to && !from.is_terminal() {
                return true;
            }
            if !from.can_transition_to(to) {
                warn!(from = %from, to = %to, "Rejected cluster state transition");
                return false;
            }
            *state = to;
            from
        };
        info!(from = %from, to = %to, "Cluster state changed");
        self.publish();
        true
    }

    /// Forget nodes and running jobs. Used by `init`.
    pub(crate) fn reset_counters(&self) {
        self.nodes.lock().clear();
        self.counted.lock().clear();
        self.job_count.store(0, Ordering::SeqCst);
        self.publish();
    }

    // ---- jobs ----

    pub(crate) fn next_job_id(&self) -> JobId {
        self.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register_promise(&self, cell: Arc<PromiseCell>) {
        self.promises.lock().insert(cell.id(), cell);
    }

    pub(crate) fn take_promise(&self, id: JobId) -> Option<Arc<PromiseCell>> {
        self.promises.lock().remove(&id)
    }

    pub(crate) fn has_promise(&self, id: JobId) -> bool {
        self.promises.lock().contains_key(&id)
    }

    pub(crate) fn job_count(&self) -> i64 {
        self.job_count.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_job_count(&self) {
        self.job_count.fetch_add(1, Ordering::SeqCst);
        self.publish();
    }

    /// Undo an increment for a unit the node refused. Never halts.
    pub(crate) fn revert_job_count(&self) {
        self.job_count.fetch_sub(1, Ordering::SeqCst);
        self.publish();
    }

    /// Count one unit as retired. When the count reaches zero during a
    /// graceful shutdown, the nodes are halted.
    pub(crate) fn decrement_job_count(&self) {
        let remaining = self.job_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining < 0 {
            warn!(job_count = remaining, "Job count went negative");
        }
        self.publish();
        if remaining <= 0 && self.state() == ClusterState::Stopping {
            debug!("Last running job finished during shutdown");
            self.halt_finished();
        }
    }

    /// Close every node once no work is left. With no nodes to wait for, the
    /// coordinator is told to terminate directly.
    pub(crate) fn halt_finished(&self) {
        let nodes = self.live_nodes();
        debug!(nodes = nodes.len(), "Halting nodes");
        if nodes.is_empty() {
            self.send(CoordinatorEvent::Drained);
        }
        for node in nodes {
            node.close();
        }
    }

    pub(crate) fn record_inconsistency(&self) {
        self.internal_errors.fetch_add(1, Ordering::SeqCst);
        self.publish();
    }

    pub(crate) fn internal_errors(&self) -> u64 {
        self.internal_errors.load(Ordering::SeqCst)
    }

    // ---- nodes ----

    pub(crate) fn add_node(&self, node: SharedNode) {
        let mut nodes = self.nodes.lock();
        if nodes.iter().any(|n| n.id() == node.id()) {
            return;
        }
        nodes.push(node);
        drop(nodes);
        self.publish();
    }

    pub(crate) fn remove_node(&self, id: NodeId) -> Option<SharedNode> {
        let removed = {
            let mut nodes = self.nodes.lock();
            let pos = nodes.iter().position(|n| n.id() == id)?;
            nodes.remove(pos)
        };
        self.publish();
        Some(removed)
    }

    pub(crate) fn clear_nodes(&self) {
        self.nodes.lock().clear();
        self.counted.lock().clear();
        self.publish();
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<SharedNode> {
        self.nodes.lock().iter().find(|n| n.id() == id).cloned()
    }

    pub(crate) fn has_node(&self, id: NodeId) -> bool {
        self.nodes.lock().iter().any(|n| n.id() == id)
    }

    pub(crate) fn live_nodes(&self) -> Vec<SharedNode> {
        self.nodes.lock().clone()
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub(crate) fn active_node_count(&self) -> usize {
        self.nodes
            .lock()
            .iter()
            .filter(|n| n.state() == NodeState::Active)
            .count()
    }

    /// Largest thread limit among registered nodes, at least 1.
    pub(crate) fn max_threads(&self) -> u32 {
        self.nodes
            .lock()
            .iter()
            .map(|n| n.thread_limit())
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// Count a node as running. Returns the new running-node count.
    pub(crate) fn node_joined(&self, id: NodeId) -> usize {
        let count = {
            let mut counted = self.counted.lock();
            counted.insert(id);
            counted.len()
        };
        self.publish();
        count
    }

    /// Stop counting a node. Returns the new count, or `None` if the node was
    /// never counted.
    pub(crate) fn node_left(&self, id: NodeId) -> Option<usize> {
        let count = {
            let mut counted = self.counted.lock();
            if !counted.remove(&id) {
                return None;
            }
            counted.len()
        };
        self.publish();
        Some(count)
    }

    pub(crate) fn running_nodes(&self) -> usize {
        self.counted.lock().len()
    }

    // ---- listeners ----

    pub(crate) fn snapshot(&self) -> ClusterStatus {
        ClusterStatus {
            state: self.state(),
            running_jobs: self.job_count(),
            running_nodes: self.running_nodes(),
            nodes: self.node_count(),
            internal_errors: self.internal_errors(),
        }
    }

    /// The snapshot is taken under the channel's lock, so concurrent
    /// publishers cannot leave an older snapshot in place.
    pub(crate) fn publish(&self) {
        self.status.send_if_modified(|current| {
            let snapshot = self.snapshot();
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ClusterStatus> {
        self.status.subscribe()
    }
}
