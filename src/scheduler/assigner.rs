use std::cmp::Reverse;
use std::collections::VecDeque;

use crate::scheduler::job::UnitOfWork;
use crate::worker::{NodeId, NodeState, SharedNode};

/// Order units so the biggest slot requests are placed first.
///
/// Fractional requests are measured against `max_threads`, the largest thread
/// limit in the cluster. The sort is stable, so equal requests keep their
/// submission order.
pub fn order_by_slots(units: &mut [UnitOfWork], max_threads: u32) {
    units.sort_by_key(|u| Reverse(u.requested_slots(max_threads)));
}

/// Result of handing one unit to one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Accepted,
    Refused,
    /// The node refused, but its loss was handled meanwhile and the unit was
    /// re-queued from there. The caller must not queue it again.
    Reclaimed,
}

/// Where a unit ended up after one pass over the rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Placed(NodeId),
    Reclaimed,
    Unplaced,
}

/// Round-robin rotation over nodes that have free slots.
///
/// Each unit is offered to the node at the front. Whatever happens, the
/// rotation advances one step afterwards, which spreads work across nodes
/// like dealing cards.
#[derive(Default)]
pub struct NodeRotation {
    nodes: VecDeque<SharedNode>,
}

impl NodeRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync the rotation with the current node list.
    ///
    /// Nodes that are no longer active or have no free slots drop out.
    /// Nodes that regained capacity rejoin at the front.
    pub fn refresh(&mut self, live: &[SharedNode]) {
        self.nodes
            .retain(|n| n.state() == NodeState::Active && n.available_slots() > 0);
        for node in live {
            if node.state() != NodeState::Active || node.available_slots() == 0 {
                continue;
            }
            if !self.nodes.iter().any(|n| n.id() == node.id()) {
                tracing::debug!(node_id = node.id(), host = %node.host(), "Node has free slots");
                self.nodes.push_front(node.clone());
            }
        }
    }

    /// Offer `unit` to each node in turn, starting at the front.
    ///
    /// `dispatch` performs the actual hand-off. A node left with no free
    /// slots leaves the rotation, and so does a node that was lost while
    /// taking the unit.
    pub fn try_submit<F>(&mut self, unit: &UnitOfWork, mut dispatch: F) -> Placement
    where
        F: FnMut(&SharedNode, &UnitOfWork) -> Handoff,
    {
        for _ in 0..self.nodes.len() {
            let Some(node) = self.nodes.front().cloned() else {
                break;
            };
            let wanted = unit.requested_slots(node.thread_limit());
            if node.available_slots() < wanted {
                self.rotate();
                continue;
            }
            match dispatch(&node, unit) {
                Handoff::Accepted => {
                    if node.available_slots() == 0 {
                        self.nodes.pop_front();
                    }
                    return Placement::Placed(node.id());
                }
                Handoff::Reclaimed => {
                    self.nodes.pop_front();
                    return Placement::Reclaimed;
                }
                Handoff::Refused => self.rotate(),
            }
        }
        Placement::Unplaced
    }

    pub fn rotate(&mut self) {
        if let Some(node) = self.nodes.pop_front() {
            self.nodes.push_back(node);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id()).collect()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}
