use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::scheduler::{JobId, UnitOfWork};
use crate::worker::{Completion, NodeEvents, NodeHandle, NodeId, NodeState};

struct Running {
    unit: UnitOfWork,
    slots: u32,
    abort: AbortHandle,
}

struct LocalState {
    state: NodeState,
    used_slots: u32,
    running: HashMap<JobId, Running>,
}

/// A node inside the coordinator's own process.
///
/// Units run as Tokio tasks. The thread limit is only a slot budget; the
/// runtime decides which OS threads actually do the work.
pub struct LocalNode {
    config: NodeConfig,
    thread_limit: u32,
    events: NodeEvents,
    runtime: Handle,
    this: Weak<LocalNode>,
    inner: Mutex<LocalState>,
}

impl LocalNode {
    /// Create an active node. A thread limit of 0 means one slot per
    /// available CPU.
    pub fn start(config: NodeConfig, events: NodeEvents, runtime: Handle) -> Arc<Self> {
        let thread_limit = match config.thread_limit {
            0 => std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            n => n,
        };
        info!(node_id = config.id, host = %config.host, thread_limit, "Local node started");
        Arc::new_cyclic(|this| Self {
            config,
            thread_limit,
            events,
            runtime,
            this: this.clone(),
            inner: Mutex::new(LocalState {
                state: NodeState::Active,
                used_slots: 0,
                running: HashMap::new(),
            }),
        })
    }

    /// Free the unit's slots. True if the unit was still running here.
    fn release(&self, id: JobId) -> bool {
        let mut inner = self.inner.lock();
        match inner.running.remove(&id) {
            Some(running) => {
                inner.used_slots = inner.used_slots.saturating_sub(running.slots);
                true
            }
            None => false,
        }
    }

    fn set_state(&self, next: NodeState) {
        let old = {
            let mut inner = self.inner.lock();
            let old = inner.state;
            if old == next || old == NodeState::Stopped {
                return;
            }
            inner.state = next;
            old
        };
        debug!(node_id = self.config.id, from = %old, to = %next, "Local node state changed");
        self.events.state_changed(self.config.id, next, old);
    }
}

impl NodeHandle for LocalNode {
    fn id(&self) -> NodeId {
        self.config.id
    }

    fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    fn thread_limit(&self) -> u32 {
        self.thread_limit
    }

    fn available_slots(&self) -> u32 {
        self.thread_limit
            .saturating_sub(self.inner.lock().used_slots)
    }

    fn submit(&self, unit: UnitOfWork, on_complete: Completion) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != NodeState::Active {
            return false;
        }
        if inner.running.contains_key(&unit.id) {
            warn!(node_id = self.config.id, job_id = unit.id, "Job is already running on this node");
            return false;
        }
        let slots = unit.requested_slots(self.thread_limit);
        if slots > self.thread_limit.saturating_sub(inner.used_slots) {
            return false;
        }

        let id = unit.id;
        let task = unit.task.clone();
        let node = self.this.clone();
        // The lock is held until the unit is recorded, so `release` cannot run first.
        let handle = self.runtime.spawn(async move {
            let result = match AssertUnwindSafe(task.run()).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err("task panicked".to_string()),
            };
            if let Some(node) = node.upgrade() {
                if node.release(id) {
                    on_complete(result);
                }
            }
        });

        inner.used_slots += slots;
        inner.running.insert(
            id,
            Running {
                unit,
                slots,
                abort: handle.abort_handle(),
            },
        );
        true
    }

    fn cancel(&self, id: JobId) -> bool {
        let mut inner = self.inner.lock();
        match inner.running.remove(&id) {
            Some(running) => {
                running.abort.abort();
                inner.used_slots = inner.used_slots.saturating_sub(running.slots);
                debug!(node_id = self.config.id, job_id = id, "Aborted job");
                true
            }
            None => false,
        }
    }

    fn deactivate(&self) {
        if self.state() == NodeState::Active {
            self.set_state(NodeState::Inactive);
        }
    }

    fn close(&self) {
        let (old, aborted) = {
            let mut inner = self.inner.lock();
            if inner.state == NodeState::Stopped {
                return;
            }
            let old = inner.state;
            inner.state = NodeState::Stopped;
            inner.used_slots = 0;
            let aborted = inner.running.len();
            for (_, running) in inner.running.drain() {
                running.abort.abort();
            }
            (old, aborted)
        };
        info!(node_id = self.config.id, aborted, "Local node closed");
        self.events.state_changed(self.config.id, NodeState::Stopped, old);
    }

    fn running_units(&self) -> Vec<UnitOfWork> {
        self.inner
            .lock()
            .running
            .values()
            .map(|r| r.unit.clone())
            .collect()
    }
}
