//! The cluster coordinator.
//!
//! [`Cluster`] owns the lifecycle state machine, the node set, the scheduler
//! and node bring-up. Node lifecycle changes arrive as events on one channel
//! and are applied by a single event-loop task, so node joins and losses are
//! handled one at a time.
//!
//! # Lifecycle
//!
//! 1. `new` spawns the event loop (state `Instantiated`)
//! 2. `init` resets bookkeeping (`Initialized`)
//! 3. `start` starts bring-up and the scheduler (`Started`)
//! 4. The first active node moves the cluster to `Running`; losing the last
//!    one moves it back to `Started`
//! 5. `shutdown` drains running work, `shutdown_now` abandons it; both end in
//!    `Stopped`

pub mod ledger;
pub mod state;

pub use ledger::ClusterStatus;
pub use state::ClusterState;

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bringup::BringupQueue;
use crate::config::{ClusterConfig, NodeConfig};
use crate::error::{FlotillaError, Result};
use crate::registry::NodeRegistry;
use crate::scheduler::promise::JobCanceller;
use crate::scheduler::{JobId, JobOutcome, Promise, Scheduler, SlotRequest, Task, UnitOfWork};
use crate::service::ExecutorService;
use crate::transport::TransportRegistry;
use crate::worker::{NodeId, NodeState, NodeStateChange, SharedNode};

use self::ledger::Ledger;

/// Messages processed by the coordinator's event loop.
pub(crate) enum CoordinatorEvent {
    /// A bring-up attempt produced a live node.
    NodeConnected(SharedNode),
    NodeStateChanged(NodeStateChange),
    /// The job count hit zero during shutdown and there were no nodes to close.
    Drained,
}

impl std::fmt::Debug for CoordinatorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorEvent::NodeConnected(node) => write!(f, "NodeConnected({})", node.id()),
            CoordinatorEvent::NodeStateChanged(change) => write!(f, "NodeStateChanged({:?})", change),
            CoordinatorEvent::Drained => write!(f, "Drained"),
        }
    }
}

struct Inner {
    config: ClusterConfig,
    ledger: Arc<Ledger>,
    scheduler: Arc<Scheduler>,
    bringup: Arc<BringupQueue>,
    registry: NodeRegistry,
    terminated: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Background tasks hold their own references; stop them with the last handle.
        self.bringup.close();
        self.scheduler.close();
        self.terminated.cancel();
    }
}

/// Handle to a running coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

impl Cluster {
    /// Build a cluster and spawn its event loop.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: ClusterConfig, transports: TransportRegistry) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let ledger = Arc::new(Ledger::new(tx));
        let scheduler = Arc::new(Scheduler::new(ledger.clone(), config.poll_interval()));
        let bringup = Arc::new(BringupQueue::new(
            transports,
            ledger.clone(),
            config.max_concurrent_bringups,
            config.bringup_timeout(),
        ));
        let registry = NodeRegistry::new(config.node_defaults.clone());
        let terminated = CancellationToken::new();

        let inner = Arc::new(Inner {
            config,
            ledger,
            scheduler,
            bringup,
            registry,
            terminated: terminated.clone(),
        });
        tokio::spawn(run_events(Arc::downgrade(&inner), rx, terminated));
        Self { inner }
    }

    /// A cluster that can only start in-process nodes.
    pub fn local(config: ClusterConfig) -> Self {
        Self::new(config, TransportRegistry::with_local())
    }

    // ---- lifecycle ----

    /// Reset bookkeeping. Only valid from `Instantiated`.
    pub fn init(&self) -> bool {
        let ledger = &self.inner.ledger;
        if ledger.state() != ClusterState::Instantiated {
            debug!(state = %ledger.state(), "Cluster already initialized");
            return false;
        }
        ledger.reset_counters();
        ledger.transition(ClusterState::Initialized)
    }

    /// Start bring-up and the scheduler. Only valid from `Initialized`.
    pub fn start(&self) -> bool {
        let ledger = &self.inner.ledger;
        if ledger.state() != ClusterState::Initialized {
            warn!(state = %ledger.state(), "Cluster can only be started after init");
            return false;
        }
        if !ledger.transition(ClusterState::Started) {
            return false;
        }
        self.inner.bringup.start();
        self.inner.scheduler.start();
        info!(
            poll_interval_ms = self.inner.scheduler.poll_interval().as_millis() as u64,
            "Cluster started"
        );
        true
    }

    /// Stop accepting work and let running jobs finish.
    ///
    /// Queued jobs stay queued and are cancelled when the cluster terminates.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.ledger.state().is_shutdown() {
            debug!("Shutdown already in progress");
            return;
        }
        if !inner.ledger.transition(ClusterState::Stopping) {
            return;
        }
        info!(running_jobs = inner.ledger.job_count(), "Shutting down cluster");
        inner.scheduler.stop_polling();
        inner.bringup.close();
        for node in inner.ledger.live_nodes() {
            node.deactivate();
        }
        if inner.ledger.job_count() <= 0 {
            inner.ledger.halt_finished();
        }
    }

    /// Stop immediately.
    ///
    /// Running jobs are cancelled and returned first, followed by every job
    /// that was still queued. The cluster is `Stopped` on return.
    pub fn shutdown_now(&self) -> Vec<UnitOfWork> {
        let inner = &self.inner;
        inner.bringup.close();
        if inner.ledger.state() == ClusterState::Stopped {
            return inner.scheduler.remaining_jobs();
        }
        inner.ledger.transition(ClusterState::Stopping);
        info!("Shutting down cluster now");

        // Nothing is placed after this, and units are retired before any node
        // is closed so node-loss handling cannot take them first.
        inner.scheduler.close();
        let mut abandoned = Vec::new();
        for unit in inner.scheduler.in_flight_units() {
            let Some(unit) = inner.scheduler.retire(unit.id) else {
                continue;
            };
            if let Some(cell) = inner.ledger.take_promise(unit.id) {
                cell.finish(JobOutcome::Cancelled);
            }
            inner.ledger.decrement_job_count();
            abandoned.push(unit);
        }

        for node in inner.ledger.live_nodes() {
            node.close();
        }

        self.terminate_finished();
        abandoned.extend(inner.scheduler.remaining_jobs());
        abandoned
    }

    /// Final step of shutdown. Runs at most once.
    fn terminate_finished(&self) {
        let inner = &self.inner;
        if inner.ledger.state() != ClusterState::Stopping {
            return;
        }
        inner.registry.clear();
        if !inner.ledger.transition(ClusterState::Stopped) {
            return;
        }
        inner.scheduler.close();
        inner.bringup.close();
        inner.ledger.clear_nodes();
        inner.terminated.cancel();
        info!("Cluster terminated");
    }

    // ---- nodes ----

    /// Queue a node for bring-up. Returns false for a duplicate or once the
    /// cluster is shutting down.
    pub fn add_node(&self, config: NodeConfig) -> bool {
        if self.is_shutdown() {
            debug!(host = %config.host, "Cluster is shutting down, not adding node");
            return false;
        }
        let registered = self.inner.registry.contains(config.id);
        if !self.inner.bringup.enqueue(config.clone()) {
            return false;
        }
        if !registered {
            self.inner.registry.insert(config.clone());
        }
        info!(node_id = config.id, host = %config.host, "Queued node for bring-up");
        true
    }

    /// Create a config for `host` from the node defaults and queue it.
    pub fn add_host(&self, host: impl Into<String>, thread_limit: Option<u32>) -> Option<NodeConfig> {
        if self.is_shutdown() {
            return None;
        }
        let mut config = self.inner.registry.new_config(host);
        if let Some(limit) = thread_limit {
            config.thread_limit = limit;
            self.inner.registry.insert(config.clone());
        }
        if self.add_node(config.clone()) {
            Some(config)
        } else {
            self.inner.registry.remove(config.id);
            None
        }
    }

    /// Close a live node. Its running jobs are re-queued.
    pub fn close_node(&self, id: NodeId) -> Result<()> {
        let node = self.inner.ledger.node(id).ok_or(FlotillaError::NodeNotFound(id))?;
        node.close();
        Ok(())
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn nodes(&self) -> Vec<SharedNode> {
        self.inner.ledger.live_nodes()
    }

    pub fn node(&self, id: NodeId) -> Option<SharedNode> {
        self.inner.ledger.node(id)
    }

    /// Configs of live nodes and of nodes still being brought up.
    pub fn node_configs(&self) -> Vec<NodeConfig> {
        let mut configs: Vec<NodeConfig> = self
            .inner
            .ledger
            .live_nodes()
            .iter()
            .map(|n| n.config().clone())
            .collect();
        configs.extend(self.inner.bringup.pending_configs());
        configs.sort_by_key(|c| c.id);
        configs.dedup_by_key(|c| c.id);
        configs
    }

    /// Registered configs with no live node yet.
    pub fn waiting_configs(&self) -> Vec<NodeConfig> {
        self.inner
            .registry
            .configs()
            .into_iter()
            .filter(|c| !self.inner.ledger.has_node(c.id))
            .collect()
    }

    fn handle_event(&self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::NodeConnected(node) => self.register_node(node),
            CoordinatorEvent::NodeStateChanged(change) => match self.inner.ledger.node(change.node_id) {
                Some(node) => {
                    if let Err(e) = self.on_node_state_changed(&node, change.new_state, change.old_state) {
                        error!(node_id = change.node_id, error = %e, "Node state change left the cluster inconsistent");
                    }
                }
                None => debug!(node_id = change.node_id, state = %change.new_state, "State change for an unregistered node"),
            },
            CoordinatorEvent::Drained => self.terminate_finished(),
        }
    }

    fn register_node(&self, node: SharedNode) {
        if !self.inner.bringup.admit(&node) {
            return;
        }
        info!(
            node_id = node.id(),
            host = %node.host(),
            thread_limit = node.thread_limit(),
            "Node joined"
        );
        let state = node.state();
        if let Err(e) = self.on_node_state_changed(&node, state, NodeState::Inactive) {
            error!(node_id = node.id(), error = %e, "Node join left the cluster inconsistent");
        }
    }

    /// Apply a node lifecycle change.
    ///
    /// On `Stopped`, every unit the node was running is retired. If the
    /// cluster is shutting down the unit is cancelled, otherwise it goes back
    /// on the priority queue. A unit with no promise is reported as an error
    /// after the remaining units are handled.
    pub fn on_node_state_changed(&self, node: &SharedNode, new_state: NodeState, old_state: NodeState) -> Result<()> {
        let inner = &self.inner;
        debug!(node_id = node.id(), from = %old_state, to = %new_state, "Node state changed");
        match new_state {
            NodeState::Active => {
                if inner.ledger.state().accepts_nodes() {
                    let running = inner.ledger.node_joined(node.id());
                    debug!(node_id = node.id(), running_nodes = running, "Node is running");
                    inner.ledger.transition(ClusterState::Running);
                }
                Ok(())
            }
            NodeState::Inactive => Ok(()),
            NodeState::Stopped => {
                info!(node_id = node.id(), host = %node.host(), "Node stopped");
                let mut orphans = Vec::new();
                for unit in inner.scheduler.in_flight_on(node.id()) {
                    if let Some(id) = self.reclaim(unit.id, node.id()) {
                        orphans.push(id);
                    }
                }

                if inner.ledger.remove_node(node.id()).is_some() {
                    inner.registry.remove(node.id());
                }
                let running = inner.ledger.node_left(node.id()).unwrap_or_else(|| inner.ledger.running_nodes());
                match inner.ledger.state() {
                    ClusterState::Stopping => {
                        if inner.ledger.node_count() == 0 {
                            self.terminate_finished();
                        }
                    }
                    ClusterState::Stopped => {}
                    _ => {
                        if running == 0 {
                            inner.ledger.transition(ClusterState::Started);
                        }
                    }
                }

                if orphans.is_empty() {
                    Ok(())
                } else {
                    Err(FlotillaError::Inconsistency(format!(
                        "node {} was running jobs with no promise: {:?}",
                        node.id(),
                        orphans
                    )))
                }
            }
        }
    }

    /// Retire one unit from a lost node. Returns the id if its promise was
    /// missing.
    fn reclaim(&self, id: JobId, node_id: NodeId) -> Option<JobId> {
        let inner = &self.inner;
        let unit = inner.scheduler.retire(id)?;

        if self.is_shutdown() {
            debug!(job_id = id, node_id, "Cancelling job from stopped node");
            let cell = inner.ledger.take_promise(id);
            if let Some(cell) = &cell {
                cell.finish(JobOutcome::Cancelled);
            }
            inner.ledger.decrement_job_count();
            return match cell {
                Some(_) => None,
                None => {
                    inner.ledger.record_inconsistency();
                    Some(id)
                }
            };
        }

        inner.ledger.decrement_job_count();
        if !inner.ledger.has_promise(id) {
            error!(job_id = id, node_id, "Job from stopped node has no promise, dropping it");
            inner.ledger.record_inconsistency();
            return Some(id);
        }
        debug!(job_id = id, node_id, "Re-queueing job from stopped node");
        if !inner.scheduler.queue_job(unit, true) {
            error!(job_id = id, "Could not re-queue job");
            if let Some(cell) = inner.ledger.take_promise(id) {
                cell.finish(JobOutcome::Failed(format!("job {} could not be rescheduled", id)));
            }
        }
        None
    }

    // ---- jobs ----

    /// Submit a task. The promise resolves `Failed` right away if the job
    /// cannot be queued.
    pub fn submit(&self, task: Arc<dyn Task>, slots: SlotRequest, priority: bool) -> Promise {
        let inner = &self.inner;
        let id = inner.ledger.next_job_id();
        let canceller: Weak<dyn JobCanceller> = Arc::downgrade(&inner.scheduler) as Weak<dyn JobCanceller>;
        let (promise, cell) = Promise::new(id, Some(canceller));
        inner.ledger.register_promise(cell.clone());

        let rejected = if self.is_shutdown() {
            Some(FlotillaError::ShuttingDown)
        } else if !inner.scheduler.queue_job(UnitOfWork::new(id, task, slots), priority) {
            Some(FlotillaError::QueueRejected(id))
        } else {
            None
        };
        if let Some(e) = rejected {
            warn!(job_id = id, error = %e, "Job rejected");
            inner.ledger.take_promise(id);
            cell.finish(JobOutcome::Failed(e.to_string()));
        } else {
            debug!(job_id = id, slots = %slots, "Job submitted");
        }
        promise
    }

    pub fn cancel_job(&self, id: JobId, force: bool) -> bool {
        self.inner.scheduler.cancel(id, force)
    }

    /// An executor whose jobs each take `threads` slots, clamped to the
    /// largest node.
    pub fn executor(&self, threads: u32) -> ExecutorService {
        let max = self.max_threads();
        let threads = if threads > max {
            info!(requested = threads, available = max, "Requested more threads than any node has, using the maximum");
            max
        } else {
            threads.max(1)
        };
        ExecutorService::new(self.clone(), SlotRequest::Threads(threads))
    }

    /// An executor whose jobs each take `fraction` of a node.
    pub fn fractional_executor(&self, fraction: f32) -> ExecutorService {
        ExecutorService::new(self.clone(), SlotRequest::Fraction(fraction))
    }

    // ---- accessors ----

    pub fn state(&self) -> ClusterState {
        self.inner.ledger.state()
    }

    pub fn status(&self) -> ClusterStatus {
        self.inner.ledger.snapshot()
    }

    /// Listen for state and counter changes.
    pub fn subscribe(&self) -> watch::Receiver<ClusterStatus> {
        self.inner.ledger.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ClusterState::Running
    }

    pub fn is_shutdown(&self) -> bool {
        self.state().is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ClusterState::Stopped
    }

    pub fn accepting_nodes(&self) -> bool {
        self.state().accepts_nodes()
    }

    /// Units dispatched to nodes and not yet retired.
    pub fn running_job_count(&self) -> i64 {
        self.inner.ledger.job_count()
    }

    pub fn queued_job_count(&self) -> usize {
        self.inner.scheduler.queued_job_count()
    }

    pub fn running_node_count(&self) -> usize {
        self.inner.ledger.running_nodes()
    }

    pub fn active_node_count(&self) -> usize {
        self.inner.ledger.active_node_count()
    }

    pub fn max_threads(&self) -> u32 {
        self.inner.ledger.max_threads()
    }

    pub fn internal_errors(&self) -> u64 {
        self.inner.ledger.internal_errors()
    }

    pub fn local_host_name(&self) -> &str {
        &self.inner.config.local_host_name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.scheduler.poll_interval()
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.inner.scheduler.set_poll_interval(interval);
    }

    /// Units still queued when the cluster terminated. Their promises were
    /// cancelled.
    pub fn remaining_jobs(&self) -> Vec<UnitOfWork> {
        self.inner.scheduler.remaining_jobs()
    }

    // ---- waiting ----

    /// Wait until at least one node is active. False on timeout.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let ready = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.state == ClusterState::Running || s.state.is_shutdown()),
        )
        .await;
        let ready = matches!(ready, Ok(Ok(_))) && self.is_ready();
        if !ready {
            error!(timeout_ms = timeout.as_millis() as u64, state = %self.state(), "Cluster was not ready in time");
        }
        ready
    }

    /// Wait until every registered config has a live node.
    pub async fn wait_for_all_nodes(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.subscribe();
        loop {
            let waiting = self.waiting_configs();
            if waiting.is_empty() {
                return Ok(());
            }
            if self.is_shutdown() {
                return Err(FlotillaError::ShuttingDown);
            }
            debug!(waiting = waiting.len(), "Waiting for nodes");
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Err(FlotillaError::Timeout(timeout)),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(FlotillaError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Wait for the cluster to reach `Stopped`. False on timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        if self.is_terminated() {
            return true;
        }
        tokio::time::timeout(timeout, self.inner.terminated.cancelled())
            .await
            .is_ok()
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("status", &self.status()).finish()
    }
}

async fn run_events(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<CoordinatorEvent>,
    terminated: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = terminated.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Cluster { inner }.handle_event(event);
    }
    debug!("Coordinator event loop exited");
}
