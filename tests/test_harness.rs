//! Test harness for cluster integration tests.
//!
//! Provides a scriptable mock transport whose nodes hold submitted jobs until
//! the test completes them, plus helpers for building clusters and polling.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use flotilla::worker::Completion;
use flotilla::{
    Cluster, ClusterConfig, FlotillaError, JobId, NodeConfig, NodeEvents, NodeHandle, NodeId, NodeState,
    NodeTransport, Result, Task, TaskResult, TransportRegistry, UnitOfWork,
};

pub const MOCK_TRANSPORT: &str = "mock";

struct Held {
    unit: UnitOfWork,
    slots: u32,
    on_complete: Completion,
}

struct MockState {
    state: NodeState,
    used: u32,
    held: HashMap<JobId, Held>,
    submitted: Vec<JobId>,
    cancelled: Vec<JobId>,
    refuse_cancel: bool,
}

/// A node that accepts jobs and keeps them until told to finish them.
pub struct MockNode {
    config: NodeConfig,
    limit: u32,
    events: NodeEvents,
    inner: Mutex<MockState>,
}

impl MockNode {
    pub fn new(config: NodeConfig, events: NodeEvents) -> Arc<Self> {
        let limit = config.thread_limit.max(1);
        Arc::new(Self {
            config,
            limit,
            events,
            inner: Mutex::new(MockState {
                state: NodeState::Active,
                used: 0,
                held: HashMap::new(),
                submitted: Vec::new(),
                cancelled: Vec::new(),
                refuse_cancel: false,
            }),
        })
    }

    /// Finish a held job. False if the node no longer holds it.
    pub fn complete(&self, id: JobId, result: TaskResult) -> bool {
        let held = {
            let mut inner = self.inner.lock();
            let Some(held) = inner.held.remove(&id) else {
                return false;
            };
            inner.used = inner.used.saturating_sub(held.slots);
            held
        };
        (held.on_complete)(result);
        true
    }

    /// Run the held job's real task and report its result.
    pub async fn run_held(&self, id: JobId) -> bool {
        let task = match self.inner.lock().held.get(&id) {
            Some(held) => held.unit.task.clone(),
            None => return false,
        };
        let result = task.run().await;
        self.complete(id, result)
    }

    pub fn held_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<_> = self.inner.lock().held.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn submitted(&self) -> Vec<JobId> {
        self.inner.lock().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<JobId> {
        self.inner.lock().cancelled.clone()
    }

    pub fn set_refuse_cancel(&self, refuse: bool) {
        self.inner.lock().refuse_cancel = refuse;
    }

    /// Simulate the connection dropping.
    pub fn disconnect(&self) {
        self.close();
    }
}

impl NodeHandle for MockNode {
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
        self.limit
    }

    fn available_slots(&self) -> u32 {
        self.limit.saturating_sub(self.inner.lock().used)
    }

    fn submit(&self, unit: UnitOfWork, on_complete: Completion) -> bool {
        let mut inner = self.inner.lock();
        let slots = unit.requested_slots(self.limit);
        if inner.state != NodeState::Active
            || inner.held.contains_key(&unit.id)
            || slots > self.limit.saturating_sub(inner.used)
        {
            return false;
        }
        inner.used += slots;
        inner.submitted.push(unit.id);
        inner.held.insert(
            unit.id,
            Held {
                unit,
                slots,
                on_complete,
            },
        );
        true
    }

    fn cancel(&self, id: JobId) -> bool {
        let mut inner = self.inner.lock();
        inner.cancelled.push(id);
        if inner.refuse_cancel {
            return false;
        }
        match inner.held.remove(&id) {
            Some(held) => {
                inner.used = inner.used.saturating_sub(held.slots);
                true
            }
            None => false,
        }
    }

    fn deactivate(&self) {
        let old = {
            let mut inner = self.inner.lock();
            if inner.state != NodeState::Active {
                return;
            }
            inner.state = NodeState::Inactive;
            NodeState::Active
        };
        self.events.state_changed(self.config.id, NodeState::Inactive, old);
    }

    fn close(&self) {
        let old = {
            let mut inner = self.inner.lock();
            if inner.state == NodeState::Stopped {
                return;
            }
            let old = inner.state;
            inner.state = NodeState::Stopped;
            inner.held.clear();
            inner.used = 0;
            old
        };
        self.events.state_changed(self.config.id, NodeState::Stopped, old);
    }

    fn running_units(&self) -> Vec<UnitOfWork> {
        self.inner.lock().held.values().map(|h| h.unit.clone()).collect()
    }
}

/// Transport producing [`MockNode`]s, with scriptable failures and delays.
#[derive(Default)]
pub struct MockTransport {
    nodes: Mutex<HashMap<NodeId, Arc<MockNode>>>,
    failing_hosts: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
}

impl MockTransport {
    pub fn node(&self, id: NodeId) -> Option<Arc<MockNode>> {
        self.nodes.lock().get(&id).cloned()
    }

    pub fn fail_host(&self, host: &str) {
        self.failing_hosts.lock().insert(host.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every job id currently held by any node.
    pub fn held_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.nodes.lock().values().flat_map(|n| n.held_ids()).collect();
        ids.sort();
        ids
    }

    /// The node currently holding `id`, if any.
    pub fn holder_of(&self, id: JobId) -> Option<Arc<MockNode>> {
        self.nodes
            .lock()
            .values()
            .find(|n| n.held_ids().contains(&id))
            .cloned()
    }
}

impl NodeTransport for MockTransport {
    fn connect(&self, config: NodeConfig, events: NodeEvents) -> BoxFuture<'static, Result<Arc<dyn NodeHandle>>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if self.failing_hosts.lock().contains(&config.host) {
            let host = config.host.clone();
            return Box::pin(async move {
                Err(FlotillaError::BringupFailed {
                    host,
                    reason: "refused".to_string(),
                })
            });
        }
        let node = MockNode::new(config, events);
        self.nodes.lock().insert(node.id(), node.clone());
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let node: Arc<dyn NodeHandle> = node;
            Ok(node)
        })
    }
}

/// Type-erased task, for mixing different task kinds in one submission.
pub type BoxedTask = Box<dyn Fn() -> BoxFuture<'static, TaskResult> + Send + Sync>;

pub fn boxed(task: impl Task) -> BoxedTask {
    Box::new(move || task.run())
}

/// Task that returns `value`.
pub fn value_task(value: serde_json::Value) -> impl Task {
    move || {
        let value = value.clone();
        async move { TaskResult::Ok(value) }
    }
}

/// Task that fails with `message`.
pub fn failing_task(message: &str) -> impl Task {
    let message = message.to_string();
    move || {
        let message = message.clone();
        async move { TaskResult::Err(message) }
    }
}

/// Task that sleeps before returning `value`.
pub fn slow_task(delay: Duration, value: serde_json::Value) -> impl Task {
    move || {
        let value = value.clone();
        async move {
            tokio::time::sleep(delay).await;
            TaskResult::Ok(value)
        }
    }
}

/// Cluster config with short intervals for fast tests.
pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        poll_interval_ms: 10,
        bringup_timeout_ms: 2_000,
        ..ClusterConfig::default()
    }
}

pub fn mock_config(id: NodeId, threads: u32) -> NodeConfig {
    NodeConfig::new(id, format!("mock-{}", id))
        .with_thread_limit(threads)
        .with_transport(MOCK_TRANSPORT)
}

/// A started cluster wired to a mock transport (and the local one).
pub struct TestCluster {
    pub cluster: Cluster,
    pub mock: Arc<MockTransport>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ClusterConfig) -> Self {
        let mock = Arc::new(MockTransport::default());
        let mut transports = TransportRegistry::with_local();
        transports.register(MOCK_TRANSPORT, mock.clone());
        let cluster = Cluster::new(config, transports);
        assert!(cluster.init());
        assert!(cluster.start());
        Self { cluster, mock }
    }

    /// Add a mock node and wait until the cluster has registered it.
    pub async fn add_mock_node(&self, id: NodeId, threads: u32) -> Arc<MockNode> {
        assert!(self.cluster.add_node(mock_config(id, threads)));
        let cluster = self.cluster.clone();
        assert_eventually(
            move || cluster.node(id).is_some(),
            Duration::from_secs(5),
            "mock node should join the cluster",
        )
        .await;
        self.mock.node(id).expect("transport should know the node")
    }

    /// Wait until the mock transport holds exactly `ids`.
    pub async fn wait_for_held(&self, ids: &[JobId]) {
        let mock = self.mock.clone();
        let mut expected = ids.to_vec();
        expected.sort();
        let message = format!("nodes should hold jobs {:?}", expected);
        assert_eventually(move || mock.held_ids() == expected, Duration::from_secs(5), &message).await;
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition() {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    condition()
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> bool,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
