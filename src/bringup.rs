//! Node bring-up.
//!
//! Configs queued with [`BringupQueue::enqueue`] are started in the
//! background, at most `max_concurrent_bringups` at a time. A config is
//! "queued" until its attempt begins and "waiting" until the attempt ends.
//! Successful connections are handed to the coordinator's event loop, which
//! decides whether to admit the node.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cluster::ledger::Ledger;
use crate::cluster::CoordinatorEvent;
use crate::config::NodeConfig;
use crate::error::FlotillaError;
use crate::transport::TransportRegistry;
use crate::worker::{NodeEvents, NodeId, NodeState, SharedNode};

#[derive(Debug, Default)]
struct Book {
    queued: BTreeMap<NodeId, NodeConfig>,
    waiting: BTreeMap<NodeId, NodeConfig>,
}

pub(crate) struct BringupQueue {
    tx: mpsc::UnboundedSender<NodeConfig>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<NodeConfig>>>,
    book: Mutex<Book>,
    transports: TransportRegistry,
    ledger: Arc<Ledger>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    stop: CancellationToken,
}

impl BringupQueue {
    pub(crate) fn new(
        transports: TransportRegistry,
        ledger: Arc<Ledger>,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            book: Mutex::new(Book::default()),
            transports,
            ledger,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
            stop: CancellationToken::new(),
        }
    }

    /// Queue a config for bring-up.
    ///
    /// Refused when closed, or when a node with the same id is live, queued
    /// or already being started. The check and the insert happen under one
    /// lock.
    pub(crate) fn enqueue(&self, config: NodeConfig) -> bool {
        if self.stop.is_cancelled() {
            debug!(node_id = config.id, "Bring-up queue is closed");
            return false;
        }
        let mut book = self.book.lock();
        let id = config.id;
        if self.ledger.has_node(id) || book.queued.contains_key(&id) || book.waiting.contains_key(&id) {
            debug!(node_id = id, host = %config.host, "Node is already known");
            return false;
        }
        if self.tx.send(config.clone()).is_err() {
            return false;
        }
        book.queued.insert(id, config);
        true
    }

    /// Spawn the bring-up loop. Only the first call has any effect.
    pub(crate) fn start(self: &Arc<Self>) -> bool {
        let Some(rx) = self.rx.lock().take() else {
            return false;
        };
        tokio::spawn(self.clone().run(rx));
        true
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<NodeConfig>) {
        let mut attempts = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Node bring-up task panicked");
                        }
                    }
                }
                next = rx.recv() => match next {
                    Some(config) => self.begin(config, &mut attempts),
                    None => break,
                },
            }
        }
        attempts.shutdown().await;
        info!("Node bring-up stopped");
    }

    fn begin(self: &Arc<Self>, config: NodeConfig, attempts: &mut JoinSet<()>) {
        {
            let mut book = self.book.lock();
            book.queued.remove(&config.id);
            if self.stop.is_cancelled() || self.ledger.has_node(config.id) {
                return;
            }
            book.waiting.insert(config.id, config.clone());
        }
        let this = self.clone();
        attempts.spawn(async move { this.bring_up(config).await });
    }

    async fn bring_up(&self, config: NodeConfig) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };
        info!(node_id = config.id, host = %config.host, transport = %config.transport, "Starting node");

        let events = NodeEvents::new(self.ledger.events());
        let result = match tokio::time::timeout(
            self.timeout,
            self.transports.connect(config.clone(), events),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FlotillaError::BringupTimeout(config.host.clone())),
        };

        match result {
            Ok(node) => self.ledger.send(CoordinatorEvent::NodeConnected(node)),
            Err(e) => {
                self.book.lock().waiting.remove(&config.id);
                error!(node_id = config.id, host = %config.host, error = %e, "Could not start node");
            }
        }
    }

    /// Called by the coordinator for a freshly connected node.
    ///
    /// The node is registered only if the cluster still accepts nodes and the
    /// node is active. A node that arrives too late is closed.
    pub(crate) fn admit(&self, node: &SharedNode) -> bool {
        let mut book = self.book.lock();
        book.waiting.remove(&node.id());
        if !self.ledger.state().accepts_nodes() {
            drop(book);
            info!(node_id = node.id(), host = %node.host(), "Cluster is not accepting nodes, closing");
            node.close();
            return false;
        }
        if node.state() != NodeState::Active {
            debug!(node_id = node.id(), state = %node.state(), "Connected node is not active");
            return false;
        }
        self.ledger.add_node(node.clone());
        true
    }

    /// Configs not yet live: queued or being started.
    pub(crate) fn pending_configs(&self) -> Vec<NodeConfig> {
        let book = self.book.lock();
        book.queued
            .values()
            .chain(book.waiting.values())
            .cloned()
            .collect()
    }

    /// Stop bringing up nodes. Attempts in progress are abandoned.
    pub(crate) fn close(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.stop.cancel();
        let mut book = self.book.lock();
        book.queued.clear();
        book.waiting.clear();
        debug!("Node bring-up closed");
    }
}
