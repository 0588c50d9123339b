//! Named node transports.
//!
//! A transport knows how to turn a [`NodeConfig`] into a live
//! [`NodeHandle`]. Node configs name their transport, and the cluster looks
//! it up in a [`TransportRegistry`] when bringing the node up.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::{NodeConfig, LOCAL_TRANSPORT};
use crate::error::{FlotillaError, Result};
use crate::worker::{LocalNode, NodeEvents, SharedNode};

pub trait NodeTransport: Send + Sync + 'static {
    /// Connect to (or start) the node described by `config`.
    ///
    /// The returned handle must already be `Active` and must report later
    /// state changes through `events`.
    fn connect(&self, config: NodeConfig, events: NodeEvents) -> BoxFuture<'static, Result<SharedNode>>;
}

/// Transport lookup by name.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn NodeTransport>>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding only the in-process transport under `"local"`.
    pub fn with_local() -> Self {
        let mut registry = Self::new();
        registry.register(LOCAL_TRANSPORT, Arc::new(LocalTransport));
        registry
    }

    /// Register `transport` under `name`, returning any transport it replaced.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        transport: Arc<dyn NodeTransport>,
    ) -> Option<Arc<dyn NodeTransport>> {
        self.transports.insert(name.into(), transport)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeTransport>> {
        self.transports.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.transports.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn connect(&self, config: NodeConfig, events: NodeEvents) -> Result<SharedNode> {
        let transport = self
            .get(&config.transport)
            .ok_or_else(|| FlotillaError::UnknownTransport(config.transport.clone()))?;
        transport.connect(config, events).await
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("transports", &self.names())
            .finish()
    }
}

/// Runs nodes inside this process on the current Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl NodeTransport for LocalTransport {
    fn connect(&self, config: NodeConfig, events: NodeEvents) -> BoxFuture<'static, Result<SharedNode>> {
        Box::pin(async move {
            let runtime = tokio::runtime::Handle::current();
            let node: SharedNode = LocalNode::start(config, events, runtime);
            Ok(node)
        })
    }
}
