pub mod bringup;
pub mod cluster;
pub mod config;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod transport;
pub mod worker;

pub use cluster::{Cluster, ClusterState, ClusterStatus};
pub use config::{ClusterConfig, NodeConfig, NodeDefaults};
pub use error::{FlotillaError, Result};
pub use scheduler::{JobId, JobOutcome, Promise, SlotRequest, Task, TaskOutput, TaskResult, UnitOfWork};
pub use service::ExecutorService;
pub use transport::{LocalTransport, NodeTransport, TransportRegistry};
pub use worker::{NodeEvents, NodeHandle, NodeId, NodeState, ShellTask};
