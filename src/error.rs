use std::time::Duration;

use thiserror::Error;

use crate::scheduler::JobId;
use crate::worker::NodeId;

#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("Cluster is shutting down")]
    ShuttingDown,

    #[error("Job {0} could not be queued")]
    QueueRejected(JobId),

    #[error("Job {0} was cancelled")]
    Cancelled(JobId),

    #[error("Job {id} failed: {message}")]
    JobFailed { id: JobId, message: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Interrupted while waiting for jobs")]
    Interrupted,

    #[error("No task completed successfully")]
    NoCompletedTasks,

    #[error("No transport registered for kind {0:?}")]
    UnknownTransport(String),

    #[error("Could not start node {host}: {reason}")]
    BringupFailed { host: String, reason: String },

    #[error("Timed out starting node {0}")]
    BringupTimeout(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Internal consistency error: {0}")]
    Inconsistency(String),
}

pub type Result<T> = std::result::Result<T, FlotillaError>;
