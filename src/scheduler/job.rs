use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::worker::NodeId;

pub type JobId = u64;

/// Value a task produces. Results cross the node boundary, so they are kept
/// in a serializable form.
pub type TaskOutput = serde_json::Value;

/// Outcome of one task run. The error string is the remote failure message.
pub type TaskResult = std::result::Result<TaskOutput, String>;

/// A schedulable piece of work.
///
/// Tasks may run more than once: a unit whose node disconnects is re-queued
/// and runs again elsewhere, so `run` takes `&self`.
pub trait Task: Send + Sync + 'static {
    fn run(&self) -> BoxFuture<'static, TaskResult>;

    /// Short human-readable description used in logs.
    fn describe(&self) -> String {
        "task".to_string()
    }
}

impl<F, Fut> Task for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    fn run(&self) -> BoxFuture<'static, TaskResult> {
        Box::pin((self)())
    }
}

/// Execution slots a unit asks for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SlotRequest {
    /// A fixed number of slots on whichever node runs the unit.
    Threads(u32),
    /// A share of the node's thread limit, e.g. 0.5 for half a node.
    Fraction(f32),
}

impl Default for SlotRequest {
    fn default() -> Self {
        SlotRequest::Threads(1)
    }
}

impl SlotRequest {
    /// Slots this request occupies on a node with the given thread limit.
    ///
    /// Fractions round up and never drop below one slot.
    pub fn slots_on(&self, thread_limit: u32) -> u32 {
        match *self {
            SlotRequest::Threads(n) => n,
            SlotRequest::Fraction(f) => {
                let wanted = (f64::from(f) * f64::from(thread_limit)).ceil();
                if wanted.is_finite() && wanted >= 1.0 {
                    wanted.min(f64::from(u32::MAX)) as u32
                } else {
                    1
                }
            }
        }
    }
}

impl fmt::Display for SlotRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotRequest::Threads(n) => write!(f, "{} threads", n),
            SlotRequest::Fraction(x) => write!(f, "{:.2} of a node", x),
        }
    }
}

/// One schedulable task paired with its id, slot request and current node.
///
/// The id never changes, so a unit that is re-queued keeps resolving the
/// promise handed out at submission.
#[derive(Clone)]
pub struct UnitOfWork {
    pub id: JobId,
    pub task: Arc<dyn Task>,
    pub slots: SlotRequest,
    pub assigned_node: Option<NodeId>,
    pub submitted_at: DateTime<Utc>,
}

impl UnitOfWork {
    pub fn new(id: JobId, task: Arc<dyn Task>, slots: SlotRequest) -> Self {
        Self {
            id,
            task,
            slots,
            assigned_node: None,
            submitted_at: Utc::now(),
        }
    }

    pub fn requested_slots(&self, thread_limit: u32) -> u32 {
        self.slots.slots_on(thread_limit)
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("task", &self.task.describe())
            .field("slots", &self.slots)
            .field("assigned_node", &self.assigned_node)
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Task> {
        Arc::new(|| async { TaskResult::Ok(serde_json::Value::Null) })
    }

    #[test]
    fn test_thread_request_ignores_node_size() {
        assert_eq!(SlotRequest::Threads(2).slots_on(1), 2);
        assert_eq!(SlotRequest::Threads(2).slots_on(64), 2);
    }

    #[test]
    fn test_fraction_rounds_up() {
        assert_eq!(SlotRequest::Fraction(0.5).slots_on(8), 4);
        assert_eq!(SlotRequest::Fraction(0.3).slots_on(8), 3);
        assert_eq!(SlotRequest::Fraction(1.0).slots_on(6), 6);
    }

    #[test]
    fn test_fraction_never_below_one_slot() {
        assert_eq!(SlotRequest::Fraction(0.01).slots_on(4), 1);
        assert_eq!(SlotRequest::Fraction(0.0).slots_on(4), 1);
        assert_eq!(SlotRequest::Fraction(f32::NAN).slots_on(4), 1);
    }

    #[test]
    fn test_new_unit_is_unassigned() {
        let unit = UnitOfWork::new(9, noop(), SlotRequest::default());
        assert_eq!(unit.id, 9);
        assert!(unit.assigned_node.is_none());
        assert_eq!(unit.requested_slots(4), 1);
    }

    #[tokio::test]
    async fn test_closures_are_tasks() {
        let task: Arc<dyn Task> = Arc::new(|| async { TaskResult::Ok(serde_json::json!(42)) });
        assert_eq!(task.run().await, Ok(serde_json::json!(42)));
        // A task can be run again after a re-queue.
        assert_eq!(task.run().await, Ok(serde_json::json!(42)));
    }
}
