use std::fmt;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::watch;

use crate::error::{FlotillaError, Result};
use crate::scheduler::job::{JobId, TaskOutput, TaskResult};

/// Terminal state of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(TaskOutput),
    Failed(String),
    Cancelled,
}

impl From<TaskResult> for JobOutcome {
    fn from(result: TaskResult) -> Self {
        match result {
            Ok(value) => JobOutcome::Completed(value),
            Err(message) => JobOutcome::Failed(message),
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed(_) => write!(f, "completed"),
            JobOutcome::Failed(_) => write!(f, "failed"),
            JobOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Something that can cancel a job by id. Implemented by the scheduler.
pub(crate) trait JobCanceller: Send + Sync {
    fn cancel_job(&self, id: JobId, force: bool) -> bool;
}

/// Write side of a promise. Accepts exactly one terminal write.
#[derive(Debug)]
pub(crate) struct PromiseCell {
    id: JobId,
    tx: watch::Sender<Option<JobOutcome>>,
}

impl PromiseCell {
    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    /// Record the outcome. Returns false if the promise was already resolved.
    pub(crate) fn finish(&self, outcome: JobOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub(crate) fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Caller-side handle for one submitted job.
#[derive(Clone)]
pub struct Promise {
    id: JobId,
    cell: Arc<PromiseCell>,
    rx: watch::Receiver<Option<JobOutcome>>,
    canceller: Option<Weak<dyn JobCanceller>>,
}

impl Promise {
    pub(crate) fn new(id: JobId, canceller: Option<Weak<dyn JobCanceller>>) -> (Self, Arc<PromiseCell>) {
        let (tx, rx) = watch::channel(None);
        let cell = Arc::new(PromiseCell { id, tx });
        let promise = Self {
            id,
            cell: cell.clone(),
            rx,
            canceller,
        };
        (promise, cell)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.rx.borrow(), Some(JobOutcome::Cancelled))
    }

    /// Current outcome without waiting.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait for the job to reach a terminal state.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.rx.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|slot| slot.clone());
        // The promise holds its own sender, so the channel cannot close while
        // we wait on it.
        outcome.unwrap_or_else(|| JobOutcome::Failed("promise abandoned".to_string()))
    }

    /// Wait for the job and convert its outcome into a `Result`.
    pub async fn result(&self) -> Result<TaskOutput> {
        match self.wait().await {
            JobOutcome::Completed(value) => Ok(value),
            JobOutcome::Failed(message) => Err(FlotillaError::JobFailed {
                id: self.id,
                message,
            }),
            JobOutcome::Cancelled => Err(FlotillaError::Cancelled(self.id)),
        }
    }

    /// Cancel the job.
    ///
    /// Queued jobs always cancel. A job already running on a node is only
    /// cancelled when `force` is set.
    pub fn cancel(&self, force: bool) -> bool {
        if self.is_done() {
            return false;
        }
        match self.canceller.as_ref().and_then(Weak::upgrade) {
            Some(canceller) => canceller.cancel_job(self.id, force),
            None => self.cell.finish(JobOutcome::Cancelled),
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("outcome", &*self.rx.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_second_write_is_ignored() {
        let (promise, cell) = Promise::new(1, None);
        assert!(cell.finish(JobOutcome::Completed(json!("first"))));
        assert!(!cell.finish(JobOutcome::Cancelled));
        assert_eq!(promise.outcome(), Some(JobOutcome::Completed(json!("first"))));
        assert!(!promise.is_cancelled());
    }

    #[test]
    fn test_detached_promise_cancels_locally() {
        let (promise, _cell) = Promise::new(2, None);
        assert!(promise.cancel(false));
        assert!(promise.is_cancelled());
        assert!(!promise.cancel(true), "already resolved");
    }

    #[tokio::test]
    async fn test_wait_returns_outcome_written_later() {
        let (promise, cell) = Promise::new(3, None);
        let waiter = promise.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        cell.finish(JobOutcome::Failed("boom".to_string()));
        assert_eq!(handle.await.unwrap(), JobOutcome::Failed("boom".to_string()));
    }

    #[tokio::test]
    async fn test_result_maps_outcomes_to_errors() {
        let (promise, cell) = Promise::new(4, None);
        cell.finish(JobOutcome::Cancelled);
        assert!(matches!(
            promise.result().await,
            Err(FlotillaError::Cancelled(4))
        ));

        let (promise, cell) = Promise::new(5, None);
        cell.finish(JobOutcome::Completed(json!({"ok": true})));
        assert_eq!(promise.result().await.unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_outcome_from_task_result() {
        assert_eq!(JobOutcome::from(Ok(json!(1))), JobOutcome::Completed(json!(1)));
        assert_eq!(
            JobOutcome::from(Err("bad".to_string())),
            JobOutcome::Failed("bad".to_string())
        );
    }
}
