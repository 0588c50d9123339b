//! Executor-service front end.
//!
//! [`ExecutorService`] submits tasks to a [`Cluster`] with a fixed slot
//! request and offers the usual bulk operations: wait for all, or take the
//! first success and cancel the rest.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::Cluster;
use crate::error::{FlotillaError, Result};
use crate::scheduler::{Promise, SlotRequest, Task, TaskOutput, UnitOfWork};

enum Waited<T> {
    Done(T),
    TimedOut,
    Interrupted,
}

async fn deadline_passed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Submits tasks to a cluster, each asking for the same slots.
#[derive(Clone, Debug)]
pub struct ExecutorService {
    cluster: Cluster,
    slots: SlotRequest,
}

impl ExecutorService {
    pub(crate) fn new(cluster: Cluster, slots: SlotRequest) -> Self {
        Self { cluster, slots }
    }

    pub fn slots(&self) -> SlotRequest {
        self.slots
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn submit<T: Task>(&self, task: T) -> Promise {
        self.submit_shared(Arc::new(task))
    }

    pub fn submit_shared(&self, task: Arc<dyn Task>) -> Promise {
        self.cluster.submit(task, self.slots, false)
    }

    /// Submit and forget.
    pub fn execute<T: Task>(&self, task: T) {
        let promise = self.submit(task);
        debug!(job_id = promise.id(), "Submitted fire-and-forget job");
    }

    /// Submit every task and wait for all of them.
    ///
    /// When `timeout` elapses first, unfinished jobs are force-cancelled.
    /// Either way every promise is returned, in submission order.
    pub async fn submit_all<I, T>(&self, tasks: I, timeout: Option<Duration>) -> Result<Vec<Promise>>
    where
        I: IntoIterator<Item = T>,
        T: Task,
    {
        self.submit_all_interruptible(tasks, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`Self::submit_all`], but gives up with
    /// [`FlotillaError::Interrupted`] when `interrupt` fires. Jobs keep running.
    pub async fn submit_all_interruptible<I, T>(
        &self,
        tasks: I,
        timeout: Option<Duration>,
        interrupt: &CancellationToken,
    ) -> Result<Vec<Promise>>
    where
        I: IntoIterator<Item = T>,
        T: Task,
    {
        let promises: Vec<Promise> = tasks.into_iter().map(|t| self.submit(t)).collect();
        let deadline = timeout.map(|t| Instant::now() + t);

        let waited = {
            let all = async {
                for promise in &promises {
                    promise.wait().await;
                }
            };
            tokio::select! {
                biased;
                _ = all => Waited::Done(()),
                _ = interrupt.cancelled() => Waited::Interrupted,
                _ = deadline_passed(deadline) => Waited::TimedOut,
            }
        };

        match waited {
            Waited::Done(()) => Ok(promises),
            Waited::Interrupted => Err(FlotillaError::Interrupted),
            Waited::TimedOut => {
                let unfinished: Vec<&Promise> = promises.iter().filter(|p| !p.is_done()).collect();
                debug!(unfinished = unfinished.len(), "Timed out waiting on jobs, cancelling the rest");
                for promise in unfinished {
                    promise.cancel(true);
                }
                Ok(promises)
            }
        }
    }

    /// Submit every task and return the first result to succeed.
    ///
    /// Remaining jobs are force-cancelled once a winner is found or the
    /// timeout elapses. If every job fails, the last failure is returned.
    pub async fn submit_any<I, T>(&self, tasks: I, timeout: Option<Duration>) -> Result<TaskOutput>
    where
        I: IntoIterator<Item = T>,
        T: Task,
    {
        self.submit_any_interruptible(tasks, timeout, &CancellationToken::new())
            .await
    }

    pub async fn submit_any_interruptible<I, T>(
        &self,
        tasks: I,
        timeout: Option<Duration>,
        interrupt: &CancellationToken,
    ) -> Result<TaskOutput>
    where
        I: IntoIterator<Item = T>,
        T: Task,
    {
        let promises: Vec<Promise> = tasks.into_iter().map(|t| self.submit(t)).collect();
        if promises.is_empty() {
            return Err(FlotillaError::NoCompletedTasks);
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let waited = {
            let first_success = async {
                let mut pending: FuturesUnordered<_> = promises.iter().map(|p| p.result()).collect();
                let mut last_error = None;
                while let Some(result) = pending.next().await {
                    match result {
                        Ok(value) => return Ok(value),
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(last_error.unwrap_or(FlotillaError::NoCompletedTasks))
            };
            tokio::select! {
                biased;
                result = first_success => Waited::Done(result),
                _ = interrupt.cancelled() => Waited::Interrupted,
                _ = deadline_passed(deadline) => Waited::TimedOut,
            }
        };

        if matches!(waited, Waited::Interrupted) {
            return Err(FlotillaError::Interrupted);
        }
        for promise in promises.iter().filter(|p| !p.is_done()) {
            promise.cancel(true);
        }
        match waited {
            Waited::Done(result) => result,
            Waited::TimedOut => Err(FlotillaError::Timeout(timeout.unwrap_or_default())),
            Waited::Interrupted => Err(FlotillaError::Interrupted),
        }
    }

    // ---- lifecycle passthrough ----

    pub fn shutdown(&self) {
        self.cluster.shutdown();
    }

    pub fn shutdown_now(&self) -> Vec<UnitOfWork> {
        self.cluster.shutdown_now()
    }

    pub fn is_shutdown(&self) -> bool {
        self.cluster.is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.cluster.is_terminated()
    }

    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.cluster.await_termination(timeout).await
    }
}
