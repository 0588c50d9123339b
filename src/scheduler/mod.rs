//! Job scheduling: queues, the placement cycle and in-flight bookkeeping.
//!
//! The [`Scheduler`] runs a periodic cycle. Each cycle it refreshes the node
//! rotation, pulls newly submitted units into its internal queue (re-queued
//! priority units first, then fresh ones, each batch ordered by slot size)
//! and deals the internal queue out across nodes with free slots.
//!
//! Units a node accepts are tracked as in-flight until exactly one of these
//! retires them: the node's completion, a forced cancel, or node loss.

pub mod assigner;
pub mod job;
pub mod promise;
pub mod queue;

pub use job::{JobId, SlotRequest, Task, TaskOutput, TaskResult, UnitOfWork};
pub use promise::{JobOutcome, Promise};
pub use queue::JobQueue;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::ledger::Ledger;
use crate::scheduler::assigner::{order_by_slots, Handoff, NodeRotation, Placement};
use crate::scheduler::promise::JobCanceller;
use crate::worker::{Completion, NodeId, SharedNode};

/// State owned by the placement cycle.
#[derive(Default)]
struct Cycle {
    internal: VecDeque<UnitOfWork>,
    rotation: NodeRotation,
}

pub struct Scheduler {
    ledger: Arc<Ledger>,
    pending: Mutex<JobQueue>,
    // Lock order: cycle, then pending.
    cycle: Mutex<Cycle>,
    in_flight: Mutex<HashMap<JobId, UnitOfWork>>,
    remaining: Mutex<Vec<UnitOfWork>>,
    poll_interval_ms: AtomicU64,
    polling: AtomicBool,
    started: AtomicBool,
    wake: Notify,
    stop: CancellationToken,
}

impl Scheduler {
    pub(crate) fn new(ledger: Arc<Ledger>, poll_interval: Duration) -> Self {
        Self {
            ledger,
            pending: Mutex::new(JobQueue::new()),
            cycle: Mutex::new(Cycle::default()),
            in_flight: Mutex::new(HashMap::new()),
            remaining: Mutex::new(Vec::new()),
            poll_interval_ms: AtomicU64::new(poll_interval.as_millis() as u64),
            polling: AtomicBool::new(false),
            started: AtomicBool::new(false),
            wake: Notify::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Spawn the scheduling loop. Does nothing if it already ran once.
    pub(crate) fn start(self: &Arc<Self>) -> bool {
        if self.stop.is_cancelled() {
            warn!("Scheduler was closed and cannot be restarted");
            return false;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.polling.store(true, Ordering::SeqCst);
        tokio::spawn(self.clone().run());
        true
    }

    async fn run(self: Arc<Self>) {
        info!(poll_interval_ms = self.poll_interval_ms.load(Ordering::Relaxed), "Scheduler started");
        while self.polling.load(Ordering::SeqCst) {
            let dispatched = self.run_cycle();
            if dispatched > 0 {
                debug!(dispatched, "Scheduler cycle placed jobs");
            }
            tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!("Scheduler interrupted while sleeping");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval()) => {}
                _ = self.wake.notified() => {}
            }
        }
        self.polling.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }

    /// One placement pass. Returns how many units were handed to nodes.
    pub(crate) fn run_cycle(self: &Arc<Self>) -> usize {
        let live = self.ledger.live_nodes();
        let max_threads = self.ledger.max_threads();

        let mut guard = self.cycle.lock();
        let cycle = &mut *guard;
        cycle.rotation.refresh(&live);

        let (mut priority, mut normal) = {
            let mut pending = self.pending.lock();
            (pending.drain_priority(), pending.drain_normal())
        };

        order_by_slots(&mut priority, max_threads);
        for unit in priority.into_iter().rev() {
            debug!(job_id = unit.id, "Moving re-queued job to the front");
            cycle.internal.push_front(unit);
        }
        order_by_slots(&mut normal, max_threads);
        cycle.internal.extend(normal);

        if cycle.internal.is_empty() || cycle.rotation.is_empty() {
            return 0;
        }

        let mut dispatched = 0;
        let units: Vec<UnitOfWork> = cycle.internal.drain(..).collect();
        for unit in units {
            match cycle.rotation.try_submit(&unit, |node, unit| self.dispatch(node, unit)) {
                Placement::Placed(node_id) => {
                    debug!(job_id = unit.id, node_id, "Dispatched job");
                    dispatched += 1;
                }
                Placement::Reclaimed => {
                    debug!(job_id = unit.id, "Node was lost during dispatch, job was re-queued");
                }
                Placement::Unplaced => cycle.internal.push_back(unit),
            }
            cycle.rotation.rotate();
        }
        dispatched
    }

    /// Hand one unit to one node, recording it as in flight first so an
    /// immediate completion finds it.
    ///
    /// If the node is lost while it is taking the unit, node-loss handling may
    /// retire the unit first. The refusal then only undoes what is still
    /// ours to undo.
    fn dispatch(self: &Arc<Self>, node: &SharedNode, unit: &UnitOfWork) -> Handoff {
        let id = unit.id;
        let node_id = node.id();
        let mut assigned = unit.clone();
        assigned.assigned_node = Some(node_id);

        self.in_flight.lock().insert(id, assigned.clone());
        self.ledger.increment_job_count();

        let scheduler = Arc::downgrade(self);
        let on_complete: Completion = Box::new(move |result| {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.finish(id, node_id, result);
            }
        });

        if node.submit(assigned, on_complete) {
            return Handoff::Accepted;
        }
        if self.retire(id).is_some() {
            self.ledger.revert_job_count();
            Handoff::Refused
        } else {
            Handoff::Reclaimed
        }
    }

    /// Record a completion reported by `node_id`.
    ///
    /// Completions from a node that no longer owns the unit are ignored.
    pub(crate) fn finish(&self, id: JobId, node_id: NodeId, result: TaskResult) -> bool {
        let retired = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&id) {
                Some(unit) if unit.assigned_node == Some(node_id) => in_flight.remove(&id),
                Some(_) => {
                    debug!(job_id = id, node_id, "Ignoring completion from a node that no longer owns the job");
                    return false;
                }
                None => None,
            }
        };
        if retired.is_none() {
            debug!(job_id = id, node_id, "Completion for a job that is no longer in flight");
            return false;
        }

        let resolved = match self.ledger.take_promise(id) {
            Some(cell) => cell.finish(JobOutcome::from(result)),
            None => {
                warn!(job_id = id, "Finished job has no promise");
                false
            }
        };
        self.ledger.decrement_job_count();
        self.wake.notify_one();
        resolved
    }

    /// Queue a unit for the next cycle. Re-queued units go in with `priority`.
    pub(crate) fn queue_job(&self, mut unit: UnitOfWork, priority: bool) -> bool {
        unit.assigned_node = None;
        let id = unit.id;
        if !self.pending.lock().push(unit, priority) {
            debug!(job_id = id, "Job queue is closed");
            return false;
        }
        if priority {
            debug!(job_id = id, "Job added to the priority queue");
        }
        self.wake.notify_one();
        true
    }

    /// Cancel a job that is queued or, with `force`, running.
    pub(crate) fn cancel(&self, id: JobId, force: bool) -> bool {
        let queued = {
            let mut cycle = self.cycle.lock();
            let from_pending = self.pending.lock().remove(id);
            from_pending.or_else(|| {
                let pos = cycle.internal.iter().position(|u| u.id == id)?;
                cycle.internal.remove(pos)
            })
        };
        if queued.is_some() {
            debug!(job_id = id, "Cancelled queued job");
            if let Some(cell) = self.ledger.take_promise(id) {
                cell.finish(JobOutcome::Cancelled);
            }
            return true;
        }

        if !force {
            return false;
        }

        let assigned = match self.in_flight.lock().get(&id) {
            Some(unit) => unit.assigned_node,
            None => return false,
        };
        let Some(node_id) = assigned else {
            error!(job_id = id, "Running job has no node");
            self.ledger.record_inconsistency();
            return false;
        };
        let Some(node) = self.ledger.node(node_id) else {
            error!(job_id = id, node_id, "Job was running but its node could not be found, cannot cancel");
            self.ledger.record_inconsistency();
            return false;
        };
        if self.retire(id).is_none() {
            // Completed while we were looking.
            return false;
        }

        match self.ledger.take_promise(id) {
            Some(cell) => {
                cell.finish(JobOutcome::Cancelled);
            }
            None => {
                error!(job_id = id, "Running job has no promise");
                self.ledger.record_inconsistency();
            }
        }
        self.ledger.decrement_job_count();

        if node.cancel(id) {
            debug!(job_id = id, node_id, "Cancelled running job");
            true
        } else {
            error!(job_id = id, node_id, host = %node.host(), "Could not cancel job on node");
            false
        }
    }

    /// Remove a unit from the in-flight table. Only the caller that gets
    /// `Some` may decrement the job count or resolve the promise.
    pub(crate) fn retire(&self, id: JobId) -> Option<UnitOfWork> {
        self.in_flight.lock().remove(&id)
    }

    pub(crate) fn in_flight_on(&self, node_id: NodeId) -> Vec<UnitOfWork> {
        self.in_flight
            .lock()
            .values()
            .filter(|u| u.assigned_node == Some(node_id))
            .cloned()
            .collect()
    }

    pub(crate) fn in_flight_units(&self) -> Vec<UnitOfWork> {
        let mut units: Vec<_> = self.in_flight.lock().values().cloned().collect();
        units.sort_by_key(|u| u.id);
        units
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Units waiting to be placed, in either the submission queues or the
    /// cycle's internal queue.
    pub fn queued_job_count(&self) -> usize {
        let cycle = self.cycle.lock();
        cycle.internal.len() + self.pending.lock().len()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_poll_interval(&self, interval: Duration) {
        self.poll_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        self.wake.notify_one();
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// Stop polling after the current cycle. Queued units stay queued.
    pub(crate) fn stop_polling(&self) {
        if self.polling.swap(false, Ordering::SeqCst) {
            debug!("Scheduler polling stopped");
        }
        self.wake.notify_one();
    }

    /// Stop the loop for good and cancel everything still queued.
    ///
    /// The cancelled units are kept and returned by [`Self::remaining_jobs`].
    pub(crate) fn close(&self) -> Vec<UnitOfWork> {
        self.polling.store(false, Ordering::SeqCst);
        self.stop.cancel();

        let remaining = {
            let mut cycle = self.cycle.lock();
            let mut pending = self.pending.lock();
            pending.close();
            cycle.rotation.clear();
            let mut units: Vec<UnitOfWork> = cycle.internal.drain(..).collect();
            units.extend(pending.drain_priority());
            units.extend(pending.drain_normal());
            units
        };

        for unit in &remaining {
            if let Some(cell) = self.ledger.take_promise(unit.id) {
                cell.finish(JobOutcome::Cancelled);
            }
        }
        if !remaining.is_empty() {
            info!(jobs = remaining.len(), "Cancelled queued jobs on close");
        }
        self.remaining.lock().extend(remaining.iter().cloned());
        remaining
    }

    pub(crate) fn remaining_jobs(&self) -> Vec<UnitOfWork> {
        self.remaining.lock().clone()
    }
}

impl JobCanceller for Scheduler {
    fn cancel_job(&self, id: JobId, force: bool) -> bool {
        self.cancel(id, force)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{LocalNode, NodeEvents};
    use crate::config::NodeConfig;
    use serde_json::json;

    fn task(value: serde_json::Value) -> Arc<dyn Task> {
        Arc::new(move || {
            let value = value.clone();
            async move { TaskResult::Ok(value) }
        })
    }

    fn sleepy() -> Arc<dyn Task> {
        Arc::new(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            TaskResult::Ok(json!(null))
        })
    }

    fn submit_task(
        ledger: &Arc<Ledger>,
        scheduler: &Arc<Scheduler>,
        slots: SlotRequest,
        priority: bool,
        make_task: impl FnOnce(JobId) -> Arc<dyn Task>,
    ) -> Promise {
        let id = ledger.next_job_id();
        let canceller: std::sync::Weak<dyn JobCanceller> = Arc::downgrade(scheduler) as _;
        let (promise, cell) = Promise::new(id, Some(canceller));
        ledger.register_promise(cell);
        assert!(scheduler.queue_job(UnitOfWork::new(id, make_task(id), slots), priority));
        promise
    }

    fn submit(ledger: &Arc<Ledger>, scheduler: &Arc<Scheduler>, slots: SlotRequest) -> Promise {
        submit_task(ledger, scheduler, slots, false, |id| task(json!(id)))
    }

    fn local_node(ledger: &Ledger, threads: u32) {
        let node = LocalNode::start(
            NodeConfig::new(1, "local").with_thread_limit(threads),
            NodeEvents::detached(),
            tokio::runtime::Handle::current(),
        );
        ledger.add_node(node);
    }

    fn setup() -> (Arc<Ledger>, Arc<Scheduler>) {
        let ledger = Arc::new(Ledger::detached());
        let scheduler = Arc::new(Scheduler::new(ledger.clone(), Duration::from_millis(10)));
        (ledger, scheduler)
    }

    #[tokio::test]
    async fn test_cycle_without_nodes_keeps_jobs_queued() {
        let (ledger, scheduler) = setup();
        submit(&ledger, &scheduler, SlotRequest::Threads(1));
        assert_eq!(scheduler.run_cycle(), 0);
        assert_eq!(scheduler.queued_job_count(), 1);
        assert_eq!(ledger.job_count(), 0);
    }

    #[tokio::test]
    async fn test_cycle_dispatches_and_completion_resolves() {
        let (ledger, scheduler) = setup();
        local_node(&ledger, 2);

        let promise = submit(&ledger, &scheduler, SlotRequest::Threads(1));
        assert_eq!(scheduler.run_cycle(), 1);
        assert_eq!(promise.wait().await, JobOutcome::Completed(json!(promise.id())));
        assert_eq!(ledger.job_count(), 0);
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_job_stays_in_internal_queue() {
        let (ledger, scheduler) = setup();
        local_node(&ledger, 2);

        let promise = submit(&ledger, &scheduler, SlotRequest::Threads(3));
        assert_eq!(scheduler.run_cycle(), 0);
        assert_eq!(scheduler.queued_job_count(), 1);

        assert!(promise.cancel(false));
        assert!(promise.is_cancelled());
        assert_eq!(scheduler.queued_job_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_completion_is_ignored() {
        let (ledger, scheduler) = setup();
        let promise = submit(&ledger, &scheduler, SlotRequest::Threads(1));
        let unit = scheduler.pending.lock().remove(promise.id()).unwrap();
        let mut assigned = unit.clone();
        assigned.assigned_node = Some(7);
        scheduler.in_flight.lock().insert(unit.id, assigned);
        ledger.increment_job_count();

        assert!(!scheduler.finish(unit.id, 8, Ok(json!("late"))));
        assert!(!promise.is_done());
        assert!(scheduler.finish(unit.id, 7, Ok(json!("ok"))));
        assert_eq!(promise.outcome(), Some(JobOutcome::Completed(json!("ok"))));
        assert_eq!(ledger.job_count(), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_queued_jobs_and_refuses_more() {
        let (ledger, scheduler) = setup();
        let a = submit(&ledger, &scheduler, SlotRequest::Threads(1));
        let b = submit(&ledger, &scheduler, SlotRequest::Threads(1));

        let remaining = scheduler.close();
        assert_eq!(remaining.len(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert_eq!(scheduler.remaining_jobs().len(), 2);

        let late = UnitOfWork::new(99, task(json!(null)), SlotRequest::default());
        assert!(!scheduler.queue_job(late, false));
        assert!(!scheduler.start());
    }

    #[tokio::test]
    async fn test_largest_request_is_placed_first() {
        let (ledger, scheduler) = setup();
        local_node(&ledger, 2);

        let small = submit_task(&ledger, &scheduler, SlotRequest::Threads(1), false, |_| sleepy());
        let big = submit_task(&ledger, &scheduler, SlotRequest::Threads(2), false, |_| sleepy());

        assert_eq!(scheduler.run_cycle(), 1);
        let running: Vec<_> = scheduler.in_flight_units().iter().map(|u| u.id).collect();
        assert_eq!(running, vec![big.id()]);
        assert_eq!(scheduler.queued_job_count(), 1);
        assert!(!small.is_done());
    }

    #[tokio::test]
    async fn test_priority_jobs_jump_the_queue() {
        let (ledger, scheduler) = setup();
        local_node(&ledger, 1);

        let normal = submit_task(&ledger, &scheduler, SlotRequest::Threads(1), false, |_| sleepy());
        let requeued = submit_task(&ledger, &scheduler, SlotRequest::Threads(1), true, |_| sleepy());

        assert_eq!(scheduler.run_cycle(), 1);
        let running: Vec<_> = scheduler.in_flight_units().iter().map(|u| u.id).collect();
        assert_eq!(running, vec![requeued.id()]);
        assert!(!normal.is_done());
        assert_eq!(ledger.job_count(), 1);
    }

    #[tokio::test]
    async fn test_forced_cancel_with_missing_node_is_an_internal_error() {
        let (ledger, scheduler) = setup();
        let promise = submit(&ledger, &scheduler, SlotRequest::Threads(1));
        let unit = scheduler.pending.lock().remove(promise.id()).unwrap();
        let mut assigned = unit.clone();
        assigned.assigned_node = Some(7);
        scheduler.in_flight.lock().insert(unit.id, assigned);
        ledger.increment_job_count();

        assert!(!scheduler.cancel(unit.id, true));
        assert_eq!(ledger.internal_errors(), 1);
        assert!(!promise.is_done());
        assert_eq!(scheduler.in_flight_count(), 1, "job stays in flight");
        assert_eq!(ledger.job_count(), 1);
    }

    #[tokio::test]
    async fn test_unforced_cancel_leaves_running_job_alone() {
        let (ledger, scheduler) = setup();
        local_node(&ledger, 1);
        let promise = submit_task(&ledger, &scheduler, SlotRequest::Threads(1), false, |_| sleepy());
        assert_eq!(scheduler.run_cycle(), 1);

        assert!(!promise.cancel(false));
        assert!(!promise.is_done());
        assert_eq!(ledger.job_count(), 1);

        assert!(promise.cancel(true));
        assert!(promise.is_cancelled());
        assert_eq!(ledger.job_count(), 0);
        assert_eq!(ledger.internal_errors(), 0);
    }
}
