use std::collections::VecDeque;

use crate::scheduler::job::{JobId, UnitOfWork};

/// Submitted units waiting for the scheduler to pick them up.
///
/// Priority units (re-queued after a node loss) are kept apart from fresh
/// submissions so the next cycle can place them ahead of everything else.
#[derive(Debug, Default)]
pub struct JobQueue {
    normal: VecDeque<UnitOfWork>,
    priority: VecDeque<UnitOfWork>,
    closed: bool,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit. Returns false once the queue has been closed.
    pub fn push(&mut self, unit: UnitOfWork, priority: bool) -> bool {
        if self.closed {
            return false;
        }
        if priority {
            self.priority.push_back(unit);
        } else {
            self.normal.push_back(unit);
        }
        true
    }

    pub fn drain_priority(&mut self) -> Vec<UnitOfWork> {
        self.priority.drain(..).collect()
    }

    pub fn drain_normal(&mut self) -> Vec<UnitOfWork> {
        self.normal.drain(..).collect()
    }

    /// Remove a queued unit by id, looking at the priority queue first.
    pub fn remove(&mut self, id: JobId) -> Option<UnitOfWork> {
        for queue in [&mut self.priority, &mut self.normal] {
            if let Some(pos) = queue.iter().position(|u| u.id == id) {
                return queue.remove(pos);
            }
        }
        None
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.priority.iter().chain(self.normal.iter()).any(|u| u.id == id)
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further pushes. Units already queued stay until drained.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
