//! Executor-side execution locks keyed by task id.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Set of task ids currently executing in this process.
///
/// The queue's conditional claim already prevents two workers from moving
/// the same row into `PROGRESS`; this lock guards the side-effecting part of
/// an attempt against a duplicate delivery inside one process.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLocks {
    held: Arc<DashMap<String, ()>>,
}

impl ExecutionLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `task_id`, or `None` if it is already held.
    #[must_use]
    pub fn try_acquire(&self, task_id: &str) -> Option<ExecutionGuard> {
        match self.held.entry(task_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(ExecutionGuard {
                    held: Arc::clone(&self.held),
                    task_id: task_id.to_string(),
                })
            }
        }
    }

    #[must_use]
    pub fn is_held(&self, task_id: &str) -> bool {
        self.held.contains_key(task_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Releases the lock on drop.
#[derive(Debug)]
pub struct ExecutionGuard {
    held: Arc<DashMap<String, ()>>,
    task_id: String,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.held.remove(&self.task_id);
    }
}
