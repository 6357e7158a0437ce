//! One-shot completion barrier over a declared set of root tasks.

use crate::task_id::TaskId;
use std::sync::{Condvar, Mutex};

pub struct Fence {
    roots: Vec<TaskId>,
    remaining: Mutex<i64>,
    done: Condvar,
}

impl Fence {
    pub(crate) fn new(roots: Vec<TaskId>) -> Self {
        let remaining = roots.len() as i64;
        Self { roots, remaining: Mutex::new(remaining), done: Condvar::new() }
    }

    pub fn roots(&self) -> &[TaskId] {
        &self.roots
    }

    pub fn contains_root(&self, id: TaskId) -> bool {
        self.roots.contains(&id)
    }

    /// Called by the completion cascade once per root this fence watches
    /// that reaches `work_count == 0`. Wakes `wait` when the count hits 0.
    pub(crate) fn mark_root_done(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining <= 0 {
            self.done.notify_all();
        }
    }

    /// Block until every root registered with this fence has completed.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.done.wait(remaining).unwrap();
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.remaining.lock().unwrap() <= 0
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("roots", &self.roots.len())
            .field("remaining", &*self.remaining.lock().unwrap())
            .finish()
    }
}
