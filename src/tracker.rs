//! In-memory set of active execution IDs.
//!
//! Rebuilt implicitly as handlers complete — there is no persistence. The
//! reconnect recovery loop iterates a [`snapshot`](TaskTracker::snapshot)
//! and asks the server which executions are still live.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct TaskTracker {
    active: Mutex<HashSet<String>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an execution. Returns `false` if the ID was already active.
    pub fn register(&self, exec_id: &str) -> bool {
        self.active
            .lock()
            .expect("tracker lock poisoned")
            .insert(exec_id.to_string())
    }

    /// Idempotent: completing an unknown or already-completed ID is a no-op.
    pub fn complete(&self, exec_id: &str) {
        self.active
            .lock()
            .expect("tracker lock poisoned")
            .remove(exec_id);
    }

    pub fn contains(&self, exec_id: &str) -> bool {
        self.active
            .lock()
            .expect("tracker lock poisoned")
            .contains(exec_id)
    }

    /// Consistent point-in-time copy for recovery iteration.
    pub fn snapshot(&self) -> Vec<String> {
        self.active
            .lock()
            .expect("tracker lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.lock().expect("tracker lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_dedups() {
        let t = TaskTracker::new();
        assert!(t.register("E1"));
        assert!(!t.register("E1"));
        assert!(t.contains("E1"));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn complete_is_idempotent() {
        let t = TaskTracker::new();
        t.register("E1");
        t.complete("E1");
        t.complete("E1");
        t.complete("never-registered");
        assert!(!t.contains("E1"));
        assert!(t.is_empty());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let t = TaskTracker::new();
        t.register("E1");
        t.register("E2");
        let snap = t.snapshot();
        t.complete("E1");
        t.complete("E2");
        assert_eq!(snap.len(), 2);
        assert!(t.is_empty());
    }
}
