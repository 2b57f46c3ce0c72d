//! Heartbeat status enricher — the optional side-band carried in
//! `agent_heartbeat` messages.
//!
//! Samples host load via `sysinfo` and reports the active execution count.
//! CPU usage needs two samples to be meaningful; the first heartbeat after
//! start reports 0 and settles from the second on.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use sysinfo::System;

use crate::session::StatusEnricher;
use crate::tracker::TaskTracker;

pub struct StatusReporter {
    system: Mutex<System>,
    tracker: Arc<TaskTracker>,
}

impl StatusReporter {
    pub fn new(tracker: Arc<TaskTracker>) -> Arc<Self> {
        Arc::new(Self {
            system: Mutex::new(System::new()),
            tracker,
        })
    }

    pub fn snapshot(&self) -> Value {
        let (cpu_pct, mem_used_mb, mem_total_mb) = {
            let mut system = self.system.lock().expect("sysinfo lock poisoned");
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                system.global_cpu_usage(),
                system.used_memory() / (1024 * 1024),
                system.total_memory() / (1024 * 1024),
            )
        };
        json!({
            "active_tasks": self.tracker.len(),
            "cpu_pct": cpu_pct,
            "mem_used_mb": mem_used_mb,
            "mem_total_mb": mem_total_mb,
        })
    }

    /// Adapt into the session's enricher hook.
    pub fn into_enricher(self: Arc<Self>) -> StatusEnricher {
        Box::new(move || Some(self.snapshot()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_active_tasks() {
        let tracker = Arc::new(TaskTracker::new());
        tracker.register("E1");
        tracker.register("E2");
        let reporter = StatusReporter::new(Arc::clone(&tracker));
        let snap = reporter.snapshot();
        assert_eq!(snap["active_tasks"], 2);
        assert!(snap["mem_total_mb"].as_u64().unwrap() > 0);
    }

    #[test]
    fn enricher_yields_values() {
        let reporter = StatusReporter::new(Arc::new(TaskTracker::new()));
        let enricher = reporter.into_enricher();
        assert!(enricher().is_some());
    }
}
