//! Event bus between the supervisor and the session-facing forwarder.
//!
//! Lifecycle outcomes travel here as typed events; a forwarder task turns
//! them into signed `mcp_health_report` messages. Lossy by design — a slow
//! subscriber lags rather than blocking the supervisor.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Started {
        name: String,
        pid: u32,
    },
    /// The process exited or was stopped; `exit_code` is `None` when it was
    /// killed by a signal or the code could not be collected.
    Stopped {
        name: String,
        exit_code: Option<i32>,
        forced: bool,
    },
    Unhealthy {
        name: String,
        restart_count: u32,
    },
    Restarted {
        name: String,
        pid: u32,
        restart_count: u32,
    },
    /// Restart budget exhausted or the process could never become ready.
    Failed {
        name: String,
        detail: String,
    },
}

impl SupervisorEvent {
    pub fn name(&self) -> &str {
        match self {
            SupervisorEvent::Started { name, .. }
            | SupervisorEvent::Stopped { name, .. }
            | SupervisorEvent::Unhealthy { name, .. }
            | SupervisorEvent::Restarted { name, .. }
            | SupervisorEvent::Failed { name, .. } => name,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// No subscribers is fine — the event is dropped.
    pub fn publish(&self, event: SupervisorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(SupervisorEvent::Started {
            name: "srv".into(),
            pid: 42,
        });
        match rx.recv().await.unwrap() {
            SupervisorEvent::Started { name, pid } => {
                assert_eq!(name, "srv");
                assert_eq!(pid, 42);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(SupervisorEvent::Failed {
            name: "srv".into(),
            detail: "spawn failed".into(),
        });
    }
}
