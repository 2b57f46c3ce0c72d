// SPDX-License-Identifier: MIT
//! Typed message router — dispatches inbound envelopes to the executor,
//! the process supervisor, or handles control messages itself.
//!
//! The router is the session's [`MessageHandler`], installed at start time.
//! It sees the session only through [`SessionLink`]. Unknown message types
//! are logged once per distinct type and ignored.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventBus, SupervisorEvent};
use crate::executor::Executor;
use crate::protocol::payloads::{HealthReportPayload, ProcessStartPayload, ProcessStopPayload};
use crate::protocol::{Envelope, MessageKind};
use crate::session::{MessageHandler, SessionLink};
use crate::supervisor::{ProcessSpec, ProcessSupervisor};

pub struct Router {
    session: Arc<dyn SessionLink>,
    executor: Arc<Executor>,
    supervisor: Arc<ProcessSupervisor>,
    /// Unknown wire tags already logged — each is reported only once.
    unknown_kinds: StdMutex<HashSet<String>>,
}

impl Router {
    pub fn new(
        session: Arc<dyn SessionLink>,
        executor: Arc<Executor>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            executor,
            supervisor,
            unknown_kinds: StdMutex::new(HashSet::new()),
        })
    }

    async fn handle_process_start(&self, envelope: &Envelope) {
        let payload: ProcessStartPayload = match envelope.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("undecodable mcp_start_request: {e}");
                return;
            }
        };
        let name = payload.name.clone();
        let spec = ProcessSpec {
            command: payload.command,
            args: payload.args,
            env: payload.env,
            working_dir: payload.working_dir,
        };

        let report = match self.supervisor.start(&name, spec).await {
            Ok(record) => HealthReportPayload {
                name,
                status: record.status.to_string(),
                pid: record.pid,
                restart_count: record.restart_count,
                detail: None,
            },
            Err(e) => HealthReportPayload {
                name,
                status: "failed".into(),
                pid: None,
                restart_count: 0,
                detail: Some(e.to_string()),
            },
        };
        self.send_health_report(report).await;
    }

    async fn handle_process_stop(&self, envelope: &Envelope) {
        let payload: ProcessStopPayload = match envelope.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("undecodable mcp_stop_request: {e}");
                return;
            }
        };
        let name = payload.name.clone();

        let outcome = if payload.force {
            self.supervisor.force_stop(&name).await
        } else {
            self.supervisor.stop(&name).await
        };
        let report = match outcome {
            Ok(()) => HealthReportPayload {
                name,
                status: "stopped".into(),
                pid: None,
                restart_count: 0,
                detail: None,
            },
            Err(e) => HealthReportPayload {
                name,
                status: "not_running".into(),
                pid: None,
                restart_count: 0,
                detail: Some(e.to_string()),
            },
        };
        self.send_health_report(report).await;
    }

    async fn send_health_report(&self, payload: HealthReportPayload) {
        match Envelope::new(MessageKind::McpHealthReport, &payload) {
            Ok(envelope) => {
                if let Err(e) = self.session.send(envelope).await {
                    debug!("health report send failed: {e}");
                }
            }
            Err(e) => warn!("failed to build health report: {e}"),
        }
    }

    fn log_unknown(&self, tag: &str) {
        let mut seen = self.unknown_kinds.lock().expect("unknown set poisoned");
        if seen.insert(tag.to_string()) {
            warn!(kind = tag, "unknown message type, ignoring");
        }
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn handle(&self, envelope: Envelope, cancel: CancellationToken) {
        let Some(kind) = envelope.message_kind() else {
            self.log_unknown(&envelope.kind);
            return;
        };

        match kind {
            // Control: a late ack after the handshake is consumed quietly.
            MessageKind::AgentConnectAck => {
                debug!(id = %envelope.id, "late agent_connect_ack ignored");
            }
            // Heartbeats are consumed by the session read loop already.
            MessageKind::AgentHeartbeat => {}

            MessageKind::TaskRequest
            | MessageKind::BuildRequest
            | MessageKind::TestRequest
            | MessageKind::QaRequest
            | MessageKind::ComputerRequest
            | MessageKind::McpCodegenRequest
            | MessageKind::McpDeployRequest => {
                self.executor.submit(&envelope, cancel).await;
            }

            MessageKind::McpStartRequest => self.handle_process_start(&envelope).await,
            MessageKind::McpStopRequest => self.handle_process_stop(&envelope).await,

            // Bridge→server kinds have no business arriving inbound.
            other => {
                self.log_unknown(other.as_str());
            }
        }
    }

    async fn on_reconnected(&self) {
        let processes = self.supervisor.list().await;
        info!(supervised = processes.len(), "router resumed after reconnect");
        // Re-announce supervised process state so the server's view is fresh.
        for record in processes {
            self.send_health_report(HealthReportPayload {
                name: record.name,
                status: record.status.to_string(),
                pid: record.pid,
                restart_count: record.restart_count,
                detail: None,
            })
            .await;
        }
    }
}

// ─── Supervisor event forwarding ──────────────────────────────────────────────

/// Turn supervisor bus events into signed `mcp_health_report` messages.
/// Runs until `cancel` fires.
pub fn spawn_health_forwarder(
    session: Arc<dyn SessionLink>,
    bus: &EventBus,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "health forwarder lagged");
                        continue;
                    }
                },
            };

            let payload = health_payload(&event);
            match Envelope::new(MessageKind::McpHealthReport, &payload) {
                Ok(envelope) => {
                    if let Err(e) = session.send(envelope).await {
                        debug!("forwarded health report failed: {e}");
                    }
                }
                Err(e) => warn!("failed to build health report: {e}"),
            }
        }
        debug!("health forwarder stopped");
    })
}

fn health_payload(event: &SupervisorEvent) -> HealthReportPayload {
    match event {
        SupervisorEvent::Started { name, pid } => HealthReportPayload {
            name: name.clone(),
            status: "running".into(),
            pid: Some(*pid),
            restart_count: 0,
            detail: None,
        },
        SupervisorEvent::Stopped {
            name,
            exit_code,
            forced,
        } => HealthReportPayload {
            name: name.clone(),
            status: "stopped".into(),
            pid: None,
            restart_count: 0,
            detail: Some(match (exit_code, forced) {
                (Some(code), false) => format!("exited with code {code}"),
                (Some(code), true) => format!("force-killed, exit code {code}"),
                (None, true) => "force-killed".into(),
                (None, false) => "exited".into(),
            }),
        },
        SupervisorEvent::Unhealthy {
            name,
            restart_count,
        } => HealthReportPayload {
            name: name.clone(),
            status: "unhealthy".into(),
            pid: None,
            restart_count: *restart_count,
            detail: None,
        },
        SupervisorEvent::Restarted {
            name,
            pid,
            restart_count,
        } => HealthReportPayload {
            name: name.clone(),
            status: "running".into(),
            pid: Some(*pid),
            restart_count: *restart_count,
            detail: Some("restarted".into()),
        },
        SupervisorEvent::Failed { name, detail } => HealthReportPayload {
            name: name.clone(),
            status: "failed".into(),
            pid: None,
            restart_count: 0,
            detail: Some(detail.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::executor::ExecutorConfig;
    use crate::protocol::payloads::ProgressPayload;
    use crate::session::state::SessionState;
    use crate::supervisor::SupervisorConfig;
    use crate::tracker::TaskTracker;
    use serde_json::json;
    use tokio::sync::Mutex as TokioMutex;

    struct CaptureLink {
        sent: TokioMutex<Vec<Envelope>>,
    }

    impl CaptureLink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: TokioMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SessionLink for CaptureLink {
        async fn send(&self, envelope: Envelope) -> Result<(), AgentError> {
            self.sent.lock().await.push(envelope);
            Ok(())
        }
        fn state(&self) -> SessionState {
            SessionState::Connected
        }
        fn set_last_exec_id(&self, _exec_id: &str) {}
    }

    fn router_under_test(link: Arc<CaptureLink>) -> Arc<Router> {
        let tracker = Arc::new(TaskTracker::new());
        let executor = Executor::new(
            link.clone() as Arc<dyn SessionLink>,
            tracker,
            ExecutorConfig::default(),
        );
        crate::handlers::register_all(
            &executor,
            Arc::new(crate::provider::EchoProvider),
            ProcessSupervisor::new(SupervisorConfig::default(), EventBus::new()),
        );
        Router::new(
            link as Arc<dyn SessionLink>,
            executor,
            ProcessSupervisor::new(SupervisorConfig::default(), EventBus::new()),
        )
    }

    #[tokio::test]
    async fn unknown_kind_is_ignored() {
        let link = CaptureLink::new();
        let router = router_under_test(Arc::clone(&link));
        let mut env = Envelope::new(MessageKind::TaskRequest, &json!({})).unwrap();
        env.kind = "mystery_message".into();
        router.handle(env, CancellationToken::new()).await;
        assert!(link.sent.lock().await.is_empty());
        assert!(router
            .unknown_kinds
            .lock()
            .unwrap()
            .contains("mystery_message"));
    }

    #[tokio::test]
    async fn work_message_reaches_executor() {
        let link = CaptureLink::new();
        let router = router_under_test(Arc::clone(&link));
        let env = Envelope::new(
            MessageKind::TaskRequest,
            &json!({ "exec_id": "R1", "prompt": "ping" }),
        )
        .unwrap();
        router.handle(env, CancellationToken::new()).await;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let sent = link.sent.lock().await;
        let progress: ProgressPayload = sent
            .iter()
            .find(|e| e.message_kind() == Some(MessageKind::TaskProgress))
            .expect("progress frame")
            .decode_payload()
            .unwrap();
        assert_eq!(progress.exec_id, "R1");
        assert!(sent
            .iter()
            .any(|e| e.message_kind() == Some(MessageKind::TaskResult)));
    }

    #[tokio::test]
    async fn stop_request_for_unknown_process_reports_not_running() {
        let link = CaptureLink::new();
        let router = router_under_test(Arc::clone(&link));
        let env = Envelope::new(MessageKind::McpStopRequest, &json!({ "name": "ghost" }))
            .unwrap();
        router.handle(env, CancellationToken::new()).await;

        let sent = link.sent.lock().await;
        let report: HealthReportPayload = sent
            .iter()
            .find(|e| e.message_kind() == Some(MessageKind::McpHealthReport))
            .expect("health report")
            .decode_payload()
            .unwrap();
        assert_eq!(report.name, "ghost");
        assert_eq!(report.status, "not_running");
    }

    #[tokio::test]
    async fn forwarder_translates_events() {
        let link = CaptureLink::new();
        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        let handle = spawn_health_forwarder(
            Arc::clone(&link) as Arc<dyn SessionLink>,
            &bus,
            cancel.clone(),
        );

        bus.publish(SupervisorEvent::Failed {
            name: "srv".into(),
            detail: "restart budget exhausted".into(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let sent = link.sent.lock().await;
        let report: HealthReportPayload = sent
            .iter()
            .find(|e| e.message_kind() == Some(MessageKind::McpHealthReport))
            .expect("health report")
            .decode_payload()
            .unwrap();
        assert_eq!(report.status, "failed");
        assert!(report.detail.as_deref().unwrap().contains("budget"));
        drop(sent);

        cancel.cancel();
        let _ = handle.await;
    }
}
