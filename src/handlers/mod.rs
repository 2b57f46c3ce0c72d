//! Registered work handlers — the glue between the executor and the
//! provider / supervisor capabilities.
//!
//! Provider-shaped kinds (task, build, test, QA, computer use, codegen) all
//! flow through [`ProviderHandler`]; `mcp_deploy_request` starts a generated
//! server under supervision via [`DeployHandler`].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::executor::{Executor, ProgressSender, TaskHandler, WorkKind, WorkRequest};
use crate::provider::{Provider, ProviderRequest};
use crate::supervisor::{ProcessSpec, ProcessSupervisor};

/// Forwards a work request to the configured provider adapter.
pub struct ProviderHandler {
    provider: Arc<dyn Provider>,
}

impl ProviderHandler {
    pub fn new(provider: Arc<dyn Provider>) -> Arc<Self> {
        Arc::new(Self { provider })
    }
}

#[async_trait]
impl TaskHandler for ProviderHandler {
    async fn run(
        &self,
        request: WorkRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<Value, AgentError> {
        let provider_request = ProviderRequest {
            exec_id: request.exec_id,
            kind: request.kind,
            params: request.params,
        };
        self.provider
            .execute(provider_request, progress, cancel)
            .await
    }
}

/// `mcp_deploy_request`: the payload carries the spec of a generated MCP
/// server; deploying means putting it under supervision.
pub struct DeployHandler {
    supervisor: Arc<ProcessSupervisor>,
}

impl DeployHandler {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Arc<Self> {
        Arc::new(Self { supervisor })
    }
}

#[async_trait]
impl TaskHandler for DeployHandler {
    async fn run(
        &self,
        request: WorkRequest,
        progress: ProgressSender,
        _cancel: CancellationToken,
    ) -> Result<Value, AgentError> {
        let name = request
            .params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Handler {
                kind: "invalid_request".into(),
                message: "deploy request is missing 'name'".into(),
            })?
            .to_string();
        let command = request
            .params
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Handler {
                kind: "invalid_request".into(),
                message: "deploy request is missing 'command'".into(),
            })?
            .to_string();
        let args: Vec<String> = request
            .params
            .get("args")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let env: HashMap<String, String> = request
            .params
            .get("env")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let working_dir = request
            .params
            .get("working_dir")
            .and_then(|v| v.as_str())
            .map(String::from);

        progress.emit("deploying", Some(json!({ "name": name }))).await;

        let record = self
            .supervisor
            .start(
                &name,
                ProcessSpec {
                    command,
                    args,
                    env,
                    working_dir,
                },
            )
            .await
            .map_err(|e| AgentError::Handler {
                kind: "process".into(),
                message: e.to_string(),
            })?;

        Ok(json!({
            "name": record.name,
            "pid": record.pid,
            "status": record.status.to_string(),
        }))
    }
}

/// Wire the standard handler set into an executor.
pub fn register_all(
    executor: &Executor,
    provider: Arc<dyn Provider>,
    supervisor: Arc<ProcessSupervisor>,
) {
    let provider_handler = ProviderHandler::new(provider);
    for kind in [
        WorkKind::Task,
        WorkKind::Build,
        WorkKind::Test,
        WorkKind::Qa,
        WorkKind::Computer,
        WorkKind::Codegen,
    ] {
        executor.register(kind, provider_handler.clone());
    }
    executor.register(WorkKind::Deploy, DeployHandler::new(supervisor));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::protocol::Envelope;
    use crate::session::state::SessionState;
    use crate::session::SessionLink;
    use crate::supervisor::SupervisorConfig;

    struct NullLink;

    #[async_trait]
    impl SessionLink for NullLink {
        async fn send(&self, _envelope: Envelope) -> Result<(), AgentError> {
            Ok(())
        }
        fn state(&self) -> SessionState {
            SessionState::Connected
        }
        fn set_last_exec_id(&self, _exec_id: &str) {}
    }

    fn progress() -> ProgressSender {
        crate::executor::testing::progress_sender(Arc::new(NullLink), "D1")
    }

    #[tokio::test]
    async fn deploy_rejects_missing_fields() {
        let supervisor = ProcessSupervisor::new(SupervisorConfig::default(), EventBus::new());
        let handler = DeployHandler::new(supervisor);
        let request = WorkRequest {
            exec_id: "D1".into(),
            kind: WorkKind::Deploy,
            params: serde_json::Map::new(),
        };
        let err = handler
            .run(request, progress(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Handler { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deploy_starts_a_supervised_process() {
        let supervisor = ProcessSupervisor::new(SupervisorConfig::default(), EventBus::new());
        let handler = DeployHandler::new(Arc::clone(&supervisor));
        let mut params = serde_json::Map::new();
        params.insert("name".into(), json!("gen-srv"));
        params.insert("command".into(), json!("sleep"));
        params.insert("args".into(), json!(["60"]));
        let request = WorkRequest {
            exec_id: "D2".into(),
            kind: WorkKind::Deploy,
            params,
        };
        let out = handler
            .run(request, progress(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["name"], "gen-srv");
        assert!(supervisor.get("gen-srv").await.is_some());
        supervisor.stop_all().await;
    }
}
