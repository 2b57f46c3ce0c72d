//! Opaque AI-provider capability.
//!
//! Provider-specific CLI/API adapters live outside this crate; the executor
//! only sees this trait. [`EchoProvider`] is the built-in placeholder used
//! when no adapter is wired in, and the workhorse of the test suite.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::executor::{ProgressSender, WorkKind};

/// One unit of provider work, decoded from the wire request.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub exec_id: String,
    pub kind: WorkKind,
    pub params: serde_json::Map<String, Value>,
}

/// Common interface for all AI provider adapters.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Execute the request, streaming progress through `progress`. Must
    /// respect `cancel` — cancelled work should return promptly with an
    /// error rather than keep running.
    async fn execute(
        &self,
        request: ProviderRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<Value, AgentError>;
}

/// Placeholder adapter: echoes the prompt back. Keeps the bridge usable
/// end-to-end without a real provider installed.
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(
        &self,
        request: ProviderRequest,
        _progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<Value, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Handler {
                kind: "cancelled".into(),
                message: "execution cancelled".into(),
            });
        }
        let prompt = request
            .params
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(json!({
            "provider": self.name(),
            "kind": request.kind.as_str(),
            "output": prompt,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::SessionState;
    use crate::session::SessionLink;
    use crate::protocol::Envelope;
    use std::sync::Arc;

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

    #[tokio::test]
    async fn echo_returns_the_prompt() {
        let provider = EchoProvider;
        let mut params = serde_json::Map::new();
        params.insert("prompt".into(), json!("hello"));
        let request = ProviderRequest {
            exec_id: "E1".into(),
            kind: WorkKind::Task,
            params,
        };
        let progress = crate::executor::testing::progress_sender(Arc::new(NullLink), "E1");
        let out = provider
            .execute(request, progress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["output"], "hello");
        assert_eq!(out["kind"], "task");
    }
}
