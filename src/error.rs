//! Error taxonomy for the bridge core.
//!
//! Library code returns [`AgentError`]; `main.rs` wraps everything in
//! `anyhow` at the process boundary. Only [`AgentError::Config`] is allowed
//! to terminate the process — every other kind surfaces as a state
//! transition (transport, auth) or a typed reply message (handler,
//! duplicate, busy).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Startup-scoped: bad config, unreadable credentials, invalid secret.
    #[error("config error: {0}")]
    Config(String),

    /// The control plane rejected the `agent_connect` handshake.
    #[error("auth rejected: {0}")]
    AuthRejected(String),

    /// Any socket-level failure. Triggers the reconnect path.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected frame, oversize frame, or decode failure on the read path.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// HMAC verification failed for a message of a signed kind.
    #[error("signature invalid on message {0}")]
    SignatureInvalid(String),

    /// A task handler failed; converted to a `task_error` reply.
    #[error("handler error ({kind}): {message}")]
    Handler { kind: String, message: String },

    /// An execution ID that is already in flight was submitted again.
    #[error("duplicate execution {0}")]
    DuplicateExecution(String),

    /// Pool and overflow queue are both saturated.
    #[error("executor saturated, rejected execution {0}")]
    BusyRejected(String),

    /// Spawn, health, or signaling failure in the process supervisor.
    #[error("process error: {0}")]
    Process(String),

    /// Credential refresh failed; the old token is retained until hard expiry.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The session is closed; no further connects or sends are possible.
    #[error("session closed")]
    Closed,
}

impl AgentError {
    /// Short machine-readable kind tag, used in `task_error` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::AuthRejected(_) => "auth_rejected",
            AgentError::Transport(_) => "transport",
            AgentError::Protocol(_) => "protocol",
            AgentError::SignatureInvalid(_) => "signature_invalid",
            AgentError::Handler { .. } => "handler",
            AgentError::DuplicateExecution(_) => "duplicate_execution",
            AgentError::BusyRejected(_) => "rejected_busy",
            AgentError::Process(_) => "process",
            AgentError::RefreshFailed(_) => "refresh_failed",
            AgentError::Closed => "closed",
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(AgentError::BusyRejected("e1".into()).kind(), "rejected_busy");
        assert_eq!(
            AgentError::Handler {
                kind: "provider".into(),
                message: "boom".into()
            }
            .kind(),
            "handler"
        );
    }
}
