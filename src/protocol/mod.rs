//! Wire protocol — framed JSON envelopes exchanged with the control plane.
//!
//! Every message is an [`Envelope`]: a `type` tag, a unique `id`, an RFC3339
//! `timestamp`, an opaque JSON `payload`, and an optional HMAC `signature`.
//! The payload is kept as raw bytes ([`serde_json::value::RawValue`]) so that
//! signatures cover the exact payload bytes and re-encoding an envelope is
//! bit-exact.
//!
//! Frames larger than 1 MiB are rejected in both directions at the frame
//! boundary, before any payload decoding happens.

pub mod payloads;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::AgentError;

/// Maximum framed message size, enforced on both ingress and egress.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

// ─── Message kinds ────────────────────────────────────────────────────────────

/// Every message type the core speaks, bridge→server and server→bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Bridge → server
    AgentConnect,
    AgentDisconnect,
    AgentHeartbeat,
    TaskProgress,
    TaskResult,
    TaskError,
    BuildResult,
    TestResult,
    QaResult,
    ComputerResult,
    McpCodegenProgress,
    McpCodegenResult,
    McpDeployResult,
    McpHealthReport,
    // Server → bridge
    AgentConnectAck,
    TaskRequest,
    BuildRequest,
    TestRequest,
    QaRequest,
    ComputerRequest,
    McpStartRequest,
    McpStopRequest,
    McpCodegenRequest,
    McpDeployRequest,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::AgentConnect => "agent_connect",
            MessageKind::AgentDisconnect => "agent_disconnect",
            MessageKind::AgentHeartbeat => "agent_heartbeat",
            MessageKind::TaskProgress => "task_progress",
            MessageKind::TaskResult => "task_result",
            MessageKind::TaskError => "task_error",
            MessageKind::BuildResult => "build_result",
            MessageKind::TestResult => "test_result",
            MessageKind::QaResult => "qa_result",
            MessageKind::ComputerResult => "computer_result",
            MessageKind::McpCodegenProgress => "mcp_codegen_progress",
            MessageKind::McpCodegenResult => "mcp_codegen_result",
            MessageKind::McpDeployResult => "mcp_deploy_result",
            MessageKind::McpHealthReport => "mcp_health_report",
            MessageKind::AgentConnectAck => "agent_connect_ack",
            MessageKind::TaskRequest => "task_request",
            MessageKind::BuildRequest => "build_request",
            MessageKind::TestRequest => "test_request",
            MessageKind::QaRequest => "qa_request",
            MessageKind::ComputerRequest => "computer_request",
            MessageKind::McpStartRequest => "mcp_start_request",
            MessageKind::McpStopRequest => "mcp_stop_request",
            MessageKind::McpCodegenRequest => "mcp_codegen_request",
            MessageKind::McpDeployRequest => "mcp_deploy_request",
        }
    }

    /// Parse a wire tag. Unknown tags return `None` — the router logs them
    /// once per distinct tag and drops the frame.
    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "agent_connect" => MessageKind::AgentConnect,
            "agent_disconnect" => MessageKind::AgentDisconnect,
            "agent_heartbeat" => MessageKind::AgentHeartbeat,
            "task_progress" => MessageKind::TaskProgress,
            "task_result" => MessageKind::TaskResult,
            "task_error" => MessageKind::TaskError,
            "build_result" => MessageKind::BuildResult,
            "test_result" => MessageKind::TestResult,
            "qa_result" => MessageKind::QaResult,
            "computer_result" => MessageKind::ComputerResult,
            "mcp_codegen_progress" => MessageKind::McpCodegenProgress,
            "mcp_codegen_result" => MessageKind::McpCodegenResult,
            "mcp_deploy_result" => MessageKind::McpDeployResult,
            "mcp_health_report" => MessageKind::McpHealthReport,
            "agent_connect_ack" => MessageKind::AgentConnectAck,
            "task_request" => MessageKind::TaskRequest,
            "build_request" => MessageKind::BuildRequest,
            "test_request" => MessageKind::TestRequest,
            "qa_request" => MessageKind::QaRequest,
            "computer_request" => MessageKind::ComputerRequest,
            "mcp_start_request" => MessageKind::McpStartRequest,
            "mcp_stop_request" => MessageKind::McpStopRequest,
            "mcp_codegen_request" => MessageKind::McpCodegenRequest,
            "mcp_deploy_request" => MessageKind::McpDeployRequest,
            _ => return None,
        })
    }

    /// Critical kinds carry an HMAC signature. Heartbeats, acks, and
    /// handshake messages do not.
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            MessageKind::TaskProgress
                | MessageKind::TaskResult
                | MessageKind::TaskError
                | MessageKind::BuildResult
                | MessageKind::TestResult
                | MessageKind::QaResult
                | MessageKind::ComputerResult
                | MessageKind::McpCodegenProgress
                | MessageKind::McpCodegenResult
                | MessageKind::McpDeployResult
                | MessageKind::McpHealthReport
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// The wire primitive. `kind` stays a `String` so unknown server-side types
/// survive decoding and can be reported; dispatch parses it into a
/// [`MessageKind`].
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Box<RawValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
}

impl Clone for Envelope {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            id: self.id.clone(),
            timestamp: self.timestamp,
            payload: self.payload.clone(),
            signature: self.signature.clone(),
        }
    }
}

impl Envelope {
    /// Build a bridge-originated envelope: fresh UUID, current timestamp,
    /// no signature yet (the session signs critical kinds on send).
    pub fn new<P: Serialize>(kind: MessageKind, payload: &P) -> Result<Self, AgentError> {
        let raw = serde_json::to_string(payload)
            .map_err(|e| AgentError::Protocol(format!("encode {kind} payload: {e}")))?;
        let payload = RawValue::from_string(raw)
            .map_err(|e| AgentError::Protocol(format!("encode {kind} payload: {e}")))?;
        Ok(Self {
            kind: kind.as_str().to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
            signature: None,
        })
    }

    /// Parsed message kind, if this crate knows the tag.
    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    /// Canonical timestamp form used in the signing tuple: RFC3339 with
    /// nanosecond precision, stable across an encode/decode round trip.
    pub fn canonical_timestamp(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    /// Decode the payload into a typed struct.
    pub fn decode_payload<'a, P: Deserialize<'a>>(&'a self) -> Result<P, AgentError> {
        serde_json::from_str(self.payload.get())
            .map_err(|e| AgentError::Protocol(format!("decode {} payload: {e}", self.kind)))
    }

    /// Serialize for the wire. Frames over [`MAX_FRAME_BYTES`] are rejected.
    pub fn encode(&self) -> Result<String, AgentError> {
        let text = serde_json::to_string(self)
            .map_err(|e| AgentError::Protocol(format!("encode envelope: {e}")))?;
        if text.len() > MAX_FRAME_BYTES {
            return Err(AgentError::Protocol(format!(
                "outgoing {} frame is {} bytes, limit {}",
                self.kind,
                text.len(),
                MAX_FRAME_BYTES
            )));
        }
        Ok(text)
    }

    /// Parse a frame received from the wire, enforcing the size limit first.
    pub fn decode(text: &str) -> Result<Self, AgentError> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(AgentError::Protocol(format!(
                "incoming frame is {} bytes, limit {}",
                text.len(),
                MAX_FRAME_BYTES
            )));
        }
        serde_json::from_str(text).map_err(|e| AgentError::Protocol(format!("decode envelope: {e}")))
    }
}
