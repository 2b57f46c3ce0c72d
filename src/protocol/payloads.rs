//! Typed payload bodies for the message kinds the core handles itself.
//!
//! Work-request payloads keep their provider-specific fields opaque — only
//! `exec_id` is lifted out; everything else flattens into `params` and is
//! decoded by the handler that owns the kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ─── Handshake ────────────────────────────────────────────────────────────────

/// `agent_connect` — first message after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPayload {
    pub version: String,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_exec_id: Option<String>,
    pub token: String,
}

/// `agent_connect_ack` — the single allowed reply to `agent_connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAckPayload {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Hex-encoded session HMAC secret; installed into the signer.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hmac_secret_hex: Option<String>,
}

/// `agent_disconnect` — best-effort notice sent on shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub reason: String,
}

/// `agent_heartbeat` — sent every heartbeat interval; `status` is the
/// optional enricher-supplied side-band (load, active task count).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<Value>,
}

// ─── Work messages ────────────────────────────────────────────────────────────

/// Common shape of every work request (`task_request`, `build_request`, …).
/// The server assigns `exec_id`; the bridge never invents one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPayload {
    #[serde(default)]
    pub exec_id: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

/// `task_progress` / `mcp_codegen_progress` — streamed while a handler runs.
/// `seq` is monotone per execution, assigned inside the handler path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub exec_id: String,
    pub seq: u64,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

/// Terminal success frame (`task_result`, `build_result`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPayload {
    pub exec_id: String,
    pub output: Value,
    pub duration_ms: u64,
}

/// Terminal failure frame (`task_error`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub exec_id: String,
    pub kind: String,
    pub message: String,
}

// ─── Process lifecycle ────────────────────────────────────────────────────────

/// `mcp_start_request` — spawn a supervised MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStartPayload {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub working_dir: Option<String>,
}

/// `mcp_stop_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStopPayload {
    pub name: String,
    /// Skip the grace period and kill the process group immediately.
    #[serde(default)]
    pub force: bool,
}

/// `mcp_health_report` — lifecycle outcomes and supervisor events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReportPayload {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

// ─── HTTP sidecar responses ───────────────────────────────────────────────────

/// Body of `GET /api/v1/agent/tasks/{exec_id}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatusResponse {
    pub success: bool,
    pub data: TaskStatusData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatusData {
    pub status: String,
}
