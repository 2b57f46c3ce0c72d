//! Post-reconnect task recovery.
//!
//! After a reconnect the bridge asks the server which tracked executions are
//! still live. `completed` and `not_found` drop the ID from the tracker;
//! `pending` keeps it; anything else is logged and kept. No messages are
//! replayed — the server is the source of truth.

use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::protocol::payloads::TaskStatusResponse;
use crate::tracker::TaskTracker;

/// `wss://host/...` → `https://host/api/v1/agent/tasks/{exec_id}/status`.
pub fn status_url(session_url: &str, exec_id: &str) -> Result<String, AgentError> {
    let (scheme, rest) = if let Some(rest) = session_url.strip_prefix("wss://") {
        ("https", rest)
    } else if let Some(rest) = session_url.strip_prefix("ws://") {
        ("http", rest)
    } else {
        return Err(AgentError::Config(format!(
            "session URL must start with ws:// or wss://, got {session_url}"
        )));
    };
    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() {
        return Err(AgentError::Config(format!(
            "session URL has no host: {session_url}"
        )));
    }
    Ok(format!("{scheme}://{host}/api/v1/agent/tasks/{exec_id}/status"))
}

/// Probe every tracked execution. Best-effort: HTTP failures keep the ID
/// tracked so a later recovery pass can settle it.
pub async fn run(http: &reqwest::Client, session_url: &str, token: &str, tracker: &TaskTracker) {
    let ids = tracker.snapshot();
    if ids.is_empty() {
        return;
    }
    info!(count = ids.len(), "recovering tracked executions");

    for exec_id in ids {
        let url = match status_url(session_url, &exec_id) {
            Ok(url) => url,
            Err(e) => {
                warn!(exec_id, "cannot build status URL: {e}");
                continue;
            }
        };

        let status = match fetch_status(http, &url, token).await {
            Ok(status) => status,
            Err(e) => {
                warn!(exec_id, "status probe failed, keeping tracked: {e}");
                continue;
            }
        };

        match status.as_str() {
            "completed" | "not_found" => {
                info!(exec_id, status, "server settled execution, untracking");
                tracker.complete(&exec_id);
            }
            "pending" => {
                debug!(exec_id, "execution still pending on server");
            }
            other => {
                warn!(exec_id, status = other, "unknown execution status, keeping tracked");
            }
        }
    }
}

async fn fetch_status(
    http: &reqwest::Client,
    url: &str,
    token: &str,
) -> Result<String, AgentError> {
    let resp = http
        .get(url)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| AgentError::Transport(format!("GET {url}: {e}")))?;

    let http_status = resp.status();
    if !http_status.is_success() {
        return Err(AgentError::Transport(format!(
            "status endpoint returned {http_status}"
        )));
    }

    let body: TaskStatusResponse = resp
        .json()
        .await
        .map_err(|e| AgentError::Protocol(format!("parse status response: {e}")))?;
    Ok(body.data.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_url_swaps_scheme_and_path() {
        assert_eq!(
            status_url("wss://plane.example.com/api/v1/agent/ws", "E3").unwrap(),
            "https://plane.example.com/api/v1/agent/tasks/E3/status"
        );
        assert_eq!(
            status_url("ws://localhost:9100/ws", "abc-123").unwrap(),
            "http://localhost:9100/api/v1/agent/tasks/abc-123/status"
        );
        assert!(status_url("tcp://nope", "E1").is_err());
    }

    /// Minimal one-shot HTTP responder for the status endpoint.
    async fn spawn_status_server(status: &'static str) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = sock.read(&mut buf).await;
                    let body =
                        format!(r#"{{"success":true,"data":{{"status":"{status}"}}}}"#);
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn completed_status_untracks() {
        let addr = spawn_status_server("completed").await;
        let tracker = TaskTracker::new();
        tracker.register("E3");
        let http = reqwest::Client::new();
        run(&http, &format!("ws://{addr}/ws"), "tok", &tracker).await;
        assert!(!tracker.contains("E3"));
    }

    #[tokio::test]
    async fn pending_status_keeps_tracked() {
        let addr = spawn_status_server("pending").await;
        let tracker = TaskTracker::new();
        tracker.register("E4");
        let http = reqwest::Client::new();
        run(&http, &format!("ws://{addr}/ws"), "tok", &tracker).await;
        assert!(tracker.contains("E4"));
    }

    #[tokio::test]
    async fn unreachable_server_keeps_ids_tracked() {
        let tracker = TaskTracker::new();
        tracker.register("E9");
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(200))
            .build()
            .unwrap();
        run(&http, "ws://127.0.0.1:1/ws", "tok", &tracker).await;
        assert!(tracker.contains("E9"));
    }
}
