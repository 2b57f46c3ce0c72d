//! Token lifecycle — keeps the access token fresh ahead of expiry.
//!
//! Shared by the session (re-auth on reconnect) and any auxiliary HTTP
//! clients. Readers hold the read lock; a refresh holds the write lock for
//! the whole HTTP round trip, which also deduplicates concurrent callers —
//! whoever loses the race re-checks validity after acquiring the lock and
//! finds fresh credentials already installed.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CredentialStore, Credentials};
use crate::error::AgentError;

/// Refresh this far ahead of expiry in the background loop.
const REFRESH_HORIZON_MINS: i64 = 5;
/// Never sleep less than this between background wake-ups.
const MIN_WAKE_SECS: i64 = 30;
const REFRESH_TIMEOUT_SECS: u64 = 10;

// ─── Refresh endpoint response ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    success: bool,
    #[serde(default)]
    message: String,
    data: Option<RefreshData>,
}

#[derive(Debug, Deserialize)]
struct RefreshData {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    workspace_id: String,
}

// ─── TokenRefresher ───────────────────────────────────────────────────────────

pub struct TokenRefresher {
    creds: RwLock<Credentials>,
    /// `None` when the token came from the environment override — nothing to
    /// persist and nothing to refresh with.
    store: Option<CredentialStore>,
    refresh_url: String,
    http: reqwest::Client,
}

impl TokenRefresher {
    pub fn new(creds: Credentials, store: Option<CredentialStore>, refresh_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            creds: RwLock::new(creds),
            store,
            refresh_url,
            http,
        }
    }

    /// Derive the refresh endpoint from the session URL: swap the WebSocket
    /// scheme for HTTP and replace the path.
    ///
    /// `wss://host:443/api/v1/agent/ws` → `https://host:443/api/v1/agent/refresh`
    pub fn refresh_url_from_session(session_url: &str) -> Result<String, AgentError> {
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
        Ok(format!("{scheme}://{host}/api/v1/agent/refresh"))
    }

    /// Snapshot of the current credentials.
    pub async fn current(&self) -> Credentials {
        self.creds.read().await.clone()
    }

    /// Returns a token valid for at least the next 30 s, refreshing
    /// synchronously if needed. On refresh failure the old token is returned
    /// as long as it has not hard-expired.
    pub async fn get_token(&self) -> Result<String, AgentError> {
        {
            let creds = self.creds.read().await;
            if creds.is_valid() {
                return Ok(creds.access_token.clone());
            }
        }

        // Write lock held across the HTTP round trip: concurrent callers
        // queue here and re-check after the winner refreshed.
        let mut creds = self.creds.write().await;
        if creds.is_valid() {
            return Ok(creds.access_token.clone());
        }

        match self.fetch_refreshed(&creds).await {
            Ok(fresh) => {
                self.persist(&fresh);
                *creds = fresh;
                info!(expires_at = %creds.expires_at, "access token refreshed");
                Ok(creds.access_token.clone())
            }
            Err(e) => {
                if !creds.hard_expired() {
                    warn!("token refresh failed, reusing current token until expiry: {e}");
                    Ok(creds.access_token.clone())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Background loop. Next wake-up is `max(expires_at − now − 5min, 30s)`.
    /// Cancelling the token stops the loop between wake-ups but never
    /// interrupts an in-flight refresh.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wake = {
                    let creds = this.creds.read().await;
                    let until_refresh = creds.expires_at - Utc::now()
                        - Duration::minutes(REFRESH_HORIZON_MINS);
                    until_refresh
                        .max(Duration::seconds(MIN_WAKE_SECS))
                        .to_std()
                        .unwrap_or(std::time::Duration::from_secs(MIN_WAKE_SECS as u64))
                };
                debug!(wake_secs = wake.as_secs(), "token refresher sleeping");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wake) => {}
                }

                let needs_refresh = {
                    let creds = this.creds.read().await;
                    !creds.valid_for(Duration::minutes(REFRESH_HORIZON_MINS))
                };
                if !needs_refresh {
                    continue;
                }

                // Deliberately not raced against `cancel` — a half-applied
                // refresh must never leave torn credentials.
                let mut creds = this.creds.write().await;
                match this.fetch_refreshed(&creds).await {
                    Ok(fresh) => {
                        this.persist(&fresh);
                        *creds = fresh;
                        info!(expires_at = %creds.expires_at, "access token refreshed in background");
                    }
                    Err(e) => warn!("background token refresh failed: {e}"),
                }
            }
            debug!("token refresher stopped");
        })
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    async fn fetch_refreshed(&self, current: &Credentials) -> Result<Credentials, AgentError> {
        if current.refresh_token.is_empty() {
            return Err(AgentError::RefreshFailed(
                "no refresh token available".into(),
            ));
        }

        let resp = self
            .http
            .post(&self.refresh_url)
            .json(&serde_json::json!({ "refresh_token": current.refresh_token }))
            .send()
            .await
            .map_err(|e| AgentError::RefreshFailed(format!("POST {}: {e}", self.refresh_url)))?;

        let http_status = resp.status();
        if !http_status.is_success() {
            return Err(AgentError::RefreshFailed(format!(
                "refresh endpoint returned {http_status}"
            )));
        }

        let body: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::RefreshFailed(format!("parse refresh response: {e}")))?;
        if !body.success {
            return Err(AgentError::RefreshFailed(if body.message.is_empty() {
                "refresh rejected".into()
            } else {
                body.message
            }));
        }
        let data = body
            .data
            .ok_or_else(|| AgentError::RefreshFailed("refresh response missing data".into()))?;

        Ok(Credentials {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at: data.expires_at,
            user_id: if data.user_id.is_empty() {
                current.user_id.clone()
            } else {
                data.user_id
            },
            workspace_id: if data.workspace_id.is_empty() {
                current.workspace_id.clone()
            } else {
                data.workspace_id
            },
        })
    }

    fn persist(&self, creds: &Credentials) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(creds) {
                warn!("failed to persist refreshed credentials: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refresher(creds: Credentials) -> TokenRefresher {
        TokenRefresher::new(creds, None, "http://127.0.0.1:1/api/v1/agent/refresh".into())
    }

    fn valid_creds() -> Credentials {
        Credentials {
            access_token: "tok".into(),
            refresh_token: "ref".into(),
            expires_at: Utc::now() + Duration::hours(1),
            user_id: String::new(),
            workspace_id: String::new(),
        }
    }

    #[test]
    fn refresh_url_derivation() {
        assert_eq!(
            TokenRefresher::refresh_url_from_session("wss://plane.example.com/api/v1/agent/ws")
                .unwrap(),
            "https://plane.example.com/api/v1/agent/refresh"
        );
        assert_eq!(
            TokenRefresher::refresh_url_from_session("ws://localhost:9100/ws").unwrap(),
            "http://localhost:9100/api/v1/agent/refresh"
        );
        assert!(TokenRefresher::refresh_url_from_session("https://nope").is_err());
        assert!(TokenRefresher::refresh_url_from_session("wss://").is_err());
    }

    #[tokio::test]
    async fn valid_token_returned_without_refresh() {
        // The refresh URL points nowhere; a valid token must short-circuit.
        let r = refresher(valid_creds());
        assert_eq!(r.get_token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn stale_but_not_expired_token_survives_refresh_failure() {
        let mut creds = valid_creds();
        // Inside the 30 s validity buffer but before hard expiry.
        creds.expires_at = Utc::now() + Duration::seconds(10);
        let r = refresher(creds);
        assert_eq!(r.get_token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn hard_expired_token_surfaces_refresh_error() {
        let mut creds = valid_creds();
        creds.expires_at = Utc::now() - Duration::seconds(5);
        let r = refresher(creds);
        assert!(matches!(
            r.get_token().await,
            Err(AgentError::RefreshFailed(_))
        ));
    }

    #[tokio::test]
    async fn env_token_never_attempts_refresh() {
        let mut creds = Credentials::from_env_token("env-tok".into());
        creds.expires_at = Utc::now() - Duration::seconds(5);
        let r = refresher(creds);
        // No refresh token → RefreshFailed, not a connection error.
        match r.get_token().await {
            Err(AgentError::RefreshFailed(msg)) => assert!(msg.contains("no refresh token")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
