// SPDX-License-Identifier: MIT
//! Top-level wiring — builds the subsystems, runs the session until a
//! terminal condition, and drives the shutdown fan-out.
//!
//! Construction order breaks the handler cycle: session first, then the
//! executor and supervisor holding the session behind [`SessionLink`], then
//! the router installed into the session as its [`MessageHandler`] at start
//! time.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::credentials::refresher::TokenRefresher;
use crate::credentials::{CredentialStore, Credentials};
use crate::error::AgentError;
use crate::events::EventBus;
use crate::executor::Executor;
use crate::provider::Provider;
use crate::router::{spawn_health_forwarder, Router};
use crate::session::state::SessionState;
use crate::session::{Session, SessionLink};
use crate::supervisor::ProcessSupervisor;
use crate::telemetry::StatusReporter;
use crate::tracker::TaskTracker;

/// Environment override for the access token; takes precedence over the
/// credentials file at startup.
pub const TOKEN_ENV: &str = "TETHERD_TOKEN";

pub struct Bridge {
    pub config: BridgeConfig,
    pub session: Session,
    pub executor: Arc<Executor>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub refresher: Arc<TokenRefresher>,
    pub tracker: Arc<TaskTracker>,
    /// Cancels the background services (refresher loop, health forwarder).
    services_cancel: CancellationToken,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Build and wire every subsystem. Fails only with config-scoped errors.
    pub fn build(config: BridgeConfig, provider: Arc<dyn Provider>) -> Result<Self, AgentError> {
        let (creds, store) = load_credentials(&config)?;
        let refresh_url = TokenRefresher::refresh_url_from_session(&config.url)?;
        let refresher = Arc::new(TokenRefresher::new(creds, store, refresh_url));

        let tracker = Arc::new(TaskTracker::new());
        let session = Session::new(
            config.session_config(),
            Arc::clone(&refresher),
            Arc::clone(&tracker),
        );
        let link: Arc<dyn SessionLink> = Arc::new(session.clone());

        let events = EventBus::new();
        let supervisor = ProcessSupervisor::new(config.supervisor_config(), events);
        let executor = Executor::new(
            Arc::clone(&link),
            Arc::clone(&tracker),
            config.executor_config(),
        );
        crate::handlers::register_all(&executor, provider, Arc::clone(&supervisor));

        let router = Router::new(link, Arc::clone(&executor), Arc::clone(&supervisor));
        session.set_handler(router);

        let reporter = StatusReporter::new(Arc::clone(&tracker));
        session.set_status_enricher(reporter.into_enricher());

        Ok(Self {
            config,
            session,
            executor,
            supervisor,
            refresher,
            tracker,
            services_cancel: CancellationToken::new(),
        })
    }

    /// Connect and serve until shutdown. Returns the process exit code:
    /// `0` after a clean shutdown, `2` when the reconnect budget was
    /// exhausted with a finite attempt limit. Startup failures (including
    /// the initial connect) surface as errors — exit code `1`.
    pub async fn run(&self) -> Result<i32, AgentError> {
        self.refresher.start(self.services_cancel.clone());
        self.supervisor.run_health_monitor();
        spawn_health_forwarder(
            Arc::new(self.session.clone()) as Arc<dyn SessionLink>,
            self.supervisor.events(),
            self.services_cancel.clone(),
        );

        self.session.connect().await?;
        info!("bridge is up");

        let mut states = self.session.watch_state();
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!("signal handler failed: {e}");
                    }
                    self.shutdown("interrupted").await;
                    return Ok(0);
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        return Ok(0);
                    }
                    let state = *states.borrow();
                    match state {
                        SessionState::Closed => {
                            self.shutdown("session closed").await;
                            return Ok(0);
                        }
                        SessionState::Disconnected if self.session.reconnect_exhausted() => {
                            self.shutdown("reconnect budget exhausted").await;
                            return Ok(2);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Shutdown fan-out: stop intake, cancel in-flight handlers (they get
    /// their grace window), stop supervised processes, then close the
    /// session with a best-effort goodbye.
    pub async fn shutdown(&self, reason: &str) {
        info!(reason, "shutting down");
        self.executor.stop_accepting();
        self.session.cancel_inflight();
        self.services_cancel.cancel();
        self.supervisor.stop_all().await;
        self.session.close(reason).await;
    }
}

fn load_credentials(
    config: &BridgeConfig,
) -> Result<(Credentials, Option<CredentialStore>), AgentError> {
    if let Some(token) = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()) {
        info!("using access token from {TOKEN_ENV}");
        return Ok((Credentials::from_env_token(token), None));
    }
    let store = CredentialStore::new(config.data_dir.join("credentials.json"));
    let creds = store.load()?;
    Ok((creds, Some(store)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::EchoProvider;

    fn config_in(dir: &std::path::Path) -> BridgeConfig {
        BridgeConfig::new(
            Some("ws://127.0.0.1:1/ws".into()),
            Some(dir.to_path_buf()),
            None,
        )
    }

    #[tokio::test]
    async fn build_fails_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var(TOKEN_ENV);
        let err = Bridge::build(config_in(dir.path()), Arc::new(EchoProvider)).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn build_succeeds_with_credentials_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        store
            .save(&Credentials {
                access_token: "tok".into(),
                refresh_token: "ref".into(),
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
                user_id: "u".into(),
                workspace_id: "w".into(),
            })
            .unwrap();

        let bridge = Bridge::build(config_in(dir.path()), Arc::new(EchoProvider)).unwrap();
        assert_eq!(bridge.session.state(), SessionState::Disconnected);
        assert_eq!(bridge.tracker.len(), 0);

        // Initial connect against an unreachable plane is a startup error.
        let err = bridge.run().await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }
}
