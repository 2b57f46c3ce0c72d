// SPDX-License-Identifier: MIT
//! The control-plane session — one logical connection from `connect` to
//! `close`, possibly spanning many physical reconnects.
//!
//! Owns the WebSocket, the auth handshake, the read and heartbeat loops,
//! signing on send, and the reconnect loop. Lifecycle transitions go
//! through a single atomic ([`state::StateCell`]); the `Connected →
//! Reconnecting` edge is CAS-guarded so exactly one failure observer wins
//! and exactly one reconnect loop runs.
//!
//! The message handler is installed at start time, not construct time, and
//! downstream components see the session only through [`SessionLink`].

pub mod recovery;
pub mod state;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Deserialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::credentials::refresher::TokenRefresher;
use crate::error::AgentError;
use crate::protocol::payloads::{
    ConnectAckPayload, ConnectPayload, DisconnectPayload, HeartbeatPayload,
};
use crate::protocol::{Envelope, MessageKind};
use crate::signing::Signer;
use crate::tracker::TaskTracker;
use state::{SessionState, StateCell};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Bounded inbox for external observers; overflow drops with a counter.
const INBOX_CAPACITY: usize = 500;

// ─── Seams ────────────────────────────────────────────────────────────────────

/// Installed into the session at start time. `handle` runs on its own task
/// per message; a panic there is converted into a disconnect.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope, cancel: CancellationToken);

    /// Invoked after a successful reconnect, once task recovery has been
    /// launched.
    async fn on_reconnected(&self) {}
}

/// The narrow view of the session that the router and executor hold.
#[async_trait]
pub trait SessionLink: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), AgentError>;
    fn state(&self) -> SessionState;
    fn set_last_exec_id(&self, exec_id: &str);
}

/// Optional heartbeat side-band supplier (load, active task count).
pub type StatusEnricher = Box<dyn Fn() -> Option<serde_json::Value> + Send + Sync>;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SessionConfig {
    /// `wss://host/...` control-plane endpoint.
    pub url: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub handshake_timeout: Duration,
    pub auth_timeout: Duration,
    pub write_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec![
                "task".into(),
                "build".into(),
                "test".into(),
                "qa".into(),
                "computer".into(),
                "mcp_codegen".into(),
                "mcp_deploy".into(),
                "mcp_servers".into(),
            ],
            handshake_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            backoff: Backoff::default(),
        }
    }
}

// ─── Counters ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CountersInner {
    signature_invalid: AtomicU64,
    inbox_dropped: AtomicU64,
    protocol_errors: AtomicU64,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub signature_invalid: u64,
    pub inbox_dropped: u64,
    pub protocol_errors: u64,
}

// ─── Session ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    state: StateCell,
    state_tx: watch::Sender<SessionState>,
    signer: Signer,
    backoff: StdMutex<Backoff>,
    tracker: Arc<TaskTracker>,
    refresher: Arc<TokenRefresher>,
    /// The transport is not concurrent-write safe: every write goes through
    /// this one lock.
    writer: Mutex<Option<WsSink>>,
    handler: StdRwLock<Option<Arc<dyn MessageHandler>>>,
    status_enricher: StdRwLock<Option<StatusEnricher>>,
    last_exec_id: StdMutex<Option<String>>,
    last_heartbeat: StdMutex<std::time::Instant>,
    inbox_tx: mpsc::Sender<Envelope>,
    inbox_rx: StdMutex<Option<mpsc::Receiver<Envelope>>>,
    counters: CountersInner,
    /// Session-lifetime cancellation; cancelled once, on close.
    root_cancel: CancellationToken,
    /// Per-physical-connection "done" signal, re-armed on every connect.
    conn_cancel: StdMutex<CancellationToken>,
    /// Set when a reconnect loop ran out of attempts.
    exhausted: AtomicBool,
    http: reqwest::Client,
}

/// Minimal payload probe: any outgoing message carrying an execution ID
/// updates `last_exec_id` for the next reconnect handshake.
#[derive(Deserialize)]
struct ExecProbe {
    exec_id: Option<String>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        refresher: Arc<TokenRefresher>,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let backoff = config.backoff.clone();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                config,
                state: StateCell::default(),
                state_tx,
                signer: Signer::new(),
                backoff: StdMutex::new(backoff),
                tracker,
                refresher,
                writer: Mutex::new(None),
                handler: StdRwLock::new(None),
                status_enricher: StdRwLock::new(None),
                last_exec_id: StdMutex::new(None),
                last_heartbeat: StdMutex::new(std::time::Instant::now()),
                inbox_tx,
                inbox_rx: StdMutex::new(Some(inbox_rx)),
                counters: CountersInner::default(),
                root_cancel: CancellationToken::new(),
                conn_cancel: StdMutex::new(CancellationToken::new()),
                exhausted: AtomicBool::new(false),
                http,
            }),
        }
    }

    // ─── Wiring ─────────────────────────────────────────────────────────────

    /// Install the message handler. Must happen before `connect`.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.inner.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    pub fn set_status_enricher(&self, enricher: StatusEnricher) {
        *self
            .inner
            .status_enricher
            .write()
            .expect("enricher lock poisoned") = Some(enricher);
    }

    /// The bounded observer inbox. Can be taken once.
    pub fn take_inbox(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inner
            .inbox_rx
            .lock()
            .expect("inbox lock poisoned")
            .take()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    pub fn counters(&self) -> SessionCounters {
        SessionCounters {
            signature_invalid: self
                .inner
                .counters
                .signature_invalid
                .load(Ordering::Relaxed),
            inbox_dropped: self.inner.counters.inbox_dropped.load(Ordering::Relaxed),
            protocol_errors: self.inner.counters.protocol_errors.load(Ordering::Relaxed),
        }
    }

    pub fn last_exec_id(&self) -> Option<String> {
        self.inner
            .last_exec_id
            .lock()
            .expect("exec id lock poisoned")
            .clone()
    }

    /// `true` once a reconnect loop has exhausted its attempt budget.
    pub fn reconnect_exhausted(&self) -> bool {
        self.inner.exhausted.load(Ordering::SeqCst)
    }

    pub fn backoff_attempt(&self) -> u32 {
        self.inner
            .backoff
            .lock()
            .expect("backoff lock poisoned")
            .current_attempt()
    }

    // ─── Connect ────────────────────────────────────────────────────────────

    /// Dial, authenticate, and start the read and heartbeat loops.
    pub async fn connect(&self) -> Result<(), AgentError> {
        if self.state() == SessionState::Closed {
            return Err(AgentError::Closed);
        }
        if !self.transition(SessionState::Disconnected, SessionState::Connecting) {
            return Err(AgentError::Transport(format!(
                "connect called while {}",
                self.state()
            )));
        }

        match self.establish(false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Roll back unless close raced us.
                self.transition(SessionState::Connecting, SessionState::Disconnected);
                self.transition(SessionState::Authenticating, SessionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self, reconnecting: bool) -> Result<(), AgentError> {
        let token = self.inner.refresher.get_token().await?;

        let ws_config = WebSocketConfig {
            max_message_size: Some(crate::protocol::MAX_FRAME_BYTES),
            max_frame_size: Some(crate::protocol::MAX_FRAME_BYTES),
            ..Default::default()
        };
        let (stream, _resp) = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            connect_async_with_config(self.inner.config.url.as_str(), Some(ws_config), false),
        )
        .await
        .map_err(|_| AgentError::Transport("websocket handshake timed out".into()))?
        .map_err(|e| AgentError::Transport(format!("websocket connect: {e}")))?;

        if !reconnecting
            && !self.transition(SessionState::Connecting, SessionState::Authenticating)
        {
            // Close raced the dial.
            return Err(AgentError::Closed);
        }

        let (mut sink, mut source) = stream.split();

        // Auth handshake: one request, exactly one allowed reply.
        let connect_payload = ConnectPayload {
            version: self.inner.config.version.clone(),
            capabilities: self.inner.config.capabilities.clone(),
            last_exec_id: self.last_exec_id(),
            token,
        };
        let hello = Envelope::new(MessageKind::AgentConnect, &connect_payload)?;
        tokio::time::timeout(
            self.inner.config.write_timeout,
            sink.send(Message::Text(hello.encode()?)),
        )
        .await
        .map_err(|_| AgentError::Transport("agent_connect write timed out".into()))?
        .map_err(|e| AgentError::Transport(format!("send agent_connect: {e}")))?;

        let ack = self.await_ack(&mut sink, &mut source).await?;
        if !ack.success {
            return Err(AgentError::AuthRejected(if ack.message.is_empty() {
                "control plane rejected agent_connect".into()
            } else {
                ack.message
            }));
        }
        if let Some(secret_hex) = &ack.hmac_secret_hex {
            self.inner.signer.install_hex(secret_hex)?;
        }

        // Install the transport, flip to Connected, re-arm the done signal.
        *self.inner.writer.lock().await = Some(sink);
        let from = if reconnecting {
            SessionState::Reconnecting
        } else {
            SessionState::Authenticating
        };
        if !self.transition(from, SessionState::Connected) {
            // Closed raced us; tear the socket back down.
            self.inner.writer.lock().await.take();
            return Err(AgentError::Closed);
        }

        self.inner
            .backoff
            .lock()
            .expect("backoff lock poisoned")
            .reset();
        *self
            .inner
            .last_heartbeat
            .lock()
            .expect("heartbeat lock poisoned") = std::time::Instant::now();

        let conn_token = self.inner.root_cancel.child_token();
        {
            let mut guard = self
                .inner
                .conn_cancel
                .lock()
                .expect("conn cancel lock poisoned");
            *guard = conn_token.clone();
        }

        let read = self.clone();
        let read_token = conn_token.clone();
        tokio::spawn(async move { read.read_loop(source, read_token).await });

        let beat = self.clone();
        tokio::spawn(async move { beat.heartbeat_loop(conn_token).await });

        info!(url = %self.inner.config.url, "session connected");
        Ok(())
    }

    /// Wait for the single `agent_connect_ack`, answering pings meanwhile.
    async fn await_ack(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
    ) -> Result<ConnectAckPayload, AgentError> {
        let deadline = tokio::time::Instant::now() + self.inner.config.auth_timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, source.next())
                .await
                .map_err(|_| AgentError::Transport("auth ack timed out".into()))?
                .ok_or_else(|| AgentError::Transport("socket closed during auth".into()))?
                .map_err(|e| AgentError::Transport(format!("read during auth: {e}")))?;

            let text = match frame {
                Message::Text(text) => text,
                Message::Ping(data) => {
                    let _ = sink.send(Message::Pong(data)).await;
                    continue;
                }
                Message::Pong(_) => continue,
                Message::Close(_) => {
                    return Err(AgentError::Transport("socket closed during auth".into()))
                }
                other => {
                    return Err(AgentError::Protocol(format!(
                        "unexpected frame during auth: {other:?}"
                    )))
                }
            };

            let envelope = Envelope::decode(&text)?;
            if envelope.message_kind() != Some(MessageKind::AgentConnectAck) {
                return Err(AgentError::Protocol(format!(
                    "expected agent_connect_ack, got {}",
                    envelope.kind
                )));
            }
            return envelope.decode_payload::<ConnectAckPayload>();
        }
    }

    // ─── Read loop ──────────────────────────────────────────────────────────

    async fn read_loop(self, mut source: WsSource, token: CancellationToken) {
        let reason: String;
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => return,
                frame = source.next() => frame,
            };
            match frame {
                None => {
                    reason = "socket closed by peer".into();
                    break;
                }
                Some(Err(e)) => {
                    reason = format!("read error: {e}");
                    break;
                }
                Some(Ok(Message::Ping(data))) => {
                    self.send_raw(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    reason = "close frame received".into();
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    self.handle_frame(&text);
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => self.handle_frame(&text),
                    Err(_) => {
                        self.inner
                            .counters
                            .protocol_errors
                            .fetch_add(1, Ordering::Relaxed);
                    }
                },
            }
        }
        self.trigger_reconnect(&reason);
    }

    fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Malformed frames are dropped and counted; only socket
                // errors tear the connection down.
                self.inner
                    .counters
                    .protocol_errors
                    .fetch_add(1, Ordering::Relaxed);
                debug!("dropping malformed frame: {e}");
                return;
            }
        };

        if envelope.message_kind() == Some(MessageKind::AgentHeartbeat) {
            *self
                .inner
                .last_heartbeat
                .lock()
                .expect("heartbeat lock poisoned") = std::time::Instant::now();
            return;
        }

        if !self.inner.signer.verify(&envelope) {
            self.inner
                .counters
                .signature_invalid
                .fetch_add(1, Ordering::Relaxed);
            warn!(kind = %envelope.kind, id = %envelope.id, "dropping message with invalid signature");
            return;
        }

        // Non-blocking offer to external observers.
        if self.inner.inbox_tx.try_send(envelope.clone()).is_err() {
            self.inner
                .counters
                .inbox_dropped
                .fetch_add(1, Ordering::Relaxed);
        }

        let handler = self
            .inner
            .handler
            .read()
            .expect("handler lock poisoned")
            .clone();
        let Some(handler) = handler else {
            debug!(kind = %envelope.kind, "no handler installed, dropping message");
            return;
        };

        // Each message gets its own task; a handler panic becomes a
        // disconnect instead of a crash. Handler contexts derive from the
        // session-lifetime root, not the connection: a reconnect blip must
        // not cancel in-flight work, only close does.
        let cancel = self.inner.root_cancel.child_token();
        let this = self.clone();
        tokio::spawn(async move {
            let run = AssertUnwindSafe(handler.handle(envelope, cancel)).catch_unwind();
            if run.await.is_err() {
                this.trigger_reconnect("message handler panicked");
            }
        });
    }

    // ─── Heartbeat loop ─────────────────────────────────────────────────────

    async fn heartbeat_loop(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.state() != SessionState::Connected {
                return;
            }

            let silence = self
                .inner
                .last_heartbeat
                .lock()
                .expect("heartbeat lock poisoned")
                .elapsed();
            if silence > self.inner.config.heartbeat_timeout {
                self.trigger_reconnect("heartbeat timeout");
                return;
            }

            let status = self
                .inner
                .status_enricher
                .read()
                .expect("enricher lock poisoned")
                .as_ref()
                .and_then(|f| f());
            let heartbeat =
                match Envelope::new(MessageKind::AgentHeartbeat, &HeartbeatPayload { status }) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("failed to build heartbeat: {e}");
                        continue;
                    }
                };
            if let Err(e) = self.send(heartbeat).await {
                debug!("heartbeat send failed: {e}");
                return;
            }
        }
    }

    // ─── Send ───────────────────────────────────────────────────────────────

    /// Sign (critical kinds), serialize, and write under the single write
    /// lock with a fresh deadline. A write failure schedules a reconnect.
    pub async fn send(&self, mut envelope: Envelope) -> Result<(), AgentError> {
        match self.state() {
            SessionState::Closed => return Err(AgentError::Closed),
            SessionState::Connected => {}
            other => {
                return Err(AgentError::Transport(format!("cannot send while {other}")))
            }
        }

        if let Ok(probe) = envelope.decode_payload::<ExecProbe>() {
            if let Some(exec_id) = probe.exec_id.filter(|id| !id.is_empty()) {
                self.set_last_exec_id(&exec_id);
            }
        }

        self.inner.signer.sign(&mut envelope);
        let text = envelope.encode()?;

        let mut guard = self.inner.writer.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| AgentError::Transport("no active transport".into()))?;
        let written = tokio::time::timeout(
            self.inner.config.write_timeout,
            sink.send(Message::Text(text)),
        )
        .await;
        drop(guard);

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                let reason = format!("write failed: {e}");
                self.trigger_reconnect(&reason);
                Err(AgentError::Transport(reason))
            }
            Err(_) => {
                let reason = "write timed out".to_string();
                self.trigger_reconnect(&reason);
                Err(AgentError::Transport(reason))
            }
        }
    }

    /// Control-frame write (pong); errors are left to the read loop.
    async fn send_raw(&self, message: Message) {
        let mut guard = self.inner.writer.lock().await;
        if let Some(sink) = guard.as_mut() {
            let _ = sink.send(message).await;
        }
    }

    // ─── Reconnect ──────────────────────────────────────────────────────────

    /// Exactly one caller wins the `Connected → Reconnecting` CAS and runs
    /// the reconnect loop; everyone else returns immediately.
    pub fn trigger_reconnect(&self, reason: &str) {
        if !self.transition(SessionState::Connected, SessionState::Reconnecting) {
            return;
        }
        warn!(reason, "session lost, reconnecting");

        // Fan-out: cancel per-connection loops and handler contexts.
        self.inner
            .conn_cancel
            .lock()
            .expect("conn cancel lock poisoned")
            .cancel();

        let this = self.clone();
        tokio::spawn(async move { this.reconnect_loop().await });
    }

    async fn reconnect_loop(&self) {
        // The dead transport must not be reused.
        self.inner.writer.lock().await.take();

        loop {
            if self.state() != SessionState::Reconnecting {
                return;
            }

            let delay = {
                let mut backoff = self.inner.backoff.lock().expect("backoff lock poisoned");
                backoff.can_retry().then(|| backoff.next_delay())
            };
            let Some(delay) = delay else {
                warn!("reconnect attempts exhausted");
                self.inner.exhausted.store(true, Ordering::SeqCst);
                self.transition(SessionState::Reconnecting, SessionState::Disconnected);
                return;
            };

            debug!(delay_ms = delay.as_millis() as u64, "sleeping before reconnect");
            tokio::select! {
                _ = self.inner.root_cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            // Best-effort token refresh; the old token is reused on failure.
            if let Err(e) = self.inner.refresher.get_token().await {
                debug!("token refresh before reconnect failed: {e}");
            }

            match self.establish(true).await {
                Ok(()) => {
                    info!("reconnected");
                    self.spawn_recovery();
                    let handler = self
                        .inner
                        .handler
                        .read()
                        .expect("handler lock poisoned")
                        .clone();
                    if let Some(handler) = handler {
                        handler.on_reconnected().await;
                    }
                    return;
                }
                Err(AgentError::Closed) => return,
                Err(e) => {
                    warn!("reconnect attempt failed: {e}");
                }
            }
        }
    }

    fn spawn_recovery(&self) {
        if self.inner.tracker.is_empty() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let token = match this.inner.refresher.get_token().await {
                Ok(token) => token,
                Err(e) => {
                    warn!("recovery skipped, no token: {e}");
                    return;
                }
            };
            recovery::run(
                &this.inner.http,
                &this.inner.config.url,
                &token,
                &this.inner.tracker,
            )
            .await;
        });
    }

    /// Cancel all in-flight handler contexts without touching the socket.
    /// Part of the shutdown fan-out: handlers get their grace window while
    /// the supervisor winds down, before the session itself closes.
    pub fn cancel_inflight(&self) {
        self.inner.root_cancel.cancel();
    }

    // ─── Close ──────────────────────────────────────────────────────────────

    /// Idempotent terminal shutdown: best-effort `agent_disconnect` and
    /// close frame, then everything is cancelled. Blocks future connects.
    pub async fn close(&self, reason: &str) {
        let previous = self.inner.state.set(SessionState::Closed);
        let _ = self.inner.state_tx.send(SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }
        info!(reason, "closing session");

        self.inner
            .conn_cancel
            .lock()
            .expect("conn cancel lock poisoned")
            .cancel();

        let mut guard = self.inner.writer.lock().await;
        if let Some(sink) = guard.as_mut() {
            if let Ok(goodbye) = Envelope::new(
                MessageKind::AgentDisconnect,
                &DisconnectPayload {
                    reason: reason.to_string(),
                },
            ) {
                if let Ok(text) = goodbye.encode() {
                    let _ = tokio::time::timeout(
                        Duration::from_secs(2),
                        sink.send(Message::Text(text)),
                    )
                    .await;
                }
            }
            let _ =
                tokio::time::timeout(Duration::from_secs(2), sink.send(Message::Close(None))).await;
        }
        guard.take();
        drop(guard);

        self.inner.root_cancel.cancel();
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let won = self.inner.state.transition(from, to);
        if won {
            let _ = self.inner.state_tx.send(to);
        }
        won
    }
}

#[async_trait]
impl SessionLink for Session {
    async fn send(&self, envelope: Envelope) -> Result<(), AgentError> {
        Session::send(self, envelope).await
    }

    fn state(&self) -> SessionState {
        Session::state(self)
    }

    fn set_last_exec_id(&self, exec_id: &str) {
        *self
            .inner
            .last_exec_id
            .lock()
            .expect("exec id lock poisoned") = Some(exec_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use chrono::Utc;

    fn session(url: &str) -> Session {
        let creds = Credentials {
            access_token: "tok".into(),
            refresh_token: String::new(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            user_id: String::new(),
            workspace_id: String::new(),
        };
        let refresher = Arc::new(TokenRefresher::new(
            creds,
            None,
            "http://127.0.0.1:1/api/v1/agent/refresh".into(),
        ));
        let config = SessionConfig {
            url: url.to_string(),
            handshake_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        Session::new(config, refresher, Arc::new(TaskTracker::new()))
    }

    #[tokio::test]
    async fn connect_to_unreachable_host_rolls_back_to_disconnected() {
        let s = session("ws://127.0.0.1:1/ws");
        let err = s.connect().await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_after_close_is_refused() {
        let s = session("ws://127.0.0.1:1/ws");
        s.close("test").await;
        assert_eq!(s.state(), SessionState::Closed);
        assert!(matches!(s.connect().await, Err(AgentError::Closed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let s = session("ws://127.0.0.1:1/ws");
        s.close("first").await;
        s.close("second").await;
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn send_refused_when_not_connected() {
        let s = session("ws://127.0.0.1:1/ws");
        let env =
            Envelope::new(MessageKind::AgentHeartbeat, &HeartbeatPayload::default()).unwrap();
        assert!(matches!(s.send(env).await, Err(AgentError::Transport(_))));
        s.close("done").await;
        let env =
            Envelope::new(MessageKind::AgentHeartbeat, &HeartbeatPayload::default()).unwrap();
        assert!(matches!(s.send(env).await, Err(AgentError::Closed)));
    }

    #[tokio::test]
    async fn trigger_reconnect_requires_connected() {
        let s = session("ws://127.0.0.1:1/ws");
        // Not connected — the CAS loses and nothing happens.
        s.trigger_reconnect("spurious");
        assert_eq!(s.state(), SessionState::Disconnected);
    }

    #[test]
    fn inbox_can_only_be_taken_once() {
        let s = session("ws://127.0.0.1:1/ws");
        assert!(s.take_inbox().is_some());
        assert!(s.take_inbox().is_none());
    }
}
