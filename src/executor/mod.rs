// SPDX-License-Identifier: MIT
//! Bounded task executor — runs work requests dispatched by the router.
//!
//! Admission control is two-tier: a semaphore-bounded worker pool, then a
//! bounded FIFO overflow queue. Beyond both, the request is answered with a
//! `rejected_busy` error and never registered. Duplicate execution IDs are
//! answered with an `ignored_duplicate` progress event and no handler runs.
//!
//! Every accepted execution emits exactly one terminal frame (`*_result` on
//! success, `task_error` on failure) and is untracked afterwards. Handlers
//! whose context is cancelled get a short grace window to unwind; stragglers
//! are abandoned — the connection their output would ride on is gone.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::protocol::payloads::{ErrorPayload, ProgressPayload, ResultPayload, WorkPayload};
use crate::protocol::{Envelope, MessageKind};
use crate::session::SessionLink;
use crate::tracker::TaskTracker;

// ─── Work kinds ───────────────────────────────────────────────────────────────

/// The executor's view of a work request, with its progress/result mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    Task,
    Build,
    Test,
    Qa,
    Computer,
    Codegen,
    Deploy,
}

impl WorkKind {
    pub fn from_message(kind: MessageKind) -> Option<Self> {
        Some(match kind {
            MessageKind::TaskRequest => WorkKind::Task,
            MessageKind::BuildRequest => WorkKind::Build,
            MessageKind::TestRequest => WorkKind::Test,
            MessageKind::QaRequest => WorkKind::Qa,
            MessageKind::ComputerRequest => WorkKind::Computer,
            MessageKind::McpCodegenRequest => WorkKind::Codegen,
            MessageKind::McpDeployRequest => WorkKind::Deploy,
            _ => return None,
        })
    }

    pub fn progress_kind(&self) -> MessageKind {
        match self {
            WorkKind::Codegen => MessageKind::McpCodegenProgress,
            _ => MessageKind::TaskProgress,
        }
    }

    pub fn result_kind(&self) -> MessageKind {
        match self {
            WorkKind::Task => MessageKind::TaskResult,
            WorkKind::Build => MessageKind::BuildResult,
            WorkKind::Test => MessageKind::TestResult,
            WorkKind::Qa => MessageKind::QaResult,
            WorkKind::Computer => MessageKind::ComputerResult,
            WorkKind::Codegen => MessageKind::McpCodegenResult,
            WorkKind::Deploy => MessageKind::McpDeployResult,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Task => "task",
            WorkKind::Build => "build",
            WorkKind::Test => "test",
            WorkKind::Qa => "qa",
            WorkKind::Computer => "computer",
            WorkKind::Codegen => "mcp_codegen",
            WorkKind::Deploy => "mcp_deploy",
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded work request handed to a [`TaskHandler`].
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub exec_id: String,
    pub kind: WorkKind,
    pub params: serde_json::Map<String, Value>,
}

// ─── Progress ─────────────────────────────────────────────────────────────────

/// Serializes progress events for one execution, with a per-execution
/// monotone sequence number.
#[derive(Clone)]
pub struct ProgressSender {
    session: Arc<dyn SessionLink>,
    exec_id: String,
    kind: MessageKind,
    seq: Arc<AtomicU64>,
}

impl ProgressSender {
    fn new(session: Arc<dyn SessionLink>, exec_id: String, kind: MessageKind) -> Self {
        Self {
            session,
            exec_id,
            kind,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// Best-effort: a failed send is logged, not propagated — the session is
    /// already driving its own reconnect.
    pub async fn emit(&self, event: &str, data: Option<Value>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let payload = ProgressPayload {
            exec_id: self.exec_id.clone(),
            seq,
            event: event.to_string(),
            data,
        };
        match Envelope::new(self.kind, &payload) {
            Ok(envelope) => {
                if let Err(e) = self.session.send(envelope).await {
                    debug!(exec_id = %self.exec_id, event, "progress send failed: {e}");
                }
            }
            Err(e) => warn!(exec_id = %self.exec_id, "failed to build progress: {e}"),
        }
    }
}

// ─── Handler seam ─────────────────────────────────────────────────────────────

/// One registered work-kind implementation. Must respect `cancel` and
/// return within the shutdown grace once it fires.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        request: WorkRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<Value, AgentError>;
}

// ─── Executor ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker pool bound. Defaults to `min(8, 2 · hardware threads)`.
    pub max_workers: usize,
    /// Overflow FIFO capacity.
    pub queue_capacity: usize,
    /// How long a cancelled handler gets to unwind before being abandoned.
    pub shutdown_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_pool_size(),
            queue_capacity: 64,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

pub fn default_pool_size() -> usize {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (2 * threads).min(8).max(1)
}

struct Job {
    request: WorkRequest,
    handler: Arc<dyn TaskHandler>,
    cancel: CancellationToken,
}

pub struct Executor {
    session: Arc<dyn SessionLink>,
    tracker: Arc<TaskTracker>,
    handlers: StdRwLock<HashMap<WorkKind, Arc<dyn TaskHandler>>>,
    pool: Arc<Semaphore>,
    /// Overflow FIFO, drained by workers before they release their permit.
    queue: StdMutex<VecDeque<Job>>,
    accepting: AtomicBool,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        session: Arc<dyn SessionLink>,
        tracker: Arc<TaskTracker>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Arc::new(Self {
            session,
            tracker,
            handlers: StdRwLock::new(HashMap::new()),
            pool,
            queue: StdMutex::new(VecDeque::new()),
            accepting: AtomicBool::new(true),
            config,
        })
    }

    pub fn register(&self, kind: WorkKind, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .write()
            .expect("handler map poisoned")
            .insert(kind, handler);
    }

    /// Part of the shutdown fan-out: no new work is admitted.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn active_count(&self) -> usize {
        self.tracker.len()
    }

    /// Validate, dedup, and schedule one work request.
    pub async fn submit(self: &Arc<Self>, envelope: &Envelope, cancel: CancellationToken) {
        let Some(message_kind) = envelope.message_kind() else {
            return;
        };
        let Some(kind) = WorkKind::from_message(message_kind) else {
            warn!(kind = %envelope.kind, "not a work message, ignoring");
            return;
        };

        let payload: WorkPayload = match envelope.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %envelope.kind, "undecodable work payload: {e}");
                return;
            }
        };
        if payload.exec_id.is_empty() {
            warn!(kind = %envelope.kind, "work request without exec_id dropped");
            return;
        }
        let exec_id = payload.exec_id.clone();

        if !self.accepting.load(Ordering::SeqCst) {
            self.reply_error(&exec_id, "rejected_busy", "executor is shutting down")
                .await;
            return;
        }

        // Dedup: registration doubles as the atomic gate, so two racing
        // frames for the same execution ID cannot both reach a handler.
        if !self.tracker.register(&exec_id) {
            info!(exec_id, "duplicate execution ignored");
            let progress = ProgressSender::new(
                Arc::clone(&self.session),
                exec_id,
                kind.progress_kind(),
            );
            progress.emit("ignored_duplicate", None).await;
            return;
        }

        let handler = self
            .handlers
            .read()
            .expect("handler map poisoned")
            .get(&kind)
            .cloned();
        let Some(handler) = handler else {
            self.tracker.complete(&exec_id);
            self.reply_error(&exec_id, "handler", &format!("no handler for {kind}"))
                .await;
            return;
        };

        let job = Job {
            request: WorkRequest {
                exec_id: exec_id.clone(),
                kind,
                params: payload.params,
            },
            handler,
            cancel,
        };

        // Pool first, overflow queue second, rejected_busy last — a
        // rejected request is unregistered before the reply goes out.
        match Arc::clone(&self.pool).try_acquire_owned() {
            Ok(permit) => {
                let runner = Arc::clone(self);
                tokio::spawn(async move { runner.run_worker(permit, job).await });
            }
            Err(_) => {
                let queued = {
                    let mut queue = self.queue.lock().expect("queue poisoned");
                    if queue.len() < self.config.queue_capacity {
                        queue.push_back(job);
                        true
                    } else {
                        false
                    }
                };
                if !queued {
                    warn!(exec_id, "pool and queue saturated, rejecting");
                    self.tracker.complete(&exec_id);
                    self.reply_error(&exec_id, "rejected_busy", "executor saturated")
                        .await;
                    return;
                }
                // A permit may have freed while we queued; pick the work
                // back up so it cannot strand with an idle pool.
                if let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() {
                    let next = self.queue.lock().expect("queue poisoned").pop_front();
                    match next {
                        Some(job) => {
                            let runner = Arc::clone(self);
                            tokio::spawn(async move { runner.run_worker(permit, job).await });
                        }
                        None => drop(permit),
                    }
                }
            }
        }
    }

    /// Run the job, then keep the permit and drain the overflow queue dry.
    async fn run_worker(self: Arc<Self>, _permit: OwnedSemaphorePermit, mut job: Job) {
        loop {
            self.run_job(job).await;
            match self.queue.lock().expect("queue poisoned").pop_front() {
                Some(next) => job = next,
                None => break,
            }
        }
    }

    async fn run_job(&self, job: Job) {
        let exec_id = job.request.exec_id.clone();
        let kind = job.request.kind;
        let started = std::time::Instant::now();

        let progress = ProgressSender::new(
            Arc::clone(&self.session),
            exec_id.clone(),
            kind.progress_kind(),
        );
        progress.emit("accepted", None).await;

        let cancel = job.cancel.clone();
        let mut work = std::pin::pin!(job.handler.run(job.request, progress, cancel));

        let outcome = tokio::select! {
            result = &mut work => Some(result),
            _ = job.cancel.cancelled() => {
                // Cancelled mid-flight: grace window to unwind, then abandon.
                match tokio::time::timeout(self.config.shutdown_grace, &mut work).await {
                    Ok(result) => Some(result),
                    Err(_) => None,
                }
            }
        };

        match outcome {
            Some(Ok(output)) => {
                let payload = ResultPayload {
                    exec_id: exec_id.clone(),
                    output,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                self.send_terminal(kind.result_kind(), &payload).await;
            }
            Some(Err(e)) => {
                self.reply_error(&exec_id, e.kind(), &e.to_string()).await;
            }
            None => {
                warn!(exec_id, "handler ignored cancellation, abandoned");
            }
        }

        self.tracker.complete(&exec_id);
    }

    async fn reply_error(&self, exec_id: &str, kind: &str, message: &str) {
        let payload = ErrorPayload {
            exec_id: exec_id.to_string(),
            kind: kind.to_string(),
            message: message.to_string(),
        };
        self.send_terminal(MessageKind::TaskError, &payload).await;
    }

    async fn send_terminal<P: serde::Serialize>(&self, kind: MessageKind, payload: &P) {
        match Envelope::new(kind, payload) {
            Ok(envelope) => {
                if let Err(e) = self.session.send(envelope).await {
                    debug!(kind = %kind, "terminal frame send failed: {e}");
                }
            }
            Err(e) => warn!(kind = %kind, "failed to build terminal frame: {e}"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::SessionState;
    use serde_json::json;
    use tokio::sync::Mutex as TokioMutex;

    /// Captures everything "sent" for assertions.
    struct FakeLink {
        sent: TokioMutex<Vec<Envelope>>,
    }

    impl FakeLink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: TokioMutex::new(Vec::new()),
            })
        }

        async fn sent_kinds(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|e| e.kind.clone()).collect()
        }

        async fn progress_events(&self) -> Vec<(String, u64, String)> {
            self.sent
                .lock()
                .await
                .iter()
                .filter(|e| {
                    matches!(
                        e.message_kind(),
                        Some(MessageKind::TaskProgress) | Some(MessageKind::McpCodegenProgress)
                    )
                })
                .map(|e| {
                    let p: ProgressPayload = e.decode_payload().unwrap();
                    (p.exec_id, p.seq, p.event)
                })
                .collect()
        }
    }

    #[async_trait]
    impl SessionLink for FakeLink {
        async fn send(&self, envelope: Envelope) -> Result<(), AgentError> {
            self.sent.lock().await.push(envelope);
            Ok(())
        }

        fn state(&self) -> SessionState {
            SessionState::Connected
        }

        fn set_last_exec_id(&self, _exec_id: &str) {}
    }

    struct EchoHandler {
        delay: Duration,
    }

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn run(
            &self,
            request: WorkRequest,
            progress: ProgressSender,
            cancel: CancellationToken,
        ) -> Result<Value, AgentError> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    return Err(AgentError::Handler {
                        kind: "cancelled".into(),
                        message: "execution cancelled".into(),
                    });
                }
            }
            progress.emit("working", None).await;
            let prompt = request
                .params
                .get("prompt")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Ok(json!({ "echo": prompt }))
        }
    }

    fn request_envelope(kind: MessageKind, exec_id: &str) -> Envelope {
        Envelope::new(kind, &json!({ "exec_id": exec_id, "prompt": "hello" })).unwrap()
    }

    fn executor_with(
        link: Arc<FakeLink>,
        config: ExecutorConfig,
        delay: Duration,
    ) -> Arc<Executor> {
        let executor = Executor::new(link, Arc::new(TaskTracker::new()), config);
        executor.register(WorkKind::Task, Arc::new(EchoHandler { delay }));
        executor.register(WorkKind::Codegen, Arc::new(EchoHandler { delay }));
        executor
    }

    #[tokio::test]
    async fn happy_path_emits_accepted_then_result() {
        let link = FakeLink::new();
        let executor = executor_with(
            Arc::clone(&link),
            ExecutorConfig::default(),
            Duration::from_millis(120),
        );

        executor
            .submit(
                &request_envelope(MessageKind::TaskRequest, "E1"),
                CancellationToken::new(),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        let kinds = link.sent_kinds().await;
        assert_eq!(
            kinds,
            vec!["task_progress", "task_progress", "task_result"]
        );
        let progress = link.progress_events().await;
        assert_eq!(progress[0], ("E1".into(), 0, "accepted".into()));
        assert_eq!(progress[1], ("E1".into(), 1, "working".into()));

        let result: ResultPayload = link.sent.lock().await[2].decode_payload().unwrap();
        assert_eq!(result.exec_id, "E1");
        assert_eq!(result.output, json!({ "echo": "hello" }));
        assert!(result.duration_ms >= 100);
        assert_eq!(executor.active_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_execution_is_ignored() {
        let link = FakeLink::new();
        let executor = executor_with(
            Arc::clone(&link),
            ExecutorConfig::default(),
            Duration::from_millis(200),
        );

        let env = request_envelope(MessageKind::TaskRequest, "E2");
        executor.submit(&env, CancellationToken::new()).await;
        executor.submit(&env, CancellationToken::new()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let events = link.progress_events().await;
        let dupes: Vec<_> = events
            .iter()
            .filter(|(_, _, e)| e == "ignored_duplicate")
            .collect();
        assert_eq!(dupes.len(), 1);

        // Exactly one terminal frame for E2.
        let kinds = link.sent_kinds().await;
        assert_eq!(kinds.iter().filter(|k| *k == "task_result").count(), 1);
    }

    #[tokio::test]
    async fn saturation_rejects_with_busy() {
        let link = FakeLink::new();
        let config = ExecutorConfig {
            max_workers: 1,
            queue_capacity: 1,
            shutdown_grace: Duration::from_millis(100),
        };
        let executor = executor_with(Arc::clone(&link), config, Duration::from_millis(500));

        for i in 0..3 {
            executor
                .submit(
                    &request_envelope(MessageKind::TaskRequest, &format!("E{i}")),
                    CancellationToken::new(),
                )
                .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Third submission overflowed pool (1) + queue (1).
        let errors: Vec<ErrorPayload> = link
            .sent
            .lock()
            .await
            .iter()
            .filter(|e| e.message_kind() == Some(MessageKind::TaskError))
            .map(|e| e.decode_payload().unwrap())
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "rejected_busy");
        // The rejected execution is not tracked.
        assert!(executor.active_count() <= 2);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        // Both admitted executions eventually complete.
        let kinds = link.sent_kinds().await;
        assert_eq!(kinds.iter().filter(|k| *k == "task_result").count(), 2);
    }

    #[tokio::test]
    async fn cancellation_produces_error_terminal() {
        let link = FakeLink::new();
        let executor = executor_with(
            Arc::clone(&link),
            ExecutorConfig::default(),
            Duration::from_secs(30),
        );

        let cancel = CancellationToken::new();
        executor
            .submit(
                &request_envelope(MessageKind::TaskRequest, "E5"),
                cancel.clone(),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let errors: Vec<ErrorPayload> = link
            .sent
            .lock()
            .await
            .iter()
            .filter(|e| e.message_kind() == Some(MessageKind::TaskError))
            .map(|e| e.decode_payload().unwrap())
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].exec_id, "E5");
        assert_eq!(executor.active_count(), 0);
    }

    #[tokio::test]
    async fn codegen_uses_its_own_progress_kind() {
        let link = FakeLink::new();
        let executor = executor_with(
            Arc::clone(&link),
            ExecutorConfig::default(),
            Duration::from_millis(10),
        );

        executor
            .submit(
                &request_envelope(MessageKind::McpCodegenRequest, "G1"),
                CancellationToken::new(),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let kinds = link.sent_kinds().await;
        assert!(kinds.contains(&"mcp_codegen_progress".to_string()));
        assert!(kinds.contains(&"mcp_codegen_result".to_string()));
    }

    #[tokio::test]
    async fn missing_exec_id_is_dropped_silently() {
        let link = FakeLink::new();
        let executor = executor_with(
            Arc::clone(&link),
            ExecutorConfig::default(),
            Duration::from_millis(10),
        );

        let env = Envelope::new(MessageKind::TaskRequest, &json!({ "prompt": "x" })).unwrap();
        executor.submit(&env, CancellationToken::new()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(link.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn stopped_executor_rejects_new_work() {
        let link = FakeLink::new();
        let executor = executor_with(
            Arc::clone(&link),
            ExecutorConfig::default(),
            Duration::from_millis(10),
        );
        executor.stop_accepting();
        executor
            .submit(
                &request_envelope(MessageKind::TaskRequest, "E9"),
                CancellationToken::new(),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let errors: Vec<ErrorPayload> = link
            .sent
            .lock()
            .await
            .iter()
            .filter(|e| e.message_kind() == Some(MessageKind::TaskError))
            .map(|e| e.decode_payload().unwrap())
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "rejected_busy");
    }
}
