//! Orchestrator - owns the worker process and multiplexes calls onto it.
//!
//! Flow:
//! 1. First forwarded call (or an explicit warm-up) spawns the worker
//! 2. Each call gets a fresh correlation id and a deadline, then is queued
//!    for the worker's stdin as one JSON line
//! 3. Replies are matched to calls by id only, in whatever order they arrive
//! 4. On worker exit: fail every outstanding call, forget the worker; the next
//!    call spawns a new one
//!
//! All state lives in one event loop task. [`WorkerClient`] talks to it over a
//! bounded command channel and gets each outcome back on a oneshot.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::bridge::lines::DEFAULT_MAX_LINE_LEN;
use crate::bridge::protocol::{WorkerReply, WorkerRequest};
use crate::pending::{PendingCalls, ReplySender};
use crate::worker::{self, LaunchOptions, WorkerEvent, WorkerHandle, WorkerSpawner, WorkerState};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_MAX_PENDING: usize = 64;
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_DEPTH: usize = 256;

#[derive(Clone)]
pub struct OrchestratorConfig {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub call_timeout: Duration,
    /// Bound on outstanding calls. Calls beyond it are rejected as busy.
    pub max_pending: usize,
    pub exit_grace: Duration,
    pub max_line_len: usize,
}

impl OrchestratorConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
            exit_grace: DEFAULT_EXIT_GRACE,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_pending(mut self, n: usize) -> Self {
        self.max_pending = n.max(1);
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn with_max_line_len(mut self, len: usize) -> Self {
        self.max_line_len = len;
        self
    }

    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            queue_depth: self.max_pending,
            max_line_len: self.max_line_len,
            exit_grace: self.exit_grace,
        }
    }
}

/// Why a forwarded call did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("worker busy: too many outstanding calls")]
    Busy,
    #[error("timeout: no reply from worker within {0:?}")]
    Timeout(Duration),
    #[error("worker unavailable: {0}")]
    Unavailable(String),
    /// Error echoed by the worker for this call.
    #[error("{0}")]
    Application(String),
}

enum Command {
    Call {
        operation: String,
        data: Value,
        reply: ReplySender,
    },
    WarmUp,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle for forwarding calls to the worker.
#[derive(Clone)]
pub struct WorkerClient {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerClient {
    /// Forward one call and wait for its outcome.
    pub async fn call(
        &self,
        operation: impl Into<String>,
        data: Value,
    ) -> Result<Value, CallError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .try_send(Command::Call {
                operation: operation.into(),
                data,
                reply,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CallError::Busy,
                mpsc::error::TrySendError::Closed(_) => {
                    CallError::Unavailable("bridge shut down".to_string())
                }
            })?;

        outcome
            .await
            .unwrap_or_else(|_| Err(CallError::Unavailable("bridge shut down".to_string())))
    }

    /// Spawn the worker now if none is running. Does not wait.
    pub fn warm_up(&self) {
        if self.commands.try_send(Command::WarmUp).is_err() {
            tracing::debug!("Warm-up skipped, command queue unavailable");
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Close the worker's stdin, let it finish within the exit grace, then
    /// stop the event loop. Outstanding calls fail as unavailable.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).await.is_ok() {
            let _ = finished.await;
        }
    }
}

/// Start the orchestrator event loop. Must be called inside a tokio runtime.
///
/// The worker is spawned lazily. The loop runs until [`WorkerClient::shutdown`]
/// or until every client is dropped.
pub fn start(config: OrchestratorConfig) -> WorkerClient {
    let (commands_tx, commands_rx) = mpsc::channel(config.max_pending);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    let (state_tx, state_rx) = watch::channel(WorkerState::NoWorker);

    let event_loop = EventLoop {
        config,
        pending: PendingCalls::new(),
        worker: None,
        generation: 0,
        state: state_tx,
        events_tx,
    };
    tokio::spawn(event_loop.run(commands_rx, events_rx));

    WorkerClient {
        commands: commands_tx,
        state: state_rx,
    }
}

struct EventLoop {
    config: OrchestratorConfig,
    pending: PendingCalls,
    worker: Option<WorkerHandle>,
    /// Generation of the most recent spawn.
    generation: u64,
    state: watch::Sender<WorkerState>,
    events_tx: mpsc::Sender<WorkerEvent>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Call { operation, data, reply }) => {
                        self.forward(operation, data, reply);
                    }
                    Some(Command::WarmUp) => {
                        let _ = self.ensure_worker();
                    }
                    Some(Command::Shutdown { done }) => {
                        self.shutdown(&mut events).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown(&mut events).await;
                        break;
                    }
                },

                Some(event) = events.recv() => self.handle_event(event),

                Some((id, call)) = self.pending.next_expired(), if !self.pending.is_empty() => {
                    tracing::warn!(
                        id,
                        operation = %call.operation,
                        timeout_secs = self.config.call_timeout.as_secs_f64(),
                        "Call timed out"
                    );
                    call.resolve(Err(CallError::Timeout(self.config.call_timeout)));
                }
            }
        }

        tracing::info!("Orchestrator event loop exiting");
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    fn ensure_worker(&mut self) -> Result<(), CallError> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.generation += 1;
        let generation = self.generation;
        self.set_state(WorkerState::Starting);
        tracing::info!(generation, "Spawning worker");

        match worker::launch(
            self.config.spawner.as_ref(),
            generation,
            self.config.launch_options(),
            self.events_tx.clone(),
        ) {
            Ok(handle) => {
                tracing::info!(generation, pid = handle.pid, "Worker ready");
                self.worker = Some(handle);
                self.set_state(WorkerState::Ready);
                Ok(())
            }
            Err(e) => {
                tracing::error!(generation, error = %e, "Worker spawn failed");
                self.set_state(WorkerState::NoWorker);
                Err(CallError::Unavailable(e.to_string()))
            }
        }
    }

    fn forward(&mut self, operation: String, data: Value, reply: ReplySender) {
        if reply.is_closed() {
            return;
        }

        if self.pending.len() >= self.config.max_pending {
            tracing::warn!(
                %operation,
                outstanding = self.pending.len(),
                "Rejecting call, too many outstanding"
            );
            let _ = reply.send(Err(CallError::Busy));
            return;
        }

        if let Err(e) = self.ensure_worker() {
            let _ = reply.send(Err(e));
            return;
        }

        let id = self.pending.allocate_id();
        let request = WorkerRequest {
            id,
            operation: operation.clone(),
            data,
        };
        let sent = match &self.worker {
            Some(worker) => worker.try_send(request),
            None => Err(mpsc::error::TrySendError::Closed(request)),
        };

        match sent {
            Ok(()) => {
                tracing::debug!(id, %operation, generation = self.generation, "Forwarded call");
                self.pending
                    .insert(id, operation, self.config.call_timeout, reply);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(id, %operation, "Worker input queue full");
                let _ = reply.send(Err(CallError::Busy));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(id, %operation, "Worker input closed");
                let _ = reply.send(Err(CallError::Unavailable(
                    "worker input closed".to_string(),
                )));
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Reply { generation, reply } if generation == self.generation => {
                self.route_reply(reply);
            }
            WorkerEvent::Exited { generation, code }
                if generation == self.generation && self.worker.is_some() =>
            {
                self.worker_exited(code);
            }
            stale => {
                tracing::debug!(?stale, current = self.generation, "Ignoring event from stale worker");
            }
        }
    }

    fn route_reply(&mut self, reply: WorkerReply) {
        let Some(id) = reply.id else {
            return;
        };

        match self.pending.complete(id) {
            Some(call) => {
                let outcome = reply.into_outcome().map_err(CallError::Application);
                tracing::debug!(
                    id,
                    operation = %call.operation,
                    elapsed_ms = call.started.elapsed().as_millis() as u64,
                    ok = outcome.is_ok(),
                    "Worker replied"
                );
                if !call.resolve(outcome) {
                    tracing::debug!(id, "Caller stopped waiting before the reply");
                }
            }
            None => {
                tracing::warn!(id, "Discarding reply for unknown or expired call");
            }
        }
    }

    fn worker_exited(&mut self, code: Option<i32>) {
        let generation = self.generation;
        self.set_state(WorkerState::Dead);
        self.worker = None;

        let failed = self
            .pending
            .fail_all(&CallError::Unavailable("worker exited before reply".to_string()));
        if failed > 0 || code != Some(0) {
            tracing::warn!(generation, ?code, failed, "Worker exited");
        } else {
            tracing::info!(generation, ?code, "Worker exited");
        }

        self.set_state(WorkerState::NoWorker);
    }

    async fn shutdown(&mut self, events: &mut mpsc::Receiver<WorkerEvent>) {
        if let Some(mut worker) = self.worker.take() {
            let generation = worker.generation;
            tracing::info!(
                generation,
                outstanding = self.pending.len(),
                "Closing worker input"
            );
            worker.close_input();

            let grace = tokio::time::sleep(self.config.exit_grace);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    _ = &mut grace => {
                        tracing::warn!(generation, "Worker did not exit within grace period, killing it");
                        worker.kill();
                        break;
                    }
                    event = events.recv() => match event {
                        Some(WorkerEvent::Reply { generation: g, reply }) if g == generation => {
                            self.route_reply(reply);
                        }
                        Some(WorkerEvent::Exited { generation: g, code }) if g == generation => {
                            tracing::info!(generation, ?code, "Worker exited");
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            self.set_state(WorkerState::Dead);
        }

        self.pending
            .fail_all(&CallError::Unavailable("bridge shutting down".to_string()));
        self.set_state(WorkerState::NoWorker);
    }
}
