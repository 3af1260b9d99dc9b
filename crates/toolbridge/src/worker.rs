//! Worker process - spawning and the pipe drains of one live worker.
//!
//! The orchestrator owns at most one [`WorkerHandle`] at a time. Each launch
//! gets a generation number and three tasks:
//! - stdin writer: one JSON line per request, in submission order
//! - stdout drain: parses reply lines, then reports the process exit
//! - stderr drain: copies diagnostics to the host log
//!
//! Everything the drains observe is sent to the orchestrator as a
//! [`WorkerEvent`] tagged with the generation, so events from a replaced
//! worker can be told apart and ignored.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::lines::{JsonLinesCodec, Line, TextLinesCodec};
use crate::bridge::protocol::{WorkerReply, WorkerRequest};

/// How long stdout is still read after the worker process has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Liveness of the worker slot, published by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NoWorker,
    Starting,
    Ready,
    Dead,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoWorker => "no_worker",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves with the exit code once the process is gone. Dropping it before
/// then kills the process.
pub type ExitFuture = BoxFuture<'static, Option<i32>>;

/// A freshly spawned worker: its pipes plus a way to await its exit.
pub struct WorkerProcess {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub exit: ExitFuture,
    pub pid: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to spawn worker: {0} was not captured")]
    MissingPipe(&'static str),
    #[error("failed to spawn worker: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerProcess, SpawnError>;
}

/// Launches the worker as a child process with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<WorkerProcess, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        let exit: ExitFuture = Box::pin(async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to wait for worker");
                    None
                }
            }
        });

        Ok(WorkerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Some(Box::new(stderr)),
            exit,
            pid,
        })
    }
}

/// What the drains of one worker generation report back.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Reply { generation: u64, reply: WorkerReply },
    Exited { generation: u64, code: Option<i32> },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LaunchOptions {
    pub queue_depth: usize,
    pub max_line_len: usize,
    pub exit_grace: Duration,
}

/// Orchestrator-side handle to one live worker. Dropping it kills the worker.
pub(crate) struct WorkerHandle {
    pub generation: u64,
    pub pid: Option<u32>,
    requests: Option<mpsc::Sender<WorkerRequest>>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Queue a request for the stdin writer without waiting.
    pub fn try_send(
        &self,
        request: WorkerRequest,
    ) -> Result<(), mpsc::error::TrySendError<WorkerRequest>> {
        match &self.requests {
            Some(tx) => tx.try_send(request),
            None => Err(mpsc::error::TrySendError::Closed(request)),
        }
    }

    /// Close the worker's stdin once queued requests are written.
    pub fn close_input(&mut self) {
        self.requests = None;
    }

    pub fn kill(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn a worker and start its drains.
pub(crate) fn launch(
    spawner: &dyn WorkerSpawner,
    generation: u64,
    options: LaunchOptions,
    events: mpsc::Sender<WorkerEvent>,
) -> Result<WorkerHandle, SpawnError> {
    let process = spawner.spawn()?;
    let pid = process.pid;
    let cancel = CancellationToken::new();
    let (requests_tx, requests_rx) = mpsc::channel(options.queue_depth.max(1));

    tokio::spawn(write_requests(
        process.stdin,
        requests_rx,
        generation,
        cancel.clone(),
    ));
    tokio::spawn(drain_replies(
        process.stdout,
        process.exit,
        generation,
        options,
        events,
        cancel.clone(),
    ));
    if let Some(stderr) = process.stderr {
        tokio::spawn(drain_diagnostics(stderr, generation, pid));
    }

    Ok(WorkerHandle {
        generation,
        pid,
        requests: Some(requests_tx),
        cancel,
    })
}

async fn write_requests(
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut requests: mpsc::Receiver<WorkerRequest>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut writer = FramedWrite::new(stdin, JsonLinesCodec::<WorkerRequest>::new());
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let id = request.id;
        tracing::trace!(generation, id, operation = %request.operation, "Writing request to worker");
        if let Err(e) = writer.send(request).await {
            tracing::warn!(generation, id, error = %e, "Failed to write to worker stdin");
            break;
        }
    }
    tracing::debug!(generation, "Worker stdin closed");
}

async fn drain_replies(
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    mut exit: ExitFuture,
    generation: u64,
    options: LaunchOptions,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(
        stdout,
        JsonLinesCodec::<WorkerReply>::with_max_length(options.max_line_len),
    );

    let drained = async {
        while let Some(line) = lines.next().await {
            match line {
                Ok(Line::Message(reply)) if reply.id.is_some() => {
                    if events
                        .send(WorkerEvent::Reply { generation, reply })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(Line::Message(reply)) => {
                    tracing::warn!(generation, ?reply, "Discarding worker reply without id");
                }
                Ok(Line::Malformed { text, error }) => {
                    tracing::warn!(generation, %error, line = %text, "Discarding unparsable worker output");
                }
                Ok(Line::Oversized) => {
                    tracing::warn!(
                        generation,
                        max_line_len = options.max_line_len,
                        "Discarding oversized worker output line"
                    );
                }
                Err(e) => {
                    tracing::warn!(generation, error = %e, "Worker stdout read failed");
                    return;
                }
            }
        }
    };

    tokio::pin!(drained);

    let code = tokio::select! {
        _ = cancel.cancelled() => None,
        _ = &mut drained => {
            tokio::select! {
                _ = cancel.cancelled() => None,
                waited = tokio::time::timeout(options.exit_grace, &mut exit) => match waited {
                    Ok(code) => code,
                    Err(_) => {
                        tracing::warn!(
                            generation,
                            grace_secs = options.exit_grace.as_secs_f64(),
                            "Worker closed stdout but did not exit, killing it"
                        );
                        None
                    }
                },
            }
        }
        code = &mut exit => {
            // Replies may still be buffered, or stdout may be held open by a
            // process the worker left behind.
            if tokio::time::timeout(EXIT_DRAIN_GRACE, &mut drained).await.is_err() {
                tracing::warn!(generation, ?code, "Worker exited but its stdout is still open");
            }
            code
        }
    };
    // Dropping the exit future kills a process that is still running.
    drop(exit);

    let _ = events.send(WorkerEvent::Exited { generation, code }).await;
}

async fn drain_diagnostics(
    stderr: Box<dyn AsyncRead + Send + Unpin>,
    generation: u64,
    pid: Option<u32>,
) {
    let mut lines = FramedRead::new(stderr, TextLinesCodec::default());
    while let Some(line) = lines.next().await {
        match line {
            Ok(Line::Message(text)) => {
                tracing::info!(target: "toolbridge::worker", generation, pid, "{}", text);
            }
            Ok(Line::Malformed { error, .. }) => {
                tracing::debug!(target: "toolbridge::worker", generation, pid, %error, "Unreadable stderr line");
            }
            Ok(Line::Oversized) => {
                tracing::debug!(target: "toolbridge::worker", generation, pid, "Oversized stderr line dropped");
            }
            Err(e) => {
                tracing::debug!(generation, error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedSpawner;
    use serde_json::json;

    fn options() -> LaunchOptions {
        LaunchOptions {
            queue_depth: 8,
            max_line_len: 1024,
            exit_grace: Duration::from_secs(5),
        }
    }

    #[test]
    fn state_names() {
        assert_eq!(WorkerState::NoWorker.to_string(), "no_worker");
        assert_eq!(WorkerState::Ready.as_str(), "ready");
    }

    #[test]
    fn spawn_error_messages() {
        let err = SpawnError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "No such file or directory",
        ));
        assert_eq!(err.to_string(), "failed to spawn worker: No such file or directory");
        assert_eq!(
            SpawnError::MissingPipe("stdout").to_string(),
            "failed to spawn worker: stdout was not captured"
        );
    }

    #[tokio::test]
    async fn forwards_replies_and_reports_exit() {
        let (spawner, mut workers) = ScriptedSpawner::new();
        let (events_tx, mut events) = mpsc::channel(8);

        let handle = launch(spawner.as_ref(), 3, options(), events_tx).unwrap();
        let mut worker = workers.recv().await.unwrap();

        handle
            .try_send(WorkerRequest {
                id: 1,
                operation: "echo".to_string(),
                data: json!({"n": 1}),
            })
            .unwrap();
        let request = worker.next_request().await;
        assert_eq!(request.operation, "echo");

        worker.reply_raw("not json\n").await;
        worker.reply_raw("{\"result\":\"no id\"}\n").await;
        worker.reply(WorkerReply::ok(1, json!("done"))).await;

        match events.recv().await.unwrap() {
            WorkerEvent::Reply { generation, reply } => {
                assert_eq!(generation, 3);
                assert_eq!(reply, WorkerReply::ok(1, json!("done")));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        worker.exit(2);
        match events.recv().await.unwrap() {
            WorkerEvent::Exited { generation, code } => {
                assert_eq!(generation, 3);
                assert_eq!(code, Some(2));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_input_reaches_worker_as_eof() {
        let (spawner, mut workers) = ScriptedSpawner::new();
        let (events_tx, _events) = mpsc::channel(8);

        let mut handle = launch(spawner.as_ref(), 1, options(), events_tx).unwrap();
        let mut worker = workers.recv().await.unwrap();

        handle.close_input();
        assert!(worker.input_closed().await);
        assert!(handle.try_send(WorkerRequest {
            id: 1,
            operation: "late".to_string(),
            data: json!({}),
        })
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_that_lingers_after_stdout_closes_is_reported_gone() {
        let (spawner, mut workers) = ScriptedSpawner::new();
        let (events_tx, mut events) = mpsc::channel(8);

        let _handle = launch(spawner.as_ref(), 1, options(), events_tx).unwrap();
        let worker = workers.recv().await.unwrap();

        // Stdout closes, the process never exits on its own.
        let _lingering = worker.close_stdout();

        match events.recv().await.unwrap() {
            WorkerEvent::Exited { code, .. } => assert_eq!(code, None),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exit_is_reported_even_if_stdout_stays_open() {
        let (spawner, mut workers) = ScriptedSpawner::new();
        let (events_tx, mut events) = mpsc::channel(8);

        let handle = launch(spawner.as_ref(), 2, options(), events_tx).unwrap();
        let mut worker = workers.recv().await.unwrap();
        handle
            .try_send(WorkerRequest {
                id: 1,
                operation: "echo".to_string(),
                data: json!({}),
            })
            .unwrap();
        worker.next_request().await;

        worker.reply(WorkerReply::ok(1, json!("last words"))).await;
        let _held_open = worker.exit_leaving_stdout_open(4);

        match events.recv().await.unwrap() {
            WorkerEvent::Reply { reply, .. } => {
                assert_eq!(reply, WorkerReply::ok(1, json!("last words")));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await.unwrap() {
            WorkerEvent::Exited { generation, code } => {
                assert_eq!(generation, 2);
                assert_eq!(code, Some(4));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_returned() {
        let (spawner, _workers) = ScriptedSpawner::new();
        spawner.fail_next_spawns(1);
        let (events_tx, _events) = mpsc::channel(8);

        let err = launch(spawner.as_ref(), 1, options(), events_tx)
            .err()
            .unwrap();
        assert!(err.to_string().starts_with("failed to spawn worker"));
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_spawner_runs_a_child() {
        let spawner = CommandSpawner::new("sh")
            .arg("-c")
            .arg("read line; echo \"{\\\"id\\\":1,\\\"result\\\":\\\"$GREETING\\\"}\"; echo diag >&2")
            .env("GREETING", "hello");
        let (events_tx, mut events) = mpsc::channel(8);

        let handle = launch(&spawner, 1, options(), events_tx).unwrap();
        assert!(handle.pid.is_some());
        handle
            .try_send(WorkerRequest {
                id: 1,
                operation: "greet".to_string(),
                data: json!({}),
            })
            .unwrap();

        match events.recv().await.unwrap() {
            WorkerEvent::Reply { reply, .. } => {
                assert_eq!(reply, WorkerReply::ok(1, json!("hello")));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await.unwrap() {
            WorkerEvent::Exited { code, .. } => assert_eq!(code, Some(0)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_spawner_reports_missing_program() {
        let spawner = CommandSpawner::new("/nonexistent/toolbridge-worker");
        let (events_tx, _events) = mpsc::channel(8);

        let err = launch(&spawner, 1, options(), events_tx).err().unwrap();
        assert!(matches!(err, SpawnError::Spawn(_)));
    }
}
