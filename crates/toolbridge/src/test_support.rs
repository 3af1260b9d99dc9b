//! In-memory worker for tests: duplex pipes behind the `WorkerSpawner` trait.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::lines::{JsonLinesCodec, Line};
use crate::bridge::protocol::{WorkerReply, WorkerRequest};
use crate::worker::{SpawnError, WorkerProcess, WorkerSpawner};

pub(crate) struct ScriptedSpawner {
    workers: mpsc::UnboundedSender<FakeWorker>,
    spawns: AtomicUsize,
    failures: AtomicUsize,
}

impl ScriptedSpawner {
    /// Every successful spawn hands its worker end to the returned receiver.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            workers: tx,
            spawns: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        });
        (spawner, rx)
    }

    pub fn fail_next_spawns(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&self) -> Result<WorkerProcess, SpawnError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SpawnError::Other("scripted spawn failure".to_string()));
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let (bridge_stdin, worker_stdin) = tokio::io::duplex(64 * 1024);
        let (worker_stdout, bridge_stdout) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel::<i32>();

        let worker = FakeWorker {
            requests: FramedRead::new(worker_stdin, JsonLinesCodec::new()),
            replies: FramedWrite::new(worker_stdout, JsonLinesCodec::new()),
            exit: exit_tx,
        };
        self.workers
            .send(worker)
            .map_err(|_| SpawnError::Other("test dropped the worker receiver".to_string()))?;

        Ok(WorkerProcess {
            stdin: Box::new(bridge_stdin),
            stdout: Box::new(bridge_stdout),
            stderr: None,
            exit: Box::pin(async move { exit_rx.await.ok() }),
            pid: None,
        })
    }
}

/// The worker's side of the pipes. Dropping it without [`FakeWorker::exit`]
/// looks like a crash with no exit code.
pub(crate) struct FakeWorker {
    requests: FramedRead<DuplexStream, JsonLinesCodec<WorkerRequest>>,
    replies: FramedWrite<DuplexStream, JsonLinesCodec<WorkerReply>>,
    exit: oneshot::Sender<i32>,
}

impl FakeWorker {
    pub async fn next_request(&mut self) -> WorkerRequest {
        match self.requests.next().await {
            Some(Ok(Line::Message(request))) => request,
            other => panic!("expected a worker request, got {other:?}"),
        }
    }

    /// True once the bridge has closed the worker's stdin.
    pub async fn input_closed(&mut self) -> bool {
        self.requests.next().await.is_none()
    }

    pub async fn reply(&mut self, reply: WorkerReply) {
        self.replies.send(reply).await.unwrap();
    }

    pub async fn reply_raw(&mut self, raw: &str) {
        let pipe = self.replies.get_mut();
        pipe.write_all(raw.as_bytes()).await.unwrap();
        pipe.flush().await.unwrap();
    }

    pub fn exit(self, code: i32) {
        let Self { exit, .. } = self;
        let _ = exit.send(code);
    }

    /// Exit while something else keeps stdout open. The returned writer is
    /// that stdout.
    pub fn exit_leaving_stdout_open(
        self,
        code: i32,
    ) -> FramedWrite<DuplexStream, JsonLinesCodec<WorkerReply>> {
        let Self { replies, exit, .. } = self;
        let _ = exit.send(code);
        replies
    }

    /// Close stdout but keep the process "running".
    pub fn close_stdout(self) -> oneshot::Sender<i32> {
        self.exit
    }
}
