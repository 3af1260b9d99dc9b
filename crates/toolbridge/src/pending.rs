//! Outstanding worker calls, keyed by correlation id.
//!
//! Owned exclusively by the orchestrator event loop. A call leaves the table
//! exactly once: on its reply, on its deadline, or when the worker goes away.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::orchestrator::CallError;

pub(crate) type ReplySender = oneshot::Sender<Result<Value, CallError>>;

pub(crate) struct PendingCall {
    reply: ReplySender,
    pub operation: String,
    pub started: Instant,
    deadline: delay_queue::Key,
}

impl PendingCall {
    /// Deliver the outcome. Returns false if the caller stopped waiting.
    pub fn resolve(self, outcome: Result<Value, CallError>) -> bool {
        self.reply.send(outcome).is_ok()
    }
}

pub(crate) struct PendingCalls {
    calls: HashMap<u64, PendingCall>,
    deadlines: DelayQueue<u64>,
    next_id: u64,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            deadlines: DelayQueue::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Strictly increasing for the lifetime of the table, across worker generations.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, id: u64, operation: String, timeout: Duration, reply: ReplySender) {
        let deadline = self.deadlines.insert(id, timeout);
        let previous = self.calls.insert(
            id,
            PendingCall {
                reply,
                operation,
                started: Instant::now(),
                deadline,
            },
        );
        debug_assert!(previous.is_none(), "correlation id {id} reused");
    }

    /// Remove the call for a reply. `None` if it already timed out or never existed.
    pub fn complete(&mut self, id: u64) -> Option<PendingCall> {
        let call = self.calls.remove(&id)?;
        self.deadlines.remove(&call.deadline);
        Some(call)
    }

    /// Wait for the next call whose deadline passes and remove it.
    ///
    /// Resolves to `None` immediately when nothing is outstanding.
    pub async fn next_expired(&mut self) -> Option<(u64, PendingCall)> {
        loop {
            let expired = self.deadlines.next().await?;
            let id = expired.into_inner();
            if let Some(call) = self.calls.remove(&id) {
                return Some((id, call));
            }
        }
    }

    /// Fail every outstanding call with the same error. Returns how many were failed.
    pub fn fail_all(&mut self, error: &CallError) -> usize {
        self.deadlines.clear();
        let failed = self.calls.len();
        for (id, call) in self.calls.drain() {
            tracing::debug!(id, operation = %call.operation, %error, "Failing outstanding call");
            call.resolve(Err(error.clone()));
        }
        failed
    }
}
