//! Request dispatch: core methods plus the capability registry.
//!
//! `initialize` and `tools/listTools` are answered immediately. A valid
//! `tools/callTool` becomes a deferred future so the server loop can keep
//! reading while the call runs. Requests without an id never get a response;
//! their failures are only logged.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Value, json};

use crate::bridge::protocol::{RequestId, RpcError, RpcRequest, RpcResponse};
use crate::capability::{CapabilityRegistry, HandlerError};
use crate::orchestrator::WorkerClient;

/// The closed set of methods the bridge itself understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreMethod {
    Initialize,
    ListTools,
    CallTool,
}

impl CoreMethod {
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "initialize" => Some(Self::Initialize),
            "tools/listTools" => Some(Self::ListTools),
            "tools/callTool" => Some(Self::CallTool),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::ListTools => "tools/listTools",
            Self::CallTool => "tools/callTool",
        }
    }
}

pub enum Dispatch {
    /// Answered inline. `None` for notifications.
    Ready(Option<RpcResponse>),
    /// A tool call to run concurrently with further input.
    Deferred {
        id: Option<RequestId>,
        call: BoxFuture<'static, Option<RpcResponse>>,
    },
}

pub struct Dispatcher {
    registry: Arc<CapabilityRegistry>,
    warm_up: Option<WorkerClient>,
}

impl Dispatcher {
    pub fn new(registry: CapabilityRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            warm_up: None,
        }
    }

    /// Spawn the worker when the handshake arrives instead of on the first call.
    pub fn with_warm_up(mut self, client: WorkerClient) -> Self {
        self.warm_up = Some(client);
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn dispatch(&self, request: RpcRequest) -> Dispatch {
        let RpcRequest {
            id, method, params, ..
        } = request;

        match CoreMethod::parse(&method) {
            Some(CoreMethod::Initialize) => {
                if let Some(client) = &self.warm_up {
                    client.warm_up();
                }
                Dispatch::Ready(id.map(|id| RpcResponse::success(id, json!({}))))
            }
            Some(CoreMethod::ListTools) => {
                let tools = json!({ "tools": self.registry.descriptors() });
                Dispatch::Ready(id.map(|id| RpcResponse::success(id, tools)))
            }
            Some(CoreMethod::CallTool) => match self.registry.prepare(params) {
                Ok(call) => Dispatch::Deferred {
                    id: id.clone(),
                    call: Box::pin(async move {
                        let tool = call.tool().to_string();
                        tracing::debug!(id = ?id, %tool, "Calling tool");
                        let outcome = call.run().await;
                        finish_call(id, &tool, outcome)
                    }),
                },
                Err(error) => Dispatch::Ready(reply_error(id, &method, error)),
            },
            None if id.is_none() => {
                tracing::debug!(%method, "Ignoring unknown notification");
                Dispatch::Ready(None)
            }
            None => Dispatch::Ready(reply_error(id, &method, RpcError::method_not_found())),
        }
    }

    /// Dispatch and wait for the response, deferred or not.
    pub async fn handle(&self, request: RpcRequest) -> Option<RpcResponse> {
        match self.dispatch(request) {
            Dispatch::Ready(response) => response,
            Dispatch::Deferred { call, .. } => call.await,
        }
    }
}

/// Tool results are returned as a single text content item.
pub fn content_envelope(result: Value) -> Value {
    let text = match result {
        Value::String(text) => text,
        other => other.to_string(),
    };
    json!({ "content": [{ "type": "text", "text": text }] })
}

fn finish_call(
    id: Option<RequestId>,
    tool: &str,
    outcome: Result<Value, HandlerError>,
) -> Option<RpcResponse> {
    match outcome {
        Ok(result) => id.map(|id| RpcResponse::success(id, content_envelope(result))),
        Err(e) => {
            tracing::warn!(id = ?id, %tool, error = %e, "Tool call failed");
            id.map(|id| RpcResponse::failure(id, RpcError::application(e.to_string())))
        }
    }
}

fn reply_error(id: Option<RequestId>, method: &str, error: RpcError) -> Option<RpcResponse> {
    match id {
        Some(id) => {
            tracing::debug!(%id, %method, code = error.code, message = %error.message, "Request rejected");
            Some(RpcResponse::failure(id, error))
        }
        None => {
            tracing::warn!(%method, code = error.code, message = %error.message, "Notification failed");
            None
        }
    }
}
