//! toolbridge: framed JSON-RPC tool bridge backed by a persistent worker process.

mod pending;

pub mod bridge;
pub mod capability;
pub mod dispatcher;
pub mod input_validation;
pub mod orchestrator;
pub mod server;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use bridge::frame::ContentLengthCodec;
pub use bridge::protocol::{RequestId, RpcError, RpcRequest, RpcResponse};
pub use capability::{
    CapabilityHandler, CapabilityRegistry, HandlerError, RegistryError, ToolDescriptor,
    WorkerCapability,
};
pub use dispatcher::{CoreMethod, Dispatch, Dispatcher};
pub use orchestrator::{CallError, OrchestratorConfig, WorkerClient};
pub use server::{ServerConfig, serve};
pub use worker::{CommandSpawner, SpawnError, WorkerSpawner, WorkerState};
