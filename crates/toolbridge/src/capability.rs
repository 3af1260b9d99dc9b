//! Capability registry: the open set of named tools callers can invoke.
//!
//! Each tool has a descriptor (what `tools/listTools` returns), a compiled
//! argument validator, and a handler. The usual handler forwards to the worker
//! through a [`WorkerClient`]; anything implementing [`CapabilityHandler`] can
//! be registered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bridge::protocol::RpcError;
use crate::input_validation::{self, InputValidator, SchemaError};
use crate::orchestrator::{CallError, WorkerClient};

/// Catalog entry for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("{0}")]
    Failed(String),
}

/// Runs a tool with already-validated arguments.
#[async_trait]
pub trait CapabilityHandler: Send + Sync + 'static {
    async fn call(&self, arguments: Value) -> Result<Value, HandlerError>;
}

/// Forwards the call to the worker as `operation`.
pub struct WorkerCapability {
    client: WorkerClient,
    operation: String,
}

impl WorkerCapability {
    pub fn new(client: WorkerClient, operation: impl Into<String>) -> Self {
        Self {
            client,
            operation: operation.into(),
        }
    }
}

#[async_trait]
impl CapabilityHandler for WorkerCapability {
    async fn call(&self, arguments: Value) -> Result<Value, HandlerError> {
        Ok(self.client.call(self.operation.as_str(), arguments).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    Duplicate(String),
    #[error("tool '{name}': {source}")]
    Schema {
        name: String,
        #[source]
        source: SchemaError,
    },
}

pub struct Capability {
    descriptor: ToolDescriptor,
    validator: InputValidator,
    handler: Arc<dyn CapabilityHandler>,
}

impl Capability {
    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }
}

#[derive(Default)]
pub struct CapabilityRegistry {
    tools: Vec<Arc<Capability>>,
    by_name: HashMap<String, usize>,
}

#[derive(Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Result<(), RegistryError> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        let validator = InputValidator::from_input_schema(&descriptor.input_schema).map_err(
            |source| RegistryError::Schema {
                name: descriptor.name.clone(),
                source,
            },
        )?;

        tracing::debug!(
            tool = %descriptor.name,
            required = validator.required().len(),
            "Registered tool"
        );
        self.by_name
            .insert(descriptor.name.clone(), self.tools.len());
        self.tools.push(Arc::new(Capability {
            descriptor,
            validator,
            handler,
        }));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Capability>> {
        self.by_name.get(name).map(|&i| &self.tools[i])
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        self.tools.iter().map(|c| &c.descriptor).collect()
    }

    /// Resolve `tools/callTool` params into a runnable call.
    ///
    /// Unknown tool is "method not found"; malformed params or arguments that
    /// fail the tool's schema are "invalid params".
    pub fn prepare(&self, params: Option<Value>) -> Result<PreparedCall, RpcError> {
        let params = params
            .ok_or_else(|| RpcError::invalid_params("expected {name, arguments}"))?;
        let CallToolParams { name, arguments } =
            serde_json::from_value(params).map_err(RpcError::invalid_params)?;

        let capability = self
            .get(&name)
            .cloned()
            .ok_or_else(RpcError::method_not_found)?;

        let arguments = match arguments {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(args @ Value::Object(_)) => args,
            Some(_) => return Err(RpcError::invalid_params("arguments must be an object")),
        };

        if let Err(errors) = capability.validator.validate(&arguments) {
            return Err(RpcError::invalid_params(input_validation::describe(&errors)));
        }

        Ok(PreparedCall {
            capability,
            arguments,
        })
    }
}

/// A validated call, ready to run.
pub struct PreparedCall {
    capability: Arc<Capability>,
    arguments: Value,
}

impl PreparedCall {
    pub fn tool(&self) -> &str {
        &self.capability.descriptor.name
    }

    pub fn arguments(&self) -> &Value {
        &self.arguments
    }

    pub async fn run(self) -> Result<Value, HandlerError> {
        self.capability.handler.call(self.arguments).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Returns its arguments unchanged.
    pub(crate) struct Echo;

    #[async_trait]
    impl CapabilityHandler for Echo {
        async fn call(&self, arguments: Value) -> Result<Value, HandlerError> {
            Ok(arguments)
        }
    }

    pub(crate) fn query_tool() -> ToolDescriptor {
        ToolDescriptor::new(
            "query",
            "Run a read-only SQL query",
            json!({
                "type": "object",
                "properties": {"sql": {"type": "string"}},
                "required": ["sql"]
            }),
        )
    }

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(query_tool(), Arc::new(Echo)).unwrap();
        registry
            .register(
                ToolDescriptor::new("ping", "Health check", json!({"type": "object"})),
                Arc::new(Echo),
            )
            .unwrap();
        registry
    }

    #[test]
    fn descriptors_keep_registration_order() {
        let registry = registry();
        let names: Vec<&str> = registry
            .descriptors()
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["query", "ping"]);
    }

    #[test]
    fn descriptor_wire_shape() {
        let descriptor = ToolDescriptor::new("ping", "Health check", json!({"type": "object"}));
        insta::assert_json_snapshot!(descriptor, @r#"
        {
          "name": "ping",
          "description": "Health check",
          "inputSchema": {
            "type": "object"
          }
        }
        "#);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = registry();
        let err = registry.register(query_tool(), Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "query"));
    }

    #[test]
    fn invalid_schema_is_rejected() {
        let mut registry = CapabilityRegistry::new();
        let err = registry
            .register(
                ToolDescriptor::new("bad", "", json!(["not", "a", "schema"])),
                Arc::new(Echo),
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "tool 'bad': input schema must be a JSON object");
    }

    #[test]
    fn unknown_tool_is_method_not_found() {
        let err = registry()
            .prepare(Some(json!({"name": "drop_tables", "arguments": {}})))
            .err()
            .unwrap();
        assert_eq!(err, RpcError::method_not_found());
    }

    #[test]
    fn missing_required_argument_is_invalid_params() {
        let err = registry()
            .prepare(Some(json!({"name": "query", "arguments": {}})))
            .err()
            .unwrap();
        assert_eq!(err.code, RpcError::INVALID_PARAMS);
        assert_eq!(err.message, "Invalid params: missing required argument 'sql'");
    }

    #[test]
    fn malformed_params_are_invalid_params() {
        let registry = registry();
        for params in [
            None,
            Some(json!("query")),
            Some(json!({"arguments": {}})),
            Some(json!({"name": 7})),
            Some(json!({"name": "ping", "arguments": [1, 2]})),
        ] {
            let err = registry.prepare(params.clone()).err().unwrap();
            assert_eq!(err.code, RpcError::INVALID_PARAMS, "params: {params:?}");
        }
    }

    #[tokio::test]
    async fn absent_arguments_become_empty_object() {
        let registry = registry();
        for params in [json!({"name": "ping"}), json!({"name": "ping", "arguments": null})] {
            let call = registry.prepare(Some(params)).unwrap();
            assert_eq!(call.tool(), "ping");
            assert_eq!(call.run().await.unwrap(), json!({}));
        }
    }

    #[tokio::test]
    async fn prepared_call_runs_handler() {
        let call = registry()
            .prepare(Some(json!({"name": "query", "arguments": {"sql": "select 1"}})))
            .unwrap();
        assert_eq!(call.arguments(), &json!({"sql": "select 1"}));
        assert_eq!(call.run().await.unwrap(), json!({"sql": "select 1"}));
    }
}
