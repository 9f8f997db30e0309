//! Block handlers.
//!
//! The engine owns scheduling and reference substitution; what a block
//! actually does is delegated to a [`BlockHandler`] registered for its type.
//! Handlers receive the block's configuration with every reference already
//! replaced by its value.
//!
//! Built-in handlers cover the block types the engine itself defines:
//! `starter`, `variables`, and `response`. Condition blocks are evaluated by
//! the engine directly because they need unresolved expressions.

use crate::error::HandlerError;
use crate::execution::{ExecutionEvent, IterationInfo};
use crate::hub::EventSink;
use async_trait::async_trait;
use blockflow_core::{BlockId, ExecutionId};
use blockflow_workflow::BlockType;
use chrono::Utc;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Resolved configuration passed to a handler.
pub type HandlerInputs = JsonMap<String, JsonValue>;

/// What a handler knows about the call it is serving.
#[derive(Clone)]
pub struct HandlerContext {
    pub execution_id: ExecutionId,
    pub block_id: BlockId,
    pub block_type: BlockType,
    pub block_name: String,
    /// The payload the run was started with.
    pub run_input: Arc<JsonValue>,
    pub iteration: Option<IterationInfo>,
    sink: Arc<dyn EventSink>,
}

impl HandlerContext {
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        block_id: BlockId,
        block_type: BlockType,
        block_name: String,
        run_input: Arc<JsonValue>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            execution_id,
            block_id,
            block_type,
            block_name,
            run_input,
            iteration: None,
            sink,
        }
    }

    #[must_use]
    pub fn with_iteration(mut self, iteration: Option<IterationInfo>) -> Self {
        self.iteration = iteration;
        self
    }

    /// Streams a partial result to subscribers.
    pub fn emit_chunk(&self, chunk: impl Into<String>) {
        self.sink.publish(ExecutionEvent::BlockChunk {
            execution_id: self.execution_id,
            block_id: self.block_id.clone(),
            chunk: chunk.into(),
            timestamp: Utc::now(),
        });
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("execution_id", &self.execution_id)
            .field("block_id", &self.block_id)
            .field("block_type", &self.block_type)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

/// Executes blocks of one type.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// Runs the block and returns its output.
    async fn execute(
        &self,
        ctx: &HandlerContext,
        inputs: HandlerInputs,
    ) -> Result<JsonValue, HandlerError>;
}

/// Handlers by block type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn BlockHandler>>,
}

impl HandlerRegistry {
    /// A registry with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the engine's own block types registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::new()
            .with_handler(BlockType::Starter.as_str(), StarterHandler)
            .with_handler(BlockType::Variables.as_str(), VariablesHandler)
            .with_handler(BlockType::Response.as_str(), ResponseHandler)
    }

    #[must_use]
    pub fn with_handler(mut self, block_type: &str, handler: impl BlockHandler + 'static) -> Self {
        self.register(block_type, Arc::new(handler));
        self
    }

    /// Registers a handler, replacing any existing one for the type.
    pub fn register(&mut self, block_type: &str, handler: Arc<dyn BlockHandler>) {
        self.handlers.insert(block_type.to_string(), handler);
    }

    #[must_use]
    pub fn get(&self, block_type: &str) -> Option<Arc<dyn BlockHandler>> {
        self.handlers.get(block_type).cloned()
    }

    /// Registered block types, sorted.
    #[must_use]
    pub fn block_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("block_types", &self.block_types())
            .finish()
    }
}

/// Publishes the run input as the start block's output.
///
/// Object payloads are exposed field by field, and the whole payload is
/// also available as `input` unless the payload defines that field itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct StarterHandler;

#[async_trait]
impl BlockHandler for StarterHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        _inputs: HandlerInputs,
    ) -> Result<JsonValue, HandlerError> {
        let input = ctx.run_input.as_ref();
        let mut output = match input {
            JsonValue::Object(fields) => fields.clone(),
            _ => JsonMap::new(),
        };
        if !output.contains_key("input") {
            output.insert("input".to_string(), input.clone());
        }
        Ok(JsonValue::Object(output))
    }
}

/// Assigns workflow variables.
///
/// Reads the `variables` list of `{variableName, value}` assignments and
/// returns them as an object; the engine applies them to the run's variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariablesHandler;

#[async_trait]
impl BlockHandler for VariablesHandler {
    async fn execute(
        &self,
        _ctx: &HandlerContext,
        inputs: HandlerInputs,
    ) -> Result<JsonValue, HandlerError> {
        let assignments = match inputs.get("variables") {
            None | Some(JsonValue::Null) => return Ok(json!({})),
            Some(JsonValue::String(text)) if text.trim().is_empty() => return Ok(json!({})),
            Some(JsonValue::String(text)) => serde_json::from_str(text)
                .map_err(|e| HandlerError::invalid_input(format!("variables: {e}")))?,
            Some(other) => other.clone(),
        };
        let JsonValue::Array(assignments) = assignments else {
            return Err(HandlerError::invalid_input("variables must be a list"));
        };

        let mut output = JsonMap::new();
        for assignment in assignments {
            let name = ["variableName", "name"]
                .iter()
                .find_map(|key| assignment.get(key).and_then(JsonValue::as_str))
                .map(str::trim)
                .filter(|name| !name.is_empty());
            let Some(name) = name else {
                continue;
            };
            let value = assignment.get("value").cloned().unwrap_or(JsonValue::Null);
            output.insert(name.to_string(), value);
        }
        Ok(JsonValue::Object(output))
    }
}

/// Shapes the run's final response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseHandler;

const DEFAULT_STATUS: u16 = 200;

#[async_trait]
impl BlockHandler for ResponseHandler {
    async fn execute(
        &self,
        _ctx: &HandlerContext,
        inputs: HandlerInputs,
    ) -> Result<JsonValue, HandlerError> {
        let data = inputs.get("data").cloned().unwrap_or(JsonValue::Null);
        let status = match inputs.get("status") {
            None | Some(JsonValue::Null) => DEFAULT_STATUS,
            Some(JsonValue::String(text)) if text.trim().is_empty() => DEFAULT_STATUS,
            Some(JsonValue::String(text)) => text
                .trim()
                .parse()
                .map_err(|_| HandlerError::invalid_input(format!("status {text:?} is not a number")))?,
            Some(JsonValue::Number(number)) => number
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .ok_or_else(|| HandlerError::invalid_input(format!("status {number} is out of range")))?,
            Some(other) => {
                return Err(HandlerError::invalid_input(format!(
                    "status {other} is not a number"
                )));
            }
        };
        let headers = response_headers(inputs.get("headers"));
        Ok(json!({ "data": data, "status": status, "headers": headers }))
    }
}

/// Accepts headers as an object or as a list of `{key, value}` rows.
fn response_headers(headers: Option<&JsonValue>) -> JsonValue {
    match headers {
        Some(JsonValue::Object(map)) => JsonValue::Object(map.clone()),
        Some(JsonValue::Array(rows)) => {
            let map: JsonMap<String, JsonValue> = rows
                .iter()
                .filter_map(|row| {
                    let key = row.get("key").and_then(JsonValue::as_str)?;
                    let value = row.get("value").cloned().unwrap_or(JsonValue::Null);
                    (!key.trim().is_empty()).then(|| (key.trim().to_string(), value))
                })
                .collect();
            JsonValue::Object(map)
        }
        _ => json!({}),
    }
}
