//! Output type derivation.
//!
//! A block's output surface depends on how it is configured, not only on its
//! type: a starter exposes its declared input fields, an agent with a
//! response format exposes those fields, a tool block exposes whatever the
//! selected operation's tool returns. [`OutputTypeDeriver`] applies the
//! derivation rules in priority order; the first rule that yields paths wins.

use crate::block::{Block, BlockType, SubBlockValues};
use crate::registry::{BlockCategory, BlockConfig, Catalog};
use crate::schema::{FieldType, OutputPath, OutputSchema, OutputShape};
use blockflow_core::BlockId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Which derivation rule produced a block's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    /// The selected trigger's payload.
    Trigger,
    /// A chat-mode starter.
    StarterChat,
    /// A starter's declared input fields.
    InputFormat,
    /// Evaluator metrics.
    Metrics,
    /// Variable assignments.
    Assignments,
    /// A configured response format.
    ResponseFormat,
    /// The tool bound to the selected operation.
    Tool,
    /// The block type's static outputs.
    Static,
    /// Nothing is known about the shape; only the bare root is offered.
    Opaque,
}

/// The derived output surface of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedOutputs {
    pub block_id: BlockId,
    /// Normalized block name used as the tag prefix.
    pub prefix: String,
    /// Paths relative to the block, parents before children.
    pub paths: Vec<OutputPath>,
    pub source: OutputSource,
    /// Keep the bare root tag even when paths exist.
    pub passthrough_root: bool,
}

impl DerivedOutputs {
    /// Full reference tags for this block, in derivation order.
    ///
    /// With no paths the bare prefix is the only tag. With paths the bare
    /// prefix is dropped unless the block is a passthrough root.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        if self.paths.is_empty() {
            return vec![self.prefix.clone()];
        }
        let root = self.passthrough_root.then(|| self.prefix.clone());
        root.into_iter()
            .chain(
                self.paths
                    .iter()
                    .map(|path| format!("{}.{}", self.prefix, path.path)),
            )
            .collect()
    }

    /// Full tags paired with their types.
    #[must_use]
    pub fn typed_tags(&self) -> Vec<(String, FieldType)> {
        if self.paths.is_empty() || self.passthrough_root {
            let root = (self.prefix.clone(), FieldType::Any);
            return std::iter::once(root)
                .chain(self.prefixed_paths())
                .collect();
        }
        self.prefixed_paths().collect()
    }

    fn prefixed_paths(&self) -> impl Iterator<Item = (String, FieldType)> + '_ {
        self.paths.iter().map(|path| {
            (
                format!("{}.{}", self.prefix, path.path),
                path.field_type.clone(),
            )
        })
    }
}

/// Derives output surfaces against a catalog.
#[derive(Debug)]
pub struct OutputTypeDeriver<'r, R: ?Sized> {
    registry: &'r R,
}

impl<'r, R: Catalog + ?Sized> OutputTypeDeriver<'r, R> {
    #[must_use]
    pub fn new(registry: &'r R) -> Self {
        Self { registry }
    }

    /// Derives the outputs of `block` configured with `values`.
    ///
    /// `values` is the block's merged configuration (persisted values with
    /// live edits applied). A block type missing from the catalog is not an
    /// error: rules that need no catalog still apply and everything else
    /// falls back to the bare root.
    #[must_use]
    pub fn derive(&self, block: &Block, values: &SubBlockValues) -> DerivedOutputs {
        let config = self.registry.block_config(block.block_type.as_str());
        if config.is_none() {
            tracing::debug!(
                block_id = %block.id,
                block_type = %block.block_type,
                "no block configuration registered"
            );
        }

        let (schema, source) = self.select_schema(block, config, values);
        let paths = schema.flatten();
        let source = if paths.is_empty() {
            OutputSource::Opaque
        } else {
            source
        };

        DerivedOutputs {
            block_id: block.id.clone(),
            prefix: block.normalized_name(),
            paths,
            source,
            passthrough_root: config.is_some_and(|c| c.passthrough_root),
        }
    }

    fn select_schema(
        &self,
        block: &Block,
        config: Option<&BlockConfig>,
        values: &SubBlockValues,
    ) -> (OutputSchema, OutputSource) {
        let static_outputs = || {
            config
                .map(|c| c.outputs.clone())
                .unwrap_or_default()
        };

        if block.trigger_mode
            && let Some(config) = config.filter(|c| c.triggers.enabled)
            && let Some(schema) = self.trigger_outputs(config, values, None)
        {
            return (schema, OutputSource::Trigger);
        }

        match &block.block_type {
            BlockType::Starter => {
                if values.get_str("startWorkflow") == Some("chat") {
                    return (chat_outputs(), OutputSource::StarterChat);
                }
                let fields = input_format_fields(values);
                if !fields.is_empty() {
                    return (fields, OutputSource::InputFormat);
                }
                return (static_outputs(), OutputSource::Static);
            }
            BlockType::Evaluator => {
                let metrics = metric_fields(values);
                if !metrics.is_empty() {
                    return (metrics, OutputSource::Metrics);
                }
                return (static_outputs(), OutputSource::Static);
            }
            BlockType::Variables => {
                return (assignment_fields(values), OutputSource::Assignments);
            }
            _ => {}
        }

        if let Some(config) = config.filter(|c| c.category == BlockCategory::Triggers)
            && let Some(schema) =
                self.trigger_outputs(config, values, Some(block.block_type.as_str()))
        {
            return (schema, OutputSource::Trigger);
        }

        if let Some(format) = values.get_json("responseFormat") {
            let fields = response_format_fields(&format);
            if !fields.is_empty() {
                return (fields, OutputSource::ResponseFormat);
            }
            return (static_outputs(), OutputSource::Static);
        }

        if let Some(operation) = values.get_str("operation")
            && let Some(tool_id) = config.and_then(|c| c.tools.tool_for_operation(operation))
            && let Some(tool) = self.registry.tool(tool_id)
            && !tool.outputs.is_empty()
        {
            return (tool.outputs.clone(), OutputSource::Tool);
        }

        (static_outputs(), OutputSource::Static)
    }

    fn trigger_outputs(
        &self,
        config: &BlockConfig,
        values: &SubBlockValues,
        fallback: Option<&str>,
    ) -> Option<OutputSchema> {
        let selected = values
            .get_str("triggerId")
            .or_else(|| values.get_str("selectedTriggerId"));
        let candidates = selected
            .into_iter()
            .chain(fallback)
            .chain(config.triggers.available.iter().map(String::as_str));

        candidates
            .filter_map(|id| self.registry.trigger(id))
            .map(|trigger| trigger.outputs.clone())
            .find(|outputs| !outputs.is_empty())
    }
}

fn chat_outputs() -> OutputSchema {
    OutputSchema::from_fields([
        ("input", FieldType::String),
        ("conversationId", FieldType::String),
        ("files", FieldType::Files),
    ])
}

/// Declared `{name, type}` fields of a starter's input format.
fn input_format_fields(values: &SubBlockValues) -> OutputSchema {
    let Some(JsonValue::Array(entries)) = values.get_json("inputFormat") else {
        return OutputSchema::new();
    };
    named_fields(&entries, &["name"], |entry| {
        entry
            .get("type")
            .and_then(JsonValue::as_str)
            .map_or(FieldType::Any, FieldType::parse)
    })
}

/// Evaluator metrics, lowercased, always numeric.
fn metric_fields(values: &SubBlockValues) -> OutputSchema {
    let Some(JsonValue::Array(entries)) = values.get_json("metrics") else {
        return OutputSchema::new();
    };
    let mut schema = OutputSchema::new();
    for name in entries
        .iter()
        .filter_map(|entry| entry.get("name").and_then(JsonValue::as_str))
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        schema.insert(name.to_lowercase(), OutputShape::leaf(FieldType::Number));
    }
    schema
}

/// Variable names assigned by a variables block.
fn assignment_fields(values: &SubBlockValues) -> OutputSchema {
    let Some(JsonValue::Array(entries)) = values.get_json("variables") else {
        return OutputSchema::new();
    };
    named_fields(&entries, &["variableName", "name"], |entry| {
        match entry.get("type").and_then(JsonValue::as_str) {
            Some("plain") => FieldType::String,
            Some(name) => FieldType::parse(name),
            None => FieldType::Any,
        }
    })
}

/// Field names declared by a response format.
///
/// Accepts a JSON Schema object, a `{schema: {...}}` wrapper, or the legacy
/// `{fields: [{name, type}]}` list.
fn response_format_fields(format: &JsonValue) -> OutputSchema {
    let schema = format
        .get("schema")
        .filter(|inner| inner.is_object())
        .unwrap_or(format);

    if let Some(JsonValue::Array(fields)) = schema.get("fields") {
        return named_fields(fields, &["name"], |entry| {
            entry
                .get("type")
                .and_then(JsonValue::as_str)
                .map_or(FieldType::Any, FieldType::parse)
        });
    }

    let Some(properties) = schema.get("properties").and_then(JsonValue::as_object) else {
        return OutputSchema::new();
    };
    let mut fields = OutputSchema::new();
    for (name, property) in properties {
        let field_type = property
            .get("type")
            .and_then(JsonValue::as_str)
            .map_or(FieldType::Any, FieldType::parse);
        fields.insert(name.clone(), OutputShape::leaf(field_type));
    }
    fields
}

fn named_fields(
    entries: &[JsonValue],
    name_keys: &[&str],
    field_type: impl Fn(&JsonValue) -> FieldType,
) -> OutputSchema {
    let mut schema = OutputSchema::new();
    for entry in entries {
        let name = name_keys
            .iter()
            .find_map(|key| entry.get(*key).and_then(JsonValue::as_str))
            .map(str::trim)
            .filter(|name| !name.is_empty());
        if let Some(name) = name {
            schema.insert(name, OutputShape::leaf(field_type(entry)));
        }
    }
    schema
}
