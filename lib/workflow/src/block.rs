//! Block types for workflow graphs.
//!
//! A block is one step on the canvas. Its behavior is selected by its type
//! and configured through sub-blocks: named fields whose values are whatever
//! the editor stored (strings, numbers, arrays, nested objects, or JSON text).

use blockflow_core::BlockId;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;

/// The kind of a block.
///
/// The engine gives special meaning to a handful of kinds. Everything else
/// (actions, tools, triggers) is carried as [`BlockType::Other`] and
/// described by the block registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BlockType {
    /// The workflow entry point.
    Starter,
    /// Loop container.
    Loop,
    /// Parallel container.
    Parallel,
    /// Conditional branching.
    Condition,
    /// Scores content against configured metrics.
    Evaluator,
    /// Assigns workflow variables.
    Variables,
    /// Shapes the final workflow response.
    Response,
    /// Any other registered kind.
    Other(String),
}

impl BlockType {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Starter => "starter",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Condition => "condition",
            Self::Evaluator => "evaluator",
            Self::Variables => "variables",
            Self::Response => "response",
            Self::Other(name) => name,
        }
    }

    /// Returns true for loop and parallel containers.
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Loop | Self::Parallel)
    }
}

impl From<String> for BlockType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "starter" => Self::Starter,
            "loop" => Self::Loop,
            "parallel" => Self::Parallel,
            "condition" => Self::Condition,
            "evaluator" => Self::Evaluator,
            "variables" => Self::Variables,
            "response" => Self::Response,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for BlockType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<BlockType> for String {
    fn from(value: BlockType) -> Self {
        match value {
            BlockType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single configured field of a block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubBlock {
    /// Field identifier, when the editor stores one alongside the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Editor widget kind (e.g. "short-input", "code").
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// The stored value.
    #[serde(default)]
    pub value: JsonValue,
}

impl SubBlock {
    /// Creates a sub-block holding only a value.
    #[must_use]
    pub fn new(value: JsonValue) -> Self {
        Self {
            id: None,
            kind: None,
            value,
        }
    }
}

/// A block in a workflow snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Unique identifier within the workflow.
    pub id: BlockId,
    /// Block kind.
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// Display name. Reference prefixes are derived from it.
    pub name: String,
    /// Disabled blocks are skipped at execution time.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// A block in trigger mode acts as an entry point.
    #[serde(default)]
    pub trigger_mode: bool,
    /// Persisted configuration, keyed by field name.
    #[serde(default)]
    pub sub_blocks: HashMap<String, SubBlock>,
}

fn default_enabled() -> bool {
    true
}

impl Block {
    /// Creates an enabled block with no configuration.
    #[must_use]
    pub fn new(
        id: impl Into<BlockId>,
        block_type: impl Into<BlockType>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            block_type: block_type.into(),
            name: name.into(),
            enabled: true,
            trigger_mode: false,
            sub_blocks: HashMap::new(),
        }
    }

    /// Sets a sub-block value.
    #[must_use]
    pub fn with_value(mut self, field: impl Into<String>, value: JsonValue) -> Self {
        self.sub_blocks.insert(field.into(), SubBlock::new(value));
        self
    }

    /// Marks the block as running in trigger mode.
    #[must_use]
    pub fn in_trigger_mode(mut self) -> Self {
        self.trigger_mode = true;
        self
    }

    /// Marks the block as disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The reference prefix for this block.
    #[must_use]
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Returns the persisted sub-block values.
    #[must_use]
    pub fn values(&self) -> SubBlockValues {
        self.sub_blocks
            .iter()
            .map(|(field, sub_block)| (field.clone(), sub_block.value.clone()))
            .collect()
    }
}

/// Strips all whitespace and lowercases a display name.
///
/// "Send Email" and "sendemail" normalize to the same prefix.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// A flat field → value map for one block's configuration.
///
/// Editors store structured fields either as JSON values or as JSON text, so
/// the accessors here accept both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubBlockValues(HashMap<String, JsonValue>);

impl SubBlockValues {
    /// Creates an empty value map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field.
    pub fn insert(&mut self, field: impl Into<String>, value: JsonValue) {
        self.0.insert(field.into(), value);
    }

    /// Returns a field unless it is missing or null.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field).filter(|value| !value.is_null())
    }

    /// Returns a field as a non-empty string.
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Returns a structured field, parsing it when it was stored as JSON text.
    ///
    /// Text that is not valid JSON is returned as a JSON string.
    #[must_use]
    pub fn get_json(&self, field: &str) -> Option<JsonValue> {
        match self.get(field)? {
            JsonValue::String(text) if text.trim().is_empty() => None,
            JsonValue::String(text) => Some(
                serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.clone())),
            ),
            other => Some(other.clone()),
        }
    }

    /// Iterates over all fields.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Converts the values into a JSON object.
    #[must_use]
    pub fn into_json(self) -> JsonMap<String, JsonValue> {
        self.0.into_iter().collect()
    }
}

impl FromIterator<(String, JsonValue)> for SubBlockValues {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_strips_whitespace_and_lowercases() {
        assert_eq!(normalize_name("Send Email"), "sendemail");
        assert_eq!(normalize_name("  Agent\t1 "), "agent1");
        assert_eq!(normalize_name("API"), "api");
    }

    #[test]
    fn known_block_types_parse() {
        assert_eq!(BlockType::from("loop"), BlockType::Loop);
        assert_eq!(BlockType::from("starter"), BlockType::Starter);
        assert_eq!(
            BlockType::from("gmail"),
            BlockType::Other("gmail".to_string())
        );
        assert!(BlockType::Parallel.is_container());
        assert!(!BlockType::Condition.is_container());
    }

    #[test]
    fn block_deserializes_from_editor_shape() {
        let block: Block = serde_json::from_value(json!({
            "id": "b1",
            "type": "agent",
            "name": "Agent 1",
            "triggerMode": false,
            "subBlocks": {
                "model": { "id": "model", "type": "dropdown", "value": "gpt-4o" }
            }
        }))
        .expect("deserialize");

        assert_eq!(block.id.as_str(), "b1");
        assert!(block.enabled);
        assert_eq!(block.block_type.as_str(), "agent");
        assert_eq!(block.normalized_name(), "agent1");
        assert_eq!(block.values().get_str("model"), Some("gpt-4o"));
    }

    #[test]
    fn block_type_serializes_as_string() {
        let json = serde_json::to_value(BlockType::Other("slack".into())).expect("serialize");
        assert_eq!(json, json!("slack"));
        let json = serde_json::to_value(BlockType::Variables).expect("serialize");
        assert_eq!(json, json!("variables"));
    }

    #[test]
    fn get_json_parses_text_values() {
        let mut values = SubBlockValues::new();
        values.insert("format", json!("{\"a\": 1}"));
        values.insert("plain", json!("not json"));
        values.insert("empty", json!("  "));
        values.insert("null", JsonValue::Null);

        assert_eq!(values.get_json("format"), Some(json!({"a": 1})));
        assert_eq!(values.get_json("plain"), Some(json!("not json")));
        assert_eq!(values.get_json("empty"), None);
        assert_eq!(values.get_json("null"), None);
        assert!(values.get("null").is_none());
    }
}
