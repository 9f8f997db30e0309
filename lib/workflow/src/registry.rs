//! Block, tool, and trigger catalogs.
//!
//! The deriver and the executor consult three read-only registries:
//! - [`BlockConfigRegistry`]: static configuration per block type
//! - [`ToolRegistry`]: output schemas of the tools blocks call
//! - [`TriggerRegistry`]: output schemas of trigger payloads
//!
//! [`Registry`] implements all three in memory and loads from a JSON catalog.
//! A built-in catalog covers the kinds the engine itself knows about.

use crate::error::RegistryError;
use crate::schema::OutputSchema;
use blockflow_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const BUILTIN_CATALOG: &str = include_str!("catalog.json");

/// Which palette a block type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockCategory {
    #[default]
    Blocks,
    Tools,
    Triggers,
}

/// Trigger support of a block type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TriggerSupport {
    /// The block can be switched into trigger mode.
    #[serde(default)]
    pub enabled: bool,
    /// Trigger ids the block can listen for, preferred first.
    #[serde(default)]
    pub available: Vec<String>,
}

/// Tool binding of a block type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolBinding {
    /// Tool ids the block may call.
    #[serde(default)]
    pub access: Vec<String>,
    /// Explicit operation → tool id map.
    #[serde(default)]
    pub operations: BTreeMap<String, String>,
}

impl ToolBinding {
    /// Finds the tool an operation selects.
    ///
    /// An explicit mapping wins. Otherwise an accessible tool named after the
    /// operation (`<service>_<operation>` or the operation itself) is used.
    #[must_use]
    pub fn tool_for_operation(&self, operation: &str) -> Option<&str> {
        if let Some(tool) = self.operations.get(operation) {
            return Some(tool.as_str());
        }
        let suffix = format!("_{operation}");
        self.access
            .iter()
            .find(|tool| tool.as_str() == operation || tool.ends_with(&suffix))
            .map(String::as_str)
    }
}

/// Static configuration for one block type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockConfig {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub category: BlockCategory,
    #[serde(default)]
    pub outputs: OutputSchema,
    #[serde(default)]
    pub triggers: TriggerSupport,
    #[serde(default)]
    pub tools: ToolBinding,
    /// Unstructured passthrough blocks keep their bare root tag next to the
    /// derived paths.
    #[serde(default)]
    pub passthrough_root: bool,
}

impl BlockConfig {
    #[must_use]
    pub fn new(block_type: impl Into<String>, outputs: OutputSchema) -> Self {
        let block_type = block_type.into();
        Self {
            name: block_type.clone(),
            block_type,
            category: BlockCategory::Blocks,
            outputs,
            triggers: TriggerSupport::default(),
            tools: ToolBinding::default(),
            passthrough_root: false,
        }
    }
}

/// A tool and the outputs it returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub id: String,
    #[serde(default)]
    pub outputs: OutputSchema,
}

/// A trigger and the payload it delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub outputs: OutputSchema,
}

/// Looks up static block configuration by type.
pub trait BlockConfigRegistry {
    fn block_config(&self, block_type: &str) -> Option<&BlockConfig>;
}

/// Looks up tools by id.
pub trait ToolRegistry {
    fn tool(&self, tool_id: &str) -> Option<&ToolConfig>;
}

/// Looks up triggers by id.
pub trait TriggerRegistry {
    fn trigger(&self, trigger_id: &str) -> Option<&TriggerConfig>;
}

/// Everything output derivation needs.
pub trait Catalog: BlockConfigRegistry + ToolRegistry + TriggerRegistry {}

impl<T: BlockConfigRegistry + ToolRegistry + TriggerRegistry + ?Sized> Catalog for T {}

/// The on-disk catalog format.
#[derive(Debug, Default, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    blocks: Vec<BlockConfig>,
    #[serde(default)]
    tools: Vec<ToolConfig>,
    #[serde(default)]
    triggers: Vec<TriggerConfig>,
}

/// In-memory registry of blocks, tools, and triggers.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    blocks: HashMap<String, BlockConfig>,
    tools: HashMap<String, ToolConfig>,
    triggers: HashMap<String, TriggerConfig>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the built-in catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedded catalog is malformed.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_json_str(BUILTIN_CATALOG)
    }

    /// Loads a catalog document with `blocks`, `tools`, and `triggers` lists.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid catalog.
    pub fn from_json_str(document: &str) -> Result<Self, RegistryError> {
        let document: CatalogDocument =
            serde_json::from_str(document).map_err(|e| RegistryError::InvalidDocument {
                reason: e.to_string(),
            })?;

        let mut registry = Self::new();
        registry.extend(document);
        Ok(registry)
    }

    /// Merges another catalog document over this registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid catalog.
    pub fn merge_json_str(&mut self, document: &str) -> Result<(), RegistryError> {
        let other = Self::from_json_str(document)?;
        self.blocks.extend(other.blocks);
        self.tools.extend(other.tools);
        self.triggers.extend(other.triggers);
        Ok(())
    }

    fn extend(&mut self, document: CatalogDocument) {
        for block in document.blocks {
            self.blocks.insert(block.block_type.clone(), block);
        }
        for tool in document.tools {
            self.tools.insert(tool.id.clone(), tool);
        }
        for trigger in document.triggers {
            self.triggers.insert(trigger.id.clone(), trigger);
        }
    }

    #[must_use]
    pub fn with_block(mut self, config: BlockConfig) -> Self {
        self.blocks.insert(config.block_type.clone(), config);
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: ToolConfig) -> Self {
        self.tools.insert(tool.id.clone(), tool);
        self
    }

    #[must_use]
    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.triggers.insert(trigger.id.clone(), trigger);
        self
    }

    /// Number of registered block types.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl BlockConfigRegistry for Registry {
    fn block_config(&self, block_type: &str) -> Option<&BlockConfig> {
        self.blocks.get(block_type)
    }
}

impl ToolRegistry for Registry {
    fn tool(&self, tool_id: &str) -> Option<&ToolConfig> {
        self.tools.get(tool_id)
    }
}

impl TriggerRegistry for Registry {
    fn trigger(&self, trigger_id: &str) -> Option<&TriggerConfig> {
        self.triggers.get(trigger_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;

    #[test]
    fn builtin_catalog_loads() {
        let registry = Registry::builtin().expect("builtin catalog");
        for block_type in ["starter", "loop", "parallel", "condition", "evaluator", "variables"] {
            assert!(
                registry.block_config(block_type).is_some(),
                "missing {block_type}"
            );
        }
        let webhook = registry.block_config("generic_webhook").expect("webhook");
        assert_eq!(webhook.category, BlockCategory::Triggers);
        assert!(webhook.passthrough_root);
        assert!(registry.trigger("generic_webhook").is_some());
        assert!(registry.tool("gmail_read").is_some());
    }

    #[test]
    fn catalog_document_parses_outputs() {
        let registry = Registry::from_json_str(
            r#"{
                "blocks": [{
                    "type": "weather",
                    "category": "tools",
                    "outputs": {"temperature": "number"},
                    "tools": {"access": ["weather_current"]}
                }]
            }"#,
        )
        .expect("parse");
        let config = registry.block_config("weather").expect("weather");
        let paths = config.outputs.flatten();
        assert_eq!(paths[0].path, "temperature");
        assert_eq!(paths[0].field_type, FieldType::Number);
        assert_eq!(config.category, BlockCategory::Tools);
    }

    #[test]
    fn invalid_document_is_rejected() {
        assert!(Registry::from_json_str("{not json").is_err());
    }

    #[test]
    fn merge_overrides_existing_entries() {
        let mut registry = Registry::new().with_block(BlockConfig::new("x", OutputSchema::new()));
        registry
            .merge_json_str(r#"{"blocks": [{"type": "x", "outputs": {"y": "string"}}]}"#)
            .expect("merge");
        let config = registry.block_config("x").expect("x");
        assert_eq!(config.outputs.len(), 1);
    }

    #[test]
    fn operation_maps_to_tool() {
        let binding = ToolBinding {
            access: vec!["gmail_send".into(), "gmail_read".into()],
            operations: BTreeMap::from([("draft".to_string(), "gmail_send".to_string())]),
        };
        assert_eq!(binding.tool_for_operation("read"), Some("gmail_read"));
        assert_eq!(binding.tool_for_operation("draft"), Some("gmail_send"));
        assert_eq!(binding.tool_for_operation("delete"), None);
    }
}
