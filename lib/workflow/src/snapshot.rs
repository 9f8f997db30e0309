//! Workflow snapshots.
//!
//! A snapshot is the immutable view of a workflow that every analysis and
//! every execution works from:
//! - Blocks keyed by id
//! - Edges between blocks
//! - Loop and parallel containers
//! - Workflow variables
//!
//! Unsaved edits from the editor are kept apart as [`LiveValues`] and merged
//! in explicitly where they matter.

use crate::block::{Block, BlockType, SubBlockValues};
use crate::container::{ContainerIndex, Loop, Parallel};
use crate::edge::Edge;
use crate::error::GraphError;
use crate::variable::Variable;
use blockflow_core::{BlockId, Result, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

/// Read access to a workflow's structure.
pub trait WorkflowSource {
    /// All blocks, keyed by id.
    fn blocks(&self) -> &BTreeMap<BlockId, Block>;
    /// All edges.
    fn edges(&self) -> &[Edge];
    /// Loop containers, keyed by container block id.
    fn loops(&self) -> &BTreeMap<BlockId, Loop>;
    /// Parallel containers, keyed by container block id.
    fn parallels(&self) -> &BTreeMap<BlockId, Parallel>;
    /// Workflow variables.
    fn variables(&self) -> &[Variable];

    /// Looks up a block.
    fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks().get(id)
    }

    /// The block execution and distance measurement start from: the first
    /// enabled starter block.
    fn start_block(&self) -> Option<&Block> {
        self.blocks()
            .values()
            .find(|block| block.enabled && block.block_type == BlockType::Starter)
    }
}

/// An immutable workflow snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<WorkflowId>,
    #[serde(default)]
    pub blocks: BTreeMap<BlockId, Block>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub loops: BTreeMap<BlockId, Loop>,
    #[serde(default)]
    pub parallels: BTreeMap<BlockId, Parallel>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl WorkflowSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block.
    #[must_use]
    pub fn with_block(mut self, block: Block) -> Self {
        self.blocks.insert(block.id.clone(), block);
        self
    }

    /// Adds an edge.
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Adds a plain edge between two blocks.
    #[must_use]
    pub fn connect(self, source: &str, target: &str) -> Self {
        self.with_edge(Edge::new(source, target))
    }

    /// Adds a loop container.
    #[must_use]
    pub fn with_loop(mut self, container: Loop) -> Self {
        self.loops.insert(container.id.clone(), container);
        self
    }

    /// Adds a parallel container.
    #[must_use]
    pub fn with_parallel(mut self, container: Parallel) -> Self {
        self.parallels.insert(container.id.clone(), container);
        self
    }

    /// Adds a workflow variable.
    #[must_use]
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Validates the snapshot's container structure.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending block if container membership is
    /// malformed.
    pub fn validate(&self) -> Result<(), GraphError> {
        ContainerIndex::build(self)?;
        Ok(())
    }
}

impl WorkflowSource for WorkflowSnapshot {
    fn blocks(&self) -> &BTreeMap<BlockId, Block> {
        &self.blocks
    }

    fn edges(&self) -> &[Edge] {
        &self.edges
    }

    fn loops(&self) -> &BTreeMap<BlockId, Loop> {
        &self.loops
    }

    fn parallels(&self) -> &BTreeMap<BlockId, Parallel> {
        &self.parallels
    }

    fn variables(&self) -> &[Variable] {
        &self.variables
    }
}

/// Unsaved editor values: block id → field → value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LiveValues(HashMap<BlockId, HashMap<String, JsonValue>>);

impl LiveValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a live value for one field of a block.
    pub fn set(&mut self, block_id: impl Into<BlockId>, field: impl Into<String>, value: JsonValue) {
        self.0
            .entry(block_id.into())
            .or_default()
            .insert(field.into(), value);
    }

    /// Builder form of [`LiveValues::set`].
    #[must_use]
    pub fn with(mut self, block_id: &str, field: &str, value: JsonValue) -> Self {
        self.set(block_id, field, value);
        self
    }

    /// Live fields for one block.
    #[must_use]
    pub fn for_block(&self, block_id: &BlockId) -> Option<&HashMap<String, JsonValue>> {
        self.0.get(block_id)
    }
}

/// Overlays live values on a block's persisted configuration.
///
/// Fields are merged one at a time: a live value replaces the persisted one,
/// unless it is null, in which case the persisted value stands.
#[must_use]
pub fn merge_live_values(
    block: &Block,
    live: Option<&HashMap<String, JsonValue>>,
) -> SubBlockValues {
    let mut merged = block.values();
    for (field, value) in live.into_iter().flatten() {
        if !value.is_null() {
            merged.insert(field.clone(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_deserializes_editor_shape() {
        let snapshot: WorkflowSnapshot = serde_json::from_value(json!({
            "blocks": {
                "s": {"id": "s", "type": "starter", "name": "Start"},
                "l": {"id": "l", "type": "loop", "name": "Loop 1"},
                "a": {"id": "a", "type": "agent", "name": "Agent"}
            },
            "edges": [
                {"source": "s", "target": "l"},
                {"source": "l", "target": "a", "sourceHandle": "loop-start-source"}
            ],
            "loops": {
                "l": {"id": "l", "nodes": ["a"], "iterations": 3}
            }
        }))
        .expect("deserialize");

        assert_eq!(snapshot.blocks.len(), 3);
        assert_eq!(snapshot.edges.len(), 2);
        assert_eq!(snapshot.loops[&BlockId::new("l")].iterations, 3);
        assert!(snapshot.parallels.is_empty());
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn start_block_skips_disabled_starters() {
        let snapshot = WorkflowSnapshot::new()
            .with_block(Block::new("a", "starter", "Old Start").disabled())
            .with_block(Block::new("b", "starter", "Start"));
        assert_eq!(
            snapshot.start_block().map(|b| b.id.as_str()),
            Some("b")
        );
        assert!(WorkflowSnapshot::new().start_block().is_none());
    }

    #[test]
    fn validate_reports_membership_conflict() {
        let snapshot = WorkflowSnapshot::new()
            .with_block(Block::new("l", "loop", "L"))
            .with_block(Block::new("p", "parallel", "P"))
            .with_block(Block::new("b", "agent", "B"))
            .with_loop(Loop::for_count("l", vec![BlockId::new("b")], 1))
            .with_parallel(Parallel::with_count("p", vec![BlockId::new("b")], 1));
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn live_values_override_persisted_fields() {
        let block = Block::new("a", "agent", "Agent")
            .with_value("model", json!("gpt-4o"))
            .with_value("prompt", json!("hello"));
        let live = LiveValues::new()
            .with("a", "model", json!("claude"))
            .with("a", "prompt", JsonValue::Null)
            .with("a", "temperature", json!(0.2));

        let merged = merge_live_values(&block, live.for_block(&block.id));
        assert_eq!(merged.get_str("model"), Some("claude"));
        assert_eq!(merged.get_str("prompt"), Some("hello"));
        assert_eq!(merged.get("temperature"), Some(&json!(0.2)));
    }

    #[test]
    fn merge_without_live_values_is_persisted() {
        let block = Block::new("a", "agent", "Agent").with_value("model", json!("x"));
        let merged = merge_live_values(&block, None);
        assert_eq!(merged, block.values());
    }
}
