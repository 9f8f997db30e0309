//! Edge types for workflow graphs.
//!
//! Edges connect blocks. Handles on the source side distinguish the branch an
//! edge belongs to:
//! - `condition-<conditionId>` for condition branches
//! - `loop-start-source` / `parallel-start-source` into a container body
//! - `loop-end-source` / `parallel-end-source` out of a finished container

use blockflow_core::BlockId;
use serde::{Deserialize, Serialize};

/// Prefix of a condition branch handle.
pub const CONDITION_HANDLE_PREFIX: &str = "condition-";
/// Handle from a loop into its first member.
pub const LOOP_START_HANDLE: &str = "loop-start-source";
/// Handle from a loop to what runs after it.
pub const LOOP_END_HANDLE: &str = "loop-end-source";
/// Handle from a parallel into its first member.
pub const PARALLEL_START_HANDLE: &str = "parallel-start-source";
/// Handle from a parallel to what runs after it.
pub const PARALLEL_END_HANDLE: &str = "parallel-end-source";

/// A directed connection between two blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Editor-assigned edge id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Upstream block.
    pub source: BlockId,
    /// Downstream block.
    pub target: BlockId,
    /// Branch handle on the source side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Port handle on the target side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    /// Creates an edge without handles.
    #[must_use]
    pub fn new(source: impl Into<BlockId>, target: impl Into<BlockId>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    /// Sets the source handle.
    #[must_use]
    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Creates the edge leaving a condition branch.
    #[must_use]
    pub fn condition_branch(
        source: impl Into<BlockId>,
        condition_id: &str,
        target: impl Into<BlockId>,
    ) -> Self {
        Self::new(source, target).with_source_handle(condition_handle(condition_id))
    }

    /// Returns the condition id when this edge leaves a condition branch.
    #[must_use]
    pub fn condition_id(&self) -> Option<&str> {
        self.source_handle
            .as_deref()?
            .strip_prefix(CONDITION_HANDLE_PREFIX)
    }

    /// Returns true for edges entering a container body.
    #[must_use]
    pub fn is_container_start(&self) -> bool {
        matches!(
            self.source_handle.as_deref(),
            Some(LOOP_START_HANDLE | PARALLEL_START_HANDLE)
        )
    }

    /// Returns true for edges leaving a finished container.
    #[must_use]
    pub fn is_container_end(&self) -> bool {
        matches!(
            self.source_handle.as_deref(),
            Some(LOOP_END_HANDLE | PARALLEL_END_HANDLE)
        )
    }
}

/// Builds the source handle for a condition branch.
#[must_use]
pub fn condition_handle(condition_id: &str) -> String {
    format!("{CONDITION_HANDLE_PREFIX}{condition_id}")
}
