//! Loop and parallel containers.
//!
//! A container is a block of type `loop` or `parallel` that owns a set of
//! member blocks. Members run once per iteration (loops) or once per branch
//! (parallels). Containers may nest; a block belongs to at most one
//! container directly.

use crate::block::BlockType;
use crate::error::GraphError;
use crate::snapshot::WorkflowSource;
use blockflow_core::BlockId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Namespace head for loop context references (`<loop.index>`).
pub const LOOP_NAMESPACE: &str = "loop";
/// Namespace head for parallel context references (`<parallel.index>`).
pub const PARALLEL_NAMESPACE: &str = "parallel";

/// Zero-based position of the current iteration or branch.
pub const CONTEXT_INDEX: &str = "index";
/// One-based iteration counter (loops only).
pub const CONTEXT_CURRENT_ITERATION: &str = "currentIteration";
/// The item being processed.
pub const CONTEXT_CURRENT_ITEM: &str = "currentItem";
/// The full collection being iterated.
pub const CONTEXT_ITEMS: &str = "items";

/// Which kind of container a block is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Loop,
    Parallel,
}

impl ContainerKind {
    /// The reference namespace for this kind's contextual tags.
    #[must_use]
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Loop => LOOP_NAMESPACE,
            Self::Parallel => PARALLEL_NAMESPACE,
        }
    }

    /// The block type that declares this kind of container.
    #[must_use]
    pub fn block_type(self) -> BlockType {
        match self {
            Self::Loop => BlockType::Loop,
            Self::Parallel => BlockType::Parallel,
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

/// How a loop decides its iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopType {
    /// A fixed number of iterations.
    #[default]
    #[serde(rename = "for")]
    For,
    /// One iteration per item of a collection.
    #[serde(rename = "forEach")]
    ForEach,
}

/// A loop container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loop {
    pub id: BlockId,
    /// Member blocks.
    #[serde(default)]
    pub nodes: Vec<BlockId>,
    #[serde(default)]
    pub loop_type: LoopType,
    /// Iteration count for `for` loops.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Collection for `forEach` loops: an array, an object, JSON text, or a
    /// reference.
    #[serde(default)]
    pub for_each_items: JsonValue,
    /// Iterations do not depend on each other and may run concurrently.
    #[serde(default)]
    pub independent: bool,
}

fn default_iterations() -> usize {
    5
}

impl Loop {
    /// Creates a `for` loop.
    #[must_use]
    pub fn for_count(id: impl Into<BlockId>, nodes: Vec<BlockId>, iterations: usize) -> Self {
        Self {
            id: id.into(),
            nodes,
            loop_type: LoopType::For,
            iterations,
            for_each_items: JsonValue::Null,
            independent: false,
        }
    }

    /// Creates a `forEach` loop.
    #[must_use]
    pub fn for_each(id: impl Into<BlockId>, nodes: Vec<BlockId>, items: JsonValue) -> Self {
        Self {
            id: id.into(),
            nodes,
            loop_type: LoopType::ForEach,
            iterations: 0,
            for_each_items: items,
            independent: false,
        }
    }

    /// Contextual variables visible to members.
    #[must_use]
    pub fn context_variables(&self) -> &'static [&'static str] {
        match self.loop_type {
            LoopType::For => &[CONTEXT_INDEX, CONTEXT_CURRENT_ITERATION],
            LoopType::ForEach => &[
                CONTEXT_INDEX,
                CONTEXT_CURRENT_ITERATION,
                CONTEXT_CURRENT_ITEM,
                CONTEXT_ITEMS,
            ],
        }
    }
}

/// How a parallel decides its branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelType {
    /// A fixed number of identical branches.
    #[default]
    Count,
    /// One branch per item of a collection.
    Collection,
}

/// A parallel container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parallel {
    pub id: BlockId,
    #[serde(default)]
    pub nodes: Vec<BlockId>,
    #[serde(default)]
    pub parallel_type: ParallelType,
    /// Branch count for `count` parallels.
    #[serde(default = "default_count")]
    pub count: usize,
    /// Collection for `collection` parallels.
    #[serde(default)]
    pub distribution: JsonValue,
}

fn default_count() -> usize {
    1
}

impl Parallel {
    /// Creates a `count` parallel.
    #[must_use]
    pub fn with_count(id: impl Into<BlockId>, nodes: Vec<BlockId>, count: usize) -> Self {
        Self {
            id: id.into(),
            nodes,
            parallel_type: ParallelType::Count,
            count,
            distribution: JsonValue::Null,
        }
    }

    /// Creates a `collection` parallel.
    #[must_use]
    pub fn over_collection(
        id: impl Into<BlockId>,
        nodes: Vec<BlockId>,
        distribution: JsonValue,
    ) -> Self {
        Self {
            id: id.into(),
            nodes,
            parallel_type: ParallelType::Collection,
            count: 0,
            distribution,
        }
    }

    /// Contextual variables visible to members.
    #[must_use]
    pub fn context_variables(&self) -> &'static [&'static str] {
        match self.parallel_type {
            ParallelType::Count => &[CONTEXT_INDEX],
            ParallelType::Collection => &[CONTEXT_INDEX, CONTEXT_CURRENT_ITEM, CONTEXT_ITEMS],
        }
    }
}

/// Container membership for a snapshot.
///
/// Maps every member block to its direct container and every container to
/// its kind and members.
#[derive(Debug, Clone, Default)]
pub struct ContainerIndex {
    parent: HashMap<BlockId, BlockId>,
    kinds: HashMap<BlockId, ContainerKind>,
    members: HashMap<BlockId, Vec<BlockId>>,
}

impl ContainerIndex {
    /// Builds a membership index without rejecting anything.
    ///
    /// Used while editing: the first container to claim a block keeps it, and
    /// members that no longer exist are dropped.
    #[must_use]
    pub fn from_source<S: WorkflowSource + ?Sized>(source: &S) -> Self {
        let mut index = Self::default();
        for (kind, id, nodes) in containers(source) {
            index.kinds.insert(id.clone(), kind);
            let mut members = Vec::with_capacity(nodes.len());
            for member in nodes {
                if member == id || !source.blocks().contains_key(member) {
                    continue;
                }
                if let Some(existing) = index.parent.get(member) {
                    tracing::debug!(
                        block_id = %member,
                        kept = %existing,
                        ignored = %id,
                        "block claimed by two containers"
                    );
                    continue;
                }
                index.parent.insert(member.clone(), id.clone());
                members.push(member.clone());
            }
            index.members.insert(id.clone(), members);
        }
        index
    }

    /// Builds a membership index, rejecting malformed container structure.
    ///
    /// # Errors
    ///
    /// Returns an error if a block belongs to two containers, a container
    /// lists a block that does not exist, a container has no matching block,
    /// or containers nest inside each other in a cycle.
    pub fn build<S: WorkflowSource + ?Sized>(source: &S) -> Result<Self, GraphError> {
        let mut index = Self::default();
        for (kind, id, nodes) in containers(source) {
            let matches_block = source
                .blocks()
                .get(id)
                .is_some_and(|block| block.block_type == kind.block_type());
            if !matches_block {
                return Err(GraphError::ContainerBlockMissing {
                    container_id: id.clone(),
                });
            }

            index.kinds.insert(id.clone(), kind);
            let mut members = Vec::with_capacity(nodes.len());
            for member in nodes {
                if member == id {
                    return Err(GraphError::MalformedNesting {
                        container_id: id.clone(),
                    });
                }
                if !source.blocks().contains_key(member) {
                    return Err(GraphError::UnknownMember {
                        container_id: id.clone(),
                        block_id: member.clone(),
                    });
                }
                if let Some(existing) = index.parent.get(member) {
                    return Err(GraphError::ContainerMembershipConflict {
                        block_id: member.clone(),
                        first_container: existing.clone(),
                        second_container: id.clone(),
                    });
                }
                index.parent.insert(member.clone(), id.clone());
                members.push(member.clone());
            }
            index.members.insert(id.clone(), members);
        }

        for container_id in index.kinds.keys() {
            let mut seen = HashSet::from([container_id]);
            let mut current = container_id;
            while let Some(parent) = index.parent.get(current) {
                if !seen.insert(parent) {
                    return Err(GraphError::MalformedNesting {
                        container_id: container_id.clone(),
                    });
                }
                current = parent;
            }
        }

        Ok(index)
    }

    /// The container that directly owns a block.
    #[must_use]
    pub fn container_of(&self, block_id: &BlockId) -> Option<&BlockId> {
        self.parent.get(block_id)
    }

    /// Every container enclosing a block, nearest first.
    #[must_use]
    pub fn enclosing(&self, block_id: &BlockId) -> Vec<&BlockId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([block_id]);
        let mut current = block_id;
        while let Some(parent) = self.parent.get(current) {
            if !seen.insert(parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Returns true when `block_id` sits inside `container_id`, at any depth.
    #[must_use]
    pub fn is_inside(&self, block_id: &BlockId, container_id: &BlockId) -> bool {
        self.enclosing(block_id).contains(&container_id)
    }

    /// Returns the kind of a container, or `None` for ordinary blocks.
    #[must_use]
    pub fn kind(&self, block_id: &BlockId) -> Option<ContainerKind> {
        self.kinds.get(block_id).copied()
    }

    /// Direct members of a container.
    #[must_use]
    pub fn members(&self, container_id: &BlockId) -> &[BlockId] {
        self.members
            .get(container_id)
            .map_or(&[], Vec::as_slice)
    }
}

fn containers<S: WorkflowSource + ?Sized>(
    source: &S,
) -> impl Iterator<Item = (ContainerKind, &BlockId, &[BlockId])> {
    let loops = source
        .loops()
        .values()
        .map(|l| (ContainerKind::Loop, &l.id, l.nodes.as_slice()));
    let parallels = source
        .parallels()
        .values()
        .map(|p| (ContainerKind::Parallel, &p.id, p.nodes.as_slice()));
    loops.chain(parallels)
}
