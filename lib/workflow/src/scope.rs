//! Scope resolution: which blocks a block may reference.
//!
//! A block can read the outputs of every block upstream of it, plus the
//! start block. Containers narrow this: a block inside a loop or parallel
//! body runs once per iteration, so its outputs only exist inside that body,
//! and blocks outside the container cannot see them. Members additionally get
//! the contextual values of their nearest loop and parallel (index, current
//! item, ...).

use crate::container::{ContainerIndex, ContainerKind};
use crate::graph::GraphIndex;
use crate::schema::FieldType;
use crate::snapshot::WorkflowSource;
use blockflow_core::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The contextual values a container exposes to its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerContext {
    pub kind: ContainerKind,
    pub container_id: BlockId,
    pub container_name: String,
    /// Variable names, in display order.
    pub variables: Vec<String>,
}

impl ContainerContext {
    /// Tags such as `loop.index`, in display order.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.variables
            .iter()
            .map(|variable| format!("{}.{variable}", self.kind.namespace()))
            .collect()
    }
}

/// Returns the type of a contextual variable.
#[must_use]
pub fn context_variable_type(variable: &str) -> FieldType {
    match variable {
        "index" | "currentIteration" => FieldType::Number,
        "items" => FieldType::Array,
        _ => FieldType::Any,
    }
}

/// Everything a block may reference.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessibleScope {
    /// Blocks whose outputs are visible. Never contains the block itself.
    pub blocks: BTreeSet<BlockId>,
    pub loop_context: Option<ContainerContext>,
    pub parallel_context: Option<ContainerContext>,
}

impl AccessibleScope {
    /// A scope with nothing in it.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, block_id: &BlockId) -> bool {
        self.blocks.contains(block_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.loop_context.is_none() && self.parallel_context.is_none()
    }

    /// Context groups, loop first.
    pub fn contexts(&self) -> impl Iterator<Item = &ContainerContext> {
        self.loop_context.iter().chain(self.parallel_context.iter())
    }

    /// Returns true if `block_id` is a container whose context is exposed.
    #[must_use]
    pub fn is_context_container(&self, block_id: &BlockId) -> bool {
        self.contexts().any(|context| &context.container_id == block_id)
    }
}

/// Resolves accessible scopes over one snapshot.
///
/// Building the resolver indexes the snapshot once; every `resolve` call
/// after that is a graph walk.
#[derive(Debug)]
pub struct ScopeResolver<'a, S: ?Sized> {
    source: &'a S,
    graph: GraphIndex,
    containers: ContainerIndex,
}

impl<'a, S: WorkflowSource + ?Sized> ScopeResolver<'a, S> {
    #[must_use]
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            graph: GraphIndex::build(source),
            containers: ContainerIndex::from_source(source),
        }
    }

    /// The graph index built for this snapshot.
    #[must_use]
    pub fn graph(&self) -> &GraphIndex {
        &self.graph
    }

    /// The container index built for this snapshot.
    #[must_use]
    pub fn containers(&self) -> &ContainerIndex {
        &self.containers
    }

    /// Resolves the scope of `block_id`.
    ///
    /// A block that no longer exists, or one running in trigger mode, has an
    /// empty scope.
    #[must_use]
    pub fn resolve(&self, block_id: &BlockId) -> AccessibleScope {
        let Some(block) = self.source.block(block_id) else {
            return AccessibleScope::empty();
        };
        if block.trigger_mode {
            return AccessibleScope::empty();
        }

        let enclosing = self.containers.enclosing(block_id);

        let mut candidates = self.graph.ancestors(block_id);
        if let Some(start) = self.source.start_block() {
            candidates.insert(start.id.clone());
        }
        for container in &enclosing {
            candidates.insert((*container).clone());
            candidates.extend(self.graph.ancestors(container));
        }

        let blocks = candidates
            .into_iter()
            .filter(|candidate| candidate != block_id)
            .filter(|candidate| self.source.blocks().contains_key(candidate))
            .filter(|candidate| match self.containers.container_of(candidate) {
                None => true,
                Some(owner) => owner == block_id || enclosing.contains(&owner),
            })
            .collect();

        let own_kind = self.containers.kind(block_id);
        let nearest = |kind: ContainerKind| {
            if own_kind == Some(kind) {
                return self.context(block_id, kind);
            }
            enclosing
                .iter()
                .find(|container| self.containers.kind(container) == Some(kind))
                .and_then(|container| self.context(container, kind))
        };

        AccessibleScope {
            blocks,
            loop_context: nearest(ContainerKind::Loop),
            parallel_context: nearest(ContainerKind::Parallel),
        }
    }

    fn context(&self, container_id: &BlockId, kind: ContainerKind) -> Option<ContainerContext> {
        let variables = match kind {
            ContainerKind::Loop => self.source.loops().get(container_id)?.context_variables(),
            ContainerKind::Parallel => self
                .source
                .parallels()
                .get(container_id)?
                .context_variables(),
        };
        let container_name = self
            .source
            .block(container_id)
            .map(|block| block.name.clone())
            .unwrap_or_default();

        Some(ContainerContext {
            kind,
            container_id: container_id.clone(),
            container_name,
            variables: variables.iter().map(|v| (*v).to_string()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::container::{Loop, Parallel};
    use crate::edge::{Edge, LOOP_START_HANDLE};
    use crate::snapshot::WorkflowSnapshot;
    use serde_json::json;

    fn id(name: &str) -> BlockId {
        BlockId::new(name)
    }

    fn names(scope: &AccessibleScope) -> Vec<&str> {
        scope.blocks.iter().map(BlockId::as_str).collect()
    }

    /// starter -> a -> loop{b} -> c
    fn loop_workflow() -> WorkflowSnapshot {
        WorkflowSnapshot::new()
            .with_block(Block::new("start", "starter", "Start"))
            .with_block(Block::new("a", "agent", "A"))
            .with_block(Block::new("loop", "loop", "Loop 1"))
            .with_block(Block::new("b", "agent", "B"))
            .with_block(Block::new("c", "agent", "C"))
            .connect("start", "a")
            .connect("a", "loop")
            .with_edge(Edge::new("loop", "b").with_source_handle(LOOP_START_HANDLE))
            .connect("loop", "c")
            .with_loop(Loop::for_count("loop", vec![id("b")], 3))
    }

    #[test]
    fn block_after_loop_sees_loop_but_not_members() {
        let snapshot = loop_workflow();
        let resolver = ScopeResolver::new(&snapshot);
        let scope = resolver.resolve(&id("c"));

        assert_eq!(names(&scope), ["a", "loop", "start"]);
        assert!(scope.loop_context.is_none());
    }

    #[test]
    fn loop_member_sees_context_and_upstream() {
        let snapshot = loop_workflow();
        let resolver = ScopeResolver::new(&snapshot);
        let scope = resolver.resolve(&id("b"));

        assert_eq!(names(&scope), ["a", "loop", "start"]);
        let context = scope.loop_context.as_ref().expect("loop context");
        assert_eq!(context.container_id, id("loop"));
        assert_eq!(context.tags(), ["loop.index", "loop.currentIteration"]);
        assert!(scope.is_context_container(&id("loop")));
        assert!(scope.parallel_context.is_none());
    }

    #[test]
    fn block_never_sees_itself() {
        let snapshot = loop_workflow().connect("c", "a");
        let resolver = ScopeResolver::new(&snapshot);
        for block in ["start", "a", "loop", "b", "c"] {
            assert!(!resolver.resolve(&id(block)).contains(&id(block)));
        }
    }

    #[test]
    fn start_block_is_always_accessible() {
        let snapshot = loop_workflow().with_block(Block::new("lonely", "agent", "Lonely"));
        let resolver = ScopeResolver::new(&snapshot);
        assert_eq!(names(&resolver.resolve(&id("lonely"))), ["start"]);
    }

    #[test]
    fn deleted_block_has_empty_scope() {
        let snapshot = loop_workflow();
        let resolver = ScopeResolver::new(&snapshot);
        assert!(resolver.resolve(&id("gone")).is_empty());
    }

    #[test]
    fn trigger_mode_block_is_an_entry_point() {
        let snapshot = loop_workflow()
            .with_block(Block::new("hook", "gmail", "Hook").in_trigger_mode())
            .connect("a", "hook");
        let resolver = ScopeResolver::new(&snapshot);
        assert!(resolver.resolve(&id("hook")).is_empty());
    }

    #[test]
    fn members_of_other_containers_are_denied() {
        let snapshot = loop_workflow()
            .with_block(Block::new("par", "parallel", "Par"))
            .with_block(Block::new("d", "agent", "D"))
            .connect("b", "d")
            .with_parallel(Parallel::with_count("par", vec![id("d")], 2));
        let resolver = ScopeResolver::new(&snapshot);
        let scope = resolver.resolve(&id("d"));

        assert!(!scope.contains(&id("b")));
        assert!(scope.parallel_context.is_some());
        assert!(scope.loop_context.is_none());
    }

    #[test]
    fn nested_member_sees_both_contexts() {
        let snapshot = WorkflowSnapshot::new()
            .with_block(Block::new("start", "starter", "Start"))
            .with_block(Block::new("outer", "loop", "Outer"))
            .with_block(Block::new("inner", "parallel", "Inner"))
            .with_block(Block::new("x", "agent", "X"))
            .with_block(Block::new("y", "agent", "Y"))
            .connect("start", "outer")
            .connect("outer", "x")
            .connect("x", "inner")
            .connect("inner", "y")
            .with_loop(Loop::for_each("outer", vec![id("x"), id("inner")], json!([1, 2])))
            .with_parallel(Parallel::with_count("inner", vec![id("y")], 2));
        let resolver = ScopeResolver::new(&snapshot);
        let scope = resolver.resolve(&id("y"));

        assert_eq!(names(&scope), ["inner", "outer", "start", "x"]);
        assert_eq!(
            scope.loop_context.as_ref().map(|c| c.container_id.as_str()),
            Some("outer")
        );
        assert_eq!(
            scope.parallel_context.as_ref().map(|c| c.tags()),
            Some(vec!["parallel.index".to_string()])
        );
    }

    #[test]
    fn container_exposes_its_own_context() {
        let snapshot = WorkflowSnapshot::new()
            .with_block(Block::new("outer", "loop", "Outer"))
            .with_block(Block::new("inner", "loop", "Inner"))
            .with_loop(Loop::for_count("outer", vec![id("inner")], 2))
            .with_loop(Loop::for_each("inner", Vec::new(), json!([])));
        let resolver = ScopeResolver::new(&snapshot);
        let scope = resolver.resolve(&id("inner"));

        let context = scope.loop_context.expect("own context");
        assert_eq!(context.container_id, id("inner"));
        assert!(context.variables.contains(&"currentItem".to_string()));
    }

    #[test]
    fn member_without_start_edge_inherits_container_scope() {
        let snapshot = loop_workflow().with_loop(Loop::for_count("loop", vec![id("b"), id("e")], 2))
            .with_block(Block::new("e", "agent", "E"));
        let resolver = ScopeResolver::new(&snapshot);
        assert_eq!(names(&resolver.resolve(&id("e"))), ["a", "loop", "start"]);
    }
}
