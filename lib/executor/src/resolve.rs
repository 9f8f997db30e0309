//! Reference substitution against the live state of a run.
//!
//! A [`RunScope`] holds what references can see at one point of a run: the
//! outputs produced so far, the workflow variables, and the loop and parallel
//! iterations currently entered. Each container iteration works on its own
//! copy, so member outputs never leak out of their iteration.
//!
//! References are resolved through a [`BlockScope`], which only sees the
//! blocks the referencing block may reference: its upstream blocks, the
//! start block, and the containers it sits in.

use crate::error::BlockError;
use crate::execution::IterationInfo;
use blockflow_core::BlockId;
use blockflow_workflow::container::{
    CONTEXT_CURRENT_ITEM, CONTEXT_CURRENT_ITERATION, CONTEXT_INDEX, CONTEXT_ITEMS,
};
use blockflow_workflow::variable::normalize_variable_name;
use blockflow_workflow::{
    ContainerKind, PathSegment, Reference, ReferenceRoot, ScopeResolver, SubBlockValues,
    WorkflowSource, find_references,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// One entered container iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: ContainerKind,
    pub container_id: BlockId,
    pub index: usize,
    /// The distributed collection, when the container iterates one.
    pub items: Option<JsonValue>,
}

impl Frame {
    #[must_use]
    pub fn new(kind: ContainerKind, container_id: BlockId, index: usize) -> Self {
        Self {
            kind,
            container_id,
            index,
            items: None,
        }
    }

    #[must_use]
    pub fn with_items(mut self, items: JsonValue) -> Self {
        self.items = Some(items);
        self
    }

    /// Value of a contextual variable such as `index` or `currentItem`.
    #[must_use]
    pub fn value(&self, variable: &str) -> Option<JsonValue> {
        match variable {
            CONTEXT_INDEX => Some(JsonValue::from(self.index)),
            CONTEXT_CURRENT_ITERATION if self.kind == ContainerKind::Loop => {
                Some(JsonValue::from(self.index + 1))
            }
            CONTEXT_CURRENT_ITEM => self.items.as_ref().map(|items| item_at(items, self.index)),
            CONTEXT_ITEMS => self.items.clone(),
            _ => None,
        }
    }
}

/// The element an iteration works on.
///
/// Object collections iterate their entries as `[key, value]` pairs.
fn item_at(items: &JsonValue, index: usize) -> JsonValue {
    match items {
        JsonValue::Array(values) => values.get(index).cloned().unwrap_or(JsonValue::Null),
        JsonValue::Object(entries) => entries
            .iter()
            .nth(index)
            .map(|(key, value)| JsonValue::Array(vec![JsonValue::from(key.clone()), value.clone()]))
            .unwrap_or(JsonValue::Null),
        _ => JsonValue::Null,
    }
}

/// Live values visible to references.
#[derive(Debug, Clone, Default)]
pub struct RunScope {
    names: Arc<HashMap<String, Vec<BlockId>>>,
    /// Blocks each block may reference.
    access: Arc<HashMap<BlockId, BTreeSet<BlockId>>>,
    outputs: HashMap<BlockId, JsonValue>,
    variables: HashMap<String, JsonValue>,
    frames: Vec<Frame>,
}

impl RunScope {
    /// Starts a scope with the snapshot's block names and variable values.
    #[must_use]
    pub fn new<S: WorkflowSource + ?Sized>(source: &S) -> Self {
        let resolver = ScopeResolver::new(source);
        let mut names: HashMap<String, Vec<BlockId>> = HashMap::new();
        let mut access = HashMap::new();
        for block in source.blocks().values() {
            names
                .entry(block.normalized_name())
                .or_default()
                .push(block.id.clone());
            access.insert(block.id.clone(), resolver.resolve(&block.id).blocks);
        }
        let variables = source
            .variables()
            .iter()
            .map(|variable| (variable.normalized_name(), variable.value.clone()))
            .collect();

        Self {
            names: Arc::new(names),
            access: Arc::new(access),
            outputs: HashMap::new(),
            variables,
            frames: Vec::new(),
        }
    }

    pub fn record_output(&mut self, block_id: BlockId, output: JsonValue) {
        self.outputs.insert(block_id, output);
    }

    pub fn set_variable(&mut self, name: &str, value: JsonValue) {
        self.variables.insert(normalize_variable_name(name), value);
    }

    #[must_use]
    pub fn variables(&self) -> &HashMap<String, JsonValue> {
        &self.variables
    }

    /// Adopts the variables left by a nested scope.
    pub fn replace_variables(&mut self, variables: HashMap<String, JsonValue>) {
        self.variables = variables;
    }

    /// A copy of this scope with one more iteration entered.
    #[must_use]
    pub fn enter(&self, frame: Frame) -> Self {
        let mut scope = self.clone();
        scope.frames.push(frame);
        scope
    }

    /// The innermost iteration, for event reporting.
    #[must_use]
    pub fn iteration(&self) -> Option<IterationInfo> {
        self.frames.last().map(|frame| IterationInfo {
            container_id: frame.container_id.clone(),
            index: frame.index,
        })
    }

    /// This scope as seen by `block_id`: only the blocks it may reference.
    #[must_use]
    pub fn seen_from(&self, block_id: &BlockId) -> BlockScope<'_> {
        BlockScope {
            scope: self,
            accessible: self.access.get(block_id),
        }
    }

    fn nearest_frame(&self, kind: ContainerKind) -> Option<&Frame> {
        self.frames.iter().rev().find(|frame| frame.kind == kind)
    }
}

/// A [`RunScope`] restricted to what one block may reference.
#[derive(Debug, Clone, Copy)]
pub struct BlockScope<'a> {
    scope: &'a RunScope,
    accessible: Option<&'a BTreeSet<BlockId>>,
}

impl BlockScope<'_> {
    /// Looks up the value a reference denotes.
    ///
    /// Returns `Ok(None)` when the root names nothing in this workflow, so
    /// the text is not a reference at all (`<div>` in a prompt).
    ///
    /// A `loop` or `parallel` head outside any container of that kind falls
    /// back to a block with that name.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedReference` when the root exists but has no value
    /// here or is not accessible, and `AmbiguousReference` when several
    /// accessible blocks share the name.
    pub fn lookup(&self, reference: &Reference) -> Result<Option<JsonValue>, BlockError> {
        let unresolved = || BlockError::UnresolvedReference {
            reference: reference.to_string(),
        };

        let (root, path) = match &reference.root {
            ReferenceRoot::Block(name) => {
                if !self.scope.names.contains_key(name) {
                    return Ok(None);
                }
                (self.block_output(name)?, reference.path.as_slice())
            }
            ReferenceRoot::Variable(name) => (
                self.scope.variables.get(name).cloned(),
                reference.path.as_slice(),
            ),
            ReferenceRoot::Loop | ReferenceRoot::Parallel => {
                let kind = if reference.root == ReferenceRoot::Loop {
                    ContainerKind::Loop
                } else {
                    ContainerKind::Parallel
                };
                match self.scope.nearest_frame(kind) {
                    Some(frame) => {
                        let Some((PathSegment::Key(variable), rest)) = reference.path.split_first()
                        else {
                            return Err(unresolved());
                        };
                        (frame.value(variable), rest)
                    }
                    None => (
                        self.block_output(kind.namespace())?,
                        reference.path.as_slice(),
                    ),
                }
            }
        };

        let root = root.ok_or_else(unresolved)?;
        navigate(&root, path).map(Some).ok_or_else(unresolved)
    }

    /// Output of the accessible block called `name`, if it has run.
    fn block_output(&self, name: &str) -> Result<Option<JsonValue>, BlockError> {
        let candidates: Vec<&BlockId> = self
            .scope
            .names
            .get(name)
            .into_iter()
            .flatten()
            .filter(|id| self.accessible.is_some_and(|accessible| accessible.contains(*id)))
            .collect();
        if candidates.len() > 1 {
            return Err(BlockError::AmbiguousReference {
                name: name.to_string(),
                candidates: candidates.into_iter().cloned().collect(),
            });
        }
        Ok(candidates
            .first()
            .and_then(|id| self.scope.outputs.get(*id))
            .cloned())
    }

    /// Substitutes every reference in a piece of text.
    ///
    /// Text that is exactly one reference takes the referenced value with its
    /// JSON type. Otherwise references are interpolated: strings verbatim,
    /// everything else as JSON text.
    ///
    /// # Errors
    ///
    /// Fails on the first reference that does not resolve.
    pub fn resolve_text(&self, text: &str) -> Result<JsonValue, BlockError> {
        let spans = find_references(text);
        if let [span] = spans.as_slice()
            && span.start == 0
            && span.end == text.len()
            && let Some(value) = self.lookup(&span.reference)?
        {
            return Ok(value);
        }

        let mut resolved = String::with_capacity(text.len());
        let mut from = 0;
        for span in spans {
            let Some(value) = self.lookup(&span.reference)? else {
                continue;
            };
            resolved.push_str(&text[from..span.start]);
            resolved.push_str(&display_value(&value));
            from = span.end;
        }
        resolved.push_str(&text[from..]);
        Ok(JsonValue::String(resolved))
    }

    /// Substitutes references in every string inside a JSON value.
    ///
    /// # Errors
    ///
    /// Fails on the first reference that does not resolve.
    pub fn resolve_value(&self, value: &JsonValue) -> Result<JsonValue, BlockError> {
        match value {
            JsonValue::String(text) => self.resolve_text(text),
            JsonValue::Array(values) => values
                .iter()
                .map(|value| self.resolve_value(value))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            JsonValue::Object(entries) => {
                let mut resolved = JsonMap::with_capacity(entries.len());
                for (key, value) in entries {
                    resolved.insert(key.clone(), self.resolve_value(value)?);
                }
                Ok(JsonValue::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Substitutes references in a block's merged configuration.
    ///
    /// # Errors
    ///
    /// Fails on the first reference that does not resolve.
    pub fn resolve_values(&self, values: SubBlockValues) -> Result<JsonMap<String, JsonValue>, BlockError> {
        let mut resolved = JsonMap::new();
        for (field, value) in values.into_json() {
            let value = self.resolve_value(&value)?;
            resolved.insert(field, value);
        }
        Ok(resolved)
    }
}

/// Follows a reference path into a value.
///
/// Numeric keys index arrays, so `<api.items.0>` and `<api.items[0]>` agree.
#[must_use]
pub fn navigate(value: &JsonValue, path: &[PathSegment]) -> Option<JsonValue> {
    let mut current = value;
    for segment in path {
        current = match (segment, current) {
            (PathSegment::Key(key), JsonValue::Object(entries)) => entries.get(key)?,
            (PathSegment::Key(key), JsonValue::Array(values)) => {
                values.get(key.parse::<usize>().ok()?)?
            }
            (PathSegment::Index(index), JsonValue::Array(values)) => values.get(*index)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn display_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_workflow::{Block, Variable, WorkflowSnapshot};
    use serde_json::json;

    /// start, a1, both "Send Email" blocks and pending all feed `reader`;
    /// `side` hangs off start on its own branch.
    fn snapshot() -> WorkflowSnapshot {
        let mut snapshot = WorkflowSnapshot::new()
            .with_block(Block::new("start", "starter", "Start"))
            .with_block(Block::new("a1", "agent", "Agent 1"))
            .with_block(Block::new("e1", "gmail", "Send Email"))
            .with_block(Block::new("e2", "gmail", "Send Email"))
            .with_block(Block::new("pending", "agent", "Pending"))
            .with_block(Block::new("side", "agent", "Side"))
            .with_block(Block::new("reader", "agent", "Reader"))
            .with_variable(Variable::new("v1", "API Key", json!("secret")))
            .connect("start", "side");
        for upstream in ["start", "a1", "e1", "e2", "pending"] {
            snapshot = snapshot.connect(upstream, "reader");
        }
        snapshot
    }

    fn scope() -> RunScope {
        let mut scope = RunScope::new(&snapshot());
        scope.record_output(
            BlockId::new("a1"),
            json!({"content": "hello", "tokens": {"total": 12}, "items": [{"id": 7}]}),
        );
        scope.record_output(BlockId::new("side"), json!({"content": "secret"}));
        scope
    }

    fn resolve(scope: &RunScope, text: &str) -> Result<JsonValue, BlockError> {
        scope.seen_from(&BlockId::new("reader")).resolve_text(text)
    }

    #[test]
    fn exact_reference_keeps_json_type() {
        let scope = scope();
        assert_eq!(resolve(&scope, "<agent1.tokens.total>"), Ok(json!(12)));
        assert_eq!(resolve(&scope, "<agent1.items[0]>"), Ok(json!({"id": 7})));
        assert_eq!(resolve(&scope, "<agent1.items.0.id>"), Ok(json!(7)));
    }

    #[test]
    fn embedded_references_are_interpolated() {
        let scope = scope();
        assert_eq!(
            resolve(&scope, "Say <agent1.content> with <agent1.tokens>"),
            Ok(json!(r#"Say hello with {"total":12}"#))
        );
    }

    #[test]
    fn unknown_roots_stay_literal() {
        let scope = scope();
        assert_eq!(
            resolve(&scope, "<div>a < b</div>"),
            Ok(json!("<div>a < b</div>"))
        );
    }

    #[test]
    fn missing_values_fail() {
        let scope = scope();
        assert_eq!(
            resolve(&scope, "<agent1.missing>"),
            Err(BlockError::UnresolvedReference {
                reference: "agent1.missing".to_string()
            })
        );
        assert!(matches!(
            resolve(&scope, "x <pending.content>"),
            Err(BlockError::UnresolvedReference { .. })
        ));
        assert!(matches!(
            resolve(&scope, "<loop.index>"),
            Err(BlockError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn blocks_off_the_upstream_path_are_not_visible() {
        let scope = scope();
        assert_eq!(
            resolve(&scope, "<side.content>"),
            Err(BlockError::UnresolvedReference {
                reference: "side.content".to_string()
            })
        );

        let from_side = scope.seen_from(&BlockId::new("side"));
        assert!(from_side.resolve_text("<agent1.content>").is_err());
        assert!(
            scope
                .seen_from(&BlockId::new("deleted"))
                .resolve_text("<agent1.content>")
                .is_err()
        );
    }

    #[test]
    fn shared_names_are_ambiguous() {
        let scope = scope();
        let Err(BlockError::AmbiguousReference { name, candidates }) =
            resolve(&scope, "<sendemail.content>")
        else {
            panic!("expected ambiguity");
        };
        assert_eq!(name, "sendemail");
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn only_accessible_namesakes_count() {
        let snapshot = WorkflowSnapshot::new()
            .with_block(Block::new("start", "starter", "Start"))
            .with_block(Block::new("n1", "agent", "Notes"))
            .with_block(Block::new("n2", "agent", "Notes"))
            .with_block(Block::new("reader", "agent", "Reader"))
            .connect("start", "n1")
            .connect("start", "n2")
            .connect("n1", "reader");
        let mut scope = RunScope::new(&snapshot);
        scope.record_output(BlockId::new("n1"), json!({"text": "mine"}));
        scope.record_output(BlockId::new("n2"), json!({"text": "other"}));

        assert_eq!(resolve(&scope, "<notes.text>"), Ok(json!("mine")));
    }

    #[test]
    fn variables_resolve_by_stripped_name() {
        let mut scope = scope();
        assert_eq!(resolve(&scope, "<variable.APIKey>"), Ok(json!("secret")));
        scope.set_variable("count", json!(3));
        assert_eq!(resolve(&scope, "<variable.count>"), Ok(json!(3)));
        assert!(resolve(&scope, "<variable.nope>").is_err());
    }

    #[test]
    fn loop_frames_expose_context() {
        let frame = Frame::new(ContainerKind::Loop, BlockId::new("loop"), 1)
            .with_items(json!(["a", "b", "c"]));
        let scope = scope().enter(frame);

        assert_eq!(resolve(&scope, "<loop.index>"), Ok(json!(1)));
        assert_eq!(resolve(&scope, "<loop.currentIteration>"), Ok(json!(2)));
        assert_eq!(resolve(&scope, "<loop.currentItem>"), Ok(json!("b")));
        assert_eq!(resolve(&scope, "<loop.items[2]>"), Ok(json!("c")));
        assert!(resolve(&scope, "<parallel.index>").is_err());
        assert_eq!(scope.iteration().map(|i| i.index), Some(1));
    }

    #[test]
    fn nearest_frame_of_each_kind_wins() {
        let scope = scope()
            .enter(Frame::new(ContainerKind::Loop, BlockId::new("outer"), 4))
            .enter(Frame::new(ContainerKind::Parallel, BlockId::new("par"), 0))
            .enter(Frame::new(ContainerKind::Loop, BlockId::new("inner"), 2));

        assert_eq!(resolve(&scope, "<loop.index>"), Ok(json!(2)));
        assert_eq!(resolve(&scope, "<parallel.index>"), Ok(json!(0)));
        assert!(resolve(&scope, "<parallel.currentIteration>").is_err());
    }

    #[test]
    fn namespace_head_falls_back_to_a_block_outside_containers() {
        let snapshot = WorkflowSnapshot::new()
            .with_block(Block::new("start", "starter", "Start"))
            .with_block(Block::new("lp", "agent", "Loop"))
            .with_block(Block::new("reader", "agent", "Reader"))
            .connect("start", "lp")
            .connect("lp", "reader");
        let mut scope = RunScope::new(&snapshot);
        scope.record_output(BlockId::new("lp"), json!({"results": [1, 2]}));

        assert_eq!(resolve(&scope, "<loop.results>"), Ok(json!([1, 2])));
        assert!(resolve(&scope, "<parallel.results>").is_err());

        let inside = scope.enter(Frame::new(ContainerKind::Loop, BlockId::new("other"), 0));
        assert_eq!(resolve(&inside, "<loop.index>"), Ok(json!(0)));
        assert!(resolve(&inside, "<loop.results>").is_err());
    }

    #[test]
    fn object_collections_iterate_entries() {
        let frame = Frame::new(ContainerKind::Parallel, BlockId::new("p"), 0)
            .with_items(json!({"x": 1}));
        assert_eq!(frame.value("currentItem"), Some(json!(["x", 1])));
    }

    #[test]
    fn nested_values_resolve_recursively() {
        let scope = scope();
        let resolved = scope
            .seen_from(&BlockId::new("reader"))
            .resolve_value(&json!({"body": ["<agent1.content>", 5], "n": null}))
            .expect("resolve");
        assert_eq!(resolved, json!({"body": ["hello", 5], "n": null}));
    }
}
