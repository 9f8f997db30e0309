//! Reference tag engine.
//!
//! Builds the autocomplete namespace for a block: every tag the block may
//! insert, grouped and ordered the way the editor shows them:
//! - Workflow variables first
//! - Then loop and parallel context groups
//! - Then one group per accessible block, nearest to the start block first
//!
//! Inside a block group, tags with three or more segments are grouped under
//! their second segment (`agent1.tokens.total` sits under `tokens`) and
//! shorter tags are listed directly.
//!
//! A block whose reference name is a reserved namespace (`variable`, or
//! `loop`/`parallel` inside a container of that kind) cannot be referenced:
//! its tags would resolve to the namespace instead. Such blocks get no group
//! and are reported in [`TagSet::shadowed`].

use crate::block::BlockType;
use crate::container::{ContainerKind, LOOP_NAMESPACE, PARALLEL_NAMESPACE};
use crate::outputs::OutputTypeDeriver;
use crate::reference::{Insertion, insert_tag};
use crate::registry::Catalog;
use crate::schema::FieldType;
use crate::scope::{AccessibleScope, ContainerContext, ScopeResolver, context_variable_type};
use crate::snapshot::{LiveValues, WorkflowSource, merge_live_values};
use crate::variable::VARIABLE_NAMESPACE;
use blockflow_core::BlockId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// What a tag group stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagGroupKind {
    /// Context of the nearest enclosing loop.
    LoopContext,
    /// Context of the nearest enclosing parallel.
    ParallelContext,
    /// Outputs of an accessible block.
    Block,
}

/// A child tag inside a grouped entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTag {
    /// Path relative to the group's parent (`total` for `agent1.tokens.total`).
    pub display: String,
    pub tag: String,
}

/// One entry of a tag group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagEntry {
    /// A tag listed on its own.
    Direct { tag: String },
    /// Deeper tags gathered under their second segment.
    Grouped {
        parent: String,
        /// The parent's own tag, when the parent is itself a derived path.
        parent_tag: Option<String>,
        children: Vec<ChildTag>,
    },
}

impl TagEntry {
    /// The tag representing this entry in the flat navigable list.
    #[must_use]
    pub fn navigable_tag(&self) -> Option<&str> {
        match self {
            Self::Direct { tag } => Some(tag.as_str()),
            Self::Grouped { children, .. } => children.first().map(|child| child.tag.as_str()),
        }
    }
}

/// Tags contributed by one block or container context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTagGroup {
    pub block_id: BlockId,
    pub block_name: String,
    pub block_type: String,
    pub kind: TagGroupKind,
    /// BFS hops from the start block. `None` when unreachable.
    pub distance: Option<usize>,
    /// All tags of the group in derivation order.
    pub tags: Vec<String>,
    pub entries: Vec<TagEntry>,
}

/// A normalized name shared by several accessible blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameCollision {
    pub normalized_name: String,
    pub block_ids: Vec<BlockId>,
}

/// An accessible block whose name is taken by a reserved namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowedName {
    pub normalized_name: String,
    pub block_id: BlockId,
}

/// The complete tag namespace for one requesting block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSet {
    pub variable_tags: Vec<String>,
    pub groups: Vec<BlockTagGroup>,
    pub collisions: Vec<NameCollision>,
    pub shadowed: Vec<ShadowedName>,
    /// Tag → type for every tag in the set.
    pub types: BTreeMap<String, FieldType>,
}

impl TagSet {
    /// The flat keyboard-navigation order.
    ///
    /// Variables, then each group's entries, with a grouped entry represented
    /// by its first child.
    #[must_use]
    pub fn navigable(&self) -> Vec<&str> {
        self.variable_tags
            .iter()
            .map(String::as_str)
            .chain(
                self.groups
                    .iter()
                    .flat_map(|group| group.entries.iter().filter_map(TagEntry::navigable_tag)),
            )
            .collect()
    }

    /// Every tag in display order.
    #[must_use]
    pub fn all_tags(&self) -> Vec<&str> {
        self.variable_tags
            .iter()
            .chain(self.groups.iter().flat_map(|group| group.tags.iter()))
            .map(String::as_str)
            .collect()
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.types.contains_key(tag)
    }

    #[must_use]
    pub fn field_type(&self, tag: &str) -> Option<&FieldType> {
        self.types.get(tag)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variable_tags.is_empty() && self.groups.is_empty()
    }

    /// The text to insert for a selected tag.
    ///
    /// A file property reached through a `files` list addresses the first
    /// file: `x.attachments.url` becomes `x.attachments[0].url`.
    #[must_use]
    pub fn qualify(&self, tag: &str) -> String {
        if let Some((parent, property)) = tag.rsplit_once('.')
            && self.field_type(parent) == Some(&FieldType::Files)
        {
            return format!("{parent}[0].{property}");
        }
        tag.to_string()
    }

    /// Applies the insertion contract for a selected tag.
    #[must_use]
    pub fn select(&self, text: &str, cursor: usize, tag: &str) -> Option<Insertion> {
        insert_tag(text, cursor, &self.qualify(tag))
    }
}

/// Groups a block's tags for display.
///
/// Tags with at least three segments are gathered under their second
/// segment; a two-segment tag naming such a parent becomes the group's own
/// tag instead of a separate entry. Order of first appearance is kept.
#[must_use]
pub fn group_tags(tags: &[String]) -> Vec<TagEntry> {
    let parents: Vec<&str> = tags
        .iter()
        .filter_map(|tag| {
            let mut parts = tag.splitn(3, '.');
            let (_, parent, rest) = (parts.next(), parts.next()?, parts.next()?);
            (!rest.is_empty()).then_some(parent)
        })
        .collect();

    let mut entries: Vec<TagEntry> = Vec::new();
    let mut group_positions: HashMap<String, usize> = HashMap::new();
    let mut group_for = |entries: &mut Vec<TagEntry>, parent: &str| {
        *group_positions.entry(parent.to_string()).or_insert_with(|| {
            entries.push(TagEntry::Grouped {
                parent: parent.to_string(),
                parent_tag: None,
                children: Vec::new(),
            });
            entries.len() - 1
        })
    };

    for tag in tags {
        let mut parts = tag.splitn(3, '.');
        let (_, parent, rest) = (parts.next(), parts.next(), parts.next());
        match (parent, rest) {
            (Some(parent), Some(rest)) => {
                let position = group_for(&mut entries, parent);
                if let TagEntry::Grouped { children, .. } = &mut entries[position] {
                    children.push(ChildTag {
                        display: rest.to_string(),
                        tag: tag.clone(),
                    });
                }
            }
            (Some(parent), None) if parents.contains(&parent) => {
                let position = group_for(&mut entries, parent);
                if let TagEntry::Grouped { parent_tag, .. } = &mut entries[position] {
                    *parent_tag = Some(tag.clone());
                }
            }
            _ => entries.push(TagEntry::Direct { tag: tag.clone() }),
        }
    }
    entries
}

/// Produces tag sets over one snapshot.
pub struct TagEngine<'a, S: ?Sized, R: ?Sized> {
    source: &'a S,
    deriver: OutputTypeDeriver<'a, R>,
    live: &'a LiveValues,
    resolver: ScopeResolver<'a, S>,
    distances: Option<HashMap<BlockId, usize>>,
}

impl<'a, S, R> TagEngine<'a, S, R>
where
    S: WorkflowSource + ?Sized,
    R: Catalog + ?Sized,
{
    #[must_use]
    pub fn new(source: &'a S, registry: &'a R, live: &'a LiveValues) -> Self {
        let resolver = ScopeResolver::new(source);
        let distances = source
            .start_block()
            .map(|start| resolver.graph().distances_from(&start.id));
        Self {
            source,
            deriver: OutputTypeDeriver::new(registry),
            live,
            resolver,
            distances,
        }
    }

    /// The scope resolver this engine uses.
    #[must_use]
    pub fn resolver(&self) -> &ScopeResolver<'a, S> {
        &self.resolver
    }

    /// Builds the tag set for `block_id`.
    ///
    /// With `single_source`, only that block's group is returned, and only if
    /// it is accessible. A block that no longer exists gets an empty set; any
    /// other block gets at least the workflow variables.
    #[must_use]
    pub fn tags_for(&self, block_id: &BlockId, single_source: Option<&BlockId>) -> TagSet {
        if self.source.block(block_id).is_none() {
            return TagSet::default();
        }
        let scope = self.resolver.resolve(block_id);
        let shadowing = |id: &BlockId| {
            self.source
                .block(id)
                .and_then(|block| shadowing_namespace(&scope, &block.normalized_name()))
        };

        let mut set = TagSet::default();
        if let Some(source_id) = single_source {
            if let Some(context) = scope.contexts().find(|c| &c.container_id == source_id) {
                self.push_context(&mut set, context);
            } else if scope.contains(source_id)
                && shadowing(source_id).is_none()
                && let Some(group) = self.block_group(source_id, &mut set.types)
            {
                set.groups.push(group);
            }
            return set;
        }

        for variable in self.source.variables() {
            let tag = variable.tag();
            set.types.insert(tag.clone(), variable.field_type());
            set.variable_tags.push(tag);
        }

        for context in scope.contexts() {
            self.push_context(&mut set, context);
        }

        let mut block_groups: Vec<BlockTagGroup> = Vec::new();
        for id in scope.blocks.iter().filter(|id| !scope.is_context_container(id)) {
            if let Some(namespace) = shadowing(id) {
                tracing::warn!(
                    requesting_block = %block_id,
                    block = %id,
                    namespace,
                    "block name is hidden by a reserved namespace"
                );
                set.shadowed.push(ShadowedName {
                    normalized_name: namespace.to_string(),
                    block_id: id.clone(),
                });
                continue;
            }
            if let Some(group) = self.block_group(id, &mut set.types) {
                block_groups.push(group);
            }
        }
        block_groups.sort_by(|a, b| {
            (a.distance.is_none(), a.distance, &a.block_name, &a.block_id).cmp(&(
                b.distance.is_none(),
                b.distance,
                &b.block_name,
                &b.block_id,
            ))
        });

        set.collisions = find_name_collisions(&scope, |id| {
            self.source.block(id).map(|block| block.normalized_name())
        });
        for collision in &set.collisions {
            tracing::warn!(
                requesting_block = %block_id,
                name = %collision.normalized_name,
                blocks = ?collision.block_ids,
                "accessible blocks share a reference name"
            );
        }

        set.groups.extend(block_groups);
        set
    }

    fn push_context(&self, set: &mut TagSet, context: &ContainerContext) {
        let tags = context.tags();
        for (tag, variable) in tags.iter().zip(&context.variables) {
            set.types
                .insert(tag.clone(), context_variable_type(variable));
        }
        let kind = match context.kind {
            ContainerKind::Loop => TagGroupKind::LoopContext,
            ContainerKind::Parallel => TagGroupKind::ParallelContext,
        };
        set.groups.push(BlockTagGroup {
            block_id: context.container_id.clone(),
            block_name: context.container_name.clone(),
            block_type: context.kind.block_type().to_string(),
            kind,
            distance: self.distance(&context.container_id),
            entries: tags
                .iter()
                .map(|tag| TagEntry::Direct { tag: tag.clone() })
                .collect(),
            tags,
        });
    }

    fn block_group(
        &self,
        block_id: &BlockId,
        types: &mut BTreeMap<String, FieldType>,
    ) -> Option<BlockTagGroup> {
        let block = self.source.block(block_id)?;
        let values = merge_live_values(block, self.live.for_block(block_id));
        let outputs = self.deriver.derive(block, &values);

        for (tag, field_type) in outputs.typed_tags() {
            types.insert(tag, field_type);
        }
        let tags = outputs.tags();
        let entries = if block.block_type == BlockType::Variables {
            tags.iter()
                .map(|tag| TagEntry::Direct { tag: tag.clone() })
                .collect()
        } else {
            group_tags(&tags)
        };

        Some(BlockTagGroup {
            block_id: block_id.clone(),
            block_name: block.name.clone(),
            block_type: block.block_type.to_string(),
            kind: TagGroupKind::Block,
            distance: self.distance(block_id),
            tags,
            entries,
        })
    }

    fn distance(&self, block_id: &BlockId) -> Option<usize> {
        match &self.distances {
            Some(distances) => distances.get(block_id).copied(),
            None => Some(0),
        }
    }
}

/// The reserved namespace a block name resolves to in `scope`, if any.
///
/// `variable` is always reserved; `loop` and `parallel` only inside a
/// container of that kind.
#[must_use]
pub fn shadowing_namespace(scope: &AccessibleScope, normalized_name: &str) -> Option<&'static str> {
    match normalized_name {
        VARIABLE_NAMESPACE => Some(VARIABLE_NAMESPACE),
        LOOP_NAMESPACE if scope.loop_context.is_some() => Some(LOOP_NAMESPACE),
        PARALLEL_NAMESPACE if scope.parallel_context.is_some() => Some(PARALLEL_NAMESPACE),
        _ => None,
    }
}

/// Reports normalized names shared by distinct blocks in a scope.
pub fn find_name_collisions(
    scope: &AccessibleScope,
    normalized_name: impl Fn(&BlockId) -> Option<String>,
) -> Vec<NameCollision> {
    let mut by_name: BTreeMap<String, Vec<BlockId>> = BTreeMap::new();
    for id in &scope.blocks {
        if let Some(name) = normalized_name(id) {
            by_name.entry(name).or_default().push(id.clone());
        }
    }
    by_name
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(normalized_name, block_ids)| NameCollision {
            normalized_name,
            block_ids,
        })
        .collect()
}
