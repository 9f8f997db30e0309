//! Dependency graph for scheduling one scope.
//!
//! A scope (the top level of a run, or one iteration of a container body)
//! is scheduled by shrinking a graph of the blocks it has not finished:
//! - completed and skipped blocks are removed, unblocking their successors
//! - failed blocks get a self-edge so they, and everything downstream, never
//!   become ready
//! - blocks with no incoming edges that are not already running are ready
//! - the scope is done when nothing is ready and nothing is running
//!
//! Whatever is still in the graph when the scope is done was held back by a
//! failure or caught in a cycle.

use blockflow_core::BlockId;
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use std::collections::{HashMap, HashSet};

/// The blocks of a scope that still need to run.
#[derive(Debug, Clone)]
pub struct RemainingWork {
    graph: StableDiGraph<BlockId, ()>,
    index: HashMap<BlockId, NodeIndex>,
    executing: HashSet<BlockId>,
}

impl RemainingWork {
    /// Builds the graph from a scope's blocks and the edges between them.
    ///
    /// Edges touching a block outside `blocks` are ignored.
    #[must_use]
    pub fn new<'a>(
        blocks: impl IntoIterator<Item = &'a BlockId>,
        edges: impl IntoIterator<Item = (&'a BlockId, &'a BlockId)>,
    ) -> Self {
        let mut graph = StableDiGraph::new();
        let mut index = HashMap::new();
        for block_id in blocks {
            index
                .entry(block_id.clone())
                .or_insert_with(|| graph.add_node(block_id.clone()));
        }
        for (source, target) in edges {
            if let (Some(&from), Some(&to)) = (index.get(source), index.get(target)) {
                graph.update_edge(from, to, ());
            }
        }

        Self {
            graph,
            index,
            executing: HashSet::new(),
        }
    }

    /// Marks a block as dispatched so it is no longer offered as ready.
    pub fn mark_executing(&mut self, block_id: &BlockId) {
        if self.index.contains_key(block_id) {
            self.executing.insert(block_id.clone());
        }
    }

    /// Removes a finished block, unblocking its successors.
    pub fn mark_completed(&mut self, block_id: &BlockId) {
        self.executing.remove(block_id);
        if let Some(idx) = self.index.remove(block_id) {
            self.graph.remove_node(idx);
        }
    }

    /// Skipped blocks unblock their successors like completed ones; the
    /// successors then decide for themselves whether to run.
    pub fn mark_skipped(&mut self, block_id: &BlockId) {
        self.mark_completed(block_id);
    }

    /// Pins a failed block in place so nothing downstream becomes ready.
    pub fn mark_failed(&mut self, block_id: &BlockId) {
        self.executing.remove(block_id);
        if let Some(&idx) = self.index.get(block_id) {
            self.graph.update_edge(idx, idx, ());
        }
    }

    /// Blocks with no pending predecessors that are not already running.
    #[must_use]
    pub fn ready(&self) -> Vec<BlockId> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .filter(|block_id| !self.executing.contains(*block_id))
            .cloned()
            .collect()
    }

    /// Returns true once nothing is ready and nothing is running.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.executing.is_empty() && self.ready().is_empty()
    }

    /// Blocks still in the graph, running and held-back ones included.
    #[must_use]
    pub fn remaining_count(&self) -> usize {
        self.graph.node_count()
    }
}
