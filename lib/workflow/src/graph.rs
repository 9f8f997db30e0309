//! Graph index over a workflow snapshot using petgraph.
//!
//! The index answers the structural questions the rest of the engine asks:
//! - Which blocks feed into a block (predecessors, ancestors)
//! - How far each block is from the start block (BFS hop counts)
//! - Where execution can begin (entry blocks)
//!
//! Edges whose endpoints no longer exist are ignored; snapshots taken while a
//! block is being deleted are routine.

use crate::snapshot::WorkflowSource;
use blockflow_core::BlockId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// Directed adjacency over a snapshot's blocks.
#[derive(Debug, Clone, Default)]
pub struct GraphIndex {
    /// Block ids as node weights; one graph edge per snapshot edge.
    graph: DiGraph<BlockId, ()>,
    /// Map from BlockId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<BlockId, NodeIndex>,
}

impl GraphIndex {
    /// Builds the index for a snapshot.
    #[must_use]
    pub fn build<S: WorkflowSource + ?Sized>(source: &S) -> Self {
        let mut graph = DiGraph::with_capacity(source.blocks().len(), source.edges().len());
        let mut node_index_map = HashMap::with_capacity(source.blocks().len());
        for id in source.blocks().keys() {
            let index = graph.add_node(id.clone());
            node_index_map.insert(id.clone(), index);
        }

        for edge in source.edges() {
            let (Some(&from), Some(&to)) = (
                node_index_map.get(&edge.source),
                node_index_map.get(&edge.target),
            ) else {
                tracing::trace!(source = %edge.source, target = %edge.target, "skipping dangling edge");
                continue;
            };
            graph.add_edge(from, to, ());
        }

        Self {
            graph,
            node_index_map,
        }
    }

    /// Returns true if the block is part of the graph.
    #[must_use]
    pub fn contains(&self, block_id: &BlockId) -> bool {
        self.node_index_map.contains_key(block_id)
    }

    /// Returns the number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Blocks with an edge into `block_id`.
    #[must_use]
    pub fn predecessors(&self, block_id: &BlockId) -> Vec<&BlockId> {
        self.neighbors(block_id, Direction::Incoming)
    }

    /// Blocks with an edge from `block_id`.
    #[must_use]
    pub fn successors(&self, block_id: &BlockId) -> Vec<&BlockId> {
        self.neighbors(block_id, Direction::Outgoing)
    }

    fn neighbors(&self, block_id: &BlockId, direction: Direction) -> Vec<&BlockId> {
        let Some(&index) = self.node_index_map.get(block_id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        self.graph
            .neighbors_directed(index, direction)
            .filter(|neighbor| seen.insert(*neighbor))
            .filter_map(|neighbor| self.graph.node_weight(neighbor))
            .collect()
    }

    /// Blocks with no incoming edges.
    #[must_use]
    pub fn entry_blocks(&self) -> Vec<&BlockId> {
        self.graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|index| self.graph.node_weight(index))
            .collect()
    }

    /// Breadth-first hop counts from `root`.
    ///
    /// The root itself is at distance 0. Blocks that cannot be reached are
    /// absent. An unknown root yields an empty map.
    #[must_use]
    pub fn distances_from(&self, root: &BlockId) -> HashMap<BlockId, usize> {
        let mut distances = HashMap::new();
        let Some(&start) = self.node_index_map.get(root) else {
            return distances;
        };

        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((index, distance)) = queue.pop_front() {
            distances.insert(self.graph[index].clone(), distance);
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if visited.insert(next) {
                    queue.push_back((next, distance + 1));
                }
            }
        }
        distances
    }

    /// Every block that reaches `block_id` through some path.
    ///
    /// The block itself is never included, even when it sits on a cycle.
    #[must_use]
    pub fn ancestors(&self, block_id: &BlockId) -> HashSet<BlockId> {
        self.reachable(block_id, Direction::Incoming)
    }

    /// Every block reachable from `block_id`, excluding the block itself.
    #[must_use]
    pub fn descendants(&self, block_id: &BlockId) -> HashSet<BlockId> {
        self.reachable(block_id, Direction::Outgoing)
    }

    fn reachable(&self, block_id: &BlockId, direction: Direction) -> HashSet<BlockId> {
        let mut found = HashSet::new();
        let Some(&start) = self.node_index_map.get(block_id) else {
            return found;
        };

        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, direction) {
                if visited.insert(next) {
                    found.insert(self.graph[next].clone());
                    queue.push_back(next);
                }
            }
        }
        found
    }
}
