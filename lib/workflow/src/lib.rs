//! Workflow graph model and analysis for blockflow.
//!
//! This crate holds everything that can be answered from a workflow snapshot
//! without running it:
//!
//! - **Model**: Blocks, edges, loop/parallel containers, and variables
//! - **Graph Index**: Adjacency and BFS distances using petgraph
//! - **Scope Resolution**: Which upstream blocks a block may reference
//! - **Output Typing**: Dynamic path → type tables per block configuration
//! - **Reference Tags**: Autocomplete namespace, grouping, and insertion
//!
//! Everything here is synchronous and side-effect free; callers pass an
//! immutable snapshot and get owned results back.

pub mod block;
pub mod container;
pub mod edge;
pub mod error;
pub mod graph;
pub mod outputs;
pub mod reference;
pub mod registry;
pub mod schema;
pub mod scope;
pub mod snapshot;
pub mod tags;
pub mod variable;

pub use block::{Block, BlockType, SubBlock, SubBlockValues, normalize_name};
pub use container::{ContainerIndex, ContainerKind, Loop, LoopType, Parallel, ParallelType};
pub use edge::Edge;
pub use error::{GraphError, RegistryError};
pub use graph::GraphIndex;
pub use outputs::{DerivedOutputs, OutputSource, OutputTypeDeriver};
pub use reference::{Insertion, PathSegment, Reference, ReferenceRoot, find_references, insert_tag};
pub use registry::{
    BlockCategory, BlockConfig, BlockConfigRegistry, Catalog, Registry, ToolConfig, ToolRegistry,
    TriggerConfig, TriggerRegistry,
};
pub use schema::{FieldType, OutputPath, OutputSchema, OutputShape};
pub use scope::{AccessibleScope, ContainerContext, ScopeResolver};
pub use snapshot::{LiveValues, WorkflowSnapshot, WorkflowSource, merge_live_values};
pub use tags::{BlockTagGroup, NameCollision, ShadowedName, TagEngine, TagEntry, TagSet};
pub use variable::Variable;
