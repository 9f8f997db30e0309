//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `GraphError`: structural problems in a snapshot (container membership)
//! - `RegistryError`: block, tool, or trigger catalogs that fail to load

use blockflow_core::BlockId;
use std::fmt;

/// Structural errors in a workflow snapshot.
///
/// Editing never fails on these; they are raised when a snapshot is
/// validated ahead of execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A block is listed as a member of two containers.
    ContainerMembershipConflict {
        block_id: BlockId,
        first_container: BlockId,
        second_container: BlockId,
    },
    /// A container lists a member that is not a block in the snapshot.
    UnknownMember {
        container_id: BlockId,
        block_id: BlockId,
    },
    /// A container is described but no block of the matching type exists.
    ContainerBlockMissing { container_id: BlockId },
    /// Containers are nested inside each other in a cycle.
    MalformedNesting { container_id: BlockId },
}

impl GraphError {
    /// The block the error is about.
    #[must_use]
    pub fn block_id(&self) -> &BlockId {
        match self {
            Self::ContainerMembershipConflict { block_id, .. }
            | Self::UnknownMember { block_id, .. } => block_id,
            Self::ContainerBlockMissing { container_id }
            | Self::MalformedNesting { container_id } => container_id,
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContainerMembershipConflict {
                block_id,
                first_container,
                second_container,
            } => {
                write!(
                    f,
                    "block {block_id} is a member of both {first_container} and {second_container}"
                )
            }
            Self::UnknownMember {
                container_id,
                block_id,
            } => {
                write!(f, "container {container_id} lists unknown member {block_id}")
            }
            Self::ContainerBlockMissing { container_id } => {
                write!(f, "container {container_id} has no matching block")
            }
            Self::MalformedNesting { container_id } => {
                write!(f, "container {container_id} is nested inside itself")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors loading a block, tool, or trigger catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The catalog document could not be parsed.
    InvalidDocument { reason: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDocument { reason } => write!(f, "invalid registry document: {reason}"),
        }
    }
}

impl std::error::Error for RegistryError {}
