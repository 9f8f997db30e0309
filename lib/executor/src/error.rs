//! Error types for the execution engine.
//!
//! - `BlockError`: why a single block failed; reported on the event stream
//!   and never aborts sibling branches
//! - `HandlerError`: what a block handler returns
//! - `ExecutorError`: why a run could not be started or looked up

use blockflow_core::{BlockId, ExecutionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors returned by block handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerError {
    /// The block's configuration is unusable.
    InvalidInput { message: String },
    /// The handler ran and failed.
    ExecutionFailed { message: String },
    /// A remote service answered with an error.
    ExternalServiceError { service: String, message: String },
}

impl HandlerError {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::ExecutionFailed { message } => write!(f, "execution failed: {message}"),
            Self::ExternalServiceError { service, message } => {
                write!(f, "external service error ({service}): {message}")
            }
        }
    }
}

impl std::error::Error for HandlerError {}

/// Why a block failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockError {
    /// A reference in the block's configuration has no value in this run.
    UnresolvedReference { reference: String },
    /// A reference names a block whose normalized name is shared.
    AmbiguousReference {
        name: String,
        candidates: Vec<BlockId>,
    },
    /// No handler is registered for the block type.
    MissingHandler { block_type: String },
    /// The block's configuration cannot be interpreted.
    InvalidConfig { message: String },
    /// The handler returned an error.
    Handler { error: HandlerError },
    /// The handler did not finish within the configured time.
    Timeout { seconds: u64 },
    /// A block inside a loop or parallel failed.
    ContainerFailed {
        block_id: BlockId,
        message: String,
    },
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedReference { reference } => {
                write!(f, "reference <{reference}> did not resolve")
            }
            Self::AmbiguousReference { name, candidates } => {
                write!(f, "reference name {name} matches {} blocks", candidates.len())
            }
            Self::MissingHandler { block_type } => {
                write!(f, "no handler registered for block type {block_type}")
            }
            Self::InvalidConfig { message } => write!(f, "invalid configuration: {message}"),
            Self::Handler { error } => write!(f, "{error}"),
            Self::Timeout { seconds } => write!(f, "block timed out after {seconds}s"),
            Self::ContainerFailed { block_id, message } => {
                write!(f, "member {block_id} failed: {message}")
            }
        }
    }
}

impl std::error::Error for BlockError {}

impl From<HandlerError> for BlockError {
    fn from(error: HandlerError) -> Self {
        Self::Handler { error }
    }
}

/// Errors starting or managing runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The snapshot failed structural validation.
    InvalidWorkflow { block_id: BlockId, reason: String },
    /// No run with this id is known.
    RunNotFound { execution_id: ExecutionId },
    /// The run has already finished.
    RunAlreadyTerminal { execution_id: ExecutionId },
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidWorkflow { block_id, reason } => {
                write!(f, "invalid workflow at block {block_id}: {reason}")
            }
            Self::RunNotFound { execution_id } => write!(f, "run not found: {execution_id}"),
            Self::RunAlreadyTerminal { execution_id } => {
                write!(f, "run already in terminal state: {execution_id}")
            }
        }
    }
}

impl std::error::Error for ExecutorError {}
