//! Run and block execution states, and the events a run emits.

use blockflow_core::{BlockId, ExecutionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Accepted, not yet scheduling blocks.
    Queued,
    Running,
    /// Every scheduled block completed or was skipped.
    Completed,
    /// At least one block failed, or the snapshot was rejected.
    Failed,
    Cancelled,
}

impl ExecutionState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The latest known state of one block in a run.
///
/// Blocks inside containers run once per iteration; their state is that of
/// the most recent iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Running,
    Completed,
    Failed,
    /// Not run: disabled, or no incoming edge was active.
    Skipped,
}

/// Which container iteration an event belongs to.
///
/// Nested containers report the innermost iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationInfo {
    pub container_id: BlockId,
    pub index: usize,
}

/// Events emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
    BlockStarted {
        execution_id: ExecutionId,
        block_id: BlockId,
        block_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<IterationInfo>,
        timestamp: DateTime<Utc>,
    },
    /// A partial result streamed by a handler before it completes.
    BlockChunk {
        execution_id: ExecutionId,
        block_id: BlockId,
        chunk: String,
        timestamp: DateTime<Utc>,
    },
    BlockCompleted {
        execution_id: ExecutionId,
        block_id: BlockId,
        output: JsonValue,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<IterationInfo>,
        timestamp: DateTime<Utc>,
    },
    BlockFailed {
        execution_id: ExecutionId,
        block_id: BlockId,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<IterationInfo>,
        timestamp: DateTime<Utc>,
    },
    BlockSkipped {
        execution_id: ExecutionId,
        block_id: BlockId,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<IterationInfo>,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        execution_id: ExecutionId,
        output: JsonValue,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        execution_id: ExecutionId,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        block_id: Option<BlockId>,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    #[must_use]
    pub fn run_started(execution_id: ExecutionId) -> Self {
        Self::RunStarted {
            execution_id,
            timestamp: Utc::now(),
        }
    }

    /// Returns the run this event belongs to.
    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::BlockStarted { execution_id, .. }
            | Self::BlockChunk { execution_id, .. }
            | Self::BlockCompleted { execution_id, .. }
            | Self::BlockFailed { execution_id, .. }
            | Self::BlockSkipped { execution_id, .. }
            | Self::RunCompleted { execution_id, .. }
            | Self::RunFailed { execution_id, .. }
            | Self::RunCancelled { execution_id, .. } => *execution_id,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStarted { timestamp, .. }
            | Self::BlockStarted { timestamp, .. }
            | Self::BlockChunk { timestamp, .. }
            | Self::BlockCompleted { timestamp, .. }
            | Self::BlockFailed { timestamp, .. }
            | Self::BlockSkipped { timestamp, .. }
            | Self::RunCompleted { timestamp, .. }
            | Self::RunFailed { timestamp, .. }
            | Self::RunCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// The block an event is about, if any.
    #[must_use]
    pub fn block_id(&self) -> Option<&BlockId> {
        match self {
            Self::BlockStarted { block_id, .. }
            | Self::BlockChunk { block_id, .. }
            | Self::BlockCompleted { block_id, .. }
            | Self::BlockFailed { block_id, .. }
            | Self::BlockSkipped { block_id, .. } => Some(block_id),
            Self::RunFailed { block_id, .. } => block_id.as_ref(),
            _ => None,
        }
    }

    /// The snake_case event name, as used for the `type` tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::BlockStarted { .. } => "block_started",
            Self::BlockChunk { .. } => "block_chunk",
            Self::BlockCompleted { .. } => "block_completed",
            Self::BlockFailed { .. } => "block_failed",
            Self::BlockSkipped { .. } => "block_skipped",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
        }
    }

    /// The block state this event reports, for block lifecycle events.
    #[must_use]
    pub fn block_state(&self) -> Option<BlockState> {
        match self {
            Self::BlockStarted { .. } => Some(BlockState::Running),
            Self::BlockCompleted { .. } => Some(BlockState::Completed),
            Self::BlockFailed { .. } => Some(BlockState::Failed),
            Self::BlockSkipped { .. } => Some(BlockState::Skipped),
            _ => None,
        }
    }

    /// The run state this event moves the run into, for run-level events.
    #[must_use]
    pub fn run_state(&self) -> Option<ExecutionState> {
        match self {
            Self::RunStarted { .. } => Some(ExecutionState::Running),
            Self::RunCompleted { .. } => Some(ExecutionState::Completed),
            Self::RunFailed { .. } => Some(ExecutionState::Failed),
            Self::RunCancelled { .. } => Some(ExecutionState::Cancelled),
            _ => None,
        }
    }

    /// Returns true for the last event of a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.run_state().is_some_and(|state| state.is_terminal())
    }
}
