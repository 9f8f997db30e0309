//! Workflow execution for blockflow.
//!
//! Runs an immutable [`WorkflowSnapshot`](blockflow_workflow::WorkflowSnapshot):
//!
//! - **Engine**: Dependency-driven scheduling with condition routing,
//!   loops, and parallels
//! - **Resolution**: Reference substitution against live run outputs
//! - **Handlers**: Per-block-type behavior behind [`BlockHandler`]
//! - **Events**: Versioned, ordered run events fanned out to subscribers
//!
//! Runs own their state; nothing outlives a run except its [`RunSummary`].

pub mod condition;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod execution;
pub mod handler;
pub mod hub;
pub mod remaining_work;
pub mod resolve;

pub use config::ExecutorConfig;
pub use engine::{Executor, RunOutcome};
pub use envelope::Envelope;
pub use error::{BlockError, ExecutorError, HandlerError};
pub use execution::{BlockState, ExecutionEvent, ExecutionState, IterationInfo};
pub use handler::{BlockHandler, HandlerContext, HandlerInputs, HandlerRegistry};
pub use hub::{EventHub, EventReceiver, EventSink, ExecutionManager, RunSummary};
pub use remaining_work::RemainingWork;
pub use resolve::{BlockScope, Frame, RunScope};
