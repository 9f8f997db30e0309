//! Core domain types and utilities for blockflow.
//!
//! This crate provides the identifiers and error handling foundation shared
//! by the workflow model, the execution engine, and the server.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{BlockId, ExecutionId, ParseIdError, WorkflowId};
