//! HTTP error responses.
//!
//! Domain errors are mapped to a status code and a user-safe JSON body
//! `{ "error": "..." }`; details stay in the logs.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use blockflow_executor::ExecutorError;
use blockflow_workflow::GraphError;
use rootcause::prelude::Report;
use serde_json::json;
use std::fmt;

/// Errors returned by API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The path did not hold a valid execution id.
    InvalidExecutionId { id: String, reason: String },
    /// No run with this id is known.
    RunNotFound { id: String },
    /// The run has already finished.
    RunFinished { id: String },
    /// The submitted workflow cannot run.
    InvalidWorkflow { block_id: String, reason: String },
    /// A tag cannot be inserted at the cursor.
    NoOpenReference { cursor: usize },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidExecutionId { id, reason } => {
                write!(f, "invalid execution id '{id}': {reason}")
            }
            Self::RunNotFound { id } => write!(f, "run '{id}' not found"),
            Self::RunFinished { id } => write!(f, "run '{id}' has already finished"),
            Self::InvalidWorkflow { block_id, reason } => {
                write!(f, "invalid workflow at block '{block_id}': {reason}")
            }
            Self::NoOpenReference { cursor } => {
                write!(f, "no open reference before position {cursor}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl From<Report<ExecutorError>> for ApiError {
    fn from(report: Report<ExecutorError>) -> Self {
        match report.current_context() {
            ExecutorError::RunNotFound { execution_id } => Self::RunNotFound {
                id: execution_id.to_string(),
            },
            ExecutorError::RunAlreadyTerminal { execution_id } => Self::RunFinished {
                id: execution_id.to_string(),
            },
            ExecutorError::InvalidWorkflow { block_id, reason } => Self::InvalidWorkflow {
                block_id: block_id.to_string(),
                reason: reason.clone(),
            },
        }
    }
}

impl From<Report<GraphError>> for ApiError {
    fn from(report: Report<GraphError>) -> Self {
        let error = report.current_context();
        Self::InvalidWorkflow {
            block_id: error.block_id().to_string(),
            reason: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidExecutionId { .. } => StatusCode::BAD_REQUEST,
            Self::RunNotFound { .. } => StatusCode::NOT_FOUND,
            Self::RunFinished { .. } => StatusCode::CONFLICT,
            Self::InvalidWorkflow { .. } | Self::NoOpenReference { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
        };
        tracing::debug!(%status, error = %self, "request failed");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
