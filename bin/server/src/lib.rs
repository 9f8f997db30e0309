//! blockflow HTTP server.
//!
//! Exposes workflow execution (with server-sent event streams) and the
//! editor's reference-tag services over axum.

pub mod api;
pub mod config;
pub mod error;
pub mod routes;

use crate::api::ApiHandler;
use crate::config::ServerConfig;
use blockflow_executor::{ExecutionManager, Executor, HandlerRegistry};
use blockflow_workflow::Registry;
use blockflow_core::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors raised while assembling the application.
#[derive(Debug)]
pub enum StartupError {
    /// The block catalog could not be loaded.
    Registry { reason: String },
    /// The outbound HTTP client could not be built.
    HttpClient { reason: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry { reason } => write!(f, "failed to load block registry: {reason}"),
            Self::HttpClient { reason } => write!(f, "failed to build http client: {reason}"),
        }
    }
}

impl std::error::Error for StartupError {}

/// Shared state for all routes.
#[derive(Debug, Clone)]
pub struct AppState {
    pub executions: ExecutionManager,
    pub registry: Arc<Registry>,
}

impl AppState {
    /// Builds the registry, the handlers, and the execution manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog at `registry_path` cannot be read or
    /// parsed, or if the HTTP client cannot be built.
    pub fn from_config(config: &ServerConfig) -> Result<Self, StartupError> {
        let mut registry = Registry::builtin().map_err(|report| StartupError::Registry {
            reason: report.current_context().to_string(),
        })?;
        if let Some(path) = &config.registry_path {
            let document = std::fs::read_to_string(path).map_err(|e| StartupError::Registry {
                reason: format!("{}: {e}", path.display()),
            })?;
            registry
                .merge_json_str(&document)
                .map_err(|report| StartupError::Registry {
                    reason: format!("{}: {}", path.display(), report.current_context()),
                })?;
            tracing::info!(path = %path.display(), "merged block catalog");
        }

        let api = ApiHandler::new(Duration::from_secs(config.http_timeout_seconds)).map_err(|e| {
            StartupError::HttpClient {
                reason: e.to_string(),
            }
        })?;
        let handlers = HandlerRegistry::with_builtins().with_handler("api", api);
        let executor = Executor::new(handlers, config.executor.clone());

        Ok(Self {
            executions: ExecutionManager::new(executor),
            registry: Arc::new(registry),
        })
    }
}
