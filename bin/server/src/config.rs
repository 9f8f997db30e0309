//! Centralized server configuration.
//!
//! Loaded via the `config` crate from an optional file, then from
//! `BLOCKFLOW__`-prefixed environment variables, e.g.
//! `BLOCKFLOW__EXECUTOR__BLOCK_TIMEOUT_SECONDS=60`.
//!
//! See [`ExecutorConfig`] for execution limits.

use blockflow_executor::ExecutorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Server configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Catalog document merged over the built-in block registry.
    #[serde(default)]
    pub registry_path: Option<PathBuf>,

    /// Timeout for outbound requests made by `api` blocks, in seconds.
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

fn default_bind_address() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            registry_path: None,
            http_timeout_seconds: default_http_timeout_seconds(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Loads configuration from `file` (if given), then the environment.
    ///
    /// Environment values win over the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or a value is invalid.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file));
        }
        builder
            .add_source(
                config::Environment::with_prefix("BLOCKFLOW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
