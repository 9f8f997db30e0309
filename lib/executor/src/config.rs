//! Execution limits.

use serde::Deserialize;
use std::time::Duration;

/// Limits applied to every run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on a single handler call, in seconds.
    #[serde(default = "default_block_timeout_seconds")]
    pub block_timeout_seconds: u64,

    /// Loops configured for more iterations than this are clamped.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,

    /// Parallels configured for more branches than this are clamped.
    #[serde(default = "default_max_parallel_branches")]
    pub max_parallel_branches: usize,
}

fn default_block_timeout_seconds() -> u64 {
    300
}

fn default_max_loop_iterations() -> usize {
    1000
}

fn default_max_parallel_branches() -> usize {
    100
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            block_timeout_seconds: default_block_timeout_seconds(),
            max_loop_iterations: default_max_loop_iterations(),
            max_parallel_branches: default_max_parallel_branches(),
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_config_has_correct_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.block_timeout(), Duration::from_secs(300));
        assert_eq!(config.max_loop_iterations, 1000);
        assert_eq!(config.max_parallel_branches, 100);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: ExecutorConfig =
            serde_json::from_str(r#"{"max_loop_iterations": 10}"#).expect("parse");
        assert_eq!(config.max_loop_iterations, 10);
        assert_eq!(config.block_timeout_seconds, 300);
    }
}
