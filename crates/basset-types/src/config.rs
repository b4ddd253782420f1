//! Engine configuration types for Basset.
//!
//! `EngineConfig` is the top-level `config.toml` that controls timeouts,
//! the default retry policy, concurrency bounds and execution retention.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.basset/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to a leaf step when neither the step nor the workflow sets one.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// Overall execution timeout when the workflow does not set one.
    #[serde(default = "default_workflow_timeout_ms")]
    pub workflow_timeout_ms: u64,

    /// Retry policy for steps and workflows that carry none of their own.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Concurrency bound for parallel steps that do not set one.
    #[serde(default = "default_max_parallel_concurrency")]
    pub max_parallel_concurrency: usize,

    /// Hard cap on loop iterations when a loop does not set its own.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Terminal executions older than this are removed by cleanup.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Poll interval for predicate waits.
    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,

    /// Base URL of the HTTP browser bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_url: Option<String>,
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_workflow_timeout_ms() -> u64 {
    600_000
}

fn default_max_parallel_concurrency() -> usize {
    4
}

fn default_max_loop_iterations() -> u32 {
    1_000
}

fn default_retention_hours() -> u64 {
    24
}

fn default_wait_poll_interval_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: default_step_timeout_ms(),
            workflow_timeout_ms: default_workflow_timeout_ms(),
            retry: RetryPolicy::default(),
            max_parallel_concurrency: default_max_parallel_concurrency(),
            max_loop_iterations: default_max_loop_iterations(),
            retention_hours: default_retention_hours(),
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
            bridge_url: None,
        }
    }
}
