//! Execution state types for Basset.
//!
//! `ExecutionState` is the durable record of one run of a workflow. It is
//! persisted as a single JSON document after every step and every lifecycle
//! transition, and is enough on its own to resume an interrupted run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
///
/// `pending -> running -> {paused <-> running} -> {completed | failed | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" | "canceled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution State
// ---------------------------------------------------------------------------

/// The durable record of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    /// Caller-supplied inputs after defaults were applied.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Keyed by step ID; loop iterations use `id[index]`, parallel branches `id.branch`.
    #[serde(default)]
    pub step_results: Map<String, Value>,
    /// Append-only captured artifacts.
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    /// Index path of the last completed step.
    #[serde(default)]
    pub current_path: Vec<usize>,
    /// Workflow outputs resolved on completion.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Live retry bookkeeping keyed by step ID.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub retry_records: HashMap<String, RetryRecord>,
    #[serde(default)]
    pub error_stats: ErrorStatistics,
    /// Snapshot of the definition this execution started from.
    pub definition: WorkflowDefinition,
}

/// Why an execution failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Originating step, if the failure came from a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    /// Attempts made on the failing step.
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

/// An artifact captured during a run (e.g. a screenshot reference).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: Uuid,
    pub step_id: String,
    /// Artifact kind (e.g. "screenshot").
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Opaque provider reference.
    pub data: Value,
    pub captured_at: DateTime<Utc>,
}

/// Per-step retry bookkeeping.
///
/// Created on the first failure of a step and discarded on success or when
/// attempts are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt_count: u32,
    pub last_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Error Statistics
// ---------------------------------------------------------------------------

/// Diagnostic error counters. Never consulted for control flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub total: u64,
    #[serde(default)]
    pub by_kind: BTreeMap<ErrorKind, u64>,
    #[serde(default)]
    pub by_step: BTreeMap<String, u64>,
    #[serde(default)]
    pub by_message: BTreeMap<String, u64>,
}

impl ErrorStatistics {
    /// Count one error.
    pub fn record(&mut self, step_id: &str, kind: ErrorKind, message: &str) {
        self.total += 1;
        *self.by_kind.entry(kind).or_default() += 1;
        *self.by_step.entry(step_id.to_string()).or_default() += 1;
        *self.by_message.entry(message.to_string()).or_default() += 1;
    }

    /// Fold another aggregate into this one.
    pub fn merge(&mut self, other: &ErrorStatistics) {
        self.total += other.total;
        for (kind, count) in &other.by_kind {
            *self.by_kind.entry(*kind).or_default() += count;
        }
        for (step, count) in &other.by_step {
            *self.by_step.entry(step.clone()).or_default() += count;
        }
        for (message, count) in &other.by_message {
            *self.by_message.entry(message.clone()).or_default() += count;
        }
    }

    /// The most frequent error message and its count.
    ///
    /// Ties resolve to the lexicographically smallest message.
    pub fn most_frequent(&self) -> Option<(&str, u64)> {
        self.by_message
            .iter()
            .fold(None, |best: Option<(&str, u64)>, (msg, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((msg.as_str(), *count)),
            })
    }
}

// ---------------------------------------------------------------------------
// Status reporting
// ---------------------------------------------------------------------------

/// Read-only status snapshot returned by the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    /// Completed top-level steps as a percentage (0-100).
    pub progress: f64,
    pub completed_steps: usize,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub evidence_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Query over persisted and live executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    /// Whether `state` passes every set criterion.
    pub fn matches(&self, state: &ExecutionState) -> bool {
        if self.status.is_some_and(|s| s != state.status) {
            return false;
        }
        if self
            .workflow_id
            .as_ref()
            .is_some_and(|id| *id != state.workflow_id)
        {
            return false;
        }
        if self.created_after.is_some_and(|t| state.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| state.created_at > t) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_serde_and_parse() {
        let json = serde_json::to_string(&ExecutionStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(
            "Running".parse::<ExecutionStatus>().unwrap(),
            ExecutionStatus::Running
        );
        assert!("sleeping".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_error_statistics_record_and_most_frequent() {
        let mut stats = ErrorStatistics::default();
        stats.record("open", ErrorKind::Timeout, "navigation timed out");
        stats.record("open", ErrorKind::Timeout, "navigation timed out");
        stats.record("click", ErrorKind::ElementNotFound, "#go missing");

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_kind[&ErrorKind::Timeout], 2);
        assert_eq!(stats.by_step["click"], 1);
        assert_eq!(stats.most_frequent(), Some(("navigation timed out", 2)));
    }

    #[test]
    fn test_error_statistics_merge() {
        let mut a = ErrorStatistics::default();
        a.record("x", ErrorKind::Network, "reset");
        let mut b = ErrorStatistics::default();
        b.record("x", ErrorKind::Network, "reset");
        b.record("y", ErrorKind::Quota, "limit");

        a.merge(&b);
        assert_eq!(a.total, 3);
        assert_eq!(a.by_step["x"], 2);
        assert_eq!(a.by_kind[&ErrorKind::Quota], 1);
    }

    #[test]
    fn test_error_statistics_serialize_kind_keys() {
        let mut stats = ErrorStatistics::default();
        stats.record("s", ErrorKind::StaleReference, "detached");
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["by_kind"]["stale_reference"], 1);
    }
}
