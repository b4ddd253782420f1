//! Event types for the Basset execution event bus.
//!
//! `ExecutionEvent` is broadcast as an execution moves through its lifecycle.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Events emitted while a workflow executes.
///
/// Consumed by the CLI progress display and by tests; never used for
/// control flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
        total_steps: usize,
    },

    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_type: String,
    },

    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    /// A step attempt failed. `will_retry` is false once attempts are exhausted.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        kind: ErrorKind,
        error: String,
        will_retry: bool,
    },

    RetryScheduled {
        execution_id: Uuid,
        step_id: String,
        /// The attempt about to run (1-based).
        attempt: u32,
        delay_ms: u64,
    },

    ExecutionPaused { execution_id: Uuid },

    ExecutionResumed { execution_id: Uuid },

    ExecutionCompleted {
        execution_id: Uuid,
        duration_ms: u64,
    },

    ExecutionFailed { execution_id: Uuid, error: String },

    ExecutionCancelled { execution_id: Uuid, reason: String },
}

impl ExecutionEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::StepFailed { execution_id, .. }
            | ExecutionEvent::RetryScheduled { execution_id, .. }
            | ExecutionEvent::ExecutionPaused { execution_id }
            | ExecutionEvent::ExecutionResumed { execution_id }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionFailed { execution_id, .. }
            | ExecutionEvent::ExecutionCancelled { execution_id, .. } => *execution_id,
        }
    }

    /// Whether this event ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::ExecutionCompleted { .. }
                | ExecutionEvent::ExecutionFailed { .. }
                | ExecutionEvent::ExecutionCancelled { .. }
        )
    }
}
