//! Execution context: the mutable state that flows through one workflow run.
//!
//! `ExecutionContext` owns an [`ExecutionState`] and guards every lifecycle
//! transition. It records step results (with size limits to prevent unbounded
//! growth), binds step outputs into variables, resolves `${...}` references
//! and derives progress, duration and summaries for the control surface.

use std::collections::HashSet;

use basset_types::error::{ErrorKind, StepError};
use basset_types::execution::{
    ErrorInfo, Evidence, ExecutionState, ExecutionStatus, ExecutionSummary,
};
use basset_types::workflow::{StepNode, WorkflowDefinition};
use chrono::Utc;
use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

use super::expression::expression_context;
use super::substitution::{SubstitutionError, Substituter, lookup_path};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step result (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of recorded results and variables (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Output path that binds the whole step result.
pub const WHOLE_RESULT: &str = "$";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A lifecycle request that is not allowed from the current status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("cannot {action} execution in status '{from}'")]
    InvalidTransition {
        from: ExecutionStatus,
        action: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("context serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl From<ContextError> for StepError {
    fn from(err: ContextError) -> Self {
        StepError::internal(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable execution context for a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    state: ExecutionState,
}

impl ExecutionContext {
    /// Create a pending execution of `definition`.
    ///
    /// Variables start as the definition's seed overlaid with `inputs`.
    pub fn new(definition: WorkflowDefinition, inputs: Map<String, Value>) -> Self {
        let mut variables = definition.variables.clone();
        for (name, value) in &inputs {
            variables.insert(name.clone(), value.clone());
        }

        Self {
            state: ExecutionState {
                execution_id: Uuid::now_v7(),
                workflow_id: definition.id.clone(),
                workflow_name: definition.name.clone(),
                status: ExecutionStatus::Pending,
                inputs,
                variables,
                step_results: Map::new(),
                evidence: Vec::new(),
                current_path: Vec::new(),
                outputs: Map::new(),
                created_at: Utc::now(),
                start_time: None,
                end_time: None,
                error_info: None,
                cancel_reason: None,
                retry_records: Default::default(),
                error_stats: Default::default(),
                definition,
            },
        }
    }

    /// Wrap a state loaded from storage.
    pub fn from_state(state: ExecutionState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut ExecutionState {
        &mut self.state
    }

    pub fn into_state(self) -> ExecutionState {
        self.state
    }

    pub fn execution_id(&self) -> Uuid {
        self.state.execution_id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.status
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.state.definition
    }

    // -----------------------------------------------------------------------
    // Lifecycle transitions
    // -----------------------------------------------------------------------

    fn transition(
        &mut self,
        allowed: &[ExecutionStatus],
        to: ExecutionStatus,
        action: &'static str,
    ) -> Result<(), StateError> {
        if !allowed.contains(&self.state.status) {
            return Err(StateError::InvalidTransition {
                from: self.state.status,
                action,
            });
        }
        tracing::debug!(
            execution_id = %self.state.execution_id,
            from = %self.state.status,
            to = %to,
            "execution transition"
        );
        self.state.status = to;
        Ok(())
    }

    /// pending -> running
    pub fn start(&mut self) -> Result<(), StateError> {
        self.transition(&[ExecutionStatus::Pending], ExecutionStatus::Running, "start")?;
        self.state.start_time = Some(Utc::now());
        Ok(())
    }

    /// running -> paused
    pub fn pause(&mut self) -> Result<(), StateError> {
        self.transition(&[ExecutionStatus::Running], ExecutionStatus::Paused, "pause")
    }

    /// paused -> running
    pub fn resume(&mut self) -> Result<(), StateError> {
        self.transition(&[ExecutionStatus::Paused], ExecutionStatus::Running, "resume")
    }

    /// running -> completed
    pub fn complete(&mut self) -> Result<(), StateError> {
        self.transition(&[ExecutionStatus::Running], ExecutionStatus::Completed, "complete")?;
        self.state.end_time = Some(Utc::now());
        Ok(())
    }

    /// running -> failed
    pub fn fail(&mut self, error: ErrorInfo) -> Result<(), StateError> {
        self.transition(&[ExecutionStatus::Running], ExecutionStatus::Failed, "fail")?;
        self.state.error_info = Some(error);
        self.state.end_time = Some(Utc::now());
        Ok(())
    }

    /// pending | running | paused -> cancelled
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        self.transition(
            &[
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Paused,
            ],
            ExecutionStatus::Cancelled,
            "cancel",
        )?;
        self.state.cancel_reason = Some(reason.into());
        self.state.end_time = Some(Utc::now());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Variables and results
    // -----------------------------------------------------------------------

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.state.variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.state.variables.get(name)
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        self.state.variables.remove(name)
    }

    pub fn step_result(&self, key: &str) -> Option<&Value> {
        self.state.step_results.get(key)
    }

    /// Resolve every `${...}` reference inside `value`.
    ///
    /// Only variables still holding their definition or input seed are
    /// expanded recursively; step-produced values substitute verbatim.
    pub fn substitute(&self, value: &Value) -> Result<Value, SubstitutionError> {
        Substituter::new(&self.state.variables, &self.state.step_results)
            .with_seeds(&self.state.definition.variables, &self.state.inputs)
            .substitute(value)
    }

    /// Substitute a string parameter, rendering non-string results as text.
    pub fn substitute_str(&self, template: &str) -> Result<String, SubstitutionError> {
        Ok(match self.substitute(&Value::String(template.to_string()))? {
            Value::String(s) => s,
            other => super::substitution::value_to_string(&other),
        })
    }

    /// Read-only snapshot handed to the expression evaluator.
    pub fn expression_context(&self) -> Value {
        expression_context(&self.state.variables, &self.state.step_results)
    }

    /// Record the result of a step under `key`.
    ///
    /// Results over `MAX_STEP_OUTPUT_SIZE` are replaced by a truncation
    /// marker. Fails when the total context grows past `MAX_CONTEXT_SIZE`.
    pub fn record_step_result(
        &mut self,
        key: impl Into<String>,
        result: Value,
    ) -> Result<(), ContextError> {
        let key = key.into();
        let size = serialized_size(&result)?;

        if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                execution_id = %self.state.execution_id,
                step_id = key.as_str(),
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step result exceeds size limit, truncating"
            );
            let truncated = json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!(
                    "result exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"
                ),
            });
            self.state.step_results.insert(key, truncated);
        } else {
            self.state.step_results.insert(key, result);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::TooLarge {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        Ok(())
    }

    /// Bind fields of `result` into variables per the step's `outputs` map.
    ///
    /// A field missing from the result binds `null`.
    pub fn bind_outputs(&mut self, step: &StepNode, result: &Value) {
        for (path, variable) in &step.outputs {
            let value = if path == WHOLE_RESULT {
                result.clone()
            } else {
                let segments: Vec<&str> = path.split('.').collect();
                match lookup_path(result, &segments) {
                    Some(v) => v.clone(),
                    None => {
                        tracing::debug!(
                            step_id = step.id.as_str(),
                            path = path.as_str(),
                            "output path missing from result, binding null"
                        );
                        Value::Null
                    }
                }
            };
            self.state.variables.insert(variable.clone(), value);
        }
    }

    /// Serialized size of all results and variables in bytes.
    pub fn total_size(&self) -> usize {
        let results: usize = self
            .state
            .step_results
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum();
        let variables: usize = self
            .state
            .variables
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum();
        results + variables
    }

    pub fn add_evidence(
        &mut self,
        step_id: &str,
        kind: &str,
        label: Option<String>,
        data: Value,
    ) -> Uuid {
        let id = Uuid::now_v7();
        self.state.evidence.push(Evidence {
            id,
            step_id: step_id.to_string(),
            kind: kind.to_string(),
            label,
            data,
            captured_at: Utc::now(),
        });
        id
    }

    pub fn set_current_path(&mut self, path: Vec<usize>) {
        self.state.current_path = path;
    }

    /// Count an error in the diagnostic statistics.
    pub fn record_error(&mut self, step_id: &str, error: &StepError) {
        self.state
            .error_stats
            .record(step_id, error.kind(), &error.message());
    }

    pub fn set_outputs(&mut self, outputs: Map<String, Value>) {
        self.state.outputs = outputs;
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    /// Index of the first top-level step that has not fully completed.
    ///
    /// A nested path means the enclosing top-level step was interrupted and
    /// must run again as a whole.
    pub fn resume_index(&self) -> usize {
        match self.state.current_path.as_slice() {
            [] => 0,
            [top] => top + 1,
            [top, ..] => *top,
        }
    }

    /// Number of completed top-level steps.
    pub fn completed_steps(&self) -> usize {
        let total = self.state.definition.steps.len();
        if self.state.status == ExecutionStatus::Completed {
            return total;
        }
        self.resume_index().min(total)
    }

    /// Completed top-level steps as a percentage (0-100).
    pub fn progress(&self) -> f64 {
        let total = self.state.definition.steps.len();
        if total == 0 {
            return if self.state.status == ExecutionStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        self.completed_steps() as f64 / total as f64 * 100.0
    }

    /// Wall-clock time since start, up to the end time once terminal.
    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.state.start_time?;
        let end = self.state.end_time.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds().max(0) as u64)
    }

    pub fn summary(&self) -> ExecutionSummary {
        let state = &self.state;
        let error = state
            .error_info
            .as_ref()
            .map(|info| info.message.clone())
            .or_else(|| state.cancel_reason.clone());

        ExecutionSummary {
            execution_id: state.execution_id,
            workflow_id: state.workflow_id.clone(),
            workflow_name: state.workflow_name.clone(),
            status: state.status,
            progress: self.progress(),
            completed_steps: self.completed_steps(),
            total_steps: state.definition.steps.len(),
            duration_ms: self.duration_ms(),
            error_count: state.error_stats.total,
            error,
            evidence_count: state.evidence.len(),
            start_time: state.start_time,
            end_time: state.end_time,
        }
    }

    // -----------------------------------------------------------------------
    // Parallel branches
    // -----------------------------------------------------------------------

    /// Independent copy of this context for one parallel branch.
    ///
    /// The branch sees all current variables and results but starts with
    /// empty evidence, retry records and error statistics so its
    /// contributions can be merged back without double counting.
    pub fn fork_branch(&self) -> Self {
        let mut branch = self.clone();
        branch.state.evidence.clear();
        branch.state.retry_records.clear();
        branch.state.error_stats = Default::default();
        branch
    }

    /// Fold a finished branch back into this context.
    ///
    /// Every step result and evidence entry the branch produced is kept;
    /// only the variables named in `bound` are copied back.
    pub fn merge_branch(&mut self, branch: ExecutionContext, bound: &HashSet<String>) {
        let branch = branch.state;
        for (key, value) in branch.step_results {
            self.state.step_results.insert(key, value);
        }
        self.state.evidence.extend(branch.evidence);
        self.state.error_stats.merge(&branch.error_stats);
        for (name, value) in branch.variables {
            if bound.contains(&name) {
                self.state.variables.insert(name, value);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    pub fn to_json(&self) -> Result<Value, ContextError> {
        serde_json::to_value(&self.state).map_err(|e| ContextError::Serialization(e.to_string()))
    }

    pub fn from_json(value: Value) -> Result<Self, ContextError> {
        serde_json::from_value(value)
            .map(Self::from_state)
            .map_err(|e| ContextError::Serialization(format!("failed to restore context: {e}")))
    }
}

/// Build the `error_info` record for a failed step.
pub fn error_info(step_id: Option<&str>, error: &StepError, attempts: u32) -> ErrorInfo {
    ErrorInfo {
        step_id: step_id.map(str::to_string),
        kind: error.kind(),
        message: error.to_string(),
        attempts,
        occurred_at: Utc::now(),
    }
}

/// `error_info` for failures that did not come from a step.
pub fn workflow_error_info(kind: ErrorKind, message: impl Into<String>) -> ErrorInfo {
    ErrorInfo {
        step_id: None,
        kind,
        message: message.into(),
        attempts: 0,
        occurred_at: Utc::now(),
    }
}

fn serialized_size(value: &Value) -> Result<usize, ContextError> {
    serde_json::to_string(value)
        .map(|s| s.len())
        .map_err(|e| ContextError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
