//! Workflow executor: orchestrates whole runs with pause, resume and cancel.
//!
//! The `WorkflowExecutor` walks the top-level step list of a definition in
//! order, handing each node to the [`StepExecutor`]. Execution state is
//! checkpointed to the KV store after every lifecycle transition and every
//! completed top-level step, so a paused or interrupted run resumes at the
//! top-level step containing its last incomplete step.
//!
//! # Execution flow
//!
//! 1. Load the definition from the workflow store, validate it, bind inputs.
//! 2. Create the execution context and persist it as `pending`.
//! 3. Register a live handle (one per execution id) and transition to
//!    `running`.
//! 4. A spawned task dispatches top-level steps under the workflow timeout.
//! 5. On completion/failure/pause/cancellation, persist the final state,
//!    publish the matching event and drop the live handle.

use std::sync::Arc;
use std::time::Duration;

use basset_types::config::EngineConfig;
use basset_types::error::{ErrorKind, StepError};
use basset_types::event::ExecutionEvent;
use basset_types::execution::{
    ExecutionFilter, ExecutionState, ExecutionStatus, ExecutionSummary,
};
use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::event::EventBus;
use crate::storage::KvStore;
use crate::store::WorkflowStore;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{ExecutionContext, StateError, error_info, workflow_error_info};
use super::definition::{DefinitionError, bind_inputs, validate_definition};
use super::keyed_lock::KeyedLocks;
use super::registry::{ExecutionHandle, ExecutionRegistry, RegistryError};
use super::step_executor::{DispatchError, Providers, StepExecutor};
use super::substitution::lookup_path;

/// Cancel reason recorded when the caller gives none.
pub const DEFAULT_CANCEL_REASON: &str = "cancelled by user";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from workflow executor control operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow unavailable: {0}")]
    Workflow(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("execution {0} is not running")]
    NotRunning(Uuid),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

struct Inner<K: KvStore> {
    workflows: WorkflowStore<Arc<K>>,
    checkpoint: CheckpointManager<Arc<K>>,
    registry: ExecutionRegistry,
    /// Serializes `resume` and `cancel` of the same execution.
    control: KeyedLocks,
    steps: StepExecutor,
    event_bus: EventBus,
    config: Arc<EngineConfig>,
}

/// Runs workflow executions and exposes their control surface.
///
/// Generic over `K: KvStore`; definitions and execution records share the
/// same store. Cloning is cheap and every clone drives the same registry.
pub struct WorkflowExecutor<K: KvStore + 'static> {
    inner: Arc<Inner<K>>,
}

impl<K: KvStore + 'static> Clone for WorkflowExecutor<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: KvStore + 'static> WorkflowExecutor<K> {
    pub fn new(
        kv: Arc<K>,
        providers: Providers,
        config: EngineConfig,
        event_bus: EventBus,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            inner: Arc::new(Inner {
                workflows: WorkflowStore::new(Arc::clone(&kv)),
                checkpoint: CheckpointManager::new(kv),
                registry: ExecutionRegistry::new(),
                control: KeyedLocks::new(),
                steps: StepExecutor::new(providers, Arc::clone(&config), event_bus.clone()),
                event_bus,
                config,
            }),
        }
    }

    pub fn workflows(&self) -> &WorkflowStore<Arc<K>> {
        &self.inner.workflows
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.inner.registry
    }

    /// Start a new execution of a stored workflow.
    ///
    /// Returns as soon as the execution is running; use [`wait`](Self::wait)
    /// to block until it settles.
    pub async fn execute(
        &self,
        workflow_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<Uuid, ExecutorError> {
        let definition = self
            .inner
            .workflows
            .get(workflow_id)
            .await
            .into_result()
            .map_err(ExecutorError::Workflow)?;
        validate_definition(&definition)?;
        let inputs = bind_inputs(&definition, inputs)?;

        let ctx = ExecutionContext::new(definition, inputs);
        self.inner.checkpoint.save(ctx.state()).await?;

        let execution_id = ctx.execution_id();
        tracing::info!(
            execution_id = %execution_id,
            workflow_id,
            "created execution"
        );
        self.launch(ctx).await?;
        Ok(execution_id)
    }

    /// Ask a running execution to pause at its next step boundary.
    pub async fn pause(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        let handle = self
            .inner
            .registry
            .get(&execution_id)
            .ok_or(ExecutorError::NotRunning(execution_id))?;
        handle.signals().request_pause();

        tracing::info!(execution_id = %execution_id, "pause requested");
        Ok(())
    }

    /// Resume a paused execution from its last checkpoint.
    ///
    /// Also recovers executions persisted as `running` whose driving task is
    /// gone (process crash).
    pub async fn resume(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        // Held until the handle is registered, so a concurrent cancel either
        // settles the stored record first or signals the live handle.
        let _control = self.inner.control.lock(execution_id).await;
        if self.inner.registry.contains(&execution_id) {
            return Err(RegistryError::AlreadyRunning(execution_id).into());
        }
        let state = self
            .inner
            .checkpoint
            .load(&execution_id)
            .await?
            .ok_or(ExecutorError::NotFound(execution_id))?;

        match state.status {
            ExecutionStatus::Paused | ExecutionStatus::Running => {}
            from => {
                return Err(StateError::InvalidTransition {
                    from,
                    action: "resume",
                }
                .into());
            }
        }

        self.launch(ExecutionContext::from_state(state)).await
    }

    /// Cancel an execution.
    ///
    /// Live executions are signalled and settle on their own; pending or
    /// paused ones are cancelled directly in the store.
    pub async fn cancel(
        &self,
        execution_id: Uuid,
        reason: Option<String>,
    ) -> Result<(), ExecutorError> {
        let reason = reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        let _control = self.inner.control.lock(execution_id).await;

        if let Some(handle) = self.inner.registry.get(&execution_id) {
            tracing::info!(
                execution_id = %execution_id,
                reason = reason.as_str(),
                "cancel requested"
            );
            handle.cancel(reason);
            return Ok(());
        }

        let state = self
            .inner
            .checkpoint
            .load(&execution_id)
            .await?
            .ok_or(ExecutorError::NotFound(execution_id))?;
        let mut ctx = ExecutionContext::from_state(state);
        ctx.cancel(reason.clone())?;
        self.inner.checkpoint.save(ctx.state()).await?;

        tracing::info!(
            execution_id = %execution_id,
            reason = reason.as_str(),
            "execution cancelled"
        );
        self.inner
            .event_bus
            .publish(ExecutionEvent::ExecutionCancelled { execution_id, reason });
        Ok(())
    }

    /// Full current state: the live snapshot if running, else the checkpoint.
    pub async fn get_state(&self, execution_id: Uuid) -> Result<ExecutionState, ExecutorError> {
        if let Some(handle) = self.inner.registry.get(&execution_id) {
            return Ok(handle.snapshot());
        }
        self.inner
            .checkpoint
            .load(&execution_id)
            .await?
            .ok_or(ExecutorError::NotFound(execution_id))
    }

    pub async fn get_status(&self, execution_id: Uuid) -> Result<ExecutionSummary, ExecutorError> {
        let state = self.get_state(execution_id).await?;
        Ok(ExecutionContext::from_state(state).summary())
    }

    /// Summaries of persisted executions passing `filter`, newest first.
    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionSummary>, ExecutorError> {
        let states = self.inner.checkpoint.list(filter).await?;
        Ok(states
            .into_iter()
            .map(|state| {
                let state = match self.inner.registry.get(&state.execution_id) {
                    Some(handle) => handle.snapshot(),
                    None => state,
                };
                ExecutionContext::from_state(state).summary()
            })
            .collect())
    }

    /// Wait until the execution is no longer live, then return its state.
    ///
    /// The settled snapshot is published only after the final checkpoint is
    /// written and the handle has left the registry.
    pub async fn wait(&self, execution_id: Uuid) -> Result<ExecutionState, ExecutorError> {
        if let Some(handle) = self.inner.registry.get(&execution_id) {
            let mut rx = handle.subscribe();
            drop(handle);
            loop {
                let settled = {
                    let state = rx.borrow_and_update();
                    state.status.is_terminal() || state.status == ExecutionStatus::Paused
                };
                if settled || rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.inner
            .checkpoint
            .load(&execution_id)
            .await?
            .ok_or(ExecutorError::NotFound(execution_id))
    }

    /// Delete terminal executions that ended more than `retention` ago.
    ///
    /// Returns the number of deleted records.
    pub async fn cleanup(&self, retention: Duration) -> Result<usize, ExecutorError> {
        let cutoff = chrono::Duration::from_std(retention)
            .map(|r| Utc::now() - r)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut removed = 0;
        for state in self.inner.checkpoint.list(&ExecutionFilter::default()).await? {
            if !state.status.is_terminal() || self.inner.registry.contains(&state.execution_id) {
                continue;
            }
            let ended = state.end_time.unwrap_or(state.created_at);
            if ended < cutoff {
                self.inner.checkpoint.delete(&state.execution_id).await?;
                removed += 1;
            }
        }

        tracing::info!(removed, retention_secs = retention.as_secs(), "cleaned up executions");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Driving an execution
    // -----------------------------------------------------------------------

    /// Register the execution, transition it to running and spawn its task.
    async fn launch(&self, mut ctx: ExecutionContext) -> Result<(), ExecutorError> {
        let execution_id = ctx.execution_id();
        let previous = ctx.status();
        match previous {
            ExecutionStatus::Pending => ctx.start()?,
            ExecutionStatus::Paused => ctx.resume()?,
            _ => {}
        }

        let handle = Arc::new(ExecutionHandle::new(ctx.state().clone()));
        self.inner.registry.register(Arc::clone(&handle))?;

        if let Err(e) = self.inner.checkpoint.save(ctx.state()).await {
            self.inner.registry.remove(&execution_id);
            return Err(e.into());
        }

        let event = match previous {
            ExecutionStatus::Pending => ExecutionEvent::ExecutionStarted {
                execution_id,
                workflow_id: ctx.state().workflow_id.clone(),
                total_steps: ctx.definition().steps.len(),
            },
            _ => ExecutionEvent::ExecutionResumed { execution_id },
        };
        self.inner.event_bus.publish(event);
        tracing::info!(
            execution_id = %execution_id,
            workflow = ctx.state().workflow_name.as_str(),
            resume_index = ctx.resume_index(),
            "running execution"
        );

        let executor = self.clone();
        tokio::spawn(async move {
            executor.drive(ctx, handle).await;
        });
        Ok(())
    }

    async fn drive(&self, mut ctx: ExecutionContext, handle: Arc<ExecutionHandle>) {
        let execution_id = ctx.execution_id();
        let timeout_ms = ctx
            .definition()
            .config
            .timeout_ms
            .unwrap_or(self.inner.config.workflow_timeout_ms);

        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.run_steps(&mut ctx, &handle),
        )
        .await;

        let event = match outcome {
            Ok(Ok(())) => {
                let outputs = resolve_outputs(&ctx);
                ctx.set_outputs(outputs);
                self.finish(&mut ctx, |ctx| ctx.complete(), "completed");
                ExecutionEvent::ExecutionCompleted {
                    execution_id,
                    duration_ms: ctx.duration_ms().unwrap_or_default(),
                }
            }
            Ok(Err(DispatchError::Failed { step_id, error, attempts })) => {
                let info = error_info(Some(&step_id), &error, attempts);
                self.finish(&mut ctx, |ctx| ctx.fail(info), "failed");
                ExecutionEvent::ExecutionFailed {
                    execution_id,
                    error: error.to_string(),
                }
            }
            Ok(Err(DispatchError::Paused)) => {
                handle.signals().clear_pause();
                self.finish(&mut ctx, |ctx| ctx.pause(), "paused");
                ExecutionEvent::ExecutionPaused { execution_id }
            }
            Ok(Err(DispatchError::Cancelled)) => {
                let reason = handle
                    .cancel_reason()
                    .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
                let recorded = reason.clone();
                self.finish(&mut ctx, |ctx| ctx.cancel(recorded), "cancelled");
                ExecutionEvent::ExecutionCancelled { execution_id, reason }
            }
            Err(_elapsed) => {
                let message = format!("workflow timed out after {timeout_ms}ms");
                let info = workflow_error_info(ErrorKind::Timeout, message.clone());
                self.finish(&mut ctx, |ctx| ctx.fail(info), "failed");
                ExecutionEvent::ExecutionFailed {
                    execution_id,
                    error: message,
                }
            }
        };

        if let Err(e) = self.inner.checkpoint.save(ctx.state()).await {
            tracing::error!(
                execution_id = %execution_id,
                error = %e,
                "failed to persist final state"
            );
        }
        self.inner.registry.remove(&execution_id);
        handle.publish(ctx.state());
        self.inner.event_bus.publish(event);
    }

    /// Dispatch the remaining top-level steps, checkpointing after each one.
    async fn run_steps(
        &self,
        ctx: &mut ExecutionContext,
        handle: &ExecutionHandle,
    ) -> Result<(), DispatchError> {
        let steps = ctx.definition().steps.clone();
        for index in ctx.resume_index()..steps.len() {
            let step = &steps[index];
            self.inner
                .steps
                .dispatch(step, ctx, handle.signals(), vec![index])
                .await?;
            ctx.set_current_path(vec![index]);

            self.inner.checkpoint.save(ctx.state()).await.map_err(|e| {
                DispatchError::Failed {
                    step_id: step.id.clone(),
                    error: StepError::internal(format!("checkpoint failed: {e}")),
                    attempts: 1,
                }
            })?;
            handle.publish(ctx.state());
        }
        Ok(())
    }

    fn finish(
        &self,
        ctx: &mut ExecutionContext,
        transition: impl FnOnce(&mut ExecutionContext) -> Result<(), StateError>,
        outcome: &str,
    ) {
        let execution_id = ctx.execution_id();
        match transition(ctx) {
            Ok(()) => tracing::info!(
                execution_id = %execution_id,
                outcome,
                progress = ctx.progress(),
                "execution settled"
            ),
            Err(e) => tracing::warn!(
                execution_id = %execution_id,
                outcome,
                error = %e,
                "could not record execution outcome"
            ),
        }
    }
}

/// Resolve the definition's output bindings against the final variables.
///
/// A binding is a variable name optionally followed by a dotted path.
fn resolve_outputs(ctx: &ExecutionContext) -> Map<String, Value> {
    let variables = Value::Object(ctx.state().variables.clone());
    ctx.definition()
        .outputs
        .iter()
        .map(|(name, binding)| {
            let path: Vec<&str> = binding.split('.').collect();
            let value = lookup_path(&variables, &path).cloned().unwrap_or(Value::Null);
            (name.clone(), value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
