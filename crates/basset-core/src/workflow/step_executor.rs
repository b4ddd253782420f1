//! Step executor for all 13 step kinds.
//!
//! `StepExecutor` interprets the step tree recursively. Leaf steps substitute
//! `${...}` references into their params, call the matching provider under a
//! timeout and are retried per the active [`RetryPolicy`]. Control-flow steps
//! (conditional, loop, parallel) recurse into the same dispatch function.
//!
//! Pause and cancellation are cooperative: both are observed before every
//! dispatch, and cancellation also interrupts retry backoff and fixed waits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use basset_types::config::EngineConfig;
use basset_types::error::{BranchFailure, StepError};
use basset_types::event::ExecutionEvent;
use basset_types::workflow::{
    ConditionalParams, DetectParams, ExtractMode, ExtractParams, LoopParams, ParallelParams,
    RetryPolicy, StepAction, StepNode, WaitParams,
};
use futures_util::future::join_all;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;

use crate::event::EventBus;
use crate::provider::{
    BoxCapabilityProvider, BoxIngestionProvider, DetectionProvider, VerificationProvider,
};

use super::context::ExecutionContext;
use super::definition::bound_variables;
use super::expression::WorkflowEvaluator;
use super::registry::ExecutionSignals;
use super::retry::RetryHandler;

/// Name the page snapshot is bound to inside predicate waits.
pub const PAGE_ROOT: &str = "page";

type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Why a dispatch did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// The step failed terminally (permanent error or retries exhausted).
    #[error("step '{step_id}' failed after {attempts} attempt(s): {error}")]
    Failed {
        step_id: String,
        error: StepError,
        attempts: u32,
    },

    /// A pause was requested; the interrupted top-level step reruns on resume.
    #[error("execution paused")]
    Paused,

    #[error("execution cancelled")]
    Cancelled,
}

impl DispatchError {
    fn failed(step: &StepNode, error: StepError) -> Self {
        DispatchError::Failed {
            step_id: step.id.clone(),
            error,
            attempts: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// The external providers leaf steps delegate to.
#[derive(Clone)]
pub struct Providers {
    pub capabilities: Arc<BoxCapabilityProvider>,
    pub detection: Arc<dyn DetectionProvider>,
    pub verification: Arc<dyn VerificationProvider>,
    pub ingestion: Arc<BoxIngestionProvider>,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("capabilities", &self.capabilities.name())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes steps by dispatching to kind-specific handlers.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    providers: Providers,
    config: Arc<EngineConfig>,
    event_bus: EventBus,
}

impl StepExecutor {
    pub fn new(providers: Providers, config: Arc<EngineConfig>, event_bus: EventBus) -> Self {
        Self {
            providers,
            config,
            event_bus,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `steps` in order, returning the output of the last one.
    ///
    /// `base_path` is the index path of the enclosing list; completed steps
    /// update the context's current path.
    pub fn run_sequence<'a>(
        &'a self,
        steps: &'a [StepNode],
        ctx: &'a mut ExecutionContext,
        signals: &'a ExecutionSignals,
        base_path: Vec<usize>,
    ) -> DispatchFuture<'a> {
        Box::pin(async move {
            let mut last = Value::Null;
            for (index, step) in steps.iter().enumerate() {
                let mut path = base_path.clone();
                path.push(index);
                last = self.dispatch(step, ctx, signals, path.clone()).await?;
                ctx.set_current_path(path);
            }
            Ok(last)
        })
    }

    /// Dispatch one step: check signals, run it (with retries for leaves),
    /// record its result under its ID and bind its outputs.
    pub fn dispatch<'a>(
        &'a self,
        step: &'a StepNode,
        ctx: &'a mut ExecutionContext,
        signals: &'a ExecutionSignals,
        path: Vec<usize>,
    ) -> DispatchFuture<'a> {
        Box::pin(async move {
            if signals.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            if signals.pause_requested() {
                return Err(DispatchError::Paused);
            }

            let execution_id = ctx.execution_id();
            tracing::debug!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                step_type = step.action.kind(),
                path = ?path,
                "dispatching step"
            );
            self.event_bus.publish(ExecutionEvent::StepStarted {
                execution_id,
                step_id: step.id.clone(),
                step_type: step.action.kind().to_string(),
            });

            let started = Instant::now();
            let outcome = match &step.action {
                StepAction::Conditional(params) => {
                    self.run_conditional(step, params, ctx, signals, path).await
                }
                StepAction::Loop(params) => self.run_loop(step, params, ctx, signals, path).await,
                StepAction::Parallel(params) => {
                    self.run_parallel(step, params, ctx, signals, path).await
                }
                _ => self.run_with_retry(step, ctx, signals).await,
            };

            match outcome {
                Ok(result) => {
                    if let Err(e) = ctx.record_step_result(step.id.clone(), result.clone()) {
                        return Err(self.own_failure(step, ctx, e.into()));
                    }
                    ctx.bind_outputs(step, &result);
                    self.event_bus.publish(ExecutionEvent::StepCompleted {
                        execution_id,
                        step_id: step.id.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    Ok(result)
                }
                Err(DispatchError::Failed { step_id, error, attempts }) => {
                    if step.action.is_control_flow() {
                        self.event_bus.publish(ExecutionEvent::StepFailed {
                            execution_id,
                            step_id: step.id.clone(),
                            kind: error.kind(),
                            error: error.to_string(),
                            will_retry: false,
                        });
                    }
                    Err(DispatchError::Failed { step_id, error, attempts })
                }
                Err(other) => Err(other),
            }
        })
    }

    // -----------------------------------------------------------------------
    // Policy resolution
    // -----------------------------------------------------------------------

    /// Step override, then workflow default, then engine default.
    fn retry_policy(&self, step: &StepNode, ctx: &ExecutionContext) -> RetryPolicy {
        step.retry
            .clone()
            .or_else(|| ctx.definition().config.retry.clone())
            .unwrap_or_else(|| self.config.retry.clone())
    }

    fn step_timeout(&self, step: &StepNode, ctx: &ExecutionContext) -> Duration {
        let kind_timeout = match &step.action {
            StepAction::Navigate(p) => p.timeout_ms,
            StepAction::Click(p) => p.timeout_ms,
            StepAction::Wait(WaitParams::Element { timeout_ms, .. })
            | StepAction::Wait(WaitParams::Predicate { timeout_ms, .. }) => *timeout_ms,
            _ => None,
        };
        let ms = step
            .timeout_ms
            .or(kind_timeout)
            .or(ctx.definition().config.step_timeout_ms)
            .unwrap_or(self.config.default_step_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Record and classify an error raised by `step` itself (not by a
    /// nested step), so it counts toward the error statistics.
    ///
    /// Control-flow nodes are not re-dispatched as a unit, so the decision is
    /// always terminal here.
    fn own_failure(
        &self,
        step: &StepNode,
        ctx: &mut ExecutionContext,
        error: StepError,
    ) -> DispatchError {
        let policy = self.retry_policy(step, ctx);
        ctx.record_error(&step.id, &error);
        let records = &mut ctx.state_mut().retry_records;
        let decision = RetryHandler::handle(&error, &step.id, records, &policy);
        RetryHandler::reset(&step.id, records);

        tracing::warn!(
            execution_id = %ctx.execution_id(),
            step_id = step.id.as_str(),
            kind = %error.kind(),
            error = %error,
            "step failed"
        );
        DispatchError::Failed {
            step_id: step.id.clone(),
            error,
            attempts: decision.attempt_count,
        }
    }

    // -----------------------------------------------------------------------
    // Leaf steps
    // -----------------------------------------------------------------------

    async fn run_with_retry(
        &self,
        step: &StepNode,
        ctx: &mut ExecutionContext,
        signals: &ExecutionSignals,
    ) -> Result<Value, DispatchError> {
        let policy = self.retry_policy(step, ctx);
        let execution_id = ctx.execution_id();

        loop {
            let error = match self.run_leaf(step, ctx, signals).await {
                Ok(value) => {
                    RetryHandler::reset(&step.id, &mut ctx.state_mut().retry_records);
                    return Ok(value);
                }
                Err(LeafError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(LeafError::Step(error)) => error,
            };

            ctx.record_error(&step.id, &error);
            let decision = RetryHandler::handle(
                &error,
                &step.id,
                &mut ctx.state_mut().retry_records,
                &policy,
            );
            self.event_bus.publish(ExecutionEvent::StepFailed {
                execution_id,
                step_id: step.id.clone(),
                kind: error.kind(),
                error: error.to_string(),
                will_retry: decision.should_retry,
            });

            if !decision.should_retry {
                tracing::warn!(
                    execution_id = %execution_id,
                    step_id = step.id.as_str(),
                    kind = %error.kind(),
                    attempts = decision.attempt_count,
                    error = %error,
                    "step failed"
                );
                return Err(DispatchError::Failed {
                    step_id: step.id.clone(),
                    error,
                    attempts: decision.attempt_count,
                });
            }

            tracing::warn!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                attempt = decision.attempt_count,
                delay_ms = decision.delay.as_millis() as u64,
                error = %error,
                "step failed, retrying"
            );
            self.event_bus.publish(ExecutionEvent::RetryScheduled {
                execution_id,
                step_id: step.id.clone(),
                attempt: decision.attempt_count + 1,
                delay_ms: decision.delay.as_millis() as u64,
            });

            tokio::select! {
                _ = signals.cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(decision.delay) => {}
            }
            if signals.pause_requested() {
                return Err(DispatchError::Paused);
            }
        }
    }

    /// One attempt of a leaf step.
    async fn run_leaf(
        &self,
        step: &StepNode,
        ctx: &mut ExecutionContext,
        signals: &ExecutionSignals,
    ) -> Result<Value, LeafError> {
        let timeout = self.step_timeout(step, ctx);

        // Scripts and predicates read variables by name; everything else
        // gets its references substituted first.
        let action = match &step.action {
            StepAction::Script(_) | StepAction::Wait(WaitParams::Predicate { .. }) => {
                step.action.clone()
            }
            action => substitute_action(action, ctx)?,
        };

        if let StepAction::Wait(WaitParams::Time { duration_ms }) = &action {
            tokio::select! {
                _ = signals.cancelled() => return Err(LeafError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(*duration_ms)) => {}
            }
            return Ok(Value::Null);
        }

        let attempt = self.run_action(step, &action, ctx, timeout);
        tokio::select! {
            _ = signals.cancelled() => Err(LeafError::Cancelled),
            result = tokio::time::timeout(timeout, attempt) => match result {
                Ok(result) => result.map_err(LeafError::Step),
                Err(_elapsed) => Err(LeafError::Step(StepError::timeout(format!(
                    "step '{}' timed out after {}ms",
                    step.id,
                    timeout.as_millis()
                )))),
            },
        }
    }

    async fn run_action(
        &self,
        step: &StepNode,
        action: &StepAction,
        ctx: &mut ExecutionContext,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let caps = &self.providers.capabilities;
        match action {
            StepAction::Navigate(p) => caps.navigate(p, timeout).await,
            StepAction::Click(p) => caps.click(p, timeout).await,
            StepAction::Fill(p) => caps.fill(p, timeout).await,
            StepAction::Extract(p) => caps.extract(p, timeout).await,
            StepAction::Detect(p) => self.run_detect(p, timeout).await,
            StepAction::Wait(WaitParams::Element { selector, .. }) => {
                caps.wait_for(selector, timeout).await
            }
            StepAction::Wait(WaitParams::Predicate {
                expression,
                selectors,
                poll_interval_ms,
                ..
            }) => {
                let interval = poll_interval_ms.unwrap_or(self.config.wait_poll_interval_ms);
                let snapshot = ExtractParams {
                    selectors: selectors.clone(),
                    mode: selectors.is_empty().then_some(ExtractMode::Text),
                };
                self.run_predicate_wait(
                    expression,
                    &snapshot,
                    Duration::from_millis(interval),
                    ctx,
                    timeout,
                )
                .await
            }
            StepAction::Wait(WaitParams::Time { .. }) => Ok(Value::Null),
            StepAction::Screenshot(p) => {
                let artifact = caps.screenshot(p, timeout).await?;
                ctx.add_evidence(&step.id, "screenshot", p.label.clone(), artifact.clone());
                Ok(artifact)
            }
            StepAction::Script(p) => {
                let value = WorkflowEvaluator::new()
                    .evaluate_value(&p.expression, &ctx.expression_context())?;
                Ok(value)
            }
            StepAction::Verify(p) => {
                let verification = self.providers.verification.verify(&p.value_type, &p.value);
                serde_json::to_value(verification).map_err(|e| StepError::internal(e.to_string()))
            }
            StepAction::Ingest(p) => self.providers.ingestion.ingest(&p.entity_type, &p.data).await,
            StepAction::Conditional(_) | StepAction::Loop(_) | StepAction::Parallel(_) => {
                Err(StepError::internal(format!(
                    "control-flow step '{}' dispatched as a leaf",
                    step.id
                )))
            }
        }
    }

    /// Scan the given text, or the current page text when none is given.
    async fn run_detect(
        &self,
        params: &DetectParams,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let text = match &params.text {
            Some(text) => text.clone(),
            None => {
                let page = self
                    .providers
                    .capabilities
                    .extract(
                        &ExtractParams {
                            selectors: Default::default(),
                            mode: Some(ExtractMode::Text),
                        },
                        timeout,
                    )
                    .await?;
                page_text(page)
            }
        };
        let matches = self
            .providers
            .detection
            .detect(&params.patterns, &params.custom, &text)?;
        serde_json::to_value(matches).map_err(|e| StepError::internal(e.to_string()))
    }

    /// Poll `expression` until truthy. The enclosing timeout bounds it.
    ///
    /// Each poll extracts a fresh page snapshot and binds it as `page` on top
    /// of the variables, so the condition can change while the step waits.
    async fn run_predicate_wait(
        &self,
        expression: &str,
        snapshot: &ExtractParams,
        interval: Duration,
        ctx: &ExecutionContext,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let evaluator = WorkflowEvaluator::new();
        let mut scope = ctx.expression_context();
        let mut polls = 0u32;
        loop {
            let page = self.providers.capabilities.extract(snapshot, timeout).await?;
            let page = if snapshot.selectors.is_empty() {
                json!({ "text": page_text(page) })
            } else {
                page
            };
            if let Value::Object(map) = &mut scope {
                map.insert(PAGE_ROOT.to_string(), page.clone());
            }
            polls += 1;

            if evaluator.evaluate_bool(expression, &scope)? {
                return Ok(json!({ "satisfied": true, "polls": polls, "page": page }));
            }
            tokio::time::sleep(interval).await;
        }
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    async fn run_conditional(
        &self,
        step: &StepNode,
        params: &ConditionalParams,
        ctx: &mut ExecutionContext,
        signals: &ExecutionSignals,
        path: Vec<usize>,
    ) -> Result<Value, DispatchError> {
        let evaluated =
            WorkflowEvaluator::new().evaluate_bool(&params.condition, &ctx.expression_context());
        let condition = match evaluated {
            Ok(condition) => condition,
            Err(e) => return Err(self.own_failure(step, ctx, e.into())),
        };

        tracing::debug!(
            execution_id = %ctx.execution_id(),
            step_id = step.id.as_str(),
            condition,
            "conditional evaluated"
        );

        let branch = if condition {
            &params.then_steps
        } else {
            &params.else_steps
        };
        self.run_sequence(branch, ctx, signals, path).await
    }

    async fn run_loop(
        &self,
        step: &StepNode,
        params: &LoopParams,
        ctx: &mut ExecutionContext,
        signals: &ExecutionSignals,
        path: Vec<usize>,
    ) -> Result<Value, DispatchError> {
        let items = match ctx.substitute(&params.items) {
            Ok(Value::Array(items)) => items,
            Ok(other) => {
                let error = StepError::validation(format!(
                    "loop '{}' items must be an array, got {other}",
                    step.id
                ));
                return Err(self.own_failure(step, ctx, error));
            }
            Err(e) => return Err(self.own_failure(step, ctx, e.into())),
        };

        let cap = params.max_iterations.unwrap_or(self.config.max_loop_iterations) as usize;
        if items.len() > cap {
            let error = StepError::validation(format!(
                "loop '{}' has {} items, exceeding max_iterations {cap}",
                step.id,
                items.len()
            ));
            return Err(self.own_failure(step, ctx, error));
        }

        // Loop variables are scoped to the body; restore any shadowed values.
        let saved_item = ctx.get_variable(&params.item_var).cloned();
        let saved_index = params
            .index_var
            .as_ref()
            .and_then(|name| ctx.get_variable(name).cloned());

        let mut outputs = Vec::with_capacity(items.len());
        let mut outcome = Ok(());
        for (index, item) in items.into_iter().enumerate() {
            ctx.set_variable(params.item_var.clone(), item);
            if let Some(index_var) = &params.index_var {
                ctx.set_variable(index_var.clone(), json!(index));
            }

            let key = format!("{}[{index}]", step.id);
            let output = match self.run_sequence(&params.body, ctx, signals, path.clone()).await {
                Ok(output) => output,
                Err(DispatchError::Failed { step_id, error, .. }) if params.continue_on_error => {
                    tracing::warn!(
                        execution_id = %ctx.execution_id(),
                        step_id = step.id.as_str(),
                        iteration = index,
                        failed_step = step_id.as_str(),
                        "loop iteration failed, continuing"
                    );
                    json!({
                        "error": error.to_string(),
                        "kind": error.kind(),
                        "step_id": step_id,
                    })
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };

            if let Err(e) = ctx.record_step_result(key, output.clone()) {
                outcome = Err(self.own_failure(step, ctx, e.into()));
                break;
            }
            outputs.push(output);
        }

        restore_variable(ctx, &params.item_var, saved_item);
        if let Some(index_var) = &params.index_var {
            restore_variable(ctx, index_var, saved_index);
        }

        outcome.map(|()| Value::Array(outputs))
    }

    async fn run_parallel(
        &self,
        step: &StepNode,
        params: &ParallelParams,
        ctx: &mut ExecutionContext,
        signals: &ExecutionSignals,
        path: Vec<usize>,
    ) -> Result<Value, DispatchError> {
        let limit = params
            .max_concurrency
            .or(ctx.definition().config.max_concurrency)
            .unwrap_or(self.config.max_parallel_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        tracing::debug!(
            execution_id = %ctx.execution_id(),
            step_id = step.id.as_str(),
            branches = params.branches.len(),
            limit,
            "running parallel branches"
        );

        let runs = params.branches.iter().map(|branch| {
            let mut branch_ctx = ctx.fork_branch();
            let semaphore = Arc::clone(&semaphore);
            let path = path.clone();
            async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => self.run_sequence(branch, &mut branch_ctx, signals, path).await,
                    Err(_) => Err(DispatchError::Cancelled),
                };
                (branch_ctx, result)
            }
        });
        let finished = join_all(runs).await;

        // Collect all, then fail if any branch failed.
        let total = params.branches.len();
        let mut outcomes = Map::new();
        let mut failures = Vec::new();
        let mut interrupted = None;
        for (index, (branch, (branch_ctx, result))) in
            params.branches.iter().zip(finished).enumerate()
        {
            ctx.merge_branch(branch_ctx, &bound_variables(branch));
            let outcome = match result {
                Ok(value) => value,
                Err(DispatchError::Failed { error, .. }) => {
                    let outcome = json!({ "error": error.to_string(), "kind": error.kind() });
                    failures.push(BranchFailure { branch: index, error });
                    outcome
                }
                Err(signal) => {
                    // Cancellation wins over a pause.
                    if interrupted != Some(DispatchError::Cancelled) {
                        interrupted = Some(signal);
                    }
                    continue;
                }
            };
            let key = format!("{}.{index}", step.id);
            if let Err(e) = ctx.record_step_result(key, outcome.clone()) {
                return Err(self.own_failure(step, ctx, e.into()));
            }
            outcomes.insert(index.to_string(), outcome);
        }

        if let Some(signal) = interrupted {
            return Err(signal);
        }
        if !failures.is_empty() {
            return Err(DispatchError::failed(
                step,
                StepError::Aggregate {
                    step_id: step.id.clone(),
                    total,
                    errors: failures,
                },
            ));
        }
        Ok(Value::Object(outcomes))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

enum LeafError {
    Step(StepError),
    Cancelled,
}

impl From<StepError> for LeafError {
    fn from(err: StepError) -> Self {
        LeafError::Step(err)
    }
}

/// Substitute references inside a leaf step's params.
fn substitute_action(action: &StepAction, ctx: &ExecutionContext) -> Result<StepAction, StepError> {
    let raw = serde_json::to_value(action).map_err(|e| StepError::internal(e.to_string()))?;
    let substituted = ctx.substitute(&raw)?;
    serde_json::from_value(substituted).map_err(|e| {
        StepError::validation(format!("step params invalid after substitution: {e}"))
    })
}

/// Plain text out of a text-mode extraction result.
fn page_text(page: Value) -> String {
    match page {
        Value::String(text) => text,
        Value::Object(mut map) => match map.remove("text") {
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
            None => Value::Object(map).to_string(),
        },
        other => other.to_string(),
    }
}

fn restore_variable(ctx: &mut ExecutionContext, name: &str, saved: Option<Value>) {
    match saved {
        Some(value) => ctx.set_variable(name.to_string(), value),
        None => {
            ctx.remove_variable(name);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FormatVerifier, KvIngestionProvider, PatternDetector};
    use crate::storage::InMemoryKvStore;
    use crate::testing::{ScriptedCapabilities, definition, step, step_with_outputs};
    use basset_types::error::ErrorKind;
    use basset_types::workflow::{
        BackoffStrategy, NavigateParams, ScreenshotParams, ScriptParams, VerifyParams,
    };

    fn executor(caps: &ScriptedCapabilities) -> StepExecutor {
        let providers = Providers {
            capabilities: Arc::new(BoxCapabilityProvider::new(caps.clone())),
            detection: Arc::new(PatternDetector::new()),
            verification: Arc::new(FormatVerifier::new()),
            ingestion: Arc::new(BoxIngestionProvider::new(KvIngestionProvider::new(
                InMemoryKvStore::new(),
            ))),
        };
        StepExecutor::new(providers, Arc::new(EngineConfig::default()), EventBus::default())
    }

    fn script(id: &str, expression: &str) -> StepNode {
        step(
            id,
            StepAction::Script(ScriptParams {
                expression: expression.to_string(),
            }),
        )
    }

    fn navigate(id: &str, url: &str) -> StepNode {
        step(
            id,
            StepAction::Navigate(NavigateParams {
                url: url.to_string(),
                wait_for: None,
                timeout_ms: None,
            }),
        )
    }

    fn context(steps: Vec<StepNode>) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(definition(steps), Map::new());
        ctx.start().unwrap();
        ctx
    }

    async fn run(exec: &StepExecutor, ctx: &mut ExecutionContext) -> Result<Value, DispatchError> {
        let steps = ctx.definition().steps.clone();
        exec.run_sequence(&steps, ctx, &ExecutionSignals::new(), Vec::new())
            .await
    }

    // -----------------------------------------------------------------------
    // Leaf steps
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_navigate_substitutes_url() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![navigate("open", "https://example.com/${user}")]);
        ctx.set_variable("user", json!("alice"));

        run(&exec, &mut ctx).await.unwrap();
        assert_eq!(
            ctx.step_result("open").unwrap()["url"],
            json!("https://example.com/alice")
        );
        assert_eq!(ctx.state().current_path, vec![0]);
    }

    #[tokio::test]
    async fn test_unresolved_reference_is_permanent_configuration_error() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![navigate("open", "https://example.com/${missing}")]);

        let err = run(&exec, &mut ctx).await.unwrap_err();
        let DispatchError::Failed { error, attempts, .. } = err else {
            panic!("expected failure, got {err:?}");
        };
        assert_eq!(error.kind(), ErrorKind::Configuration);
        assert_eq!(attempts, 1);
        assert_eq!(caps.calls("navigate"), 0);
    }

    #[tokio::test]
    async fn test_navigate_extract_verify_email() {
        let caps = ScriptedCapabilities::new();
        caps.push_ok("extract", json!({"email": "a@b.com"}));
        let exec = executor(&caps);

        let extract = step_with_outputs(
            "grab",
            StepAction::Extract(ExtractParams {
                selectors: [("email".to_string(), ".email".to_string())].into(),
                mode: None,
            }),
            &[("email", "email")],
        );
        let verify = step(
            "check",
            StepAction::Verify(VerifyParams {
                value_type: "email".to_string(),
                value: json!("${email}"),
            }),
        );
        let mut ctx = context(vec![navigate("open", "https://example.com"), extract, verify]);

        let result = run(&exec, &mut ctx).await.unwrap();
        assert_eq!(result, json!({"valid": true, "normalized": "a@b.com"}));
        assert_eq!(ctx.step_result("check"), Some(&result));
    }

    #[tokio::test]
    async fn test_scraped_text_with_markers_is_not_expanded() {
        let caps = ScriptedCapabilities::new();
        caps.push_ok("extract", json!({"bio": "I love ${money", "motto": "${secret}"}));
        let exec = executor(&caps);

        let extract = step_with_outputs(
            "grab",
            StepAction::Extract(ExtractParams {
                selectors: [
                    ("bio".to_string(), ".bio".to_string()),
                    ("motto".to_string(), ".motto".to_string()),
                ]
                .into(),
                mode: None,
            }),
            &[("bio", "bio"), ("motto", "motto")],
        );
        let visit = navigate("visit", "https://example.com/?bio=${bio}&m=${motto}");
        let mut ctx = context(vec![extract, visit]);
        ctx.set_variable("secret", json!("hunter2"));

        run(&exec, &mut ctx).await.unwrap();
        assert_eq!(
            ctx.step_result("visit").unwrap()["url"],
            json!("https://example.com/?bio=I love ${money&m=${secret}")
        );
    }

    #[tokio::test]
    async fn test_screenshot_appends_evidence() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let shot = step(
            "shot",
            StepAction::Screenshot(ScreenshotParams {
                label: Some("profile".to_string()),
                ..Default::default()
            }),
        );
        let mut ctx = context(vec![shot]);

        run(&exec, &mut ctx).await.unwrap();
        let evidence = &ctx.state().evidence;
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, "screenshot");
        assert_eq!(evidence[0].label.as_deref(), Some("profile"));
        assert_eq!(evidence[0].data["artifact"], "shot.png");
    }

    #[tokio::test]
    async fn test_detect_pulls_page_text_when_none_given() {
        let caps = ScriptedCapabilities::new();
        caps.push_ok("extract", json!({"text": "mail bob@example.org now"}));
        let exec = executor(&caps);
        let detect = step(
            "scan",
            StepAction::Detect(DetectParams {
                patterns: vec!["email".to_string()],
                custom: Default::default(),
                text: None,
            }),
        );
        let mut ctx = context(vec![detect]);

        let result = run(&exec, &mut ctx).await.unwrap();
        assert_eq!(result[0]["value"], "bob@example.org");
        assert_eq!(caps.calls("extract"), 1);
    }

    #[tokio::test]
    async fn test_script_reads_variables_and_steps() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![
            script("two", "2"),
            script("sum", "steps.two + base"),
        ]);
        ctx.set_variable("base", json!(40));

        assert_eq!(run(&exec, &mut ctx).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_ingest_returns_id() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let ingest = step(
            "save",
            StepAction::Ingest(basset_types::workflow::IngestParams {
                entity_type: "profile".to_string(),
                data: json!({"name": "${who}"}),
            }),
        );
        let mut ctx = context(vec![ingest]);
        ctx.set_variable("who", json!("alice"));

        let result = run(&exec, &mut ctx).await.unwrap();
        assert!(result["id"].is_string());
    }

    fn predicate_wait(id: &str, expression: &str, selectors: &[(&str, &str)]) -> StepNode {
        step(
            id,
            StepAction::Wait(WaitParams::Predicate {
                expression: expression.to_string(),
                selectors: selectors
                    .iter()
                    .map(|(field, selector)| (field.to_string(), selector.to_string()))
                    .collect(),
                timeout_ms: Some(5_000),
                poll_interval_ms: Some(100),
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_wait_sees_condition_change_during_wait() {
        let caps = ScriptedCapabilities::new();
        caps.push_ok("extract", json!({"status": "pending"}));
        caps.push_ok("extract", json!({"status": "pending"}));
        caps.push_ok("extract", json!({"status": "done"}));
        let exec = executor(&caps);
        let mut ctx = context(vec![predicate_wait(
            "ready",
            "page.status == expected",
            &[("status", "#status")],
        )]);
        ctx.set_variable("expected", json!("done"));

        let started = tokio::time::Instant::now();
        let result = run(&exec, &mut ctx).await.unwrap();

        assert_eq!(result["satisfied"], json!(true));
        assert_eq!(result["polls"], json!(3));
        assert_eq!(caps.calls("extract"), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert_eq!(ctx.state().error_stats.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_wait_reads_page_text_without_selectors() {
        let caps = ScriptedCapabilities::new();
        caps.push_ok("extract", json!({"text": "Loading..."}));
        caps.push_ok("extract", json!("Order complete"));
        let exec = executor(&caps);
        let mut ctx = context(vec![predicate_wait(
            "done",
            "page.text == 'Order complete'",
            &[],
        )]);

        let result = run(&exec, &mut ctx).await.unwrap();
        assert_eq!(result["polls"], json!(2));
        assert_eq!(result["page"], json!({"text": "Order complete"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_wait_that_never_holds_times_out() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut node = predicate_wait("never", "page.status == 'done'", &[("status", "#s")]);
        node.retry = Some(RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        });
        let mut ctx = context(vec![node]);

        let err = run(&exec, &mut ctx).await.unwrap_err();
        match err {
            DispatchError::Failed { step_id, error, .. } => {
                assert_eq!(step_id, "never");
                assert_eq!(error.kind(), ErrorKind::Timeout);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(caps.calls("extract") > 1);
    }

    // -----------------------------------------------------------------------
    // Retries and timeouts
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_two_transient_failures_then_success() {
        let caps = ScriptedCapabilities::new();
        caps.push_err("navigate", StepError::new(ErrorKind::Network, "reset"));
        caps.push_err("navigate", StepError::new(ErrorKind::Network, "reset"));
        let exec = executor(&caps);
        let mut node = navigate("open", "https://example.com");
        node.retry = Some(RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::Exponential,
        });
        let mut ctx = context(vec![node]);
        let mut events = exec.event_bus.subscribe();

        let started = tokio::time::Instant::now();
        run(&exec, &mut ctx).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_millis(3_000));
        assert_eq!(caps.calls("navigate"), 3);
        assert!(ctx.state().retry_records.is_empty());
        assert_eq!(ctx.state().error_stats.total, 2);

        let mut delays = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::RetryScheduled { delay_ms, .. } = event {
                delays.push(delay_ms);
            }
        }
        assert_eq!(delays, vec![1_000, 2_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_reports_attempts() {
        let caps = ScriptedCapabilities::new();
        for _ in 0..3 {
            caps.push_err("click", StepError::new(ErrorKind::ElementNotFound, "#go"));
        }
        let exec = executor(&caps);
        let click = step(
            "go",
            StepAction::Click(basset_types::workflow::ClickParams {
                selector: "#go".to_string(),
                wait_for: None,
                timeout_ms: None,
            }),
        );
        let mut ctx = context(vec![click]);

        let err = run(&exec, &mut ctx).await.unwrap_err();
        assert!(matches!(err, DispatchError::Failed { attempts: 3, .. }));
        assert_eq!(caps.calls("click"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let caps = ScriptedCapabilities::new();
        caps.set_delay(Duration::from_secs(60));
        let exec = executor(&caps);
        let mut node = navigate("open", "https://example.com");
        node.timeout_ms = Some(500);
        node.retry = Some(RetryPolicy {
            max_retries: 1,
            ..Default::default()
        });
        let mut ctx = context(vec![node]);

        let err = run(&exec, &mut ctx).await.unwrap_err();
        let DispatchError::Failed { error, .. } = err else {
            panic!("expected failure");
        };
        assert_eq!(error.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retrying() {
        let caps = ScriptedCapabilities::new();
        caps.push_err("navigate", StepError::timeout("slow"));
        let exec = executor(&caps);
        let mut ctx = context(vec![navigate("open", "https://example.com")]);
        let signals = ExecutionSignals::new();

        let canceller = signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let steps = ctx.definition().steps.clone();
        let err = exec
            .run_sequence(&steps, &mut ctx, &signals, Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Cancelled);
        assert_eq!(caps.calls("navigate"), 1);
    }

    #[tokio::test]
    async fn test_signals_checked_before_dispatch() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![navigate("open", "https://example.com")]);
        let steps = ctx.definition().steps.clone();

        let signals = ExecutionSignals::new();
        signals.request_pause();
        let err = exec
            .run_sequence(&steps, &mut ctx, &signals, Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Paused);
        assert_eq!(caps.calls("navigate"), 0);
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    fn conditional(condition: &str) -> StepNode {
        step(
            "check",
            StepAction::Conditional(ConditionalParams {
                condition: condition.to_string(),
                then_steps: vec![script("then-step", "'then'")],
                else_steps: vec![script("else-step", "'else'")],
            }),
        )
    }

    #[tokio::test]
    async fn test_false_conditional_runs_only_else() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![conditional("count > 5")]);
        ctx.set_variable("count", json!(1));

        run(&exec, &mut ctx).await.unwrap();
        assert_eq!(ctx.step_result("else-step"), Some(&json!("else")));
        assert!(ctx.step_result("then-step").is_none());
        assert_eq!(ctx.step_result("check"), Some(&json!("else")));
    }

    #[tokio::test]
    async fn test_conditional_expression_error_counts_one_error() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![conditional("count >")]);
        let mut events = exec.event_bus.subscribe();

        let err = run(&exec, &mut ctx).await.unwrap_err();
        let DispatchError::Failed { step_id, .. } = err else {
            panic!("expected failure");
        };
        assert_eq!(step_id, "check");
        assert!(ctx.step_result("then-step").is_none());
        assert!(ctx.step_result("else-step").is_none());
        assert_eq!(ctx.summary().error_count, 1);

        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::StepFailed { will_retry, .. } = event {
                assert!(!will_retry);
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_true_conditional_runs_only_then() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![conditional("count > 5")]);
        ctx.set_variable("count", json!(10));

        run(&exec, &mut ctx).await.unwrap();
        assert_eq!(ctx.step_result("then-step"), Some(&json!("then")));
        assert!(ctx.step_result("else-step").is_none());
    }

    fn doubling_loop(items: Value) -> StepNode {
        step(
            "loop-1",
            StepAction::Loop(LoopParams {
                items,
                item_var: "item".to_string(),
                index_var: Some("i".to_string()),
                max_iterations: None,
                continue_on_error: false,
                body: vec![script("double", "item * 2")],
            }),
        )
    }

    #[tokio::test]
    async fn test_loop_doubles_items_in_order() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![doubling_loop(json!([1, 2, 3]))]);

        run(&exec, &mut ctx).await.unwrap();
        assert_eq!(ctx.step_result("loop-1"), Some(&json!([2, 4, 6])));
        assert_eq!(ctx.step_result("loop-1[0]"), Some(&json!(2)));
        assert_eq!(ctx.step_result("loop-1[2]"), Some(&json!(6)));
        assert!(ctx.get_variable("item").is_none(), "loop variable is scoped");
        assert!(ctx.get_variable("i").is_none());
    }

    #[tokio::test]
    async fn test_loop_items_from_variable_and_cap() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut node = doubling_loop(json!("${values}"));
        if let StepAction::Loop(params) = &mut node.action {
            params.max_iterations = Some(2);
        }
        let mut ctx = context(vec![node]);
        ctx.set_variable("values", json!([1, 2, 3]));

        let err = run(&exec, &mut ctx).await.unwrap_err();
        let DispatchError::Failed { error, step_id, .. } = err else {
            panic!("expected failure");
        };
        assert_eq!(step_id, "loop-1");
        assert!(error.to_string().contains("max_iterations"));
        assert!(ctx.step_result("loop-1[0]").is_none());
        assert_eq!(ctx.summary().error_count, 1);
        assert_eq!(ctx.state().error_stats.by_step.get("loop-1"), Some(&1));
    }

    #[tokio::test]
    async fn test_loop_over_non_array_counts_one_error() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![doubling_loop(json!("${values}"))]);
        ctx.set_variable("values", json!({"not": "a list"}));

        let err = run(&exec, &mut ctx).await.unwrap_err();
        let DispatchError::Failed { error, attempts, .. } = err else {
            panic!("expected failure");
        };
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert_eq!(attempts, 1);
        assert_eq!(ctx.summary().error_count, 1);
        assert!(ctx.state().retry_records.is_empty());
    }

    #[tokio::test]
    async fn test_loop_continue_on_error_records_failed_iteration() {
        let caps = ScriptedCapabilities::new();
        caps.push_err("navigate", StepError::validation("bad url"));
        let exec = executor(&caps);
        let node = step(
            "visit",
            StepAction::Loop(LoopParams {
                items: json!(["a", "b"]),
                item_var: "name".to_string(),
                index_var: None,
                max_iterations: None,
                continue_on_error: true,
                body: vec![navigate("open", "https://example.com/${name}")],
            }),
        );
        let mut ctx = context(vec![node]);

        run(&exec, &mut ctx).await.unwrap();
        let results = ctx.step_result("visit").unwrap();
        assert_eq!(results[0]["kind"], "validation");
        assert_eq!(results[1]["url"], "https://example.com/b");
    }

    fn fan_out(branches: Vec<Vec<StepNode>>) -> StepNode {
        step(
            "fan",
            StepAction::Parallel(ParallelParams {
                branches,
                max_concurrency: Some(2),
            }),
        )
    }

    #[tokio::test]
    async fn test_parallel_one_failure_keeps_successful_branch_output() {
        let caps = ScriptedCapabilities::new();
        caps.push_err("navigate", StepError::validation("blocked"));
        let exec = executor(&caps);
        let ok_branch = vec![step_with_outputs(
            "compute",
            StepAction::Script(ScriptParams {
                expression: "21 * 2".to_string(),
            }),
            &[("$", "answer")],
        )];
        let bad_branch = vec![navigate("open", "https://example.com")];
        let mut ctx = context(vec![fan_out(vec![bad_branch, ok_branch])]);

        let err = run(&exec, &mut ctx).await.unwrap_err();
        let DispatchError::Failed { error, .. } = err else {
            panic!("expected failure");
        };
        let StepError::Aggregate { total, errors, .. } = error else {
            panic!("expected aggregate error, got {error:?}");
        };
        assert_eq!(total, 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].branch, 0);

        assert_eq!(ctx.step_result("fan.1"), Some(&json!(42)));
        assert_eq!(ctx.step_result("fan.0").unwrap()["kind"], "validation");
        assert_eq!(ctx.get_variable("answer"), Some(&json!(42)));
        assert!(ctx.step_result("fan").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_runs_at_most_max_concurrency_branches() {
        let caps = ScriptedCapabilities::new();
        caps.set_delay(Duration::from_millis(100));
        let exec = executor(&caps);
        let branches = (0..5)
            .map(|i| vec![navigate(&format!("visit-{i}"), "https://example.com")])
            .collect();
        let mut ctx = context(vec![fan_out(branches)]);

        let started = tokio::time::Instant::now();
        run(&exec, &mut ctx).await.unwrap();

        assert_eq!(caps.calls("navigate"), 5);
        assert_eq!(caps.peak_in_flight(), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(ctx.step_result("fan").unwrap().as_object().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_parallel_success_maps_branch_index_to_outcome() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let mut ctx = context(vec![fan_out(vec![
            vec![script("a", "1")],
            vec![script("b", "2")],
            vec![script("c", "3")],
        ])]);

        run(&exec, &mut ctx).await.unwrap();
        assert_eq!(
            ctx.step_result("fan"),
            Some(&json!({"0": 1, "1": 2, "2": 3}))
        );
        assert_eq!(ctx.step_result("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_parallel_branches_do_not_leak_unbound_variables() {
        let caps = ScriptedCapabilities::new();
        let exec = executor(&caps);
        let looped = step(
            "inner",
            StepAction::Loop(LoopParams {
                items: json!([1]),
                item_var: "scratch".to_string(),
                index_var: None,
                max_iterations: None,
                continue_on_error: false,
                body: vec![script("noop", "scratch")],
            }),
        );
        let mut ctx = context(vec![fan_out(vec![vec![looped]])]);
        ctx.set_variable("scratch", json!("parent"));

        run(&exec, &mut ctx).await.unwrap();
        assert_eq!(ctx.get_variable("scratch"), Some(&json!("parent")));
    }
}
