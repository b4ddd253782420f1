//! Shared test fixtures: scripted providers and definition builders.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use basset_types::error::StepError;
use basset_types::workflow::{
    ClickParams, ExtractParams, FillParams, NavigateParams, ScreenshotParams, StepAction,
    StepNode, WorkflowConfig, WorkflowDefinition,
};
use chrono::Utc;
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn step(id: &str, action: StepAction) -> StepNode {
    StepNode {
        id: id.to_string(),
        name: None,
        action,
        outputs: HashMap::new(),
        retry: None,
        timeout_ms: None,
    }
}

pub fn step_with_outputs(id: &str, action: StepAction, outputs: &[(&str, &str)]) -> StepNode {
    let mut node = step(id, action);
    node.outputs = outputs
        .iter()
        .map(|(path, var)| (path.to_string(), var.to_string()))
        .collect();
    node
}

pub fn definition(steps: Vec<StepNode>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "wf-test".to_string(),
        name: "test-workflow".to_string(),
        version: "1.0.0".to_string(),
        description: None,
        tags: Vec::new(),
        inputs: Vec::new(),
        outputs: HashMap::new(),
        variables: Map::new(),
        steps,
        config: WorkflowConfig::default(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// ScriptedCapabilities
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    queues: HashMap<String, VecDeque<Result<Value, StepError>>>,
    calls: Vec<String>,
    delay: Option<Duration>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Capability provider that replays queued results per operation.
///
/// When an operation's queue is empty a canned success is returned. Every
/// call is logged as `op` so tests can assert on dispatch order.
#[derive(Clone, Default)]
pub struct ScriptedCapabilities {
    script: Arc<Mutex<Script>>,
}

impl ScriptedCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, op: &str, value: Value) {
        self.push(op, Ok(value));
    }

    pub fn push_err(&self, op: &str, error: StepError) {
        self.push(op, Err(error));
    }

    fn push(&self, op: &str, result: Result<Value, StepError>) {
        self.script
            .lock()
            .unwrap()
            .queues
            .entry(op.to_string())
            .or_default()
            .push_back(result);
    }

    /// Make every call sleep first (observes a paused tokio clock).
    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = Some(delay);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == op)
            .count()
    }

    pub fn call_log(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Most calls that were ever in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.script.lock().unwrap().peak_in_flight
    }

    async fn call(&self, op: &str, fallback: Value) -> Result<Value, StepError> {
        let (result, delay) = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(op.to_string());
            let result = script
                .queues
                .get_mut(op)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(fallback));
            script.in_flight += 1;
            script.peak_in_flight = script.peak_in_flight.max(script.in_flight);
            (result, script.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script.lock().unwrap().in_flight -= 1;
        result
    }
}

impl crate::provider::CapabilityProvider for ScriptedCapabilities {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn navigate(&self, params: &NavigateParams, _: Duration) -> Result<Value, StepError> {
        self.call("navigate", json!({"url": params.url, "status": 200}))
            .await
    }

    async fn click(&self, params: &ClickParams, _: Duration) -> Result<Value, StepError> {
        self.call("click", json!({"clicked": params.selector})).await
    }

    async fn fill(&self, params: &FillParams, _: Duration) -> Result<Value, StepError> {
        self.call("fill", json!({"filled": params.fields})).await
    }

    async fn extract(&self, params: &ExtractParams, _: Duration) -> Result<Value, StepError> {
        let record: Map<String, Value> = params
            .selectors
            .keys()
            .map(|k| (k.clone(), Value::String(String::new())))
            .collect();
        self.call("extract", Value::Object(record)).await
    }

    async fn screenshot(&self, params: &ScreenshotParams, _: Duration) -> Result<Value, StepError> {
        self.call("screenshot", json!({"artifact": "shot.png", "full_page": params.full_page}))
            .await
    }

    async fn wait_for(&self, selector: &str, _: Duration) -> Result<Value, StepError> {
        self.call("wait_for", json!({"found": selector})).await
    }
}
