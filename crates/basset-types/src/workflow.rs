//! Workflow definition types for Basset.
//!
//! A `WorkflowDefinition` is the canonical form of an automation: YAML files,
//! JSON documents and the workflow store all convert to and from it. Steps
//! form a tree: `conditional`, `loop` and `parallel` nodes carry nested step
//! lists, every other kind is a leaf delegated to an external provider.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A named, versioned template of steps, inputs and outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique ID. Assigned by the store when empty.
    #[serde(default)]
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form tags used by store search.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Typed parameters supplied by the caller at execution time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputSpec>,
    /// Output name -> variable reference (`name` or `name.path`) resolved on completion.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    /// Initial variable seed.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    /// Top-level step list, executed in order.
    pub steps: Vec<StepNode>,
    #[serde(default)]
    pub config: WorkflowConfig,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A typed workflow input parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    /// Required inputs without a default must be supplied by the caller.
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

/// JSON type accepted by an input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl InputType {
    /// Whether `value` has this JSON type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            InputType::Any => true,
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Integer => value.is_i64() || value.is_u64(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
        }
    }
}

/// Per-workflow execution settings. Unset fields fall back to engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Overall execution timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Default timeout for leaf steps in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_ms: Option<u64>,
    /// Default retry policy for every step without its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Default concurrency bound for parallel steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// How and how often a failing step is re-attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, counting the first one (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds (default 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds (default 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            strategy: BackoffStrategy::default(),
        }
    }
}

/// Growth of the delay between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^attempt`
    #[default]
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
}

// ---------------------------------------------------------------------------
// Step tree
// ---------------------------------------------------------------------------

/// A single node of the step tree.
///
/// Serialized with the kind and its parameters side by side:
/// ```yaml
/// - id: open-profile
///   type: navigate
///   params:
///     url: "https://example.com/${username}"
///   outputs:
///     title: page_title
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    /// Unique within the defining workflow.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub action: StepAction,
    /// Result field path -> variable name. The path `$` binds the whole result.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, String>,
    /// Overrides the workflow retry policy for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Overrides the workflow step timeout for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepNode {
    /// Display name, falling back to the ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// The kind of a step together with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum StepAction {
    Navigate(NavigateParams),
    Click(ClickParams),
    Fill(FillParams),
    Extract(ExtractParams),
    Detect(DetectParams),
    Wait(WaitParams),
    Screenshot(ScreenshotParams),
    Conditional(ConditionalParams),
    Loop(LoopParams),
    Parallel(ParallelParams),
    Script(ScriptParams),
    Verify(VerifyParams),
    Ingest(IngestParams),
}

impl StepAction {
    /// The serialized `type` tag of this step kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Navigate(_) => "navigate",
            StepAction::Click(_) => "click",
            StepAction::Fill(_) => "fill",
            StepAction::Extract(_) => "extract",
            StepAction::Detect(_) => "detect",
            StepAction::Wait(_) => "wait",
            StepAction::Screenshot(_) => "screenshot",
            StepAction::Conditional(_) => "conditional",
            StepAction::Loop(_) => "loop",
            StepAction::Parallel(_) => "parallel",
            StepAction::Script(_) => "script",
            StepAction::Verify(_) => "verify",
            StepAction::Ingest(_) => "ingest",
        }
    }

    /// Control-flow nodes recurse into nested step lists.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            StepAction::Conditional(_) | StepAction::Loop(_) | StepAction::Parallel(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigateParams {
    pub url: String,
    /// CSS selector that must appear before navigation counts as complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickParams {
    pub selector: String,
    /// Selector to wait for after the click.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillParams {
    /// Selector -> value.
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub submit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_selector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractParams {
    /// Record field -> selector.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub selectors: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExtractMode>,
}

/// Whole-page extraction modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMode {
    Text,
    Html,
    Links,
    Forms,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
    /// Built-in pattern names (`email`, `phone`, `url`, ...).
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Extra named regular expressions.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, String>,
    /// Text to scan. When absent the current page text is extracted first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// What a wait step blocks on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitParams {
    /// Sleep for a fixed duration.
    Time { duration_ms: u64 },
    /// Wait until a selector is present on the page.
    Element {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Poll an expression until it is truthy.
    ///
    /// Every poll re-reads the page through the capability provider and
    /// exposes it to the expression as `page`: the extracted record when
    /// `selectors` is set, otherwise `{ text }` with the page text.
    Predicate {
        expression: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        selectors: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_interval_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotParams {
    #[serde(default)]
    pub full_page: bool,
    /// Capture only this element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Image format (`png`, `jpeg`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Label attached to the evidence entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalParams {
    /// Boolean expression over the current variables.
    pub condition: String,
    #[serde(rename = "then")]
    pub then_steps: Vec<StepNode>,
    #[serde(rename = "else", default, skip_serializing_if = "Vec::is_empty")]
    pub else_steps: Vec<StepNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopParams {
    /// A literal array or a `${variable}` reference resolving to one.
    pub items: Value,
    /// Variable bound to the current item.
    #[serde(default = "default_item_var")]
    pub item_var: String,
    /// Variable bound to the current zero-based index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    /// Fail when the item count exceeds this cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Record failed iterations and keep going instead of failing the loop.
    #[serde(default)]
    pub continue_on_error: bool,
    pub body: Vec<StepNode>,
}

fn default_item_var() -> String {
    "item".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelParams {
    /// Each branch is an ordered step list.
    pub branches: Vec<Vec<StepNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptParams {
    /// Expression evaluated over a read-only snapshot of the variables.
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyParams {
    /// Format to check (`email`, `phone`, `url`, ...).
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestParams {
    pub entity_type: String,
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
