//! Workflow definition parsing, validation, input binding and file operations.
//!
//! Converts between YAML/JSON documents and the canonical
//! `WorkflowDefinition`, validates structural constraints (unique IDs,
//! non-empty step lists, resolvable variable references) and binds caller
//! inputs against the declared input specs.

use std::collections::HashSet;
use std::path::Path;

use basset_types::workflow::{InputType, StepAction, StepNode, WaitParams, WorkflowDefinition};
use serde_json::{Map, Value};
use thiserror::Error;

use super::substitution::{STEPS_ROOT, contains_reference, references};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading, validating or binding a definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// A required input was neither supplied nor defaulted.
    #[error("missing required input '{0}'")]
    MissingInput(String),

    /// A supplied input has the wrong JSON type.
    #[error("input '{name}' must be of type {expected:?}")]
    InvalidInput { name: String, expected: InputType },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(message: impl Into<String>) -> DefinitionError {
    DefinitionError::Validation(message.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn serialize_workflow_json(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_json::to_string_pretty(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

fn is_json_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Load a definition from a `.json` file or, for any other extension, YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    if is_json_path(path) {
        parse_workflow_json(&content)
    } else {
        parse_workflow_yaml(&content)
    }
}

/// Save a definition, choosing the format from the file extension.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = if is_json_path(path) {
        serialize_workflow_json(def)?
    } else {
        serialize_workflow_yaml(def)?
    };
    std::fs::write(path, content)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Step tree helpers
// ---------------------------------------------------------------------------

/// Nested step lists of a control-flow node (empty for leaves).
pub fn child_lists(action: &StepAction) -> Vec<&[StepNode]> {
    match action {
        StepAction::Conditional(p) => vec![p.then_steps.as_slice(), p.else_steps.as_slice()],
        StepAction::Loop(p) => vec![p.body.as_slice()],
        StepAction::Parallel(p) => p.branches.iter().map(Vec::as_slice).collect(),
        _ => Vec::new(),
    }
}

/// Visit every node of the tree depth-first, parents before children.
pub fn walk_steps<'a>(steps: &'a [StepNode], visit: &mut impl FnMut(&'a StepNode)) {
    for step in steps {
        visit(step);
        for children in child_lists(&step.action) {
            walk_steps(children, visit);
        }
    }
}

/// Variables bound by the `outputs` maps of `steps` and their descendants.
pub fn bound_variables(steps: &[StepNode]) -> HashSet<String> {
    let mut bound = HashSet::new();
    walk_steps(steps, &mut |step| {
        bound.extend(step.outputs.values().cloned());
    });
    bound
}

/// Total number of nodes in the tree.
pub fn count_steps(steps: &[StepNode]) -> usize {
    let mut count = 0;
    walk_steps(steps, &mut |_| count += 1);
    count
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and at least one top-level step exists
/// - Step IDs are non-empty, use only `[A-Za-z0-9_-]` and are unique across
///   the whole tree
/// - Loop bodies, parallel branches and conditional `then` lists are non-empty
/// - Every `${...}` reference names an input, a seed variable, an output bound
///   by an earlier step, an enclosing loop variable or `steps`
/// - Expressions reference variables by name, never through `${...}`
/// - Timeouts, concurrency bounds, loop caps and retry attempts are positive
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.trim().is_empty() {
        return Err(invalid("workflow name must not be empty"));
    }
    if def.steps.is_empty() {
        return Err(invalid("workflow must have at least one step"));
    }

    let mut seen_ids = HashSet::new();
    let mut id_error = None;
    walk_steps(&def.steps, &mut |step| {
        if id_error.is_some() {
            return;
        }
        if step.id.is_empty()
            || !step
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            id_error = Some(invalid(format!(
                "step ID '{}' must be non-empty and contain only letters, digits, '-' or '_'",
                step.id
            )));
        } else if !seen_ids.insert(step.id.as_str()) {
            id_error = Some(invalid(format!("duplicate step ID: '{}'", step.id)));
        }
    });
    if let Some(err) = id_error {
        return Err(err);
    }

    if def.config.timeout_ms == Some(0) || def.config.step_timeout_ms == Some(0) {
        return Err(invalid("timeout must be > 0"));
    }
    if def.config.max_concurrency == Some(0) {
        return Err(invalid("max_concurrency must be >= 1"));
    }
    if def.config.retry.as_ref().is_some_and(|r| r.max_retries == 0) {
        return Err(invalid("retry.max_retries must be >= 1"));
    }

    let mut scope: HashSet<String> = def.inputs.iter().map(|i| i.name.clone()).collect();
    scope.extend(def.variables.keys().cloned());
    scope.insert(STEPS_ROOT.to_string());

    validate_steps(&def.steps, &mut scope)
}

fn validate_steps(steps: &[StepNode], scope: &mut HashSet<String>) -> Result<(), DefinitionError> {
    for step in steps {
        validate_step(step, scope)?;
        scope.extend(step.outputs.values().cloned());
    }
    Ok(())
}

fn check_references(
    step: &StepNode,
    value: &Value,
    scope: &HashSet<String>,
) -> Result<(), DefinitionError> {
    for name in references(value) {
        if !scope.contains(&name) {
            return Err(invalid(format!(
                "step '{}' references unknown variable '{name}'",
                step.id
            )));
        }
    }
    Ok(())
}

fn check_expression(step: &StepNode, expression: &str) -> Result<(), DefinitionError> {
    if expression.trim().is_empty() {
        return Err(invalid(format!("step '{}' has an empty expression", step.id)));
    }
    if contains_reference(expression) {
        return Err(invalid(format!(
            "step '{}': expressions reference variables by name, not '${{...}}'",
            step.id
        )));
    }
    Ok(())
}

fn validate_step(step: &StepNode, scope: &mut HashSet<String>) -> Result<(), DefinitionError> {
    if step.timeout_ms == Some(0) {
        return Err(invalid(format!("step '{}': timeout must be > 0", step.id)));
    }
    if step.retry.as_ref().is_some_and(|r| r.max_retries == 0) {
        return Err(invalid(format!("step '{}': retry.max_retries must be >= 1", step.id)));
    }

    match &step.action {
        StepAction::Conditional(params) => {
            check_expression(step, &params.condition)?;
            if params.then_steps.is_empty() {
                return Err(invalid(format!(
                    "conditional step '{}' must have at least one 'then' step",
                    step.id
                )));
            }
            // Either branch may run, so both contribute their bindings.
            let mut then_scope = scope.clone();
            validate_steps(&params.then_steps, &mut then_scope)?;
            let mut else_scope = scope.clone();
            validate_steps(&params.else_steps, &mut else_scope)?;
            scope.extend(then_scope);
            scope.extend(else_scope);
        }
        StepAction::Loop(params) => {
            check_references(step, &params.items, scope)?;
            if params.body.is_empty() {
                return Err(invalid(format!("loop step '{}' has an empty body", step.id)));
            }
            if params.item_var.is_empty() {
                return Err(invalid(format!("loop step '{}' has an empty item_var", step.id)));
            }
            if params.max_iterations == Some(0) {
                return Err(invalid(format!(
                    "loop step '{}': max_iterations must be >= 1",
                    step.id
                )));
            }
            let mut body_scope = scope.clone();
            body_scope.insert(params.item_var.clone());
            if let Some(index_var) = &params.index_var {
                body_scope.insert(index_var.clone());
            }
            validate_steps(&params.body, &mut body_scope)?;
            scope.extend(bound_variables(&params.body));
        }
        StepAction::Parallel(params) => {
            if params.branches.is_empty() {
                return Err(invalid(format!("parallel step '{}' has no branches", step.id)));
            }
            if params.max_concurrency == Some(0) {
                return Err(invalid(format!(
                    "parallel step '{}': max_concurrency must be >= 1",
                    step.id
                )));
            }
            for (index, branch) in params.branches.iter().enumerate() {
                if branch.is_empty() {
                    return Err(invalid(format!(
                        "parallel step '{}' branch {index} is empty",
                        step.id
                    )));
                }
                // Branches run concurrently and cannot see each other's bindings.
                let mut branch_scope = scope.clone();
                validate_steps(branch, &mut branch_scope)?;
            }
            for branch in &params.branches {
                scope.extend(bound_variables(branch));
            }
        }
        StepAction::Script(params) => check_expression(step, &params.expression)?,
        StepAction::Wait(WaitParams::Predicate { expression, .. }) => {
            check_expression(step, expression)?;
        }
        action => {
            let params = serde_json::to_value(action)
                .map_err(|e| DefinitionError::Parse(e.to_string()))?;
            check_references(step, &params, scope)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Input binding
// ---------------------------------------------------------------------------

/// Bind caller-supplied inputs against the definition's input specs.
///
/// Applies defaults, rejects missing required inputs and type mismatches.
/// Undeclared inputs are passed through unchanged.
pub fn bind_inputs(
    def: &WorkflowDefinition,
    provided: Map<String, Value>,
) -> Result<Map<String, Value>, DefinitionError> {
    let mut bound = provided;
    for declared in &def.inputs {
        let value = match bound.get(&declared.name) {
            Some(value) => value.clone(),
            None => match &declared.default {
                Some(default) => default.clone(),
                None if declared.required => {
                    return Err(DefinitionError::MissingInput(declared.name.clone()));
                }
                None => continue,
            },
        };
        if !declared.input_type.accepts(&value) {
            return Err(DefinitionError::InvalidInput {
                name: declared.name.clone(),
                expected: declared.input_type,
            });
        }
        bound.insert(declared.name.clone(), value);
    }
    Ok(bound)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
