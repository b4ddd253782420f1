//! `${name}` / `${name.path}` variable substitution over step parameters.
//!
//! A string that is exactly one reference resolves to the referenced JSON
//! value with its type intact; references embedded in longer strings are
//! stringified. Seed values (definition variables and caller inputs) that
//! themselves contain references are expanded recursively, and a reference
//! that (directly or indirectly) needs itself is rejected as a cycle. Values
//! produced at runtime are data and are never re-read as templates.

use basset_types::error::StepError;
use serde_json::{Map, Value};
use thiserror::Error;

/// Pseudo-variable that exposes recorded step results: `${steps.<id>.field}`.
pub const STEPS_ROOT: &str = "steps";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstitutionError {
    #[error("unresolved variable reference '${{{0}}}'")]
    Unresolved(String),

    #[error("cyclic variable reference: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("unterminated variable reference in '{0}'")]
    Unterminated(String),

    #[error("empty variable reference in '{0}'")]
    Empty(String),
}

impl From<SubstitutionError> for StepError {
    fn from(err: SubstitutionError) -> Self {
        StepError::configuration(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Template parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Reference(&'a str),
}

fn parse_template(template: &str) -> Result<Vec<Segment<'_>>, SubstitutionError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| SubstitutionError::Unterminated(template.to_string()))?;
        let reference = after[..end].trim();
        if reference.is_empty() {
            return Err(SubstitutionError::Empty(template.to_string()));
        }
        segments.push(Segment::Reference(reference));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// Root variable names referenced anywhere inside `value`.
///
/// Malformed templates contribute nothing; they surface when substituted.
pub fn references(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_references(value, &mut out);
    out
}

fn collect_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Ok(segments) = parse_template(s) {
                for segment in segments {
                    if let Segment::Reference(reference) = segment {
                        let root = reference.split('.').next().unwrap_or(reference);
                        if !out.iter().any(|r| r == root) {
                            out.push(root.to_string());
                        }
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

/// Whether `s` contains a `${` marker.
pub fn contains_reference(s: &str) -> bool {
    s.contains("${")
}

/// Walk a dotted path into a JSON value. Numeric segments index arrays.
pub fn lookup_path<'v>(root: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Render a value for embedding inside a larger string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Substituter
// ---------------------------------------------------------------------------

/// Resolves references against the variables and recorded step results of
/// one execution.
#[derive(Debug, Clone, Copy)]
pub struct Substituter<'a> {
    variables: &'a Map<String, Value>,
    step_results: &'a Map<String, Value>,
    defaults: Option<&'a Map<String, Value>>,
    inputs: Option<&'a Map<String, Value>>,
}

impl<'a> Substituter<'a> {
    pub fn new(variables: &'a Map<String, Value>, step_results: &'a Map<String, Value>) -> Self {
        Self {
            variables,
            step_results,
            defaults: None,
            inputs: None,
        }
    }

    /// Treat variables still holding their seed value as templates.
    ///
    /// The seed of a name is its caller input, else its definition default.
    /// A variable overwritten at runtime no longer matches and stays literal.
    pub fn with_seeds(
        mut self,
        defaults: &'a Map<String, Value>,
        inputs: &'a Map<String, Value>,
    ) -> Self {
        self.defaults = Some(defaults);
        self.inputs = Some(inputs);
        self
    }

    /// Substitute every reference inside `value`, recursing through arrays
    /// and objects. Object keys are left untouched.
    pub fn substitute(&self, value: &Value) -> Result<Value, SubstitutionError> {
        let mut stack = Vec::new();
        self.resolve_value(value, &mut stack)
    }

    /// Resolve a single `name.path` reference.
    pub fn resolve_reference(&self, reference: &str) -> Result<Value, SubstitutionError> {
        let mut stack = Vec::new();
        self.resolve_ref(reference, &mut stack)
    }

    fn resolve_value(
        &self,
        value: &Value,
        stack: &mut Vec<String>,
    ) -> Result<Value, SubstitutionError> {
        match value {
            Value::String(s) => self.resolve_str(s, stack),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, stack))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.resolve_value(item, stack)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_str(&self, s: &str, stack: &mut Vec<String>) -> Result<Value, SubstitutionError> {
        if !contains_reference(s) {
            return Ok(Value::String(s.to_string()));
        }

        let segments = parse_template(s)?;
        if let [Segment::Reference(reference)] = segments.as_slice() {
            return self.resolve_ref(reference, stack);
        }

        let mut rendered = String::with_capacity(s.len());
        for segment in segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Reference(reference) => {
                    rendered.push_str(&value_to_string(&self.resolve_ref(reference, stack)?));
                }
            }
        }
        Ok(Value::String(rendered))
    }

    fn resolve_ref(
        &self,
        reference: &str,
        stack: &mut Vec<String>,
    ) -> Result<Value, SubstitutionError> {
        if stack.iter().any(|r| r == reference) {
            let mut chain = stack.clone();
            chain.push(reference.to_string());
            return Err(SubstitutionError::Cycle(chain));
        }

        let (raw, expand) = self
            .lookup(reference)
            .ok_or_else(|| SubstitutionError::Unresolved(reference.to_string()))?;
        if !expand {
            return Ok(raw.clone());
        }

        stack.push(reference.to_string());
        let resolved = self.resolve_value(raw, stack);
        stack.pop();
        resolved
    }

    /// The referenced value and whether it is a template to expand further.
    fn lookup(&self, reference: &str) -> Option<(&'a Value, bool)> {
        let mut parts = reference.split('.');
        let root = parts.next()?;
        let path: Vec<&str> = parts.collect();

        if let Some(value) = self.variables.get(root) {
            return lookup_path(value, &path).map(|found| (found, self.is_seed(root, value)));
        }
        if root == STEPS_ROOT {
            let (step_id, rest) = path.split_first()?;
            return lookup_path(self.step_results.get(*step_id)?, rest).map(|found| (found, false));
        }
        None
    }

    fn is_seed(&self, name: &str, value: &Value) -> bool {
        let seed = self
            .inputs
            .and_then(|inputs| inputs.get(name))
            .or_else(|| self.defaults.and_then(|defaults| defaults.get(name)));
        seed == Some(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
