//! JEXL expression evaluator for conditional, script and predicate-wait steps.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms and
//! provides convenience methods for boolean evaluation over an execution's
//! variables. Expressions see a read-only snapshot: every variable at the top
//! level plus `steps.<id>` for recorded step results. There is no access to
//! providers, the filesystem or the host.
//!
//! **Security note:** values are always passed as context objects, NEVER
//! interpolated into expression strings.

use basset_types::error::{ErrorKind, StepError};
use serde_json::{Map, Number, Value, json};

use super::substitution::STEPS_ROOT;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Longest accepted expression, in bytes.
pub const MAX_EXPRESSION_LENGTH: usize = 4_096;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("Expression exceeds {max} bytes (got {len})")]
    TooLong { len: usize, max: usize },
}

impl From<ExpressionError> for StepError {
    fn from(err: ExpressionError) -> Self {
        let kind = match err {
            ExpressionError::TooLong { .. } => ErrorKind::Security,
            ExpressionError::EvalFailed(_) | ExpressionError::InvalidContext(_) => {
                ErrorKind::Expression
            }
        };
        StepError::new(kind, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for:
/// - Conditional step branching (e.g. `results|length > 0`)
/// - Script steps (e.g. `item * 2`)
/// - Predicate waits (e.g. `steps['poll'].ready == true`)
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!is_truthy(&val)))
            })
            // String search transforms
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Length transform (works on strings, arrays, and objects)
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            // Collection transforms
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            })
            .with_transform("first", |args: &[Value]| {
                let first = match args.first() {
                    Some(Value::Array(a)) => a.first().cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                Ok(first)
            })
            .with_transform("join", |args: &[Value]| {
                let separator = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let joined = match args.first() {
                    Some(Value::Array(a)) => a
                        .iter()
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(separator),
                    _ => String::new(),
                };
                Ok(json!(joined))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Expression results are coerced
    /// to boolean using JavaScript-like truthiness rules.
    pub fn evaluate_bool(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(is_truthy(&result))
    }

    /// Evaluate an expression and return the raw JSON value.
    ///
    /// Integral floats are normalized to integers so results compare equal
    /// to the JSON a user would write (`2`, not `2.0`).
    pub fn evaluate_value(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        if expression.len() > MAX_EXPRESSION_LENGTH {
            return Err(ExpressionError::TooLong {
                len: expression.len(),
                max: MAX_EXPRESSION_LENGTH,
            });
        }
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map(normalize_numbers)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build the JSON object expressions evaluate against.
///
/// Shape: every variable at the top level, plus
/// `steps: { "<step_id>": <result>, ... }` unless a variable named `steps`
/// shadows it.
pub fn expression_context(
    variables: &Map<String, Value>,
    step_results: &Map<String, Value>,
) -> Value {
    let mut context = variables.clone();
    context
        .entry(STEPS_ROOT)
        .or_insert_with(|| Value::Object(step_results.clone()));
    Value::Object(context)
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Replace integral floats with integers, recursively.
pub fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => {
            let f = n.as_f64().unwrap_or(f64::NAN);
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
                Value::Number(Number::from(f as i64))
            } else {
                Value::Number(n)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> WorkflowEvaluator {
        WorkflowEvaluator::new()
    }

    #[test]
    fn test_dot_notation_nested() {
        let ctx = json!({"profile": {"user": {"name": "Alice"}}});
        let result = evaluator().evaluate_value("profile.user.name", &ctx).unwrap();
        assert_eq!(result, json!("Alice"));
    }

    #[test]
    fn test_array_indexing() {
        let ctx = json!({"tags": ["rust", "wasm", "jexl"]});
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("tags[0]", &ctx).unwrap(), json!("rust"));
        assert_eq!(eval.evaluate_value("tags[2]", &ctx).unwrap(), json!("jexl"));
    }

    #[test]
    fn test_boolean_operators() {
        let ctx = json!({"status": 200, "title": "Home"});
        let eval = evaluator();
        assert!(eval.evaluate_bool("status == 200 && title == 'Home'", &ctx).unwrap());
        assert!(!eval.evaluate_bool("status == 404 || title == 'Away'", &ctx).unwrap());
    }

    #[test]
    fn test_arithmetic_normalizes_integers() {
        let ctx = json!({"item": 3});
        let result = evaluator().evaluate_value("item * 2", &ctx).unwrap();
        assert_eq!(result, json!(6));
        assert!(result.is_i64());

        let result = evaluator().evaluate_value("item / 2", &ctx).unwrap();
        assert_eq!(result, json!(1.5));
    }

    #[test]
    fn test_transforms() {
        let ctx = json!({"name": "  Alice  ", "msg": "connection timeout", "items": [1, 2, 3]});
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("name|trim|lower", &ctx).unwrap(), json!("alice"));
        assert!(eval.evaluate_bool("msg|contains('timeout')", &ctx).unwrap());
        assert!(eval.evaluate_bool("msg|startsWith('conn')", &ctx).unwrap());
        assert_eq!(eval.evaluate_value("items|length", &ctx).unwrap(), json!(3));
        assert_eq!(eval.evaluate_value("items|first", &ctx).unwrap(), json!(1));
        assert_eq!(eval.evaluate_value("items|join('-')", &ctx).unwrap(), json!("1-2-3"));
    }

    #[test]
    fn test_transform_not() {
        let eval = evaluator();
        assert!(!eval.evaluate_bool("(active)|not", &json!({"active": true})).unwrap());
        assert!(eval.evaluate_bool("(active)|not", &json!({"active": false})).unwrap());
    }

    #[test]
    fn test_ternary_expression() {
        let eval = evaluator();
        let result = eval
            .evaluate_value("(count > 5) ? 'high' : 'low'", &json!({"count": 10}))
            .unwrap();
        assert_eq!(result, json!("high"));
    }

    #[test]
    fn test_truthiness() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("val", &json!({"val": "x"})).unwrap());
        assert!(!eval.evaluate_bool("val", &json!({"val": ""})).unwrap());
        assert!(!eval.evaluate_bool("val", &json!({"val": 0})).unwrap());
        assert!(!eval.evaluate_bool("page.missing", &json!({"page": {}})).unwrap());
    }

    #[test]
    fn test_invalid_context_not_object() {
        assert!(evaluator().evaluate_bool("true", &json!("string")).is_err());
    }

    #[test]
    fn test_syntax_error_maps_to_expression_kind() {
        let err = evaluator().evaluate_value("a ==", &json!({})).unwrap_err();
        let step_err: StepError = err.into();
        assert_eq!(step_err.kind(), ErrorKind::Expression);
        assert!(!step_err.is_retryable());
    }

    #[test]
    fn test_overlong_expression_is_security_error() {
        let expression = "a".repeat(MAX_EXPRESSION_LENGTH + 1);
        let err = evaluator().evaluate_value(&expression, &json!({})).unwrap_err();
        assert!(matches!(err, ExpressionError::TooLong { .. }));
        let step_err: StepError = err.into();
        assert_eq!(step_err.kind(), ErrorKind::Security);
    }

    #[test]
    fn test_expression_context_exposes_steps() {
        let vars = json!({"threshold": 2}).as_object().cloned().unwrap();
        let results = json!({"count-links": 5}).as_object().cloned().unwrap();
        let ctx = expression_context(&vars, &results);
        assert!(
            evaluator()
                .evaluate_bool("steps['count-links'] > threshold", &ctx)
                .unwrap()
        );
    }

    #[test]
    fn test_normalize_numbers_nested() {
        let value = json!({"a": [1.0, 2.5, {"b": -4.0}]});
        assert_eq!(normalize_numbers(value), json!({"a": [1, 2.5, {"b": -4}]}));
    }
}
