//! Computed input evaluation
//!
//! The graph only collects the values flowing into a computed input and
//! caches the result; deriving the value is delegated to an [`Evaluator`].
//! [`BuiltinEvaluator`] covers a handful of aggregate functions so graphs can
//! be exercised without an external expression runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeSet;
use thiserror::Error;

/// How collected values are presented to the evaluator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// `{value, resource, input}` envelopes
    Full,
    /// Raw values
    #[default]
    Values,
}

/// Everything the evaluator needs to derive one value
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRequest {
    pub resource: String,
    pub input: String,
    pub aggregation: Aggregation,
    pub lang: String,
    pub func: String,
    pub values: Vec<Value>,
}

/// Failures reported by an evaluator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Failed(String),
}

/// Derives a computed input value from its collected sources
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Value, EvaluationError>;
}

/// Evaluator for graphs without computed inputs; always fails
pub struct NoEvaluator;

impl Evaluator for NoEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Value, EvaluationError> {
        Err(EvaluationError::UnsupportedLanguage(request.lang.clone()))
    }
}

/// Aggregate functions for `lang = "builtin"`
///
/// Supported: `sum`, `min`, `max`, `count`, `first`, `last`, `concat`,
/// `join:<sep>` and `unique`. Envelopes are unwrapped to their `value`.
pub struct BuiltinEvaluator;

impl BuiltinEvaluator {
    pub const LANG: &'static str = "builtin";
}

impl Evaluator for BuiltinEvaluator {
    fn evaluate(&self, request: &EvaluationRequest) -> Result<Value, EvaluationError> {
        if request.lang != Self::LANG {
            return Err(EvaluationError::UnsupportedLanguage(request.lang.clone()));
        }

        let values: Vec<&Value> = request
            .values
            .iter()
            .map(|v| match request.aggregation {
                Aggregation::Full => v.get("value").unwrap_or(&Value::Null),
                Aggregation::Values => v,
            })
            .collect();

        let func = request.func.trim();
        if let Some(sep) = func.strip_prefix("join:") {
            let parts = values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>();
            return Ok(Value::String(parts.join(sep)));
        }

        match func {
            "count" => Ok(Value::from(values.len())),
            "first" => Ok(values.first().map_or(Value::Null, |v| (*v).clone())),
            "last" => Ok(values.last().map_or(Value::Null, |v| (*v).clone())),
            "sum" => {
                let numbers = numbers(&values)?;
                Ok(number(numbers.iter().sum()))
            }
            "min" => {
                let numbers = numbers(&values)?;
                Ok(numbers.into_iter().reduce(f64::min).map_or(Value::Null, number))
            }
            "max" => {
                let numbers = numbers(&values)?;
                Ok(numbers.into_iter().reduce(f64::max).map_or(Value::Null, number))
            }
            "concat" => {
                let mut out = Vec::new();
                for v in values {
                    match v {
                        Value::Array(items) => out.extend(items.iter().cloned()),
                        other => out.push(other.clone()),
                    }
                }
                Ok(Value::Array(out))
            }
            "unique" => {
                let mut seen = BTreeSet::new();
                let out = values
                    .into_iter()
                    .filter(|v| seen.insert(v.to_string()))
                    .cloned()
                    .collect();
                Ok(Value::Array(out))
            }
            other => Err(EvaluationError::UnknownFunction(other.to_string())),
        }
    }
}

fn numbers(values: &[&Value]) -> Result<Vec<f64>, EvaluationError> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| EvaluationError::InvalidArgument(format!("{v} is not a number")))
        })
        .collect()
}

/// Integral results stay integers
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(func: &str, values: Vec<Value>) -> EvaluationRequest {
        EvaluationRequest {
            resource: "r".into(),
            input: "total".into(),
            aggregation: Aggregation::Values,
            lang: "builtin".into(),
            func: func.into(),
            values,
        }
    }

    #[test]
    fn test_numeric_aggregates() {
        let eval = BuiltinEvaluator;
        let values = vec![json!(3), json!(1), json!(2)];
        assert_eq!(eval.evaluate(&request("sum", values.clone())).unwrap(), json!(6));
        assert_eq!(eval.evaluate(&request("min", values.clone())).unwrap(), json!(1));
        assert_eq!(eval.evaluate(&request("max", values.clone())).unwrap(), json!(3));
        assert_eq!(eval.evaluate(&request("count", values)).unwrap(), json!(3));
        assert_eq!(
            eval.evaluate(&request("sum", vec![json!(0.5), json!(1)])).unwrap(),
            json!(1.5)
        );
    }

    #[test]
    fn test_join_unwraps_envelopes() {
        let mut req = request(
            "join:,",
            vec![
                json!({"value": "a", "resource": "r1", "input": "x"}),
                json!({"value": "b", "resource": "r2", "input": "x"}),
            ],
        );
        req.aggregation = Aggregation::Full;
        assert_eq!(BuiltinEvaluator.evaluate(&req).unwrap(), json!("a,b"));
    }

    #[test]
    fn test_errors() {
        let eval = BuiltinEvaluator;
        assert!(matches!(
            eval.evaluate(&request("median", vec![])),
            Err(EvaluationError::UnknownFunction(_))
        ));
        assert!(matches!(
            eval.evaluate(&request("sum", vec![json!("x")])),
            Err(EvaluationError::InvalidArgument(_))
        ));

        let mut req = request("sum", vec![]);
        req.lang = "jinja".into();
        assert!(eval.evaluate(&req).is_err());
        assert!(NoEvaluator.evaluate(&request("sum", vec![])).is_err());
    }

    #[test]
    fn test_concat_and_unique() {
        let eval = BuiltinEvaluator;
        let values = vec![json!([1, 2]), json!(3), json!([1])];
        assert_eq!(eval.evaluate(&request("concat", values)).unwrap(), json!([1, 2, 3, 1]));
        let values = vec![json!("a"), json!("b"), json!("a")];
        assert_eq!(eval.evaluate(&request("unique", values)).unwrap(), json!(["a", "b"]));
    }
}
