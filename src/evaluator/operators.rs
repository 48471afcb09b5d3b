//! Comparison operators for convergence predicates.
//!
//! Numeric operands are coerced through `f64` (numeric strings included);
//! equality on numbers uses an epsilon. A comparison whose operands cannot
//! be coerced to a common type is simply `false` — convergence predicates
//! never fail at run time.

use serde_json::Value;

/// Comparison operator of a single predicate term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
}

impl ComparisonOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::Equal => "==",
            ComparisonOperator::NotEqual => "!=",
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::GreaterOrEqual => ">=",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::LessOrEqual => "<=",
        }
    }
}

/// Evaluate `actual <op> expected`.
pub fn compare(op: ComparisonOperator, actual: &Value, expected: &Value) -> bool {
    match op {
        ComparisonOperator::Equal => equal(actual, expected),
        ComparisonOperator::NotEqual => !equal(actual, expected),
        ComparisonOperator::GreaterThan => numeric(actual, expected, |a, b| a > b),
        ComparisonOperator::GreaterOrEqual => numeric(actual, expected, |a, b| a >= b),
        ComparisonOperator::LessThan => numeric(actual, expected, |a, b| a < b),
        ComparisonOperator::LessOrEqual => numeric(actual, expected, |a, b| a <= b),
    }
}

fn numeric(actual: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (as_f64(actual), as_f64(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        // Numbers (and numeric strings) compare through f64 with epsilon.
        _ => match (as_f64(actual), as_f64(expected)) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
    }
}
