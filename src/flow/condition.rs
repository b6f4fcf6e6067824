use serde_json::Value;

use crate::flow::model::ConditionOperator;
use crate::flow::state::StateValue;

fn compare_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => StateValue::from(other.clone()).to_string(),
    }
}

fn compare_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Evaluates one edge condition against a variable value.
///
/// `equals` is loose: numeric when either side is a number or boolean and
/// both parse as numbers, otherwise the display strings are compared. A missing variable compares as the
/// empty string. Unrecognised operators evaluate to `true`.
pub fn evaluate_condition(value: Option<&StateValue>, operator: &ConditionOperator, compare: &Value) -> bool {
    let left_text = value.map(|v| v.to_string()).unwrap_or_default();
    let left_num = value.and_then(|v| v.to_f64());

    match operator {
        ConditionOperator::Equals => {
            let typed = matches!(value, Some(StateValue::Number(_) | StateValue::Boolean(_)))
                || matches!(compare, Value::Number(_) | Value::Bool(_));
            match (typed, left_num, compare_number(compare)) {
                (true, Some(a), Some(b)) => a == b,
                _ => left_text == compare_text(compare),
            }
        }
        ConditionOperator::Contains => left_text
            .to_lowercase()
            .contains(&compare_text(compare).to_lowercase()),
        ConditionOperator::StartsWith => left_text
            .to_lowercase()
            .starts_with(&compare_text(compare).to_lowercase()),
        ConditionOperator::GreaterThan => match (left_num, compare_number(compare)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOperator::LessThan => match (left_num, compare_number(compare)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ConditionOperator::Other(name) => {
            tracing::warn!(operator = %name, "unknown condition operator, treating as true");
            true
        }
    }
}
