use std::collections::HashMap;
use std::fmt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The per-execution variable bag.
pub type Variables = HashMap<String, StateValue>;

/// Well-known variable names written by the interpreter.
pub const LAST_USER_RESPONSE: &str = "lastUserResponse";
pub const DEFAULT_SAVE_AS: &str = "userResponse";
pub const WEBHOOK_RESPONSE: &str = "webhookResponse";
pub const WEBHOOK_ERROR: &str = "webhookError";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum StateValue {
    String(String),
    Number(f64),
    Boolean(bool),
    List(Vec<StateValue>),
    Map(HashMap<String, StateValue>),
    Null,
}

impl StateValue {
    pub fn as_str(&self) -> Option<&str> {
        if let StateValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        if let StateValue::Number(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let StateValue::Boolean(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, StateValue>> {
        if let StateValue::Map(m) = self {
            Some(m)
        } else {
            None
        }
    }

    /// Numeric view used by `greater_than` / `less_than`: numbers as-is,
    /// strings parsed after trimming.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            StateValue::String(s) => s.trim().parse::<f64>().ok(),
            StateValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StateValue::String(s) => json!(s),
            StateValue::Number(n) => json!(n),
            StateValue::Boolean(b) => json!(b),
            StateValue::List(l) => json!(l.iter().map(|v| v.to_json()).collect::<Vec<_>>()),
            StateValue::Map(m) => {
                json!(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<HashMap<_, _>>())
            }
            StateValue::Null => Value::Null,
        }
    }
}

/// Display form used for `{{var}}` substitution and string comparisons.
/// Integral numbers print without a trailing `.0`.
impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::String(s) => f.write_str(s),
            StateValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            StateValue::Number(n) => write!(f, "{}", n),
            StateValue::Boolean(b) => write!(f, "{}", b),
            StateValue::Null => Ok(()),
            other => f.write_str(&other.to_json().to_string()),
        }
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::String(s.to_string())
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::String(s)
    }
}

impl From<f64> for StateValue {
    fn from(n: f64) -> Self {
        StateValue::Number(n)
    }
}

impl From<bool> for StateValue {
    fn from(b: bool) -> Self {
        StateValue::Boolean(b)
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => StateValue::String(s),
            Value::Number(n) => n.as_f64().map(StateValue::Number).unwrap_or(StateValue::Null),
            Value::Bool(b) => StateValue::Boolean(b),
            Value::Array(a) => StateValue::List(a.into_iter().map(StateValue::from).collect()),
            Value::Object(o) => StateValue::Map(
                o.into_iter().map(|(k, v)| (k, StateValue::from(v))).collect(),
            ),
            Value::Null => StateValue::Null,
        }
    }
}

/// Converts a whole variable bag to a JSON object (webhook bodies, logs).
pub fn variables_to_json(vars: &Variables) -> Value {
    Value::Object(vars.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_value_accessors() {
        let string = StateValue::String("hello".into());
        assert_eq!(string.as_str(), Some("hello"));
        assert_eq!(string.as_number(), None);

        let number = StateValue::Number(42.0);
        assert_eq!(number.as_number(), Some(42.0));
        assert_eq!(number.as_str(), None);

        assert_eq!(StateValue::Boolean(true).as_bool(), Some(true));

        let mut map_data = HashMap::new();
        map_data.insert("k".into(), StateValue::Null);
        let map = StateValue::Map(map_data.clone());
        assert_eq!(map.as_map(), Some(&map_data));

        assert_eq!(StateValue::Null.as_str(), None);
    }

    #[test]
    fn display_drops_integral_fraction() {
        assert_eq!(StateValue::Number(30.0).to_string(), "30");
        assert_eq!(StateValue::Number(2.5).to_string(), "2.5");
        assert_eq!(StateValue::Boolean(false).to_string(), "false");
        assert_eq!(StateValue::Null.to_string(), "");
        assert_eq!(StateValue::from("Alice").to_string(), "Alice");
    }

    #[test]
    fn numeric_view_parses_strings() {
        assert_eq!(StateValue::from(" 85 ").to_f64(), Some(85.0));
        assert_eq!(StateValue::from("abc").to_f64(), None);
        assert_eq!(StateValue::Null.to_f64(), None);
    }

    #[test]
    fn json_conversion_keeps_nested_shape() {
        let v = StateValue::from(json!({"order": {"id": 7, "items": ["a", "b"]}, "ok": true}));
        let order = v.as_map().unwrap().get("order").unwrap().as_map().unwrap();
        assert_eq!(order.get("id"), Some(&StateValue::Number(7.0)));
        assert_eq!(v.to_json(), json!({"order": {"id": 7.0, "items": ["a", "b"]}, "ok": true}));
    }

    #[test]
    fn untagged_serde_round_trips_plain_json() {
        let vars: Variables = serde_json::from_value(json!({"name": "World", "age": 3, "vip": true}))
            .unwrap();
        assert_eq!(vars.get("name"), Some(&StateValue::from("World")));
        assert_eq!(vars.get("age"), Some(&StateValue::Number(3.0)));
        assert_eq!(variables_to_json(&vars)["vip"], json!(true));
    }
}
