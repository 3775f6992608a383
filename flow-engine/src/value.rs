// Dynamic value type
// Shared by parameters, expressions, matrix variables, and data-item attributes

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A dynamic value flowing through elaboration and execution.
///
/// Maps are ordered (BTreeMap) so the canonical JSON rendering used for
/// cache keys is stable across runs and hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    /// Truthiness used by boolean operators and conditions
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    /// Render as a plain string (string interpolation, event payloads)
    pub fn as_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.as_string()).collect();
                parts.join(",")
            }
            Value::Map(_) => self.canonical_json(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Canonical JSON rendering: map keys sorted, no insignificant whitespace.
    /// Used as the stable parameter serialization inside cache keys.
    pub fn canonical_json(&self) -> String {
        // BTreeMap keys are already sorted, so plain serialization is canonical
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    /// Convert a serde_yaml value into an engine value
    pub fn from_yaml(yaml: &serde_yaml::Value) -> Value {
        match yaml {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => {
                Value::Number(n.as_f64().unwrap_or(n.as_i64().unwrap_or(0) as f64))
            }
            serde_yaml::Value::String(s) => Value::String(s.clone()),
            serde_yaml::Value::Sequence(seq) => {
                Value::List(seq.iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => Value::Map(
                map.iter()
                    .filter_map(|(k, v)| k.as_str().map(|key| (key.to_string(), Value::from_yaml(v))))
                    .collect(),
            ),
            serde_yaml::Value::Tagged(_) => Value::Null, // not supported
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(1.5).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(Value::String("x".to_string()).is_truthy());
        assert!(!Value::List(Vec::new()).is_truthy());
    }

    #[test]
    fn test_as_string_integer_numbers() {
        assert_eq!(Value::Number(42.0).as_string(), "42");
        assert_eq!(Value::Number(3.5).as_string(), "3.5");
    }

    #[test]
    fn test_canonical_json_sorted_keys() {
        let mut map = BTreeMap::new();
        map.insert("zeta".to_string(), Value::Number(1.0));
        map.insert("alpha".to_string(), Value::Bool(true));
        let value = Value::Map(map);

        assert_eq!(value.canonical_json(), r#"{"alpha":true,"zeta":1.0}"#);
    }

    #[test]
    fn test_from_yaml() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("{a: 1, b: [x, y], c: true}").unwrap();
        let value = Value::from_yaml(&yaml);

        if let Value::Map(map) = value {
            assert_eq!(map.get("a"), Some(&Value::Number(1.0)));
            assert_eq!(
                map.get("b"),
                Some(&Value::List(vec![
                    Value::String("x".to_string()),
                    Value::String("y".to_string())
                ]))
            );
            assert_eq!(map.get("c"), Some(&Value::Bool(true)));
        } else {
            panic!("expected map");
        }
    }
}
