// Built-in filter functions
// Targets of the pipe operator and direct calls, e.g. `files | join(' ')`

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::value::Value;

/// Error from a filter application, wrapped into a ResolutionError with the
/// call-site position by the evaluator
#[derive(Debug, Clone)]
pub struct FilterError {
    pub message: String,
}

impl FilterError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn arity(name: &str, expected: &str, got: usize) -> Self {
        Self::new(format!(
            "filter '{}' expects {} argument(s), got {}",
            name, expected, got
        ))
    }
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FilterError {}

/// Apply a built-in filter by name
pub fn apply_filter(name: &str, args: &[Value]) -> Result<Value, FilterError> {
    match name {
        "upper" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            Ok(Value::String(v.as_string().to_uppercase()))
        }
        "lower" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            Ok(Value::String(v.as_string().to_lowercase()))
        }
        "trim" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            Ok(Value::String(v.as_string().trim().to_string()))
        }
        "len" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            let n = match v {
                Value::String(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                other => {
                    return Err(FilterError::new(format!(
                        "len: expected string, list, or map, got {}",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Number(n as f64))
        }
        "default" => {
            let [v, fallback] = args else {
                return Err(FilterError::arity(name, "2", args.len()));
            };
            if matches!(v, Value::Null) {
                Ok(fallback.clone())
            } else {
                Ok(v.clone())
            }
        }
        "join" => {
            let (items, sep) = match args {
                [Value::List(items)] => (items, " ".to_string()),
                [Value::List(items), sep] => (items, sep.as_string()),
                [other, ..] => {
                    return Err(FilterError::new(format!(
                        "join: expected list, got {}",
                        other.type_name()
                    )))
                }
                [] => return Err(FilterError::arity(name, "1 or 2", 0)),
            };
            let parts: Vec<String> = items.iter().map(|v| v.as_string()).collect();
            Ok(Value::String(parts.join(&sep)))
        }
        "split" => {
            let [v, sep] = args else {
                return Err(FilterError::arity(name, "2", args.len()));
            };
            let parts = v
                .as_string()
                .split(&sep.as_string())
                .map(|s| Value::String(s.to_string()))
                .collect();
            Ok(Value::List(parts))
        }
        "replace" => {
            let [v, from, to] = args else {
                return Err(FilterError::arity(name, "3", args.len()));
            };
            Ok(Value::String(
                v.as_string().replace(&from.as_string(), &to.as_string()),
            ))
        }
        "contains" => {
            let [container, needle] = args else {
                return Err(FilterError::arity(name, "2", args.len()));
            };
            let found = match container {
                Value::String(s) => s.contains(&needle.as_string()),
                Value::List(items) => items.contains(needle),
                Value::Map(map) => map.contains_key(&needle.as_string()),
                other => {
                    return Err(FilterError::new(format!(
                        "contains: expected string, list, or map, got {}",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Bool(found))
        }
        "first" => {
            let [Value::List(items)] = args else {
                return Err(FilterError::new("first: expected a single list argument"));
            };
            Ok(items.first().cloned().unwrap_or(Value::Null))
        }
        "last" => {
            let [Value::List(items)] = args else {
                return Err(FilterError::new("last: expected a single list argument"));
            };
            Ok(items.last().cloned().unwrap_or(Value::Null))
        }
        "sorted" => {
            let [Value::List(items)] = args else {
                return Err(FilterError::new("sorted: expected a single list argument"));
            };
            let mut strs: Vec<(String, Value)> =
                items.iter().map(|v| (v.as_string(), v.clone())).collect();
            strs.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(Value::List(strs.into_iter().map(|(_, v)| v).collect()))
        }
        "unique" => {
            let [Value::List(items)] = args else {
                return Err(FilterError::new("unique: expected a single list argument"));
            };
            let mut seen = Vec::new();
            for item in items {
                if !seen.contains(item) {
                    seen.push(item.clone());
                }
            }
            Ok(Value::List(seen))
        }
        "keys" => {
            let [Value::Map(map)] = args else {
                return Err(FilterError::new("keys: expected a single map argument"));
            };
            Ok(Value::List(
                map.keys().map(|k| Value::String(k.clone())).collect(),
            ))
        }
        "values" => {
            let [Value::Map(map)] = args else {
                return Err(FilterError::new("values: expected a single map argument"));
            };
            Ok(Value::List(map.values().cloned().collect()))
        }
        "basename" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            let s = v.as_string();
            let base = Path::new(&s)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(Value::String(base))
        }
        "dirname" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            let s = v.as_string();
            let dir = Path::new(&s)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(Value::String(dir))
        }
        "stem" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            let s = v.as_string();
            let stem = Path::new(&s)
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(Value::String(stem))
        }
        "ext" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            let s = v.as_string();
            let ext = Path::new(&s)
                .extension()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(Value::String(ext))
        }
        "abs" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            let n = v
                .as_f64()
                .ok_or_else(|| FilterError::new("abs: expected a number"))?;
            Ok(Value::Number(n.abs()))
        }
        "min" => numeric_fold(name, args, f64::min),
        "max" => numeric_fold(name, args, f64::max),
        "string" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            Ok(Value::String(v.as_string()))
        }
        "number" => {
            let [v] = args else {
                return Err(FilterError::arity(name, "1", args.len()));
            };
            v.as_f64()
                .map(Value::Number)
                .ok_or_else(|| FilterError::new(format!("number: cannot convert {}", v.type_name())))
        }
        // List constructor used by list-literal expressions with non-constant
        // elements
        "list" => Ok(Value::List(args.to_vec())),
        "map" => {
            if args.len() % 2 != 0 {
                return Err(FilterError::new("map: expected an even number of arguments"));
            }
            let mut map = BTreeMap::new();
            for pair in args.chunks(2) {
                map.insert(pair[0].as_string(), pair[1].clone());
            }
            Ok(Value::Map(map))
        }
        _ => Err(FilterError::new(format!("unknown filter: '{}'", name))),
    }
}

fn numeric_fold(
    name: &str,
    args: &[Value],
    f: fn(f64, f64) -> f64,
) -> Result<Value, FilterError> {
    // Accept either a single list or two-or-more scalars
    let values: Vec<f64> = match args {
        [Value::List(items)] => items
            .iter()
            .map(|v| v.as_f64())
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| FilterError::new(format!("{}: non-numeric list element", name)))?,
        _ => args
            .iter()
            .map(|v| v.as_f64())
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| FilterError::new(format!("{}: non-numeric argument", name)))?,
    };

    let mut iter = values.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| FilterError::new(format!("{}: empty argument list", name)))?;
    Ok(Value::Number(iter.fold(first, f)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_filters() {
        assert_eq!(
            apply_filter("upper", &[Value::from("abc")]).unwrap(),
            Value::from("ABC")
        );
        assert_eq!(
            apply_filter("replace", &[Value::from("a.c"), Value::from("."), Value::from("_")])
                .unwrap(),
            Value::from("a_c")
        );
    }

    #[test]
    fn test_join_and_split() {
        let items = Value::List(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(
            apply_filter("join", &[items.clone(), Value::from("-")]).unwrap(),
            Value::from("a-b")
        );
        assert_eq!(
            apply_filter("split", &[Value::from("a-b"), Value::from("-")]).unwrap(),
            items
        );
    }

    #[test]
    fn test_default() {
        assert_eq!(
            apply_filter("default", &[Value::Null, Value::from("x")]).unwrap(),
            Value::from("x")
        );
        assert_eq!(
            apply_filter("default", &[Value::from("y"), Value::from("x")]).unwrap(),
            Value::from("y")
        );
    }

    #[test]
    fn test_path_filters() {
        assert_eq!(
            apply_filter("basename", &[Value::from("src/main.c")]).unwrap(),
            Value::from("main.c")
        );
        assert_eq!(
            apply_filter("stem", &[Value::from("src/main.c")]).unwrap(),
            Value::from("main")
        );
        assert_eq!(
            apply_filter("ext", &[Value::from("src/main.c")]).unwrap(),
            Value::from("c")
        );
    }

    #[test]
    fn test_wrong_arity() {
        assert!(apply_filter("upper", &[]).is_err());
        assert!(apply_filter("default", &[Value::Null]).is_err());
    }

    #[test]
    fn test_unknown_filter() {
        assert!(apply_filter("nope", &[Value::Null]).is_err());
    }

    #[test]
    fn test_min_max() {
        assert_eq!(
            apply_filter("min", &[Value::from(3.0), Value::from(1.0)]).unwrap(),
            Value::Number(1.0)
        );
        let list = Value::List(vec![Value::from(2.0), Value::from(5.0)]);
        assert_eq!(apply_filter("max", &[list]).unwrap(), Value::Number(5.0));
    }
}
