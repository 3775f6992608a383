// Expression evaluator
// Walks the AST against a scope stack and an optional package registry

use std::fmt;

use super::filters::apply_filter;
use super::lexer::{extract_expressions, Segment};
use super::parser::{parse_expression, BinaryOp, Expr, UnaryOp};
use super::scope::{QualifiedResolver, ScopeStack};
use crate::value::Value;

/// Fatal resolution failure carrying the source position of the offending
/// token
#[derive(Debug, Clone)]
pub struct ResolutionError {
    pub message: String,
    pub pos: usize,
}

impl ResolutionError {
    pub fn new(message: impl Into<String>, pos: usize) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resolution error at position {}: {}", self.pos, self.message)
    }
}

impl std::error::Error for ResolutionError {}

/// Expression evaluator over a scope stack.
///
/// A registry handle enables fully-qualified `package.name` references; when
/// absent, only the scope stack is consulted.
pub struct Evaluator<'a> {
    scope: &'a ScopeStack,
    registry: Option<&'a dyn QualifiedResolver>,
}

impl<'a> Evaluator<'a> {
    pub fn new(scope: &'a ScopeStack) -> Self {
        Self {
            scope,
            registry: None,
        }
    }

    pub fn with_registry(scope: &'a ScopeStack, registry: &'a dyn QualifiedResolver) -> Self {
        Self {
            scope,
            registry: Some(registry),
        }
    }

    /// Evaluate a parsed expression
    pub fn eval(&self, expr: &Expr) -> Result<Value, ResolutionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),

            Expr::Var { name, pos } => self
                .scope
                .lookup(name)
                .ok_or_else(|| ResolutionError::new(format!("unresolved identifier: '{}'", name), *pos)),

            Expr::Member { base, member, pos } => {
                // Qualified package reference bypasses the scope stack
                if let Expr::Var { name, .. } = base.as_ref() {
                    if let Some(registry) = self.registry {
                        if registry.is_package(name) {
                            return registry.resolve_qualified(name, member).ok_or_else(|| {
                                ResolutionError::new(
                                    format!("package '{}' has no parameter '{}'", name, member),
                                    *pos,
                                )
                            });
                        }
                    }
                }

                let base_value = self.eval(base)?;
                match base_value {
                    Value::Map(map) => map.get(member).cloned().ok_or_else(|| {
                        ResolutionError::new(format!("no member '{}'", member), *pos)
                    }),
                    other => Err(ResolutionError::new(
                        format!("cannot access member '{}' of {}", member, other.type_name()),
                        *pos,
                    )),
                }
            }

            Expr::Index { base, index, pos } => {
                let base_value = self.eval(base)?;
                let index_value = self.eval(index)?;
                self.index(&base_value, &index_value, *pos)
            }

            Expr::Slice {
                base,
                start,
                end,
                pos,
            } => {
                let base_value = self.eval(base)?;
                let start = self.eval_bound(start, *pos)?;
                let end = self.eval_bound(end, *pos)?;
                self.slice(&base_value, start, end, *pos)
            }

            Expr::Call { name, args, pos } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                apply_filter(name, &values).map_err(|e| ResolutionError::new(e.message, *pos))
            }

            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => value
                        .as_f64()
                        .map(|n| Value::Number(-n))
                        .ok_or_else(|| ResolutionError::new(
                            format!("cannot negate {}", value.type_name()),
                            0,
                        )),
                }
            }

            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
        }
    }

    /// Lex, parse, and evaluate a single expression string
    pub fn eval_str(&self, input: &str) -> Result<Value, ResolutionError> {
        let expr = parse_expression(input)
            .map_err(|e| ResolutionError::new(e.message, e.pos))?;
        self.eval(&expr)
    }

    /// Resolve a string containing zero or more `${{ }}` expressions.
    ///
    /// A string that is exactly one expression keeps the expression's type;
    /// mixed text and expressions concatenate into a string.
    pub fn interpolate(&self, input: &str) -> Result<Value, ResolutionError> {
        let segments = extract_expressions(input);

        if let [Segment::Expr(expr)] = segments.as_slice() {
            return self.eval_str(expr);
        }

        let mut out = String::new();
        for segment in &segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) => out.push_str(&self.eval_str(expr)?.as_string()),
            }
        }
        Ok(Value::String(out))
    }

    /// Recursively resolve every string inside a value
    pub fn resolve_value(&self, value: &Value) -> Result<Value, ResolutionError> {
        match value {
            Value::String(s) => self.interpolate(s),
            Value::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.resolve_value(item)?);
                }
                Ok(Value::List(resolved))
            }
            Value::Map(map) => {
                let mut resolved = std::collections::BTreeMap::new();
                for (key, item) in map {
                    resolved.insert(key.clone(), self.resolve_value(item)?);
                }
                Ok(Value::Map(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, ResolutionError> {
        // Short-circuit boolean operators return the deciding operand
        match op {
            BinaryOp::Or => {
                let l = self.eval(left)?;
                return if l.is_truthy() { Ok(l) } else { self.eval(right) };
            }
            BinaryOp::And => {
                let l = self.eval(left)?;
                return if l.is_truthy() { self.eval(right) } else { Ok(l) };
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;

        match op {
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ord = compare(&l, &r)?;
                let result = match op {
                    BinaryOp::Lt => ord.is_lt(),
                    BinaryOp::Le => ord.is_le(),
                    BinaryOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                };
                Ok(Value::Bool(result))
            }
            BinaryOp::Add => match (&l, &r) {
                (Value::String(_), _) | (_, Value::String(_)) => {
                    Ok(Value::String(format!("{}{}", l.as_string(), r.as_string())))
                }
                (Value::List(a), Value::List(b)) => {
                    let mut out = a.clone();
                    out.extend(b.clone());
                    Ok(Value::List(out))
                }
                _ => numeric_op(&l, &r, "+", |a, b| Ok(a + b)),
            },
            BinaryOp::Sub => numeric_op(&l, &r, "-", |a, b| Ok(a - b)),
            BinaryOp::Mul => numeric_op(&l, &r, "*", |a, b| Ok(a * b)),
            BinaryOp::Div => numeric_op(&l, &r, "/", |a, b| {
                if b == 0.0 {
                    Err("division by zero".to_string())
                } else {
                    Ok(a / b)
                }
            }),
            BinaryOp::FloorDiv => numeric_op(&l, &r, "//", |a, b| {
                if b == 0.0 {
                    Err("division by zero".to_string())
                } else {
                    Ok((a / b).floor())
                }
            }),
            BinaryOp::Mod => numeric_op(&l, &r, "%", |a, b| {
                if b == 0.0 {
                    Err("modulo by zero".to_string())
                } else {
                    Ok(a % b)
                }
            }),
            BinaryOp::Pow => numeric_op(&l, &r, "**", |a, b| Ok(a.powf(b))),
            BinaryOp::Or | BinaryOp::And => unreachable!(),
        }
    }

    fn eval_bound(
        &self,
        bound: &Option<Box<Expr>>,
        pos: usize,
    ) -> Result<Option<i64>, ResolutionError> {
        match bound {
            None => Ok(None),
            Some(expr) => {
                let value = self.eval(expr)?;
                value
                    .as_f64()
                    .map(|n| Some(n as i64))
                    .ok_or_else(|| ResolutionError::new("slice bound must be a number", pos))
            }
        }
    }

    fn index(&self, base: &Value, index: &Value, pos: usize) -> Result<Value, ResolutionError> {
        match base {
            Value::List(items) => {
                let n = index.as_f64().ok_or_else(|| {
                    ResolutionError::new("list index must be a number", pos)
                })? as i64;
                let idx = resolve_index(n, items.len());
                items
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| ResolutionError::new(format!("index {} out of range", n), pos))
            }
            Value::Map(map) => {
                let key = index.as_string();
                map.get(&key)
                    .cloned()
                    .ok_or_else(|| ResolutionError::new(format!("no key '{}'", key), pos))
            }
            Value::String(s) => {
                let n = index.as_f64().ok_or_else(|| {
                    ResolutionError::new("string index must be a number", pos)
                })? as i64;
                let chars: Vec<char> = s.chars().collect();
                let idx = resolve_index(n, chars.len());
                chars
                    .get(idx)
                    .map(|c| Value::String(c.to_string()))
                    .ok_or_else(|| ResolutionError::new(format!("index {} out of range", n), pos))
            }
            other => Err(ResolutionError::new(
                format!("cannot index {}", other.type_name()),
                pos,
            )),
        }
    }

    fn slice(
        &self,
        base: &Value,
        start: Option<i64>,
        end: Option<i64>,
        pos: usize,
    ) -> Result<Value, ResolutionError> {
        match base {
            Value::List(items) => {
                let (lo, hi) = slice_bounds(start, end, items.len());
                Ok(Value::List(items[lo..hi].to_vec()))
            }
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (lo, hi) = slice_bounds(start, end, chars.len());
                Ok(Value::String(chars[lo..hi].iter().collect()))
            }
            other => Err(ResolutionError::new(
                format!("cannot slice {}", other.type_name()),
                pos,
            )),
        }
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    // Numeric comparison tolerates bool/string coercions both ways
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        if matches!(l, Value::Number(_)) || matches!(r, Value::Number(_)) {
            return a == b;
        }
    }
    l == r
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, ResolutionError> {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| ResolutionError::new("incomparable numbers", 0));
    }
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(a.cmp(b));
    }
    Err(ResolutionError::new(
        format!("cannot compare {} with {}", l.type_name(), r.type_name()),
        0,
    ))
}

fn numeric_op(
    l: &Value,
    r: &Value,
    op: &str,
    f: impl Fn(f64, f64) -> Result<f64, String>,
) -> Result<Value, ResolutionError> {
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(ResolutionError::new(
            format!(
                "operator '{}' requires numbers, got {} and {}",
                op,
                l.type_name(),
                r.type_name()
            ),
            0,
        ));
    };
    f(a, b)
        .map(Value::Number)
        .map_err(|message| ResolutionError::new(message, 0))
}

fn resolve_index(n: i64, len: usize) -> usize {
    if n < 0 {
        (len as i64 + n).max(0) as usize
    } else {
        n as usize
    }
}

fn slice_bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let clamp = |n: i64| -> usize {
        let resolved = if n < 0 { len as i64 + n } else { n };
        resolved.clamp(0, len as i64) as usize
    };
    let lo = start.map(clamp).unwrap_or(0);
    let hi = end.map(clamp).unwrap_or(len);
    (lo, hi.max(lo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::scope::ScopeFrame;
    use std::collections::BTreeMap;

    fn scope_with(params: &[(&str, Value)]) -> ScopeStack {
        let mut stack = ScopeStack::new(BTreeMap::new());
        let mut frame = ScopeFrame::for_task("pkg", "t");
        for (name, value) in params {
            frame = frame.with_param(*name, value.clone());
        }
        stack.push(frame);
        stack
    }

    #[test]
    fn test_arithmetic() {
        let scope = ScopeStack::new(BTreeMap::new());
        let eval = Evaluator::new(&scope);

        assert_eq!(eval.eval_str("1 + 2 * 3").unwrap(), Value::Number(7.0));
        assert_eq!(eval.eval_str("7 // 2").unwrap(), Value::Number(3.0));
        assert_eq!(eval.eval_str("7 % 2").unwrap(), Value::Number(1.0));
        assert_eq!(eval.eval_str("2 ** 10").unwrap(), Value::Number(1024.0));
        assert_eq!(eval.eval_str("-(1 + 2)").unwrap(), Value::Number(-3.0));
    }

    #[test]
    fn test_division_by_zero() {
        let scope = ScopeStack::new(BTreeMap::new());
        let eval = Evaluator::new(&scope);
        assert!(eval.eval_str("1 / 0").is_err());
    }

    #[test]
    fn test_boolean_short_circuit() {
        let scope = scope_with(&[("name", Value::from("x"))]);
        let eval = Evaluator::new(&scope);

        // 'or' returns the first truthy operand without touching the rest
        assert_eq!(
            eval.eval_str("name or missing_identifier").unwrap(),
            Value::from("x")
        );
        assert_eq!(eval.eval_str("false or 'fallback'").unwrap(), Value::from("fallback"));
    }

    #[test]
    fn test_comparisons() {
        let scope = ScopeStack::new(BTreeMap::new());
        let eval = Evaluator::new(&scope);

        assert_eq!(eval.eval_str("1 < 2").unwrap(), Value::Bool(true));
        assert_eq!(eval.eval_str("'a' < 'b'").unwrap(), Value::Bool(true));
        assert_eq!(eval.eval_str("2 == 2 and 3 != 4").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_string_concat() {
        let scope = scope_with(&[("top", Value::from("main"))]);
        let eval = Evaluator::new(&scope);
        assert_eq!(eval.eval_str("'obj/' + top + '.o'").unwrap(), Value::from("obj/main.o"));
    }

    #[test]
    fn test_member_and_index() {
        let mut map = BTreeMap::new();
        map.insert("debug".to_string(), Value::Bool(true));
        let scope = scope_with(&[
            ("params", Value::Map(map)),
            (
                "files",
                Value::List(vec![Value::from("a.c"), Value::from("b.c")]),
            ),
        ]);
        let eval = Evaluator::new(&scope);

        assert_eq!(eval.eval_str("params.debug").unwrap(), Value::Bool(true));
        assert_eq!(eval.eval_str("files[1]").unwrap(), Value::from("b.c"));
        assert_eq!(eval.eval_str("files[-1]").unwrap(), Value::from("b.c"));
    }

    #[test]
    fn test_slice() {
        let scope = scope_with(&[(
            "items",
            Value::List(vec![
                Value::from(1.0),
                Value::from(2.0),
                Value::from(3.0),
                Value::from(4.0),
            ]),
        )]);
        let eval = Evaluator::new(&scope);

        assert_eq!(
            eval.eval_str("items[1:3]").unwrap(),
            Value::List(vec![Value::from(2.0), Value::from(3.0)])
        );
        assert_eq!(
            eval.eval_str("items[:2]").unwrap(),
            Value::List(vec![Value::from(1.0), Value::from(2.0)])
        );
    }

    #[test]
    fn test_pipe_filter() {
        let scope = scope_with(&[(
            "files",
            Value::List(vec![Value::from("a.c"), Value::from("b.c")]),
        )]);
        let eval = Evaluator::new(&scope);
        assert_eq!(eval.eval_str("files | join(' ')").unwrap(), Value::from("a.c b.c"));
    }

    #[test]
    fn test_unresolved_identifier_has_position() {
        let scope = ScopeStack::new(BTreeMap::new());
        let eval = Evaluator::new(&scope);
        let err = eval.eval_str("1 + missing").unwrap_err();
        assert_eq!(err.pos, 4);
    }

    #[test]
    fn test_interpolation_preserves_type() {
        let scope = scope_with(&[("count", Value::Number(3.0))]);
        let eval = Evaluator::new(&scope);

        // A whole-string expression keeps its type
        assert_eq!(eval.interpolate("${{ count }}").unwrap(), Value::Number(3.0));
        // Mixed text concatenates
        assert_eq!(
            eval.interpolate("n=${{ count }}!").unwrap(),
            Value::from("n=3!")
        );
        // Plain text passes through
        assert_eq!(eval.interpolate("plain").unwrap(), Value::from("plain"));
    }

    #[test]
    fn test_qualified_reference() {
        struct Registry;
        impl QualifiedResolver for Registry {
            fn is_package(&self, name: &str) -> bool {
                name == "toolchain"
            }
            fn resolve_qualified(&self, package: &str, name: &str) -> Option<Value> {
                (package == "toolchain" && name == "cc").then(|| Value::from("gcc"))
            }
        }

        let scope = ScopeStack::new(BTreeMap::new());
        let eval = Evaluator::with_registry(&scope, &Registry);

        assert_eq!(eval.eval_str("toolchain.cc").unwrap(), Value::from("gcc"));
        assert!(eval.eval_str("toolchain.missing").is_err());
    }

    #[test]
    fn test_resolve_value_recursive() {
        let scope = scope_with(&[("v", Value::from("x"))]);
        let eval = Evaluator::new(&scope);

        let input = Value::List(vec![Value::from("${{ v }}.o"), Value::from("plain")]);
        assert_eq!(
            eval.resolve_value(&input).unwrap(),
            Value::List(vec![Value::from("x.o"), Value::from("plain")])
        );
    }
}
