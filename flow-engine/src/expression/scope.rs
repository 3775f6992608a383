// Name-resolution scopes
// Stack of frames consulted by the evaluator, innermost first

use std::collections::BTreeMap;

use crate::value::Value;

/// Resolver for fully-qualified `package.name` references.
///
/// Qualified references bypass the scope stack and resolve directly against
/// the elaboration context's package registry.
pub trait QualifiedResolver {
    /// True when `name` is a known package
    fn is_package(&self, name: &str) -> bool;

    /// Look up a parameter of a known package
    fn resolve_qualified(&self, package: &str, name: &str) -> Option<Value>;
}

/// One name-resolution frame: the elaborating package, the active task (if
/// any, exposed as `this`), and a synthetic variable table (matrix variables,
/// `inputs`, `memento`, run-directory bindings).
#[derive(Debug, Clone, Default)]
pub struct ScopeFrame {
    pub package: String,
    pub task: Option<String>,
    pub synthetic: BTreeMap<String, Value>,
    pub task_params: BTreeMap<String, Value>,
}

impl ScopeFrame {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            ..Default::default()
        }
    }

    pub fn for_task(package: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            task: Some(task.into()),
            ..Default::default()
        }
    }

    pub fn with_synthetic(mut self, name: impl Into<String>, value: Value) -> Self {
        self.synthetic.insert(name.into(), value);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.task_params.insert(name.into(), value);
        self
    }

    /// Map view of this frame, what `this` evaluates to
    pub fn as_map(&self) -> Value {
        let mut map = self.task_params.clone();
        map.extend(self.synthetic.clone());
        Value::Map(map)
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        self.synthetic
            .get(name)
            .or_else(|| self.task_params.get(name))
            .cloned()
    }
}

/// Stack of scope frames plus the enclosing package's parameter table.
///
/// Lookup order: innermost frame synthetics, then its task params, then
/// enclosing frames walking outward, then package params. Qualified
/// references are not handled here (see [`QualifiedResolver`]).
#[derive(Debug, Clone, Default)]
pub struct ScopeStack {
    frames: Vec<ScopeFrame>,
    package_params: BTreeMap<String, Value>,
}

impl ScopeStack {
    pub fn new(package_params: BTreeMap<String, Value>) -> Self {
        Self {
            frames: Vec::new(),
            package_params,
        }
    }

    pub fn push(&mut self, frame: ScopeFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<ScopeFrame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&ScopeFrame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut ScopeFrame> {
        self.frames.last_mut()
    }

    /// Package name of the innermost frame, if any
    pub fn current_package(&self) -> Option<&str> {
        self.frames.last().map(|f| f.package.as_str())
    }

    /// Resolve a bare identifier
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if name == "this" {
            return self.frames.last().map(|f| f.as_map());
        }

        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.lookup(name) {
                return Some(value);
            }
        }

        self.package_params.get(name).cloned()
    }

    pub fn package_params(&self) -> &BTreeMap<String, Value> {
        &self.package_params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_order_innermost_wins() {
        let mut pkg = BTreeMap::new();
        pkg.insert("v".to_string(), Value::from("package"));

        let mut stack = ScopeStack::new(pkg);
        stack.push(ScopeFrame::for_task("pkg", "outer").with_param("v", Value::from("outer")));
        stack.push(ScopeFrame::for_task("pkg", "inner").with_param("v", Value::from("inner")));

        assert_eq!(stack.lookup("v"), Some(Value::from("inner")));
        stack.pop();
        assert_eq!(stack.lookup("v"), Some(Value::from("outer")));
        stack.pop();
        assert_eq!(stack.lookup("v"), Some(Value::from("package")));
    }

    #[test]
    fn test_synthetic_shadows_params() {
        let mut stack = ScopeStack::new(BTreeMap::new());
        stack.push(
            ScopeFrame::for_task("pkg", "t")
                .with_param("x", Value::from("param"))
                .with_synthetic("x", Value::from("matrix")),
        );
        assert_eq!(stack.lookup("x"), Some(Value::from("matrix")));
    }

    #[test]
    fn test_this_is_frame_map() {
        let mut stack = ScopeStack::new(BTreeMap::new());
        stack.push(ScopeFrame::for_task("pkg", "t").with_param("top", Value::from("main.c")));

        let Some(Value::Map(map)) = stack.lookup("this") else {
            panic!("expected map");
        };
        assert_eq!(map.get("top"), Some(&Value::from("main.c")));
    }

    #[test]
    fn test_enclosing_scope_visible() {
        let mut stack = ScopeStack::new(BTreeMap::new());
        stack.push(ScopeFrame::for_task("pkg", "outer").with_param("base", Value::from("b")));
        stack.push(ScopeFrame::for_task("pkg", "inner"));

        assert_eq!(stack.lookup("base"), Some(Value::from("b")));
    }

    #[test]
    fn test_unknown_is_none() {
        let stack = ScopeStack::new(BTreeMap::new());
        assert_eq!(stack.lookup("missing"), None);
    }
}
