// Elaborated model
// Fully-merged packages, types, and tasks with flattened inheritance

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::params::ParamCollection;
use crate::defs::{
    CachePolicy, CheckSpec, ConsumeSpec, Passthrough, Pattern, ScopeFlag, Strategy,
};
use crate::error::ElaborationError;
use crate::runner::ImplHandle;
use crate::value::Value;

/// An elaborated type: inheritance chain flattened into one parameter table
#[derive(Debug, Clone)]
pub struct Type {
    pub name: String,
    pub package: String,
    pub params: ParamCollection,
}

/// An elaborated task. Inheritance and overrides are already applied; the
/// implementation reference is resolved to a registry handle.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub package: String,
    pub params: ParamCollection,
    pub resolved_params: BTreeMap<String, Value>,
    pub needs: Vec<String>,
    pub feeds: Vec<String>,
    pub consumes: ConsumeSpec,
    pub produces: Vec<Pattern>,
    pub passthrough: Passthrough,
    pub scope: ScopeFlag,
    pub cache: Option<CachePolicy>,
    pub strategy: Option<Strategy>,
    pub body: Vec<Task>,
    pub implementation: Option<ImplHandle>,
    pub check: Option<CheckSpec>,
    /// Parameter names whose defaults reference `inputs` or `memento` and
    /// are re-evaluated at schedule time
    pub deferred_params: Vec<String>,
}

impl Task {
    pub fn is_compound(&self) -> bool {
        !self.body.is_empty() || self.strategy.is_some()
    }

    pub fn is_exported(&self) -> bool {
        matches!(self.scope, ScopeFlag::Export | ScopeFlag::Root)
    }

    /// Fully-qualified `package.task` name
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.package, self.name)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("package", &self.package)
            .field("needs", &self.needs)
            .field("scope", &self.scope)
            .field("has_impl", &self.implementation.is_some())
            .finish_non_exhaustive()
    }
}

/// An elaborated package: one merged, acyclic namespace of types and tasks
#[derive(Debug, Clone, Default)]
pub struct Package {
    pub name: String,
    pub params: ParamCollection,
    pub resolved_params: BTreeMap<String, Value>,
    pub default_scope: ScopeFlag,
    tasks: Vec<Task>,
    task_indices: HashMap<String, usize>,
    types: Vec<Type>,
    type_indices: HashMap<String, usize>,
    /// Override redirections: overridden name -> most-derived replacement
    aliases: HashMap<String, String>,
}

impl Package {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_task(&mut self, task: Task) -> Result<(), ElaborationError> {
        if self.task_indices.contains_key(&task.name) {
            return Err(ElaborationError::DuplicateName {
                name: task.name.clone(),
                package: self.name.clone(),
            });
        }
        self.task_indices.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn add_type(&mut self, ty: Type) -> Result<(), ElaborationError> {
        if self.type_indices.contains_key(&ty.name) {
            return Err(ElaborationError::DuplicateName {
                name: ty.name.clone(),
                package: self.name.clone(),
            });
        }
        self.type_indices.insert(ty.name.clone(), self.types.len());
        self.types.push(ty);
        Ok(())
    }

    /// Replace an existing type in place, keeping its position
    pub fn replace_type(&mut self, ty: Type) {
        match self.type_indices.get(&ty.name) {
            Some(&i) => self.types[i] = ty,
            None => {
                self.type_indices.insert(ty.name.clone(), self.types.len());
                self.types.push(ty);
            }
        }
    }

    /// Replace an existing task in place, keeping its position
    pub fn replace_task(&mut self, task: Task) {
        match self.task_indices.get(&task.name) {
            Some(&i) => self.tasks[i] = task,
            None => {
                self.task_indices.insert(task.name.clone(), self.tasks.len());
                self.tasks.push(task);
            }
        }
    }

    /// Redirect every lookup of `old` to `new`
    pub fn add_alias(&mut self, old: impl Into<String>, new: impl Into<String>) {
        self.aliases.insert(old.into(), new.into());
    }

    /// Look up a task, following override redirections
    pub fn get_task(&self, name: &str) -> Option<&Task> {
        let mut name = name;
        let mut hops = 0;
        while let Some(target) = self.aliases.get(name) {
            name = target;
            hops += 1;
            if hops > self.aliases.len() {
                return None;
            }
        }
        self.task_indices.get(name).map(|&i| &self.tasks[i])
    }

    pub fn tasks_mut(&mut self) -> &mut [Task] {
        &mut self.tasks
    }

    /// Resolve a name through the alias map without fetching the task
    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> &'a str {
        let mut name = name;
        let mut hops = 0;
        while let Some(target) = self.aliases.get(name) {
            name = target;
            hops += 1;
            if hops > self.aliases.len() {
                break;
            }
        }
        name
    }

    pub fn get_type(&self, name: &str) -> Option<&Type> {
        self.type_indices.get(name).map(|&i| &self.types[i])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn types(&self) -> &[Type] {
        &self.types
    }

    pub fn param_value(&self, name: &str) -> Option<Value> {
        self.resolved_params.get(name).cloned()
    }

    /// Tasks addressable as run roots
    pub fn root_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.scope, ScopeFlag::Root))
    }
}
